use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ArboError {
    /// Malformed input rejected before any persisted state is touched.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("update conflict on task {task_name} after {attempts} attempts")]
    UpdateConflict { task_name: String, attempts: u32 },

    /// Persistence or monitoring collaborator unreachable.
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task already exists: {0}")]
    TaskAlreadyExists(String),

    /// The observation was queued and will be applied by a later flush.
    #[error("feedback for task {task_name} deferred: store unavailable")]
    FeedbackDeferred { task_name: String },

    #[error("{0}")]
    Other(String),
}

impl ArboError {
    /// Whether the caller may retry the whole operation later.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::Validation(_) | Self::TaskNotFound(_) | Self::TaskAlreadyExists(_)
        )
    }
}

pub type ArboResult<T> = Result<T, ArboError>;
