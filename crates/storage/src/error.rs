use arbo_core::ArboError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The row changed since it was read (optimistic version mismatch).
    #[error("version conflict on task {0}")]
    Conflict(String),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task already exists: {0}")]
    AlreadyExists(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid row: {0}")]
    Invalid(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<StoreError> for ArboError {
    fn from(e: StoreError) -> Self {
        match e {
            // Callers translate a conflict into UpdateConflict once retries run out.
            StoreError::Conflict(task) => ArboError::UpdateConflict { task_name: task, attempts: 1 },
            StoreError::NotFound(task) => ArboError::TaskNotFound(task),
            StoreError::AlreadyExists(task) => ArboError::TaskAlreadyExists(task),
            StoreError::Unavailable(msg) => ArboError::Unavailable(msg),
            StoreError::Invalid(msg) => ArboError::Validation(msg),
            // Reaching the database and failing there is not an outage; retrying later won't help.
            StoreError::Database(e) => ArboError::Other(format!("task store: {}", e)),
        }
    }
}
