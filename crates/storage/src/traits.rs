use std::sync::Arc;

use arbo_core::{ExecutionRecord, TaskModel};
use async_trait::async_trait;

use crate::error::StoreError;

/// Durable home of task models and execution history.
///
/// Versioning: a model with `version == 0` has never been persisted. Every
/// successful write stores `version + 1` and returns the stored copy; a write
/// whose version no longer matches the stored row fails with
/// [`StoreError::Conflict`].
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get_model(&self, task_name: &str) -> Result<Option<TaskModel>, StoreError>;

    /// Most recent executions first, at most `limit` rows.
    async fn get_recent_history(
        &self,
        task_name: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, StoreError>;

    /// Create a model; fails with `AlreadyExists` if the name is taken.
    async fn insert_model(&self, model: &TaskModel) -> Result<TaskModel, StoreError>;

    /// Atomic create-or-update guarded by the model's version.
    async fn upsert_model(&self, model: &TaskModel) -> Result<TaskModel, StoreError>;

    /// Insert one history row. Requires the owning model to exist.
    async fn append_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError>;

    /// Versioned model write plus history append as a single transaction.
    ///
    /// Idempotent on `record.id`: when a row with that id is already stored
    /// nothing is written and the current model is returned, so a commit whose
    /// acknowledgement was lost can be replayed safely.
    async fn commit_update(
        &self,
        model: &TaskModel,
        record: &ExecutionRecord,
    ) -> Result<TaskModel, StoreError>;
}

/// Blanket implementation so `Arc<dyn TaskStore>` can be used directly.
#[async_trait]
impl<T: TaskStore + ?Sized> TaskStore for Arc<T> {
    async fn get_model(&self, task_name: &str) -> Result<Option<TaskModel>, StoreError> {
        (**self).get_model(task_name).await
    }

    async fn get_recent_history(
        &self,
        task_name: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        (**self).get_recent_history(task_name, limit).await
    }

    async fn insert_model(&self, model: &TaskModel) -> Result<TaskModel, StoreError> {
        (**self).insert_model(model).await
    }

    async fn upsert_model(&self, model: &TaskModel) -> Result<TaskModel, StoreError> {
        (**self).upsert_model(model).await
    }

    async fn append_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        (**self).append_execution(record).await
    }

    async fn commit_update(
        &self,
        model: &TaskModel,
        record: &ExecutionRecord,
    ) -> Result<TaskModel, StoreError> {
        (**self).commit_update(model, record).await
    }
}
