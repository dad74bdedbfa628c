use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;

use arbo_core::{ExecutionRecord, TaskModel};
use async_trait::async_trait;

use crate::error::StoreError;
use crate::traits::TaskStore;

#[derive(Default)]
struct Tables {
    models: HashMap<String, TaskModel>,
    /// Per-task history in insertion order (oldest first).
    history: HashMap<String, Vec<ExecutionRecord>>,
}

/// In-process [`TaskStore`] with the same versioning contract as PostgreSQL.
///
/// Also carries test hooks: an offline switch that makes every call fail
/// with [`StoreError::Unavailable`], and injected version conflicts.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    offline: AtomicBool,
    injected_conflicts: AtomicU32,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store becoming (un)reachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make the next `n` versioned writes fail as if another writer won the race.
    pub fn inject_conflicts(&self, n: u32) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    /// Number of successful mutating calls so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {}", e)))
    }

    /// Version check and write of a model row; caller holds the write lock.
    fn put_versioned(&self, tables: &mut Tables, model: &TaskModel) -> Result<TaskModel, StoreError> {
        model.validate().map_err(|e| StoreError::Invalid(e.to_string()))?;
        if self.take_injected_conflict() {
            return Err(StoreError::Conflict(model.task_name.clone()));
        }

        let stored_version = tables.models.get(&model.task_name).map(|m| m.version);
        match stored_version {
            None if model.version != 0 => return Err(StoreError::Conflict(model.task_name.clone())),
            Some(v) if v != model.version => return Err(StoreError::Conflict(model.task_name.clone())),
            _ => {}
        }

        let mut stored = model.clone();
        stored.version = model.version + 1;
        tables.models.insert(stored.task_name.clone(), stored.clone());
        Ok(stored)
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn get_model(&self, task_name: &str) -> Result<Option<TaskModel>, StoreError> {
        self.check_online()?;
        Ok(self.read()?.models.get(task_name).cloned())
    }

    async fn get_recent_history(
        &self,
        task_name: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        self.check_online()?;
        let tables = self.read()?;
        Ok(tables
            .history
            .get(task_name)
            .map(|rows| rows.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn insert_model(&self, model: &TaskModel) -> Result<TaskModel, StoreError> {
        self.check_online()?;
        model.validate().map_err(|e| StoreError::Invalid(e.to_string()))?;
        let mut tables = self.write()?;
        if tables.models.contains_key(&model.task_name) {
            return Err(StoreError::AlreadyExists(model.task_name.clone()));
        }
        let mut stored = model.clone();
        stored.version = 1;
        tables.models.insert(stored.task_name.clone(), stored.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    async fn upsert_model(&self, model: &TaskModel) -> Result<TaskModel, StoreError> {
        self.check_online()?;
        let mut tables = self.write()?;
        let stored = self.put_versioned(&mut tables, model)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    async fn append_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        self.check_online()?;
        let mut tables = self.write()?;
        if !tables.models.contains_key(&record.task_name) {
            return Err(StoreError::NotFound(record.task_name.clone()));
        }
        tables
            .history
            .entry(record.task_name.clone())
            .or_default()
            .push(record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn commit_update(
        &self,
        model: &TaskModel,
        record: &ExecutionRecord,
    ) -> Result<TaskModel, StoreError> {
        self.check_online()?;
        if record.task_name != model.task_name {
            return Err(StoreError::Invalid(format!(
                "record for {} committed with model {}",
                record.task_name, model.task_name
            )));
        }
        // One write lock spans both tables, so readers never see half a commit.
        let mut tables = self.write()?;
        let already_recorded = tables
            .history
            .get(&record.task_name)
            .is_some_and(|rows| rows.iter().any(|r| r.id == record.id));
        if already_recorded {
            return tables
                .models
                .get(&model.task_name)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(model.task_name.clone()));
        }
        let stored = self.put_versioned(&mut tables, model)?;
        tables
            .history
            .entry(record.task_name.clone())
            .or_default()
            .push(record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }
}
