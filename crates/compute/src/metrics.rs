use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Optimizer operational counters, snapshotted by [`crate::Optimizer::metrics`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct OptimizerMetrics {
    /// Recommendations returned, whatever their source.
    pub recommendations_served: u64,
    pub cold_starts: u64,
    pub cache_hits: u64,
    /// No candidate met the constraints; the caller's default was returned.
    pub feasibility_violations: u64,
    /// A collaborator failed and the caller's default was returned.
    pub fail_open_fallbacks: u64,
    pub feedback_applied: u64,
    /// Version conflicts absorbed by a retry.
    pub conflict_retries: u64,
    /// Feedback that exhausted its retries.
    pub conflicts_surfaced: u64,
    pub feedback_deferred: u64,
    /// Deferred observations dropped because the queue was full.
    pub feedback_dropped: u64,
    /// Deferred observations discarded because their replay failed permanently.
    pub feedback_rejected: u64,
    /// Feedback applied per task name.
    pub updates_by_task: HashMap<String, u64>,
    pub last_update: HashMap<String, DateTime<Utc>>,
}

impl OptimizerMetrics {
    pub fn record_feedback(&mut self, task_name: &str, at: DateTime<Utc>) {
        self.feedback_applied += 1;
        *self.updates_by_task.entry(task_name.to_string()).or_default() += 1;
        self.last_update.insert(task_name.to_string(), at);
    }

    /// Fraction of served recommendations answered from the cache.
    pub fn cache_hit_ratio(&self) -> f64 {
        if self.recommendations_served == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / self.recommendations_served as f64
    }
}
