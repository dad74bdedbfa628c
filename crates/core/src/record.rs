use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ArboResult;
use crate::model::{
    validate_cluster_load, validate_cost_metric, validate_duration, validate_parallelism,
    validate_scale_factor, validate_task_name,
};

/// A completed run as reported by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub task_name: String,
    pub parallelism: u32,
    pub input_scale_factor: f64,
    pub cluster_load: f64,
    /// Wall-clock outcome in seconds.
    pub total_duration: f64,
    pub cost_metric: Option<f64>,
}

impl Observation {
    /// Reject malformed input before anything touches the store.
    pub fn validate(&self) -> ArboResult<()> {
        validate_task_name(&self.task_name)?;
        validate_parallelism(self.parallelism)?;
        validate_scale_factor(self.input_scale_factor)?;
        validate_cluster_load(self.cluster_load)?;
        validate_duration(self.total_duration)?;
        validate_cost_metric(self.cost_metric)
    }
}

/// Immutable history row, one per completed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub task_name: String,
    pub parallelism: u32,
    pub input_scale_factor: f64,
    pub cluster_load: f64,
    pub total_duration: f64,
    /// Observed time minus the law's baseline prediction.
    pub residual: f64,
    /// `p_obs` the prediction was made with.
    pub p_snapshot: f64,
    pub cost_metric: Option<f64>,
    /// Baseline law prediction at the observed point.
    pub predicted_time: f64,
    /// Residual model mean at the observed point.
    pub predicted_residual: f64,
    pub recorded_at: DateTime<Utc>,
}

impl ExecutionRecord {
    /// Residual-model feature vector `(s, γ, L)`.
    pub fn features(&self) -> [f64; 3] {
        [self.parallelism as f64, self.input_scale_factor, self.cluster_load]
    }
}
