//! Optimization loop and feedback path.
//!
//! An [`Optimizer`] is an explicit context object: it owns handles to the
//! task store and the cluster monitor plus the policy constants, and exposes
//! the two operations an orchestrator wires into its hooks:
//!
//! - [`Optimizer::recommend_parallelism`] before a task runs. Read-only
//!   against the store, fail-open on collaborator errors.
//! - [`Optimizer::report_execution`] after it completes. Serialised per task
//!   name, retried on version conflicts, deferred when the store is down.

mod feedback;
mod recommend;
pub mod search;
mod types;

#[cfg(test)]
mod tests;

pub use types::{CandidateEvaluation, Recommendation, RecommendationSource};

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arbo_core::{ArboError, ArboResult, Observation, PolicyConfig, TaskModel};
use arbo_storage::TaskStore;
use uuid::Uuid;

use crate::cache::RecommendationCache;
use crate::estimator::ParameterEstimator;
use crate::metrics::OptimizerMetrics;
use crate::monitor::ClusterMonitor;
use crate::performance::{ContentionPolicy, PerformanceModel};
use crate::residual::ResidualConfig;

/// An observation waiting for the store, with its history row id fixed on
/// the first attempt so a replay can never be recorded twice.
#[derive(Debug, Clone)]
struct PendingFeedback {
    record_id: Uuid,
    observation: Observation,
}

pub struct Optimizer {
    store: Arc<dyn TaskStore>,
    monitor: Arc<dyn ClusterMonitor>,
    policy: PolicyConfig,
    performance: PerformanceModel,
    residual_config: ResidualConfig,
    estimator: ParameterEstimator,
    cache: RecommendationCache,
    metrics: Mutex<OptimizerMetrics>,
    /// One async mutex per task name serialises feedback in-process.
    task_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Validated observations waiting for the store to come back.
    pending: Mutex<VecDeque<PendingFeedback>>,
    collaborator_timeout: Duration,
}

impl Optimizer {
    pub fn new(
        store: Arc<dyn TaskStore>,
        monitor: Arc<dyn ClusterMonitor>,
        policy: PolicyConfig,
    ) -> ArboResult<Self> {
        policy.validate()?;
        let performance = PerformanceModel::new(ContentionPolicy::Linear { beta: policy.contention_beta });
        let residual_config = ResidualConfig {
            min_samples: policy.min_residual_samples,
            ..ResidualConfig::default()
        };
        let cache = RecommendationCache::new(
            policy.cache_capacity,
            Duration::from_millis(policy.cache_ttl_ms),
            policy.gamma_bucket,
            policy.load_bucket,
        );
        Ok(Self {
            store,
            monitor,
            collaborator_timeout: Duration::from_millis(policy.collaborator_timeout_ms),
            policy,
            performance,
            residual_config,
            estimator: ParameterEstimator::new(performance),
            cache,
            metrics: Mutex::new(OptimizerMetrics::default()),
            task_locks: Mutex::new(HashMap::new()),
            pending: Mutex::new(VecDeque::new()),
        })
    }

    /// Swap the contention shape used by both prediction and estimation.
    pub fn with_contention(mut self, contention: ContentionPolicy) -> Self {
        self.performance = PerformanceModel::new(contention);
        self.estimator = ParameterEstimator::new(self.performance);
        self
    }

    pub fn with_residual_config(mut self, config: ResidualConfig) -> Self {
        self.residual_config = config;
        self
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    pub fn performance(&self) -> &PerformanceModel {
        &self.performance
    }

    /// Current persisted model for `task_name`.
    pub async fn task_model(&self, task_name: &str) -> ArboResult<Option<TaskModel>> {
        self.call("get_model", self.store.get_model(task_name)).await
    }

    pub fn metrics(&self) -> OptimizerMetrics {
        self.lock_metrics().clone()
    }

    /// Observations queued while the store was unreachable.
    pub fn pending_feedback(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Run a collaborator call under the policy timeout.
    async fn call<T, E, F>(&self, what: &str, fut: F) -> ArboResult<T>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<ArboError>,
    {
        match tokio::time::timeout(self.collaborator_timeout, fut).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(ArboError::Unavailable(format!(
                "{} timed out after {}ms",
                what,
                self.collaborator_timeout.as_millis()
            ))),
        }
    }

    fn lock_metrics(&self) -> std::sync::MutexGuard<'_, OptimizerMetrics> {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn task_lock(&self, task_name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.task_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(task_name.to_string()).or_default().clone()
    }
}
