use std::sync::Arc;

use arbo_core::{ArboError, ArboResult, ExecutionRecord, Observation, TaskModel, TaskPrior};
use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{Optimizer, PendingFeedback};

impl Optimizer {
    /// Create a task model with explicit priors before its first run.
    pub async fn register_task(&self, task_name: &str, prior: TaskPrior) -> ArboResult<TaskModel> {
        arbo_core::validate_task_name(task_name)?;
        prior.validate()?;
        let model = TaskModel::new(task_name, &prior);
        let stored = self.call("insert_model", self.store.insert_model(&model)).await?;
        info!(
            task = %task_name,
            t_base_1 = ?prior.t_base_1,
            p_obs = stored.p_obs,
            c_startup = stored.c_startup,
            "task registered"
        );
        Ok(stored)
    }

    /// Fold one completed run into the task's model and history.
    ///
    /// Exactly one model update and one history row per successful call.
    /// When the store is unreachable the observation is queued for
    /// [`Self::flush_pending`] and `FeedbackDeferred` is returned.
    pub async fn report_execution(&self, observation: Observation) -> ArboResult<TaskModel> {
        observation.validate()?;
        let entry = PendingFeedback { record_id: Uuid::new_v4(), observation };

        let lock = self.task_lock(&entry.observation.task_name);
        let _guard = lock.lock().await;

        match self.apply_observation(&entry).await {
            Ok(model) => Ok(model),
            Err(ArboError::Unavailable(reason)) => {
                warn!(task = %entry.observation.task_name, %reason, "store unavailable, deferring feedback");
                let task_name = entry.observation.task_name.clone();
                self.defer(entry);
                Err(ArboError::FeedbackDeferred { task_name })
            }
            Err(e) => Err(e),
        }
    }

    /// Replay deferred observations in arrival order.
    ///
    /// Stops at the first transient failure (store unavailable or conflict),
    /// leaving it and everything behind it queued. An observation whose replay
    /// fails for any other reason is discarded and counted in
    /// `feedback_rejected`, so it cannot hold up the rest of the queue.
    pub async fn flush_pending(&self) -> ArboResult<usize> {
        let mut applied = 0;
        loop {
            let next = self.pending.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
            let Some(entry) = next else { break };

            let lock = self.task_lock(&entry.observation.task_name);
            let result = {
                let _guard = lock.lock().await;
                self.apply_observation(&entry).await
            };
            match result {
                Ok(_) => applied += 1,
                Err(e @ (ArboError::Unavailable(_) | ArboError::UpdateConflict { .. })) => {
                    warn!(
                        task = %entry.observation.task_name,
                        error = %e,
                        applied,
                        "pending feedback flush stopped"
                    );
                    self.pending.lock().unwrap_or_else(|e| e.into_inner()).push_front(entry);
                    if applied == 0 {
                        return Err(e);
                    }
                    break;
                }
                Err(e) => {
                    error!(
                        task = %entry.observation.task_name,
                        id = %entry.record_id,
                        s = entry.observation.parallelism,
                        duration = entry.observation.total_duration,
                        error = %e,
                        "deferred feedback rejected, discarding"
                    );
                    self.lock_metrics().feedback_rejected += 1;
                }
            }
        }
        if applied > 0 {
            info!(applied, remaining = self.pending_feedback(), "pending feedback flushed");
        }
        Ok(applied)
    }

    /// Read-modify-write with optimistic retry. Caller holds the task lock.
    ///
    /// Every attempt commits under `entry.record_id`, so an attempt whose
    /// acknowledgement was lost is recognised by the store on replay.
    async fn apply_observation(&self, entry: &PendingFeedback) -> ArboResult<TaskModel> {
        let observation = &entry.observation;
        let task_name = &observation.task_name;
        let attempts = self.policy.max_update_retries;

        for attempt in 1..=attempts {
            let current = match self.task_model(task_name).await? {
                Some(m) => m,
                None => {
                    info!(task = %task_name, "first observation of unseen task, creating model");
                    TaskModel::new(task_name.as_str(), &TaskPrior::default())
                }
            };

            let predicted_residual = if current.version == 0 {
                0.0
            } else {
                self.residual_at(task_name, observation).await?
            };

            let outcome =
                self.estimator
                    .update_as(entry.record_id, &current, observation, predicted_residual, Utc::now());
            let residual = outcome.record.residual;
            match self.commit(outcome.model, outcome.record).await {
                Ok(stored) => {
                    self.cache.invalidate_task(task_name);
                    self.lock_metrics().record_feedback(task_name, stored.last_updated);
                    info!(
                        task = %task_name,
                        kind = ?outcome.kind,
                        s = observation.parallelism,
                        duration = observation.total_duration,
                        residual,
                        p_obs = stored.p_obs,
                        t_base_1 = stored.t_base_1,
                        k = stored.k_exponent,
                        samples = stored.sample_count,
                        "task model updated"
                    );
                    return Ok(stored);
                }
                Err(ArboError::UpdateConflict { .. }) if attempt < attempts => {
                    debug!(task = %task_name, attempt, "version conflict, retrying update");
                    self.lock_metrics().conflict_retries += 1;
                }
                Err(ArboError::UpdateConflict { .. }) => break,
                Err(e) => return Err(e),
            }
        }

        warn!(task = %task_name, attempts, "update conflict not resolved");
        self.lock_metrics().conflicts_surfaced += 1;
        Err(ArboError::UpdateConflict { task_name: task_name.clone(), attempts })
    }

    /// Commit on a detached task under the policy timeout. A commit that
    /// outlives the timeout still runs to completion in the store.
    async fn commit(&self, model: TaskModel, record: ExecutionRecord) -> ArboResult<TaskModel> {
        let store = Arc::clone(&self.store);
        let write = tokio::spawn(async move { store.commit_update(&model, &record).await });
        self.call("commit_update", async move {
            match write.await {
                Ok(result) => result.map_err(ArboError::from),
                Err(e) => Err(ArboError::Other(format!("commit task failed: {}", e))),
            }
        })
        .await
    }

    /// Residual model mean at the observed point, for the forecast snapshot.
    async fn residual_at(&self, task_name: &str, observation: &Observation) -> ArboResult<f64> {
        let residual = self.fit_residual(task_name).await?;
        Ok(residual.mean(
            observation.parallelism as f64,
            observation.input_scale_factor,
            observation.cluster_load,
        ))
    }

    fn defer(&self, entry: PendingFeedback) {
        let capacity = self.policy.pending_feedback_capacity;
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let mut dropped = 0;
        while capacity > 0 && pending.len() >= capacity {
            pending.pop_front();
            dropped += 1;
        }
        if capacity > 0 {
            pending.push_back(entry);
        } else {
            dropped += 1;
        }
        let queued = pending.len();
        drop(pending);

        if dropped > 0 {
            warn!(dropped, queued, "pending feedback queue full, oldest observations dropped");
        }
        let mut m = self.lock_metrics();
        m.feedback_deferred += 1;
        m.feedback_dropped += dropped;
    }
}
