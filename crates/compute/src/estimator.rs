use arbo_core::{ExecutionRecord, Observation, TaskModel};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::performance::{amdahl_factor, PerformanceModel};

/// Smallest baseline the estimator will ever write.
const MIN_BASELINE: f64 = 1e-3;

/// Implied parallel fractions are clamped to this band before blending.
const IMPLIED_P_RANGE: (f64, f64) = (0.01, 0.99);

/// `|ln γ|` below this is treated as the reference scale for baseline runs.
const REFERENCE_SCALE_TOLERANCE: f64 = 0.05;

/// Which parameter a single observation informed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    /// First observation of a task with no known baseline.
    Bootstrap,
    /// `s = 1` at the reference scale: refines `t_base_1`.
    Baseline,
    /// `s = 1` at another scale: refines `k_exponent`.
    Exponent,
    /// `s > 1`: refines `p_obs`.
    ParallelFraction,
    /// The observation carried no usable signal (e.g. duration below startup).
    Unchanged,
}

/// Result of folding one observation into a model.
#[derive(Debug, Clone)]
pub struct EstimatorOutcome {
    pub model: TaskModel,
    pub record: ExecutionRecord,
    pub kind: UpdateKind,
}

/// Online update rule: invert the law at the observed point, then blend with
/// exponential smoothing. `c_startup` is never re-estimated and `t_base_1`
/// only moves on single-worker runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParameterEstimator {
    performance: PerformanceModel,
}

impl ParameterEstimator {
    pub fn new(performance: PerformanceModel) -> Self {
        Self { performance }
    }

    /// Compute the next model and the history row for `obs`.
    ///
    /// The caller validates `obs` first. `predicted_residual` is the residual
    /// model's mean at the observed point and is only stored as a snapshot.
    pub fn update(
        &self,
        model: &TaskModel,
        obs: &Observation,
        predicted_residual: f64,
        now: DateTime<Utc>,
    ) -> EstimatorOutcome {
        self.update_as(Uuid::new_v4(), model, obs, predicted_residual, now)
    }

    /// [`Self::update`] with a caller-chosen history row id, so every attempt
    /// at committing one observation carries the same id.
    pub fn update_as(
        &self,
        record_id: Uuid,
        model: &TaskModel,
        obs: &Observation,
        predicted_residual: f64,
        now: DateTime<Utc>,
    ) -> EstimatorOutcome {
        let s = obs.parallelism as f64;
        let gamma = obs.input_scale_factor;
        let load = obs.cluster_load;
        let contention = self.performance.contention.factor(load);
        let net = obs.total_duration - model.c_startup;

        let mut next = model.clone();
        let kind = if !model.baseline_established {
            let divisor = gamma.powf(model.k_exponent) * amdahl_factor(s, model.p_obs) * contention;
            next.t_base_1 = finite_or(net / divisor, model.t_base_1).max(MIN_BASELINE);
            next.baseline_established = true;
            UpdateKind::Bootstrap
        } else if obs.parallelism == 1 {
            if gamma.ln().abs() < REFERENCE_SCALE_TOLERANCE {
                let implied = (net / contention).max(MIN_BASELINE);
                next.t_base_1 = ema(model.t_base_1, implied, model.alpha_k).max(MIN_BASELINE);
                UpdateKind::Baseline
            } else {
                match implied_k(net, gamma, model.t_base_1, contention) {
                    Some(k) => {
                        next.k_exponent = ema(model.k_exponent, k, model.alpha_k);
                        UpdateKind::Exponent
                    }
                    None => UpdateKind::Unchanged,
                }
            }
        } else {
            let work = self.performance.scaled_work(gamma, load, model);
            match implied_p(net, work, s) {
                Some(p) => {
                    next.p_obs = ema(model.p_obs, p, model.alpha_p).clamp(0.0, 1.0);
                    UpdateKind::ParallelFraction
                }
                None => UpdateKind::Unchanged,
            }
        };

        // The forecast snapshot uses the pre-update model, except on bootstrap
        // where the placeholder baseline would make it meaningless.
        let forecast_model = if kind == UpdateKind::Bootstrap { &next } else { model };
        let predicted_time = self.performance.predict_unchecked(s, gamma, load, forecast_model);

        next.sample_count = model.sample_count + 1;
        next.last_updated = now;

        let record = ExecutionRecord {
            id: record_id,
            task_name: model.task_name.clone(),
            parallelism: obs.parallelism,
            input_scale_factor: gamma,
            cluster_load: load,
            total_duration: obs.total_duration,
            residual: obs.total_duration - predicted_time,
            p_snapshot: model.p_obs,
            cost_metric: obs.cost_metric,
            predicted_time,
            predicted_residual,
            recorded_at: now,
        };

        EstimatorOutcome { model: next, record, kind }
    }
}

/// `(1 − α)·prior + α·new`
#[inline]
pub fn ema(prior: f64, new: f64, alpha: f64) -> f64 {
    (1.0 - alpha) * prior + alpha * new
}

/// Parallel fraction implied by one run at `s > 1`, clamped to [0.01, 0.99].
///
/// `net` is the duration minus startup, `work` the law's single-worker work
/// term at the observed scale and load.
pub fn implied_p(net: f64, work: f64, s: f64) -> Option<f64> {
    if s <= 1.0 || work <= 0.0 {
        return None;
    }
    let ratio = net / work;
    let p = (1.0 - ratio) / (1.0 - 1.0 / s);
    p.is_finite().then(|| p.clamp(IMPLIED_P_RANGE.0, IMPLIED_P_RANGE.1))
}

/// Exponent implied by a single-worker run at scale `gamma`.
pub fn implied_k(net: f64, gamma: f64, t_base_1: f64, contention: f64) -> Option<f64> {
    let denom = t_base_1 * contention;
    if net <= 0.0 || denom <= 0.0 || gamma.ln().abs() < f64::EPSILON {
        return None;
    }
    let k = (net / denom).ln() / gamma.ln();
    k.is_finite().then_some(k)
}

fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() { value } else { fallback }
}
