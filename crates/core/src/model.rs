use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ArboError, ArboResult};

/// Placeholder baseline used until the first observation bootstraps `t_base_1`.
pub const UNSET_BASELINE: f64 = 1.0;

/// Largest parallelism accepted anywhere at the boundary. Fits a SQL `INTEGER`.
pub const PARALLELISM_LIMIT: u32 = 1 << 20;

/// Largest candidate range `[1, S_max]` a single search may enumerate.
pub const CANDIDATE_LIMIT: u32 = 4096;

/// Learned performance parameters for one task name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskModel {
    pub task_name: String,
    /// Baseline time at parallelism 1 for the reference input scale.
    pub t_base_1: f64,
    /// Parallelizable fraction, always within [0, 1].
    pub p_obs: f64,
    /// Fixed per-run overhead in seconds.
    pub c_startup: f64,
    /// Growth exponent of baseline time over input scale.
    pub k_exponent: f64,
    pub alpha_p: f64,
    pub alpha_k: f64,
    /// Executions folded into this model.
    pub sample_count: u64,
    /// Raw input quantity that corresponds to a scale factor of 1.0.
    pub base_input_quantity: Option<f64>,
    /// False until `t_base_1` comes from a caller prior or an observation.
    pub baseline_established: bool,
    /// Optimistic concurrency token, bumped by the store on every write.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// Priors used when a task model is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPrior {
    /// Known baseline time, if any. `None` defers to the first observation.
    pub t_base_1: Option<f64>,
    pub p_obs: f64,
    pub c_startup: f64,
    pub k_exponent: f64,
    pub alpha_p: f64,
    pub alpha_k: f64,
    pub base_input_quantity: Option<f64>,
}

impl Default for TaskPrior {
    fn default() -> Self {
        Self {
            t_base_1: None,
            p_obs: 1.0,
            c_startup: 6.0,
            k_exponent: 1.0,
            alpha_p: 0.3,
            alpha_k: 0.3,
            base_input_quantity: None,
        }
    }
}

impl TaskPrior {
    pub fn with_baseline(mut self, t_base_1: f64) -> Self {
        self.t_base_1 = Some(t_base_1);
        self
    }

    pub fn validate(&self) -> ArboResult<()> {
        if let Some(t) = self.t_base_1 {
            ensure_positive("t_base_1", t)?;
        }
        if !(0.0..=1.0).contains(&self.p_obs) {
            return Err(ArboError::Validation(format!("p_obs must be within [0, 1], got {}", self.p_obs)));
        }
        if !self.c_startup.is_finite() || self.c_startup < 0.0 {
            return Err(ArboError::Validation(format!("c_startup must be >= 0, got {}", self.c_startup)));
        }
        if !self.k_exponent.is_finite() {
            return Err(ArboError::Validation("k_exponent must be finite".into()));
        }
        ensure_rate("alpha_p", self.alpha_p)?;
        ensure_rate("alpha_k", self.alpha_k)?;
        if let Some(q) = self.base_input_quantity {
            ensure_positive("base_input_quantity", q)?;
        }
        Ok(())
    }
}

impl TaskModel {
    /// Build a fresh model from priors. The store assigns the version on insert.
    pub fn new(task_name: impl Into<String>, prior: &TaskPrior) -> Self {
        let now = Utc::now();
        Self {
            task_name: task_name.into(),
            t_base_1: prior.t_base_1.unwrap_or(UNSET_BASELINE),
            p_obs: prior.p_obs,
            c_startup: prior.c_startup,
            k_exponent: prior.k_exponent,
            alpha_p: prior.alpha_p,
            alpha_k: prior.alpha_k,
            sample_count: 0,
            base_input_quantity: prior.base_input_quantity,
            baseline_established: prior.t_base_1.is_some(),
            version: 0,
            created_at: now,
            last_updated: now,
        }
    }

    /// Convert a raw work quantity into an input scale factor.
    pub fn scale_factor_for(&self, input_quantity: f64) -> f64 {
        match self.base_input_quantity {
            Some(base) if base > 0.0 => input_quantity / base,
            _ => 1.0,
        }
    }

    /// Check the stored invariants; used by stores before accepting a write.
    pub fn validate(&self) -> ArboResult<()> {
        validate_task_name(&self.task_name)?;
        ensure_positive("t_base_1", self.t_base_1)?;
        if !(0.0..=1.0).contains(&self.p_obs) {
            return Err(ArboError::Validation(format!("p_obs out of range: {}", self.p_obs)));
        }
        if !self.c_startup.is_finite() || self.c_startup < 0.0 {
            return Err(ArboError::Validation(format!("c_startup out of range: {}", self.c_startup)));
        }
        if !self.k_exponent.is_finite() {
            return Err(ArboError::Validation("k_exponent must be finite".into()));
        }
        ensure_rate("alpha_p", self.alpha_p)?;
        ensure_rate("alpha_k", self.alpha_k)
    }
}

/// What the optimizer minimises among feasible candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Objective {
    #[default]
    Latency,
    Cost,
}

/// Optional service-level and budget constraints for a recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    /// Upper bound on the pessimistic predicted time (inclusive).
    pub max_time: Option<f64>,
    /// Budget on `s * predicted_time * cost_per_second` (inclusive).
    pub max_cost: Option<f64>,
    pub cost_per_second: f64,
    pub objective: Objective,
    /// Overrides the policy's candidate range upper bound.
    pub max_parallelism: Option<u32>,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            max_time: None,
            max_cost: None,
            cost_per_second: 1.0,
            objective: Objective::Latency,
            max_parallelism: None,
        }
    }
}

impl Constraints {
    pub fn validate(&self) -> ArboResult<()> {
        if let Some(t) = self.max_time {
            if !t.is_finite() || t < 0.0 {
                return Err(ArboError::Validation(format!("max_time must be >= 0, got {}", t)));
            }
        }
        if let Some(c) = self.max_cost {
            if !c.is_finite() || c < 0.0 {
                return Err(ArboError::Validation(format!("max_cost must be >= 0, got {}", c)));
            }
        }
        if !self.cost_per_second.is_finite() || self.cost_per_second < 0.0 {
            return Err(ArboError::Validation(format!(
                "cost_per_second must be >= 0, got {}",
                self.cost_per_second
            )));
        }
        if let Some(s_max) = self.max_parallelism {
            validate_candidate_range(s_max)?;
        }
        Ok(())
    }
}

// ── Boundary validation ──────────────────────────────────────

pub fn validate_task_name(name: &str) -> ArboResult<()> {
    if name.trim().is_empty() {
        return Err(ArboError::Validation("task_name must not be empty".into()));
    }
    Ok(())
}

pub fn validate_parallelism(s: u32) -> ArboResult<()> {
    if s < 1 {
        return Err(ArboError::Validation("parallelism must be >= 1".into()));
    }
    if s > PARALLELISM_LIMIT {
        return Err(ArboError::Validation(format!(
            "parallelism must be <= {}, got {}",
            PARALLELISM_LIMIT, s
        )));
    }
    Ok(())
}

/// Upper end of a candidate search range.
pub fn validate_candidate_range(s_max: u32) -> ArboResult<()> {
    if s_max < 1 || s_max > CANDIDATE_LIMIT {
        return Err(ArboError::Validation(format!(
            "max_parallelism must be within [1, {}], got {}",
            CANDIDATE_LIMIT, s_max
        )));
    }
    Ok(())
}

pub fn validate_scale_factor(gamma: f64) -> ArboResult<()> {
    ensure_positive("input_scale_factor", gamma)
}

pub fn validate_cluster_load(load: f64) -> ArboResult<()> {
    if !load.is_finite() || load < 0.0 {
        return Err(ArboError::Validation(format!("cluster_load must be >= 0, got {}", load)));
    }
    Ok(())
}

pub fn validate_duration(duration: f64) -> ArboResult<()> {
    if !duration.is_finite() || duration < 0.0 {
        return Err(ArboError::Validation(format!("total_duration must be >= 0, got {}", duration)));
    }
    Ok(())
}

pub fn validate_cost_metric(cost: Option<f64>) -> ArboResult<()> {
    match cost {
        Some(c) if !c.is_finite() || c < 0.0 => {
            Err(ArboError::Validation(format!("cost_metric must be >= 0, got {}", c)))
        }
        _ => Ok(()),
    }
}

fn ensure_positive(field: &str, value: f64) -> ArboResult<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ArboError::Validation(format!("{} must be > 0, got {}", field, value)));
    }
    Ok(())
}

fn ensure_rate(field: &str, value: f64) -> ArboResult<()> {
    if !(value > 0.0 && value <= 1.0) {
        return Err(ArboError::Validation(format!("{} must be within (0, 1], got {}", field, value)));
    }
    Ok(())
}
