use arbo_core::{validate_cluster_load, validate_parallelism, validate_scale_factor, ArboResult, TaskModel};
use serde::{Deserialize, Serialize};

/// Slowdown multiplier as a function of cluster load.
///
/// Every shape is monotone non-decreasing in load and equals 1.0 at zero load.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum ContentionPolicy {
    /// Load is ignored.
    None,
    /// `1 + β·L`
    Linear { beta: f64 },
    /// `1 + β·L`, capped at `max_factor`.
    Saturating { beta: f64, max_factor: f64 },
}

impl Default for ContentionPolicy {
    fn default() -> Self {
        Self::Linear { beta: 0.01 }
    }
}

impl ContentionPolicy {
    pub fn factor(&self, load: f64) -> f64 {
        let load = load.max(0.0);
        match *self {
            Self::None => 1.0,
            Self::Linear { beta } => 1.0 + beta.max(0.0) * load,
            Self::Saturating { beta, max_factor } => {
                (1.0 + beta.max(0.0) * load).min(max_factor.max(1.0))
            }
        }
    }
}

/// Amdahl speedup term `(1 − p) + p / s`.
#[inline]
pub fn amdahl_factor(s: f64, p: f64) -> f64 {
    (1.0 - p) + p / s
}

/// Deterministic time law:
/// `c_startup + t_base_1 · γ^k · ((1 − p) + p/s) · contention(L)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceModel {
    pub contention: ContentionPolicy,
}

impl PerformanceModel {
    pub fn new(contention: ContentionPolicy) -> Self {
        Self { contention }
    }

    /// Predicted baseline time, rejecting `s < 1`, `γ ≤ 0` and negative load.
    pub fn predict(&self, s: u32, gamma: f64, load: f64, model: &TaskModel) -> ArboResult<f64> {
        validate_parallelism(s)?;
        validate_scale_factor(gamma)?;
        validate_cluster_load(load)?;
        Ok(self.predict_unchecked(s as f64, gamma, load, model))
    }

    /// The law without boundary checks; `s` may be any value ≥ 1.
    pub fn predict_unchecked(&self, s: f64, gamma: f64, load: f64, model: &TaskModel) -> f64 {
        model.c_startup
            + self.scaled_work(gamma, load, model) * amdahl_factor(s, model.p_obs)
    }

    /// Limit of the law as `s → ∞`.
    pub fn amdahl_floor(&self, gamma: f64, load: f64, model: &TaskModel) -> f64 {
        model.c_startup + self.scaled_work(gamma, load, model) * (1.0 - model.p_obs)
    }

    /// `t_base_1 · γ^k · contention(L)`: the single-worker time net of startup.
    pub fn scaled_work(&self, gamma: f64, load: f64, model: &TaskModel) -> f64 {
        model.t_base_1 * gamma.powf(model.k_exponent) * self.contention.factor(load)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbo_core::{ArboError, TaskPrior};

    fn worked_model() -> TaskModel {
        let prior = TaskPrior {
            p_obs: 0.8,
            c_startup: 5.0,
            k_exponent: 1.0,
            ..TaskPrior::default()
        };
        TaskModel::new("worked", &prior.with_baseline(100.0))
    }

    fn flat() -> PerformanceModel {
        PerformanceModel::new(ContentionPolicy::None)
    }

    #[test]
    fn worked_example() {
        let m = worked_model();
        let law = flat();
        assert!((law.predict(1, 1.0, 0.0, &m).unwrap() - 105.0).abs() < 1e-9);
        assert!((law.predict(4, 1.0, 0.0, &m).unwrap() - 45.0).abs() < 1e-9);
        assert!((law.predict(100, 1.0, 0.0, &m).unwrap() - 25.8).abs() < 1e-9);
        assert!((law.amdahl_floor(1.0, 0.0, &m) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn reference_calculation_with_half_parallel() {
        // 10 startup + 50 serial + 25 parallel at s = 2.
        let prior = TaskPrior { p_obs: 0.5, c_startup: 10.0, ..TaskPrior::default() };
        let m = TaskModel::new("t", &prior.with_baseline(100.0));
        assert_eq!(flat().predict(2, 1.0, 0.0, &m).unwrap(), 85.0);
    }

    #[test]
    fn non_increasing_in_parallelism() {
        let m = worked_model();
        let law = PerformanceModel::default();
        for gamma in [0.5, 1.0, 3.0] {
            for load in [0.0, 10.0, 80.0] {
                let mut prev = f64::INFINITY;
                for s in 1..=256 {
                    let t = law.predict(s, gamma, load, &m).unwrap();
                    assert!(t <= prev, "s={} gamma={} load={}", s, gamma, load);
                    prev = t;
                }
            }
        }
    }

    #[test]
    fn never_below_floor_and_converges() {
        let m = worked_model();
        let law = PerformanceModel::default();
        let floor = law.amdahl_floor(2.0, 5.0, &m);
        for s in [1u32, 2, 10, 1_000, 1_000_000] {
            assert!(law.predict(s, 2.0, 5.0, &m).unwrap() >= floor);
        }
        let far = law.predict(10_000_000, 2.0, 5.0, &m).unwrap();
        assert!((far - floor).abs() < 1e-4);
    }

    #[test]
    fn equals_full_work_at_one_worker() {
        let m = worked_model();
        let law = PerformanceModel::default();
        let expected = m.c_startup + law.scaled_work(1.7, 3.0, &m);
        assert!((law.predict(1, 1.7, 3.0, &m).unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn zero_parallelism_is_rejected() {
        let m = worked_model();
        assert!(matches!(flat().predict(0, 1.0, 0.0, &m), Err(ArboError::Validation(_))));
        assert!(flat().predict(1, 0.0, 0.0, &m).is_err());
        assert!(flat().predict(1, 1.0, -1.0, &m).is_err());
    }

    #[test]
    fn contention_shapes() {
        assert_eq!(ContentionPolicy::None.factor(50.0), 1.0);
        assert_eq!(ContentionPolicy::Linear { beta: 0.01 }.factor(0.0), 1.0);
        assert!((ContentionPolicy::Linear { beta: 0.01 }.factor(20.0) - 1.2).abs() < 1e-12);
        let sat = ContentionPolicy::Saturating { beta: 0.1, max_factor: 2.0 };
        assert_eq!(sat.factor(0.0), 1.0);
        assert_eq!(sat.factor(100.0), 2.0);
        assert!(sat.factor(5.0) <= sat.factor(6.0));
    }
}
