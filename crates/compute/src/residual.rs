//! Gaussian-process regression over the residuals the time law cannot explain.
//!
//! Inputs are `(s, γ, L)` feature vectors from the recent execution window,
//! targets are the recorded residuals. The kernel is a squared-exponential
//! with fixed per-dimension length scales and a signal variance taken from
//! the sample variance of the window, so fitting is a single Cholesky
//! factorisation: O(n³) for n ≤ window size, and fully deterministic.

use arbo_core::ExecutionRecord;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Standard deviation reported when there is too little data to fit.
pub const UNFIT_STD: f64 = 1.0e6;

/// Jitter ladder tried when the kernel matrix is numerically singular.
const JITTER_STEPS: [f64; 5] = [0.0, 1e-8, 1e-6, 1e-4, 1e-2];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidualConfig {
    /// Length scales for `(s, γ, L)`.
    pub length_scales: [f64; 3],
    /// Observation noise added to the kernel diagonal (seconds²).
    pub noise_variance: f64,
    /// Lower bound for the signal variance so sparse windows stay uncertain.
    pub min_signal_variance: f64,
    /// Fewer window rows than this yields the unfit sentinel.
    pub min_samples: usize,
}

impl Default for ResidualConfig {
    fn default() -> Self {
        Self {
            length_scales: [10.0, 1.0, 10.0],
            noise_variance: 1.0,
            min_signal_variance: 1.0,
            min_samples: 2,
        }
    }
}

/// Predictive distribution of the residual at one query point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResidualPrediction {
    pub mean: f64,
    pub std: f64,
}

#[derive(Debug, Clone)]
struct FittedProcess {
    inputs: Vec<[f64; 3]>,
    /// Lower-triangular Cholesky factor of `K + σₙ²I`, row-major.
    chol: Vec<f64>,
    /// `(K + σₙ²I)⁻¹ (y − ȳ)`
    weights: Vec<f64>,
    y_mean: f64,
    signal_variance: f64,
}

/// Residual model fitted over one history window.
#[derive(Debug, Clone)]
pub struct ResidualModel {
    config: ResidualConfig,
    fitted: Option<FittedProcess>,
}

impl ResidualModel {
    /// An empty model: zero mean, maximal uncertainty everywhere.
    pub fn unfit(config: ResidualConfig) -> Self {
        Self { config, fitted: None }
    }

    /// Fit on a history window (any order; the fit is order-independent up to rounding).
    pub fn fit(records: &[ExecutionRecord], config: ResidualConfig) -> Self {
        let samples: Vec<([f64; 3], f64)> = records
            .iter()
            .filter(|r| r.residual.is_finite())
            .map(|r| (r.features(), r.residual))
            .collect();
        Self::fit_samples(&samples, config)
    }

    pub fn fit_samples(samples: &[([f64; 3], f64)], config: ResidualConfig) -> Self {
        let n = samples.len();
        if n < config.min_samples.max(1) {
            return Self::unfit(config);
        }

        let y_mean = samples.iter().map(|(_, y)| y).sum::<f64>() / n as f64;
        let sample_var = samples.iter().map(|(_, y)| (y - y_mean).powi(2)).sum::<f64>() / n as f64;
        let signal_variance = sample_var.max(config.min_signal_variance);
        let inputs: Vec<[f64; 3]> = samples.iter().map(|(x, _)| *x).collect();

        let mut gram = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..=i {
                let k = kernel(&inputs[i], &inputs[j], &config.length_scales, signal_variance);
                gram[i * n + j] = k;
                gram[j * n + i] = k;
            }
        }

        let mut chol = None;
        for jitter in JITTER_STEPS {
            let mut a = gram.clone();
            for i in 0..n {
                a[i * n + i] += config.noise_variance + jitter;
            }
            if let Some(l) = cholesky(&a, n) {
                chol = Some(l);
                break;
            }
        }
        let Some(chol) = chol else {
            warn!(samples = n, "residual kernel matrix not positive definite; using unfit model");
            return Self::unfit(config);
        };

        let centered: Vec<f64> = samples.iter().map(|(_, y)| y - y_mean).collect();
        let z = forward_substitute(&chol, n, &centered);
        let weights = backward_substitute(&chol, n, &z);

        debug!(samples = n, y_mean, signal_variance, "residual model fitted");
        Self {
            config,
            fitted: Some(FittedProcess { inputs, chol, weights, y_mean, signal_variance }),
        }
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    pub fn sample_count(&self) -> usize {
        self.fitted.as_ref().map(|f| f.inputs.len()).unwrap_or(0)
    }

    pub fn predict(&self, s: f64, gamma: f64, load: f64) -> ResidualPrediction {
        let Some(fit) = &self.fitted else {
            return ResidualPrediction { mean: 0.0, std: UNFIT_STD };
        };
        let query = [s, gamma, load];
        let n = fit.inputs.len();
        let k_star: Vec<f64> = fit
            .inputs
            .iter()
            .map(|x| kernel(x, &query, &self.config.length_scales, fit.signal_variance))
            .collect();

        let mean = fit.y_mean + dot(&k_star, &fit.weights);
        let v = forward_substitute(&fit.chol, n, &k_star);
        let variance = (fit.signal_variance - dot(&v, &v)).max(0.0);
        ResidualPrediction { mean, std: variance.sqrt() }
    }

    pub fn mean(&self, s: f64, gamma: f64, load: f64) -> f64 {
        self.predict(s, gamma, load).mean
    }

    pub fn std(&self, s: f64, gamma: f64, load: f64) -> f64 {
        self.predict(s, gamma, load).std
    }
}

fn kernel(a: &[f64; 3], b: &[f64; 3], length_scales: &[f64; 3], signal_variance: f64) -> f64 {
    let sq: f64 = a
        .iter()
        .zip(b.iter())
        .zip(length_scales.iter())
        .map(|((x, y), l)| {
            let d = (x - y) / l;
            d * d
        })
        .sum();
    signal_variance * (-0.5 * sq).exp()
}

#[inline]
fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Cholesky–Banachiewicz; `None` if `a` is not positive definite.
fn cholesky(a: &[f64], n: usize) -> Option<Vec<f64>> {
    let mut l = vec![0.0; n * n];
    for i in 0..n {
        for j in 0..=i {
            let sum: f64 = (0..j).map(|k| l[i * n + k] * l[j * n + k]).sum();
            if i == j {
                let d = a[i * n + i] - sum;
                if d <= 0.0 || !d.is_finite() {
                    return None;
                }
                l[i * n + j] = d.sqrt();
            } else {
                l[i * n + j] = (a[i * n + j] - sum) / l[j * n + j];
            }
        }
    }
    Some(l)
}

/// Solve `L z = b`.
fn forward_substitute(l: &[f64], n: usize, b: &[f64]) -> Vec<f64> {
    let mut z = vec![0.0; n];
    for i in 0..n {
        let sum: f64 = (0..i).map(|k| l[i * n + k] * z[k]).sum();
        z[i] = (b[i] - sum) / l[i * n + i];
    }
    z
}

/// Solve `Lᵀ x = z`.
fn backward_substitute(l: &[f64], n: usize, z: &[f64]) -> Vec<f64> {
    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let sum: f64 = (i + 1..n).map(|k| l[k * n + i] * x[k]).sum();
        x[i] = (z[i] - sum) / l[i * n + i];
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ResidualConfig {
        ResidualConfig::default()
    }

    #[test]
    fn below_min_samples_is_unfit() {
        let model = ResidualModel::fit_samples(&[([4.0, 1.0, 0.0], 3.0)], cfg());
        assert!(!model.is_fitted());
        let p = model.predict(4.0, 1.0, 0.0);
        assert_eq!(p.mean, 0.0);
        assert_eq!(p.std, UNFIT_STD);
    }

    #[test]
    fn empty_window_is_unfit() {
        let model = ResidualModel::fit(&[], cfg());
        assert_eq!(model.predict(1.0, 1.0, 0.0).std, UNFIT_STD);
    }

    #[test]
    fn learns_constant_bias() {
        let samples: Vec<_> = (1..=8).map(|s| ([s as f64, 1.0, 0.0], 7.0)).collect();
        let model = ResidualModel::fit_samples(&samples, cfg());
        assert!(model.is_fitted());
        assert!((model.mean(4.0, 1.0, 0.0) - 7.0).abs() < 1e-6);
        // Far away the mean reverts to the window average, which is also 7.
        assert!((model.mean(500.0, 9.0, 300.0) - 7.0).abs() < 1e-6);
    }

    #[test]
    fn uncertainty_grows_away_from_data() {
        let samples: Vec<_> = (1..=6).map(|s| ([s as f64, 1.0, 0.0], (s as f64).sin() * 4.0)).collect();
        let model = ResidualModel::fit_samples(&samples, cfg());
        let near = model.std(3.0, 1.0, 0.0);
        let mid = model.std(20.0, 1.0, 0.0);
        let far = model.std(200.0, 5.0, 100.0);
        assert!(near < mid, "near={} mid={}", near, mid);
        assert!(mid <= far, "mid={} far={}", mid, far);
    }

    #[test]
    fn tracks_a_trend_between_points() {
        // Residual grows with s; interpolation should sit between neighbours.
        let samples: Vec<_> = [2.0, 4.0, 6.0, 8.0, 10.0]
            .iter()
            .map(|&s| ([s, 1.0, 0.0], 2.0 * s))
            .collect();
        let model = ResidualModel::fit_samples(&samples, cfg());
        let m = model.mean(5.0, 1.0, 0.0);
        assert!(m > 6.0 && m < 14.0, "mean={}", m);
    }

    #[test]
    fn fit_is_deterministic() {
        let samples: Vec<_> = (1..=10)
            .map(|i| ([i as f64, 1.0 + i as f64 * 0.1, (i % 3) as f64], (i * 7 % 5) as f64))
            .collect();
        let a = ResidualModel::fit_samples(&samples, cfg()).predict(3.5, 1.2, 1.0);
        let b = ResidualModel::fit_samples(&samples, cfg()).predict(3.5, 1.2, 1.0);
        assert_eq!(a, b);
    }

    #[test]
    fn duplicate_points_without_noise_still_fit() {
        let config = ResidualConfig { noise_variance: 0.0, ..cfg() };
        let samples = vec![([2.0, 1.0, 0.0], 1.0), ([2.0, 1.0, 0.0], 1.0), ([2.0, 1.0, 0.0], 1.0)];
        let model = ResidualModel::fit_samples(&samples, config);
        assert!(model.is_fitted());
        assert!((model.mean(2.0, 1.0, 0.0) - 1.0).abs() < 1e-3);
    }

    #[test]
    fn cholesky_reconstructs_matrix() {
        let a = [4.0, 2.0, 2.0, 3.0];
        let l = cholesky(&a, 2).unwrap();
        assert!((l[0] - 2.0).abs() < 1e-12);
        assert!((l[2] - 1.0).abs() < 1e-12);
        assert!((l[3] - 2f64.sqrt()).abs() < 1e-12);
        assert!(cholesky(&[1.0, 2.0, 2.0, 1.0], 2).is_none());
    }
}
