use serde::Serialize;

/// Why a recommendation has the value it has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationSource {
    /// Too few samples to trust the model; caller's default returned.
    ColdStart,
    /// Chosen by the constrained search.
    Optimized,
    /// No candidate met the constraints; caller's default returned.
    FeasibilityViolation,
    /// A collaborator failed or timed out; caller's default returned.
    Degraded,
}

impl RecommendationSource {
    /// Whether the value is the caller-supplied default.
    pub fn is_fallback(&self) -> bool {
        !matches!(self, Self::Optimized)
    }
}

/// Answer to a recommendation request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub task_name: String,
    pub parallelism: u32,
    pub source: RecommendationSource,
    /// The γ the decision was made for.
    pub input_scale_factor: f64,
    /// `None` when the monitor was never consulted or failed.
    pub cluster_load: Option<f64>,
    /// Law + residual mean at the chosen `s`; absent on fallbacks.
    pub predicted_time: Option<f64>,
    pub upper_bound: Option<f64>,
    pub predicted_cost: Option<f64>,
}

impl Recommendation {
    pub(crate) fn fallback(
        task_name: &str,
        default_value: u32,
        source: RecommendationSource,
        input_scale_factor: f64,
        cluster_load: Option<f64>,
    ) -> Self {
        Self {
            task_name: task_name.to_string(),
            parallelism: default_value,
            source,
            input_scale_factor,
            cluster_load,
            predicted_time: None,
            upper_bound: None,
            predicted_cost: None,
        }
    }
}

/// One row of the candidate table produced by the search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CandidateEvaluation {
    pub parallelism: u32,
    /// Deterministic law alone.
    pub baseline_time: f64,
    pub residual_mean: f64,
    pub residual_std: f64,
    /// `baseline_time + residual_mean`
    pub predicted_time: f64,
    /// `predicted_time + z · residual_std`
    pub upper_bound: f64,
    /// `s · predicted_time · cost_per_second`
    pub predicted_cost: f64,
    pub feasible: bool,
}
