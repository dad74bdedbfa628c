//! Candidate enumeration and selection. Pure functions over a fitted model.

use arbo_core::{Constraints, Objective, TaskModel};
use tracing::debug;

use super::types::CandidateEvaluation;
use crate::performance::PerformanceModel;
use crate::residual::ResidualModel;

/// Inputs shared by every candidate of one search.
pub struct SearchContext<'a> {
    pub performance: &'a PerformanceModel,
    pub residual: &'a ResidualModel,
    pub model: &'a TaskModel,
    pub gamma: f64,
    pub load: f64,
    pub confidence_z: f64,
}

/// Evaluate every `s` in `[1, s_max]` in ascending order, lazily.
pub fn evaluate<'a>(
    ctx: &'a SearchContext<'a>,
    s_max: u32,
    constraints: &'a Constraints,
) -> impl Iterator<Item = CandidateEvaluation> + 'a {
    (1..=s_max.max(1)).map(move |s| {
        let baseline_time = ctx.performance.predict_unchecked(s as f64, ctx.gamma, ctx.load, ctx.model);
        let residual = ctx.residual.predict(s as f64, ctx.gamma, ctx.load);
        let predicted_time = baseline_time + residual.mean;
        let upper_bound = predicted_time + ctx.confidence_z * residual.std;
        let predicted_cost = s as f64 * predicted_time * constraints.cost_per_second;

        let within_time = constraints.max_time.map_or(true, |max| upper_bound <= max);
        let within_budget = constraints.max_cost.map_or(true, |max| predicted_cost <= max);

        let candidate = CandidateEvaluation {
            parallelism: s,
            baseline_time,
            residual_mean: residual.mean,
            residual_std: residual.std,
            predicted_time,
            upper_bound,
            predicted_cost,
            feasible: within_time && within_budget && predicted_time.is_finite(),
        };
        debug!(
            s,
            predicted = candidate.predicted_time,
            upper = candidate.upper_bound,
            cost = candidate.predicted_cost,
            feasible = candidate.feasible,
            "candidate evaluated"
        );
        candidate
    })
}

/// Best feasible candidate for `objective`; ties go to the earliest, which
/// is the smallest `s` for [`evaluate`] output.
pub fn select<I>(candidates: I, objective: Objective) -> Option<CandidateEvaluation>
where
    I: IntoIterator<Item = CandidateEvaluation>,
{
    let score = |c: &CandidateEvaluation| match objective {
        Objective::Latency => c.predicted_time,
        Objective::Cost => c.predicted_cost,
    };
    candidates
        .into_iter()
        .filter(|c| c.feasible)
        .fold(None, |best: Option<CandidateEvaluation>, c| match best {
            Some(b) if score(&b) <= score(&c) => Some(b),
            _ => Some(c),
        })
}
