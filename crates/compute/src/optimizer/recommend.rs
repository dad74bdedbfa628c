use arbo_core::{
    validate_cluster_load, validate_parallelism, validate_scale_factor, validate_task_name, ArboError,
    ArboResult, Constraints, TaskModel,
};
use tracing::{debug, info, warn};

use super::search::{self, SearchContext};
use super::types::{CandidateEvaluation, Recommendation, RecommendationSource};
use super::Optimizer;
use crate::residual::ResidualModel;

impl Optimizer {
    /// Recommend a parallelism for the next run of `task_name` at scale `gamma`.
    ///
    /// Only malformed input is an error. Cold start, infeasible constraints and
    /// collaborator failures all return `default_value`, tagged with the reason.
    pub async fn recommend_parallelism(
        &self,
        task_name: &str,
        input_scale_factor: f64,
        default_value: u32,
        constraints: Option<&Constraints>,
    ) -> ArboResult<Recommendation> {
        self.recommend_inner(task_name, input_scale_factor, default_value, constraints, None)
            .await
    }

    /// Like [`Self::recommend_parallelism`] with a caller-supplied cluster load
    /// instead of a monitor reading.
    pub async fn recommend_at_load(
        &self,
        task_name: &str,
        input_scale_factor: f64,
        cluster_load: f64,
        default_value: u32,
        constraints: Option<&Constraints>,
    ) -> ArboResult<Recommendation> {
        validate_cluster_load(cluster_load)?;
        self.recommend_inner(task_name, input_scale_factor, default_value, constraints, Some(cluster_load))
            .await
    }

    /// Recommend from a raw work quantity, converted with the task's
    /// `base_input_quantity`. The γ used is on the returned recommendation.
    pub async fn recommend_for_quantity(
        &self,
        task_name: &str,
        input_quantity: f64,
        default_value: u32,
        constraints: Option<&Constraints>,
    ) -> ArboResult<Recommendation> {
        validate_task_name(task_name)?;
        validate_parallelism(default_value)?;
        if !input_quantity.is_finite() || input_quantity <= 0.0 {
            return Err(ArboError::Validation(format!(
                "input_quantity must be > 0, got {}",
                input_quantity
            )));
        }

        let gamma = match self.task_model(task_name).await {
            Ok(Some(model)) => model.scale_factor_for(input_quantity),
            Ok(None) => 1.0,
            Err(e) => return Ok(self.degraded(task_name, default_value, 1.0, None, &e)),
        };
        self.recommend_inner(task_name, gamma, default_value, constraints, None)
            .await
    }

    /// Full candidate table for diagnostics. Unlike the recommendation path
    /// this surfaces collaborator errors and requires a persisted model.
    pub async fn evaluate_candidates(
        &self,
        task_name: &str,
        input_scale_factor: f64,
        cluster_load: f64,
        constraints: Option<&Constraints>,
    ) -> ArboResult<Vec<CandidateEvaluation>> {
        validate_task_name(task_name)?;
        validate_scale_factor(input_scale_factor)?;
        validate_cluster_load(cluster_load)?;
        let constraints = constraints.cloned().unwrap_or_default();
        constraints.validate()?;

        let model = self
            .task_model(task_name)
            .await?
            .ok_or_else(|| ArboError::TaskNotFound(task_name.to_string()))?;
        let residual = self.fit_residual(task_name).await?;
        let ctx = self.search_context(&model, &residual, input_scale_factor, cluster_load);
        let s_max = self.candidate_range(&constraints);
        Ok(search::evaluate(&ctx, s_max, &constraints).collect())
    }

    async fn recommend_inner(
        &self,
        task_name: &str,
        gamma: f64,
        default_value: u32,
        constraints: Option<&Constraints>,
        load: Option<f64>,
    ) -> ArboResult<Recommendation> {
        validate_task_name(task_name)?;
        validate_scale_factor(gamma)?;
        validate_parallelism(default_value)?;
        let constraints = constraints.cloned().unwrap_or_default();
        constraints.validate()?;

        let load = match load {
            Some(l) => l,
            None => match self.read_load().await {
                Ok(l) => l,
                Err(e) => return Ok(self.degraded(task_name, default_value, gamma, None, &e)),
            },
        };

        let key = self.cache.key(task_name, gamma, load, default_value, &constraints);
        if let Some(hit) = self.cache.get(&key) {
            debug!(task = %task_name, s = hit.parallelism, "recommendation cache hit");
            let mut m = self.lock_metrics();
            m.cache_hits += 1;
            m.recommendations_served += 1;
            return Ok(hit);
        }

        let generation = self.cache.generation(task_name);
        let recommendation = match self.decide(task_name, gamma, load, default_value, &constraints).await {
            Ok(r) => r,
            Err(e) => return Ok(self.degraded(task_name, default_value, gamma, Some(load), &e)),
        };

        if matches!(
            recommendation.source,
            RecommendationSource::Optimized | RecommendationSource::FeasibilityViolation
        ) {
            self.cache.put(key, recommendation.clone(), generation);
        }
        self.lock_metrics().recommendations_served += 1;
        Ok(recommendation)
    }

    /// Cold-start check, residual fit and constrained search.
    async fn decide(
        &self,
        task_name: &str,
        gamma: f64,
        load: f64,
        default_value: u32,
        constraints: &Constraints,
    ) -> ArboResult<Recommendation> {
        let model = self.task_model(task_name).await?;
        let model = match model {
            Some(m) if m.sample_count >= self.policy.warmup_samples => m,
            other => {
                debug!(
                    task = %task_name,
                    samples = other.as_ref().map(|m| m.sample_count).unwrap_or(0),
                    "cold start, returning default"
                );
                self.lock_metrics().cold_starts += 1;
                return Ok(Recommendation::fallback(
                    task_name,
                    default_value,
                    RecommendationSource::ColdStart,
                    gamma,
                    Some(load),
                ));
            }
        };

        let residual = self.fit_residual(task_name).await?;
        let ctx = self.search_context(&model, &residual, gamma, load);
        let s_max = self.candidate_range(constraints);
        let best = search::select(search::evaluate(&ctx, s_max, constraints), constraints.objective);

        match best {
            Some(best) => {
                info!(
                    task = %task_name,
                    s = best.parallelism,
                    predicted = best.predicted_time,
                    upper = best.upper_bound,
                    gamma,
                    load,
                    "parallelism recommended"
                );
                Ok(Recommendation {
                    task_name: task_name.to_string(),
                    parallelism: best.parallelism,
                    source: RecommendationSource::Optimized,
                    input_scale_factor: gamma,
                    cluster_load: Some(load),
                    predicted_time: Some(best.predicted_time),
                    upper_bound: Some(best.upper_bound),
                    predicted_cost: Some(best.predicted_cost),
                })
            }
            None => {
                warn!(
                    task = %task_name,
                    s_max,
                    max_time = ?constraints.max_time,
                    max_cost = ?constraints.max_cost,
                    default = default_value,
                    "no feasible parallelism, falling back to default"
                );
                self.lock_metrics().feasibility_violations += 1;
                Ok(Recommendation::fallback(
                    task_name,
                    default_value,
                    RecommendationSource::FeasibilityViolation,
                    gamma,
                    Some(load),
                ))
            }
        }
    }

    pub(super) async fn fit_residual(&self, task_name: &str) -> ArboResult<ResidualModel> {
        let history = self
            .call(
                "get_recent_history",
                self.store.get_recent_history(task_name, self.policy.history_window),
            )
            .await?;
        Ok(ResidualModel::fit(&history, self.residual_config.clone()))
    }

    /// Monitor reading, rejected when it is not a usable load.
    async fn read_load(&self) -> ArboResult<f64> {
        let load = self.call("current_cluster_load", self.monitor.current_cluster_load()).await?;
        validate_cluster_load(load)
            .map_err(|e| ArboError::Unavailable(format!("cluster monitor returned an unusable reading: {}", e)))?;
        Ok(load)
    }

    fn search_context<'a>(
        &'a self,
        model: &'a TaskModel,
        residual: &'a ResidualModel,
        gamma: f64,
        load: f64,
    ) -> SearchContext<'a> {
        SearchContext {
            performance: &self.performance,
            residual,
            model,
            gamma,
            load,
            confidence_z: self.policy.confidence_z,
        }
    }

    fn candidate_range(&self, constraints: &Constraints) -> u32 {
        constraints.max_parallelism.unwrap_or(self.policy.max_parallelism)
    }

    fn degraded(
        &self,
        task_name: &str,
        default_value: u32,
        gamma: f64,
        load: Option<f64>,
        cause: &ArboError,
    ) -> Recommendation {
        warn!(task = %task_name, error = %cause, default = default_value, "recommendation failing open");
        {
            let mut m = self.lock_metrics();
            m.fail_open_fallbacks += 1;
            m.recommendations_served += 1;
        }
        Recommendation::fallback(task_name, default_value, RecommendationSource::Degraded, gamma, load)
    }
}
