pub mod cache;
pub mod estimator;
pub mod metrics;
pub mod monitor;
pub mod optimizer;
pub mod performance;
pub mod residual;

pub use cache::RecommendationCache;
pub use estimator::{EstimatorOutcome, ParameterEstimator, UpdateKind};
pub use metrics::OptimizerMetrics;
pub use monitor::{ClusterMonitor, MonitorError, SharedLoad, StaticLoad};
pub use optimizer::{CandidateEvaluation, Optimizer, Recommendation, RecommendationSource};
pub use performance::{amdahl_factor, ContentionPolicy, PerformanceModel};
pub use residual::{ResidualConfig, ResidualModel, ResidualPrediction, UNFIT_STD};
