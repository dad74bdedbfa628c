use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arbo_core::{ArboError, Constraints, ExecutionRecord, Objective, Observation, PolicyConfig, TaskModel, TaskPrior};
use arbo_storage::{MemoryStore, StoreError, TaskStore};
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{Optimizer, RecommendationSource};
use crate::monitor::{ClusterMonitor, MonitorError, SharedLoad, StaticLoad};
use crate::performance::ContentionPolicy;

/// Monitor that never answers within any reasonable timeout.
struct StalledMonitor;

#[async_trait]
impl ClusterMonitor for StalledMonitor {
    async fn current_cluster_load(&self) -> Result<f64, MonitorError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(0.0)
    }
}

/// Memory store with scripted faults: slow acknowledgements after a
/// successful commit, slow history reads, and a parallelism value the
/// database refuses outright.
#[derive(Default)]
struct FaultyStore {
    inner: MemoryStore,
    slow_commits: AtomicU32,
    slow_history_reads: AtomicU32,
    rejected_parallelism: AtomicU32,
}

impl FaultyStore {
    const COMMIT_ACK_DELAY: Duration = Duration::from_millis(600);
    const HISTORY_DELAY: Duration = Duration::from_millis(100);

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl TaskStore for FaultyStore {
    async fn get_model(&self, task_name: &str) -> Result<Option<TaskModel>, StoreError> {
        self.inner.get_model(task_name).await
    }

    async fn get_recent_history(&self, task_name: &str, limit: usize) -> Result<Vec<ExecutionRecord>, StoreError> {
        if Self::take(&self.slow_history_reads) {
            tokio::time::sleep(Self::HISTORY_DELAY).await;
        }
        self.inner.get_recent_history(task_name, limit).await
    }

    async fn insert_model(&self, model: &TaskModel) -> Result<TaskModel, StoreError> {
        self.inner.insert_model(model).await
    }

    async fn upsert_model(&self, model: &TaskModel) -> Result<TaskModel, StoreError> {
        self.inner.upsert_model(model).await
    }

    async fn append_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        self.inner.append_execution(record).await
    }

    async fn commit_update(&self, model: &TaskModel, record: &ExecutionRecord) -> Result<TaskModel, StoreError> {
        if record.parallelism == self.rejected_parallelism.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::Protocol(
                "new row violates check constraint".into(),
            )));
        }
        let stored = self.inner.commit_update(model, record).await?;
        if Self::take(&self.slow_commits) {
            tokio::time::sleep(Self::COMMIT_ACK_DELAY).await;
        }
        Ok(stored)
    }
}

fn faulty_optimizer(store: Arc<FaultyStore>, monitor: Arc<dyn ClusterMonitor>) -> Optimizer {
    Optimizer::new(store, monitor, policy())
        .unwrap()
        .with_contention(ContentionPolicy::None)
}

fn policy() -> PolicyConfig {
    PolicyConfig {
        max_parallelism: 10,
        collaborator_timeout_ms: 200,
        ..PolicyConfig::default()
    }
}

fn worked_prior() -> TaskPrior {
    TaskPrior { p_obs: 0.8, c_startup: 5.0, ..TaskPrior::default() }.with_baseline(100.0)
}

fn optimizer_with(store: Arc<MemoryStore>, monitor: Arc<dyn ClusterMonitor>) -> Optimizer {
    Optimizer::new(store, monitor, policy())
        .unwrap()
        .with_contention(ContentionPolicy::None)
}

fn optimizer(store: Arc<MemoryStore>) -> Optimizer {
    optimizer_with(store, Arc::new(StaticLoad(0.0)))
}

fn exact_record(task: &str, s: u32) -> ExecutionRecord {
    let t = 5.0 + 100.0 * (0.2 + 0.8 / s as f64);
    ExecutionRecord {
        id: Uuid::new_v4(),
        task_name: task.into(),
        parallelism: s,
        input_scale_factor: 1.0,
        cluster_load: 0.0,
        total_duration: t,
        residual: 0.0,
        p_snapshot: 0.8,
        cost_metric: None,
        predicted_time: t,
        predicted_residual: 0.0,
        recorded_at: Utc::now(),
    }
}

/// Persist the worked-example model as if `samples` runs had been folded in.
async fn seed_warm(store: &MemoryStore, task: &str, samples: u32) {
    let mut model = TaskModel::new(task, &worked_prior());
    model.sample_count = samples as u64;
    store.insert_model(&model).await.unwrap();
    for s in 1..=samples {
        store.append_execution(&exact_record(task, s)).await.unwrap();
    }
}

fn observation(task: &str, s: u32, t: f64) -> Observation {
    Observation {
        task_name: task.into(),
        parallelism: s,
        input_scale_factor: 1.0,
        cluster_load: 0.0,
        total_duration: t,
        cost_metric: None,
    }
}

#[tokio::test]
async fn unseen_task_cold_starts_without_writes() {
    let store = Arc::new(MemoryStore::new());
    let opt = optimizer(store.clone());

    let rec = opt.recommend_parallelism("never_seen", 1.0, 7, None).await.unwrap();
    assert_eq!(rec.parallelism, 7);
    assert_eq!(rec.source, RecommendationSource::ColdStart);
    assert_eq!(store.write_count(), 0);
    assert_eq!(opt.metrics().cold_starts, 1);
}

#[tokio::test]
async fn below_warmup_still_cold() {
    let store = Arc::new(MemoryStore::new());
    seed_warm(&store, "young", 4).await;
    let opt = optimizer(store);

    let rec = opt.recommend_parallelism("young", 1.0, 3, None).await.unwrap();
    assert_eq!(rec.source, RecommendationSource::ColdStart);
    assert_eq!(rec.parallelism, 3);
}

#[tokio::test]
async fn warm_task_is_optimized() {
    let store = Arc::new(MemoryStore::new());
    seed_warm(&store, "warm", 5).await;
    let opt = optimizer(store);

    let rec = opt.recommend_parallelism("warm", 1.0, 2, None).await.unwrap();
    assert_eq!(rec.source, RecommendationSource::Optimized);
    assert_eq!(rec.parallelism, 10);
    let predicted = rec.predicted_time.unwrap();
    assert!((predicted - 33.0).abs() < 1e-6, "predicted={}", predicted);
    assert!(rec.upper_bound.unwrap() >= predicted);
}

#[tokio::test]
async fn caller_range_limits_candidates() {
    let store = Arc::new(MemoryStore::new());
    seed_warm(&store, "capped", 5).await;
    let opt = optimizer(store);

    let cons = Constraints { max_parallelism: Some(3), ..Constraints::default() };
    let rec = opt.recommend_parallelism("capped", 1.0, 1, Some(&cons)).await.unwrap();
    assert_eq!(rec.parallelism, 3);
}

#[tokio::test]
async fn infeasible_constraints_fall_back() {
    let store = Arc::new(MemoryStore::new());
    seed_warm(&store, "tight", 5).await;
    let opt = optimizer(store);

    let cons = Constraints { max_time: Some(20.0), ..Constraints::default() };
    let rec = opt.recommend_parallelism("tight", 1.0, 6, Some(&cons)).await.unwrap();
    assert_eq!(rec.parallelism, 6);
    assert_eq!(rec.source, RecommendationSource::FeasibilityViolation);
    assert!(rec.source.is_fallback());
    assert_eq!(opt.metrics().feasibility_violations, 1);
}

#[tokio::test]
async fn cost_objective_with_budget() {
    let store = Arc::new(MemoryStore::new());
    seed_warm(&store, "budget", 5).await;
    let opt = optimizer(store);

    let cons = Constraints { objective: Objective::Cost, ..Constraints::default() };
    let rec = opt.recommend_parallelism("budget", 1.0, 4, Some(&cons)).await.unwrap();
    assert_eq!(rec.parallelism, 1);
}

#[tokio::test]
async fn monitor_failure_fails_open() {
    let store = Arc::new(MemoryStore::new());
    seed_warm(&store, "warm", 5).await;
    let gauge = Arc::new(SharedLoad::new(0.0));
    gauge.set_offline(true);
    let opt = optimizer_with(store, gauge);

    let rec = opt.recommend_parallelism("warm", 1.0, 5, None).await.unwrap();
    assert_eq!(rec.parallelism, 5);
    assert_eq!(rec.source, RecommendationSource::Degraded);
    assert_eq!(rec.cluster_load, None);
    assert_eq!(opt.metrics().fail_open_fallbacks, 1);
}

#[tokio::test]
async fn stalled_monitor_times_out_to_default() {
    let store = Arc::new(MemoryStore::new());
    seed_warm(&store, "warm", 5).await;
    let opt = optimizer_with(store, Arc::new(StalledMonitor));

    let rec = opt.recommend_parallelism("warm", 1.0, 5, None).await.unwrap();
    assert_eq!(rec.source, RecommendationSource::Degraded);
    assert_eq!(rec.parallelism, 5);
}

#[tokio::test]
async fn store_outage_fails_open() {
    let store = Arc::new(MemoryStore::new());
    seed_warm(&store, "warm", 5).await;
    store.set_offline(true);
    let opt = optimizer(store);

    let rec = opt.recommend_at_load("warm", 1.0, 0.0, 9, None).await.unwrap();
    assert_eq!(rec.parallelism, 9);
    assert_eq!(rec.source, RecommendationSource::Degraded);
}

#[tokio::test]
async fn malformed_requests_are_rejected() {
    let opt = optimizer(Arc::new(MemoryStore::new()));
    assert!(matches!(
        opt.recommend_parallelism("t", 1.0, 0, None).await,
        Err(ArboError::Validation(_))
    ));
    assert!(opt.recommend_parallelism("t", 0.0, 1, None).await.is_err());
    assert!(opt.recommend_parallelism("", 1.0, 1, None).await.is_err());
    assert!(opt.recommend_at_load("t", 1.0, -1.0, 1, None).await.is_err());
    let bad = Constraints { max_parallelism: Some(0), ..Constraints::default() };
    assert!(opt.recommend_parallelism("t", 1.0, 1, Some(&bad)).await.is_err());
}

#[tokio::test]
async fn repeat_requests_hit_cache_until_feedback() {
    let store = Arc::new(MemoryStore::new());
    seed_warm(&store, "burst", 5).await;
    let opt = optimizer(store);

    let first = opt.recommend_parallelism("burst", 1.0, 2, None).await.unwrap();
    let second = opt.recommend_parallelism("burst", 1.0, 2, None).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(opt.metrics().cache_hits, 1);

    opt.report_execution(observation("burst", 8, 35.0)).await.unwrap();
    opt.recommend_parallelism("burst", 1.0, 2, None).await.unwrap();
    assert_eq!(opt.metrics().cache_hits, 1, "feedback must invalidate cached entries");
}

#[tokio::test]
async fn register_then_duplicate() {
    let opt = optimizer(Arc::new(MemoryStore::new()));
    let model = opt.register_task("genome_individual", worked_prior()).await.unwrap();
    assert_eq!(model.version, 1);
    assert!(model.baseline_established);

    let err = opt.register_task("genome_individual", worked_prior()).await.unwrap_err();
    assert_eq!(err, ArboError::TaskAlreadyExists("genome_individual".into()));
    assert!(!err.is_recoverable());
}

#[tokio::test]
async fn first_report_creates_and_bootstraps() {
    let store = Arc::new(MemoryStore::new());
    let opt = optimizer(store.clone());

    let model = opt.report_execution(observation("fresh", 1, 106.0)).await.unwrap();
    assert_eq!(model.sample_count, 1);
    assert!(model.baseline_established);
    // Default prior: startup 6, so a single-worker run of 106s implies t_base 100.
    assert!((model.t_base_1 - 100.0).abs() < 1e-9);
    assert_eq!(store.get_recent_history("fresh", 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn invalid_observation_touches_nothing() {
    let store = Arc::new(MemoryStore::new());
    let opt = optimizer(store.clone());
    let err = opt.report_execution(observation("t", 0, 10.0)).await.unwrap_err();
    assert!(matches!(err, ArboError::Validation(_)));
    assert_eq!(store.write_count(), 0);
    assert_eq!(opt.pending_feedback(), 0);
}

#[tokio::test]
async fn outage_defers_then_flush_applies() {
    let store = Arc::new(MemoryStore::new());
    let opt = optimizer(store.clone());
    opt.register_task("batch", worked_prior()).await.unwrap();

    store.set_offline(true);
    let err = opt.report_execution(observation("batch", 4, 45.0)).await.unwrap_err();
    assert_eq!(err, ArboError::FeedbackDeferred { task_name: "batch".into() });
    assert!(err.is_recoverable());
    assert_eq!(opt.pending_feedback(), 1);

    // Still offline: nothing applied, queue intact.
    assert!(opt.flush_pending().await.is_err());
    assert_eq!(opt.pending_feedback(), 1);

    store.set_offline(false);
    assert_eq!(opt.flush_pending().await.unwrap(), 1);
    assert_eq!(opt.pending_feedback(), 0);
    assert_eq!(store.get_model("batch").await.unwrap().unwrap().sample_count, 1);
}

#[tokio::test]
async fn pending_queue_is_bounded() {
    let store = Arc::new(MemoryStore::new());
    let policy = PolicyConfig { pending_feedback_capacity: 2, ..policy() };
    let opt = Optimizer::new(store.clone(), Arc::new(StaticLoad(0.0)), policy).unwrap();
    store.set_offline(true);
    for t in [10.0, 20.0, 30.0] {
        let _ = opt.report_execution(observation("q", 2, t)).await;
    }
    assert_eq!(opt.pending_feedback(), 2);
    let m = opt.metrics();
    assert_eq!(m.feedback_deferred, 3);
    assert_eq!(m.feedback_dropped, 1);
}

#[tokio::test]
async fn conflicts_are_retried() {
    let store = Arc::new(MemoryStore::new());
    let opt = optimizer(store.clone());
    opt.register_task("racy", worked_prior()).await.unwrap();

    store.inject_conflicts(2);
    let model = opt.report_execution(observation("racy", 4, 45.0)).await.unwrap();
    assert_eq!(model.sample_count, 1);
    assert_eq!(opt.metrics().conflict_retries, 2);
}

#[tokio::test]
async fn exhausted_retries_surface_conflict() {
    let store = Arc::new(MemoryStore::new());
    let opt = optimizer(store.clone());
    opt.register_task("racy", worked_prior()).await.unwrap();

    store.inject_conflicts(3);
    let err = opt.report_execution(observation("racy", 4, 45.0)).await.unwrap_err();
    assert_eq!(err, ArboError::UpdateConflict { task_name: "racy".into(), attempts: 3 });
    assert!(err.is_recoverable());
    assert_eq!(store.get_model("racy").await.unwrap().unwrap().sample_count, 0);
    assert!(store.get_recent_history("racy", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn quantity_is_scaled_by_base() {
    let store = Arc::new(MemoryStore::new());
    let opt = optimizer(store);
    let prior = TaskPrior { base_input_quantity: Some(250.0), ..worked_prior() };
    opt.register_task("sized", prior).await.unwrap();

    let rec = opt.recommend_for_quantity("sized", 500.0, 3, None).await.unwrap();
    assert_eq!(rec.input_scale_factor, 2.0);
    assert_eq!(rec.source, RecommendationSource::ColdStart);
    assert!(opt.recommend_for_quantity("sized", 0.0, 3, None).await.is_err());
}

#[tokio::test]
async fn candidate_table_requires_model() {
    let store = Arc::new(MemoryStore::new());
    seed_warm(&store, "diag", 5).await;
    let opt = optimizer(store);

    let table = opt.evaluate_candidates("diag", 1.0, 0.0, None).await.unwrap();
    assert_eq!(table.len(), 10);
    assert!((table[0].baseline_time - 105.0).abs() < 1e-9);
    assert!(table.iter().all(|c| c.feasible));

    let err = opt.evaluate_candidates("missing", 1.0, 0.0, None).await.unwrap_err();
    assert_eq!(err, ArboError::TaskNotFound("missing".into()));
}

#[tokio::test]
async fn lost_commit_acknowledgement_is_not_applied_twice() {
    let store = Arc::new(FaultyStore::default());
    let opt = faulty_optimizer(store.clone(), Arc::new(StaticLoad(0.0)));
    opt.register_task("slow_ack", worked_prior()).await.unwrap();

    store.slow_commits.store(1, Ordering::SeqCst);
    let err = opt.report_execution(observation("slow_ack", 4, 45.0)).await.unwrap_err();
    assert_eq!(err, ArboError::FeedbackDeferred { task_name: "slow_ack".into() });
    assert_eq!(opt.pending_feedback(), 1);

    // The commit landed even though the caller stopped waiting for it.
    assert_eq!(store.inner.get_model("slow_ack").await.unwrap().unwrap().sample_count, 1);

    assert_eq!(opt.flush_pending().await.unwrap(), 1);
    assert_eq!(opt.pending_feedback(), 0);
    assert_eq!(store.inner.get_model("slow_ack").await.unwrap().unwrap().sample_count, 1);
    assert_eq!(store.inner.get_recent_history("slow_ack", 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn retried_report_keeps_one_history_row() {
    let store = Arc::new(MemoryStore::new());
    let opt = optimizer(store.clone());
    opt.register_task("racy_ids", worked_prior()).await.unwrap();

    store.inject_conflicts(2);
    opt.report_execution(observation("racy_ids", 4, 45.0)).await.unwrap();
    let history = store.get_recent_history("racy_ids", 10).await.unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn permanent_store_failure_is_not_deferred() {
    let store = Arc::new(FaultyStore::default());
    store.rejected_parallelism.store(7, Ordering::SeqCst);
    let opt = faulty_optimizer(store.clone(), Arc::new(StaticLoad(0.0)));
    opt.register_task("strict", worked_prior()).await.unwrap();

    let err = opt.report_execution(observation("strict", 7, 40.0)).await.unwrap_err();
    assert!(matches!(err, ArboError::Other(_)), "got {:?}", err);
    assert_eq!(opt.pending_feedback(), 0);
    assert_eq!(opt.metrics().feedback_deferred, 0);
}

#[tokio::test]
async fn rejected_replay_does_not_block_the_queue() {
    let store = Arc::new(FaultyStore::default());
    let opt = faulty_optimizer(store.clone(), Arc::new(StaticLoad(0.0)));
    opt.register_task("queued", worked_prior()).await.unwrap();

    store.inner.set_offline(true);
    for s in [7, 4] {
        let err = opt.report_execution(observation("queued", s, 45.0)).await.unwrap_err();
        assert!(matches!(err, ArboError::FeedbackDeferred { .. }));
    }
    assert_eq!(opt.pending_feedback(), 2);

    // While offline, s = 7 was accepted; now the database refuses it for good.
    store.rejected_parallelism.store(7, Ordering::SeqCst);
    store.inner.set_offline(false);

    assert_eq!(opt.flush_pending().await.unwrap(), 1);
    assert_eq!(opt.pending_feedback(), 0);
    assert_eq!(opt.metrics().feedback_rejected, 1);
    let model = store.inner.get_model("queued").await.unwrap().unwrap();
    assert_eq!(model.sample_count, 1);
    let history = store.inner.get_recent_history("queued", 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].parallelism, 4);
}

#[tokio::test]
async fn unusable_monitor_reading_degrades() {
    for reading in [f64::NAN, -3.0, f64::INFINITY] {
        let store = Arc::new(MemoryStore::new());
        seed_warm(&store, "warm", 5).await;
        let opt = optimizer_with(store, Arc::new(StaticLoad(reading)));

        for _ in 0..2 {
            let rec = opt.recommend_parallelism("warm", 1.0, 5, None).await.unwrap();
            assert_eq!(rec.source, RecommendationSource::Degraded, "reading {}", reading);
            assert_eq!(rec.parallelism, 5);
        }
        let m = opt.metrics();
        assert_eq!(m.fail_open_fallbacks, 2);
        assert_eq!(m.cache_hits, 0);
        assert_eq!(m.feasibility_violations, 0);
    }
}

#[tokio::test]
async fn oversized_candidate_range_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    seed_warm(&store, "wide", 5).await;
    let opt = optimizer(store.clone());

    let huge = Constraints { max_parallelism: Some(u32::MAX), ..Constraints::default() };
    assert!(matches!(
        opt.recommend_parallelism("wide", 1.0, 2, Some(&huge)).await,
        Err(ArboError::Validation(_))
    ));
    assert!(opt.evaluate_candidates("wide", 1.0, 0.0, Some(&huge)).await.is_err());

    let widest = Constraints { max_parallelism: Some(arbo_core::CANDIDATE_LIMIT), ..Constraints::default() };
    let table = opt.evaluate_candidates("wide", 1.0, 0.0, Some(&widest)).await.unwrap();
    assert_eq!(table.len(), arbo_core::CANDIDATE_LIMIT as usize);

    let policy = PolicyConfig { max_parallelism: 1_000_000, ..policy() };
    assert!(Optimizer::new(store, Arc::new(StaticLoad(0.0)), policy).is_err());
}

#[tokio::test]
async fn recommendation_racing_feedback_is_not_cached() {
    let store = Arc::new(FaultyStore::default());
    seed_warm(&store.inner, "raced", 5).await;
    let opt = faulty_optimizer(store.clone(), Arc::new(StaticLoad(0.0)));

    // The recommendation stalls on its history read while feedback lands.
    store.slow_history_reads.store(1, Ordering::SeqCst);
    let (rec, fed) = tokio::join!(opt.recommend_parallelism("raced", 1.0, 2, None), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        opt.report_execution(observation("raced", 8, 35.0)).await
    });
    assert_eq!(rec.unwrap().source, RecommendationSource::Optimized);
    fed.unwrap();

    opt.recommend_parallelism("raced", 1.0, 2, None).await.unwrap();
    assert_eq!(opt.metrics().cache_hits, 0, "pre-feedback answer must not be served");
}
