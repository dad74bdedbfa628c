use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use arbo_core::{Constraints, Objective};
use lru::LruCache;
use tracing::debug;

use crate::optimizer::Recommendation;

/// Identity of a recommendation request after discretisation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub task_name: String,
    gamma_bucket: i64,
    load_bucket: i64,
    default_value: u32,
    max_time_bits: Option<u64>,
    max_cost_bits: Option<u64>,
    cost_per_second_bits: u64,
    objective: Objective,
    max_parallelism: Option<u32>,
}

struct CachedRecommendation {
    value: Recommendation,
    inserted: Instant,
}

struct CacheState {
    entries: LruCache<CacheKey, CachedRecommendation>,
    /// Bumped by every invalidation; a put computed under an older value is dropped.
    generations: HashMap<String, u64>,
}

/// Short-lived LRU memo of recommendations keyed by task, bucketed γ and L,
/// and the request's default and constraints.
pub struct RecommendationCache {
    state: Mutex<CacheState>,
    ttl: Duration,
    gamma_bucket: f64,
    load_bucket: f64,
}

impl RecommendationCache {
    pub fn new(capacity: usize, ttl: Duration, gamma_bucket: f64, load_bucket: f64) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::new(capacity),
                generations: HashMap::new(),
            }),
            ttl,
            gamma_bucket,
            load_bucket,
        }
    }

    pub fn key(
        &self,
        task_name: &str,
        gamma: f64,
        load: f64,
        default_value: u32,
        constraints: &Constraints,
    ) -> CacheKey {
        CacheKey {
            task_name: task_name.to_string(),
            gamma_bucket: bucket(gamma, self.gamma_bucket),
            load_bucket: bucket(load, self.load_bucket),
            default_value,
            max_time_bits: constraints.max_time.map(f64::to_bits),
            max_cost_bits: constraints.max_cost.map(f64::to_bits),
            cost_per_second_bits: constraints.cost_per_second.to_bits(),
            objective: constraints.objective,
            max_parallelism: constraints.max_parallelism,
        }
    }

    /// Fresh entry for `key`, if any. Expired entries are dropped on access.
    pub fn get(&self, key: &CacheKey) -> Option<Recommendation> {
        let mut state = self.lock();
        let expired = match state.entries.get(key) {
            Some(hit) if hit.inserted.elapsed() < self.ttl => return Some(hit.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            state.entries.pop(key);
            debug!(task = %key.task_name, "recommendation cache entry expired");
        }
        None
    }

    /// Current invalidation generation of `task_name`. Read it before
    /// computing a value that will be passed to [`Self::put`].
    pub fn generation(&self, task_name: &str) -> u64 {
        self.lock().generations.get(task_name).copied().unwrap_or(0)
    }

    /// Store `value` unless `task_name` was invalidated after `generation`
    /// was read. Returns whether the entry was stored.
    pub fn put(&self, key: CacheKey, value: Recommendation, generation: u64) -> bool {
        let mut state = self.lock();
        let current = state.generations.get(&key.task_name).copied().unwrap_or(0);
        if current != generation {
            debug!(task = %key.task_name, generation, current, "stale recommendation not cached");
            return false;
        }
        state.entries.put(key, CachedRecommendation { value, inserted: Instant::now() });
        true
    }

    /// Drop every entry for `task_name`; returns how many were removed.
    pub fn invalidate_task(&self, task_name: &str) -> usize {
        let mut state = self.lock();
        *state.generations.entry(task_name.to_string()).or_insert(0) += 1;
        let stale: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(k, _)| k.task_name == task_name)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            state.entries.pop(key);
        }
        if !stale.is_empty() {
            debug!(task = %task_name, removed = stale.len(), "recommendation cache invalidated");
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn bucket(value: f64, width: f64) -> i64 {
    (value / width).floor() as i64
}
