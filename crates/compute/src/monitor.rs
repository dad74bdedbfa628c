use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MonitorError {
    #[error("cluster monitor unreachable: {0}")]
    Unreachable(String),

    #[error("cluster monitor returned invalid load: {0}")]
    InvalidReading(f64),
}

impl From<MonitorError> for arbo_core::ArboError {
    fn from(e: MonitorError) -> Self {
        arbo_core::ArboError::Unavailable(e.to_string())
    }
}

/// Source of the current cluster contention signal `L`.
#[async_trait]
pub trait ClusterMonitor: Send + Sync {
    async fn current_cluster_load(&self) -> Result<f64, MonitorError>;
}

#[async_trait]
impl<T: ClusterMonitor + ?Sized> ClusterMonitor for Arc<T> {
    async fn current_cluster_load(&self) -> Result<f64, MonitorError> {
        (**self).current_cluster_load().await
    }
}

/// Always reports the same load.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticLoad(pub f64);

#[async_trait]
impl ClusterMonitor for StaticLoad {
    async fn current_cluster_load(&self) -> Result<f64, MonitorError> {
        Ok(self.0)
    }
}

/// Load gauge that can be moved or taken offline at runtime.
///
/// Used by the simulator to feed synthetic load and by tests to exercise
/// the fail-open path.
#[derive(Debug, Default)]
pub struct SharedLoad {
    bits: AtomicU64,
    offline: AtomicBool,
}

impl SharedLoad {
    pub fn new(load: f64) -> Self {
        Self {
            bits: AtomicU64::new(load.to_bits()),
            offline: AtomicBool::new(false),
        }
    }

    pub fn set(&self, load: f64) {
        self.bits.store(load.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }
}

#[async_trait]
impl ClusterMonitor for SharedLoad {
    async fn current_cluster_load(&self) -> Result<f64, MonitorError> {
        if self.offline.load(Ordering::Relaxed) {
            return Err(MonitorError::Unreachable("shared load gauge offline".into()));
        }
        let load = self.get();
        if !load.is_finite() || load < 0.0 {
            return Err(MonitorError::InvalidReading(load));
        }
        Ok(load)
    }
}
