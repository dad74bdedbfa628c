use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ArboError, ArboResult};
use crate::model::CANDIDATE_LIMIT;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_parse<T: FromStr>(profile: &str, key: &str, default: T) -> T {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub postgres: PostgresConfig,
    pub policy: PolicyConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `ARBO_PROFILE`. When set (e.g. `PROD`), every key
    /// is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("ARBO_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            postgres: PostgresConfig::from_env_profiled(p),
            policy: PolicyConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  postgres:    host={}, port={}, db={}",
            self.postgres.host, self.postgres.port, self.postgres.database
        );
        tracing::info!(
            "  policy:      window={}, warmup={}, z={}, s_max={}, cache_ttl={}ms",
            self.policy.history_window,
            self.policy.warmup_samples,
            self.policy.confidence_z,
            self.policy.max_parallelism,
            self.policy.cache_ttl_ms
        );
    }
}

// ── PostgreSQL ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub max_connections: u32,
}

impl PostgresConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "ARBO_DB_HOST", "localhost"),
            port: profiled_env_parse(p, "ARBO_DB_PORT", 5433),
            database: profiled_env_or(p, "ARBO_DB_NAME", "arbo_state"),
            username: profiled_env_or(p, "ARBO_DB_USER", "arbo_user"),
            password: profiled_env_or(p, "ARBO_DB_PASS", "arbo_pass"),
            max_connections: profiled_env_parse(p, "ARBO_DB_MAX_CONNECTIONS", 10),
        }
    }

    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.database
        )
    }
}

// ── Policy ────────────────────────────────────────────────────

/// Named, swappable policy constants for learning and optimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Most recent executions used for residual fitting.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Below this many window rows the residual model reports maximal uncertainty.
    #[serde(default = "default_min_residual_samples")]
    pub min_residual_samples: usize,
    /// `sample_count` at which a task leaves cold start.
    #[serde(default = "default_warmup_samples")]
    pub warmup_samples: u64,
    /// Confidence multiplier applied to the residual std.
    #[serde(default = "default_confidence_z")]
    pub confidence_z: f64,
    /// Upper bound of the candidate parallelism range.
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: u32,
    /// Optimistic-concurrency retries before surfacing a conflict.
    #[serde(default = "default_max_update_retries")]
    pub max_update_retries: u32,
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Bucket width used to discretize γ for cache keys.
    #[serde(default = "default_gamma_bucket")]
    pub gamma_bucket: f64,
    /// Bucket width used to discretize cluster load for cache keys.
    #[serde(default = "default_load_bucket")]
    pub load_bucket: f64,
    /// Slope of the linear contention policy `1 + β·L`.
    #[serde(default = "default_contention_beta")]
    pub contention_beta: f64,
    /// Observations held while the store is unreachable.
    #[serde(default = "default_pending_capacity")]
    pub pending_feedback_capacity: usize,
    /// Upper bound on any single store or monitor call.
    #[serde(default = "default_collaborator_timeout_ms")]
    pub collaborator_timeout_ms: u64,
}

fn default_history_window() -> usize { 50 }
fn default_min_residual_samples() -> usize { 2 }
fn default_warmup_samples() -> u64 { 5 }
fn default_confidence_z() -> f64 { 1.5 }
fn default_max_parallelism() -> u32 { 32 }
fn default_max_update_retries() -> u32 { 3 }
fn default_cache_ttl_ms() -> u64 { 5_000 }
fn default_cache_capacity() -> usize { 1024 }
fn default_gamma_bucket() -> f64 { 0.05 }
fn default_load_bucket() -> f64 { 0.05 }
fn default_contention_beta() -> f64 { 0.01 }
fn default_pending_capacity() -> usize { 256 }
fn default_collaborator_timeout_ms() -> u64 { 2_000 }

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            history_window: default_history_window(),
            min_residual_samples: default_min_residual_samples(),
            warmup_samples: default_warmup_samples(),
            confidence_z: default_confidence_z(),
            max_parallelism: default_max_parallelism(),
            max_update_retries: default_max_update_retries(),
            cache_ttl_ms: default_cache_ttl_ms(),
            cache_capacity: default_cache_capacity(),
            gamma_bucket: default_gamma_bucket(),
            load_bucket: default_load_bucket(),
            contention_beta: default_contention_beta(),
            pending_feedback_capacity: default_pending_capacity(),
            collaborator_timeout_ms: default_collaborator_timeout_ms(),
        }
    }
}

impl PolicyConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            history_window: profiled_env_parse(p, "ARBO_HISTORY_WINDOW", d.history_window),
            min_residual_samples: profiled_env_parse(p, "ARBO_MIN_RESIDUAL_SAMPLES", d.min_residual_samples),
            warmup_samples: profiled_env_parse(p, "ARBO_WARMUP_SAMPLES", d.warmup_samples),
            confidence_z: profiled_env_parse(p, "ARBO_CONFIDENCE_Z", d.confidence_z),
            max_parallelism: profiled_env_parse(p, "ARBO_MAX_PARALLELISM", d.max_parallelism),
            max_update_retries: profiled_env_parse(p, "ARBO_MAX_UPDATE_RETRIES", d.max_update_retries),
            cache_ttl_ms: profiled_env_parse(p, "ARBO_CACHE_TTL_MS", d.cache_ttl_ms),
            cache_capacity: profiled_env_parse(p, "ARBO_CACHE_CAPACITY", d.cache_capacity),
            gamma_bucket: profiled_env_parse(p, "ARBO_GAMMA_BUCKET", d.gamma_bucket),
            load_bucket: profiled_env_parse(p, "ARBO_LOAD_BUCKET", d.load_bucket),
            contention_beta: profiled_env_parse(p, "ARBO_CONTENTION_BETA", d.contention_beta),
            pending_feedback_capacity: profiled_env_parse(
                p,
                "ARBO_PENDING_FEEDBACK_CAPACITY",
                d.pending_feedback_capacity,
            ),
            collaborator_timeout_ms: profiled_env_parse(
                p,
                "ARBO_COLLABORATOR_TIMEOUT_MS",
                d.collaborator_timeout_ms,
            ),
        }
    }

    pub fn validate(&self) -> ArboResult<()> {
        let invalid = |msg: &str| Err(ArboError::Validation(format!("policy: {}", msg)));
        if self.history_window == 0 {
            return invalid("history_window must be >= 1");
        }
        if self.max_parallelism == 0 || self.max_parallelism > CANDIDATE_LIMIT {
            return invalid(&format!("max_parallelism must be within [1, {}]", CANDIDATE_LIMIT));
        }
        if !self.confidence_z.is_finite() || self.confidence_z < 0.0 {
            return invalid("confidence_z must be >= 0");
        }
        if self.max_update_retries == 0 {
            return invalid("max_update_retries must be >= 1");
        }
        if self.gamma_bucket.is_nan() || self.gamma_bucket <= 0.0 || self.load_bucket.is_nan() || self.load_bucket <= 0.0 {
            return invalid("cache bucket widths must be > 0");
        }
        if !self.contention_beta.is_finite() || self.contention_beta < 0.0 {
            return invalid("contention_beta must be >= 0");
        }
        if self.collaborator_timeout_ms == 0 {
            return invalid("collaborator_timeout_ms must be >= 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_defaults() {
        let p = PolicyConfig::default();
        assert_eq!(p.history_window, 50);
        assert_eq!(p.min_residual_samples, 2);
        assert_eq!(p.warmup_samples, 5);
        assert_eq!(p.max_update_retries, 3);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn policy_deserializes_with_partial_fields() {
        let p: PolicyConfig = serde_json::from_str(r#"{"max_parallelism": 8}"#).unwrap();
        assert_eq!(p.max_parallelism, 8);
        assert_eq!(p.history_window, 50);
    }

    #[test]
    fn policy_validation_rejects_zero_window() {
        let p = PolicyConfig { history_window: 0, ..PolicyConfig::default() };
        assert!(p.validate().is_err());
        let p = PolicyConfig { confidence_z: -1.0, ..PolicyConfig::default() };
        assert!(p.validate().is_err());
        let p = PolicyConfig { max_parallelism: CANDIDATE_LIMIT + 1, ..PolicyConfig::default() };
        assert!(p.validate().is_err());
    }

    #[test]
    fn connection_string_format() {
        let pg = PostgresConfig {
            host: "db".into(),
            port: 5433,
            database: "arbo_state".into(),
            username: "arbo_user".into(),
            password: "secret".into(),
            max_connections: 4,
        };
        assert_eq!(pg.connection_string(), "postgres://arbo_user:secret@db:5433/arbo_state");
    }
}
