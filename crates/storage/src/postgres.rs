//! PostgreSQL-backed [`TaskStore`].
//!
//! `task_models` holds one row per task with a `version` column for
//! optimistic concurrency; `execution_history` is append-only and indexed on
//! `(task_name, recorded_at DESC)` for most-recent-N lookups.

use arbo_core::config::PostgresConfig;
use arbo_core::{ExecutionRecord, TaskModel};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::traits::TaskStore;

const MODEL_COLUMNS: &str = "task_name, t_base_1, p_obs, c_startup, k_exponent, alpha_p, alpha_k,
     sample_count, base_input_quantity, baseline_established, version, created_at, last_updated";

const HISTORY_COLUMNS: &str = "id, task_name, parallelism, input_scale_factor, cluster_load,
     total_duration, residual, p_snapshot, cost_metric, predicted_time, predicted_residual, recorded_at";

#[derive(Debug, sqlx::FromRow)]
struct TaskModelRow {
    task_name: String,
    t_base_1: f64,
    p_obs: f64,
    c_startup: f64,
    k_exponent: f64,
    alpha_p: f64,
    alpha_k: f64,
    sample_count: i64,
    base_input_quantity: Option<f64>,
    baseline_established: bool,
    version: i64,
    created_at: DateTime<Utc>,
    last_updated: DateTime<Utc>,
}

impl From<TaskModelRow> for TaskModel {
    fn from(r: TaskModelRow) -> Self {
        Self {
            task_name: r.task_name,
            t_base_1: r.t_base_1,
            p_obs: r.p_obs,
            c_startup: r.c_startup,
            k_exponent: r.k_exponent,
            alpha_p: r.alpha_p,
            alpha_k: r.alpha_k,
            sample_count: r.sample_count.max(0) as u64,
            base_input_quantity: r.base_input_quantity,
            baseline_established: r.baseline_established,
            version: r.version.max(0) as u64,
            created_at: r.created_at,
            last_updated: r.last_updated,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ExecutionRow {
    id: Uuid,
    task_name: String,
    parallelism: i32,
    input_scale_factor: f64,
    cluster_load: f64,
    total_duration: f64,
    residual: f64,
    p_snapshot: f64,
    cost_metric: Option<f64>,
    predicted_time: f64,
    predicted_residual: f64,
    recorded_at: DateTime<Utc>,
}

impl From<ExecutionRow> for ExecutionRecord {
    fn from(r: ExecutionRow) -> Self {
        Self {
            id: r.id,
            task_name: r.task_name,
            parallelism: r.parallelism.max(1) as u32,
            input_scale_factor: r.input_scale_factor,
            cluster_load: r.cluster_load,
            total_duration: r.total_duration,
            residual: r.residual,
            p_snapshot: r.p_snapshot,
            cost_metric: r.cost_metric,
            predicted_time: r.predicted_time,
            predicted_residual: r.predicted_residual,
            recorded_at: r.recorded_at,
        }
    }
}

/// Task store over a PostgreSQL connection pool.
#[derive(Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect using the configured pool size and apply migrations.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.connection_string())
            .await
            .map_err(map_sqlx)?;
        info!("PostgreSQL connected: {}:{}/{}", config.host, config.port, config.database);

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("migration failed: {}", e)))?;
        info!("Database migrations applied successfully");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Versioned write of one model row inside `tx`.
    async fn write_model(
        tx: &mut Transaction<'_, Postgres>,
        model: &TaskModel,
    ) -> Result<TaskModel, StoreError> {
        model.validate().map_err(|e| StoreError::Invalid(e.to_string()))?;
        let next_version = model.version as i64 + 1;

        let row = if model.version == 0 {
            // First write: a concurrent creator makes this a no-op, which is a conflict.
            sqlx::query_as::<_, TaskModelRow>(&format!(
                "INSERT INTO task_models ({MODEL_COLUMNS})
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                 ON CONFLICT (task_name) DO NOTHING
                 RETURNING {MODEL_COLUMNS}"
            ))
            .bind(&model.task_name)
            .bind(model.t_base_1)
            .bind(model.p_obs)
            .bind(model.c_startup)
            .bind(model.k_exponent)
            .bind(model.alpha_p)
            .bind(model.alpha_k)
            .bind(model.sample_count as i64)
            .bind(model.base_input_quantity)
            .bind(model.baseline_established)
            .bind(next_version)
            .bind(model.created_at)
            .bind(model.last_updated)
            .fetch_optional(&mut **tx)
            .await
            .map_err(map_sqlx)?
        } else {
            sqlx::query_as::<_, TaskModelRow>(&format!(
                "UPDATE task_models
                 SET t_base_1 = $2, p_obs = $3, c_startup = $4, k_exponent = $5,
                     alpha_p = $6, alpha_k = $7, sample_count = $8,
                     base_input_quantity = $9, baseline_established = $10,
                     version = $11, last_updated = $12
                 WHERE task_name = $1 AND version = $13
                 RETURNING {MODEL_COLUMNS}"
            ))
            .bind(&model.task_name)
            .bind(model.t_base_1)
            .bind(model.p_obs)
            .bind(model.c_startup)
            .bind(model.k_exponent)
            .bind(model.alpha_p)
            .bind(model.alpha_k)
            .bind(model.sample_count as i64)
            .bind(model.base_input_quantity)
            .bind(model.baseline_established)
            .bind(next_version)
            .bind(model.last_updated)
            .bind(model.version as i64)
            .fetch_optional(&mut **tx)
            .await
            .map_err(map_sqlx)?
        };

        row.map(TaskModel::from)
            .ok_or_else(|| StoreError::Conflict(model.task_name.clone()))
    }

    /// Insert one history row. Returns false when the id is already stored.
    async fn insert_record(
        tx: &mut Transaction<'_, Postgres>,
        record: &ExecutionRecord,
    ) -> Result<bool, StoreError> {
        let parallelism = i32::try_from(record.parallelism).map_err(|_| {
            StoreError::Invalid(format!("parallelism {} does not fit the history table", record.parallelism))
        })?;
        let result = sqlx::query(&format!(
            "INSERT INTO execution_history ({HISTORY_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (id) DO NOTHING"
        ))
        .bind(record.id)
        .bind(&record.task_name)
        .bind(parallelism)
        .bind(record.input_scale_factor)
        .bind(record.cluster_load)
        .bind(record.total_duration)
        .bind(record.residual)
        .bind(record.p_snapshot)
        .bind(record.cost_metric)
        .bind(record.predicted_time)
        .bind(record.predicted_residual)
        .bind(record.recorded_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_fk_violation(e, &record.task_name))?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_exists(tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<bool, StoreError> {
        let found: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM execution_history WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(map_sqlx)?;
        Ok(found.is_some())
    }

    async fn current_model(
        tx: &mut Transaction<'_, Postgres>,
        task_name: &str,
    ) -> Result<TaskModel, StoreError> {
        let row = sqlx::query_as::<_, TaskModelRow>(&format!(
            "SELECT {MODEL_COLUMNS} FROM task_models WHERE task_name = $1"
        ))
        .bind(task_name)
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_sqlx)?;
        row.map(TaskModel::from)
            .ok_or_else(|| StoreError::NotFound(task_name.to_string()))
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn get_model(&self, task_name: &str) -> Result<Option<TaskModel>, StoreError> {
        let row = sqlx::query_as::<_, TaskModelRow>(&format!(
            "SELECT {MODEL_COLUMNS} FROM task_models WHERE task_name = $1"
        ))
        .bind(task_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.map(TaskModel::from))
    }

    async fn get_recent_history(
        &self,
        task_name: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
            "SELECT {HISTORY_COLUMNS} FROM execution_history
             WHERE task_name = $1
             ORDER BY recorded_at DESC, id DESC
             LIMIT $2"
        ))
        .bind(task_name)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(rows.into_iter().map(ExecutionRecord::from).collect())
    }

    async fn insert_model(&self, model: &TaskModel) -> Result<TaskModel, StoreError> {
        let mut fresh = model.clone();
        fresh.version = 0;
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        let stored = match Self::write_model(&mut tx, &fresh).await {
            Err(StoreError::Conflict(name)) => return Err(StoreError::AlreadyExists(name)),
            other => other?,
        };
        tx.commit().await.map_err(map_sqlx)?;
        Ok(stored)
    }

    async fn upsert_model(&self, model: &TaskModel) -> Result<TaskModel, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        let stored = Self::write_model(&mut tx, model).await?;
        tx.commit().await.map_err(map_sqlx)?;
        Ok(stored)
    }

    async fn append_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        if !Self::insert_record(&mut tx, record).await? {
            debug!(id = %record.id, task = %record.task_name, "history row already stored");
        }
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn commit_update(
        &self,
        model: &TaskModel,
        record: &ExecutionRecord,
    ) -> Result<TaskModel, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        if Self::record_exists(&mut tx, record.id).await? {
            debug!(id = %record.id, task = %record.task_name, "execution already committed");
            let current = Self::current_model(&mut tx, &model.task_name).await?;
            tx.rollback().await.map_err(map_sqlx)?;
            return Ok(current);
        }
        let stored = Self::write_model(&mut tx, model).await?;
        if !Self::insert_record(&mut tx, record).await? {
            // A concurrent commit of the same id won; dropping `tx` undoes our model write.
            return Err(StoreError::Conflict(model.task_name.clone()));
        }
        tx.commit().await.map_err(map_sqlx)?;
        Ok(stored)
    }
}

/// Connection-level and transient server failures become `Unavailable`,
/// integrity and data violations become `Invalid`. Everything else stays a
/// database error.
fn map_sqlx(e: sqlx::Error) -> StoreError {
    let code = match &e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => return StoreError::Unavailable(e.to_string()),
        sqlx::Error::Database(db_err) => db_err.code().map(|c| c.into_owned()),
        _ => None,
    };
    let code = code.unwrap_or_default();
    match sqlstate_class(&code) {
        // connection exception, transaction rollback, insufficient resources, operator intervention
        "08" | "40" | "53" | "57" => StoreError::Unavailable(e.to_string()),
        // data exception, integrity constraint violation
        "22" | "23" => StoreError::Invalid(format!("{} (SQLSTATE {})", e, code)),
        _ => {
            error!("task store database error: {}", e);
            StoreError::Database(e)
        }
    }
}

fn sqlstate_class(code: &str) -> &str {
    code.get(..2).unwrap_or("")
}

fn map_fk_violation(e: sqlx::Error, task_name: &str) -> StoreError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.code().as_deref() == Some("23503") {
            return StoreError::NotFound(task_name.to_string());
        }
    }
    map_sqlx(e)
}
