//! arbo-sim — drives the optimizer against a synthetic cluster.
//!
//! Each round draws an input scale and a cluster load, asks for a
//! recommendation, "runs" the task on a hidden ground-truth law with seeded
//! noise, and reports the outcome back. The learned parameters converge
//! toward the hidden ones as rounds accumulate.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use arbo_compute::{Optimizer, RecommendationSource, SharedLoad};
use arbo_core::config::load_dotenv;
use arbo_core::{ArboError, Config, Constraints, Objective, Observation, TaskPrior};
use arbo_storage::{MemoryStore, PgTaskStore, TaskStore};

// ── CLI ─────────────────────────────────────────────────────────────

/// Simulate repeated runs of one task and watch the model learn.
#[derive(Parser, Debug)]
#[command(name = "arbo-sim", version, about)]
struct Cli {
    /// Task name to simulate.
    #[arg(long, default_value = "genome_individual")]
    task: String,

    /// Number of simulated runs.
    #[arg(long, env = "ARBO_SIM_RUNS", default_value_t = 40)]
    runs: u32,

    /// RNG seed for inputs and noise.
    #[arg(long, env = "ARBO_SIM_SEED", default_value_t = 42)]
    seed: u64,

    /// Parallelism used while the task is cold.
    #[arg(long, default_value_t = 4)]
    default_parallelism: u32,

    /// Optional latency bound in seconds.
    #[arg(long)]
    max_time: Option<f64>,

    /// Minimise cost instead of latency.
    #[arg(long)]
    cost: bool,

    /// Persist to PostgreSQL (ARBO_DB_*) instead of memory.
    #[arg(long)]
    postgres: bool,
}

// ── Ground truth ────────────────────────────────────────────────────

/// Hidden behaviour of the simulated cluster.
struct TrueCluster {
    t_base: f64,
    p: f64,
    startup: f64,
    k: f64,
    /// Fractional slowdown per load unit.
    slowdown_per_load: f64,
    /// Uniform multiplicative noise amplitude.
    noise: f64,
}

impl TrueCluster {
    fn run(&self, s: u32, gamma: f64, load: f64, rng: &mut StdRng) -> f64 {
        let law = self.startup
            + self.t_base
                * gamma.powf(self.k)
                * ((1.0 - self.p) + self.p / s as f64)
                * (1.0 + self.slowdown_per_load * load);
        let jitter = rng.gen_range(-self.noise..=self.noise);
        (law * (1.0 + jitter)).max(0.0)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    load_dotenv();
    let cli = Cli::parse();
    let config = Config::from_env();
    config.log_summary();

    let store: Arc<dyn TaskStore> = if cli.postgres {
        let pg = PgTaskStore::connect(&config.postgres)
            .await
            .context("connecting to PostgreSQL task store")?;
        info!("using PostgreSQL task store");
        Arc::new(pg)
    } else {
        info!("using in-memory task store");
        Arc::new(MemoryStore::new())
    };

    let gauge = Arc::new(SharedLoad::new(0.0));
    let optimizer = Optimizer::new(store, gauge.clone(), config.policy.clone())?;

    let truth = TrueCluster {
        t_base: 200.0,
        p: 0.85,
        startup: 10.0,
        k: 1.0,
        slowdown_per_load: config.policy.contention_beta,
        noise: 0.05,
    };

    let prior = TaskPrior { c_startup: truth.startup, ..TaskPrior::default() };
    match optimizer.register_task(&cli.task, prior).await {
        Ok(_) => {}
        Err(ArboError::TaskAlreadyExists(_)) => info!(task = %cli.task, "continuing existing task model"),
        Err(e) => return Err(e.into()),
    }

    let constraints = Constraints {
        max_time: cli.max_time,
        objective: if cli.cost { Objective::Cost } else { Objective::Latency },
        ..Constraints::default()
    };

    let mut rng = StdRng::seed_from_u64(cli.seed);
    for round in 1..=cli.runs {
        let gamma: f64 = rng.gen_range(0.5..=2.0);
        let load: f64 = rng.gen_range(0.0..=40.0);
        gauge.set(load);

        let rec = optimizer
            .recommend_parallelism(&cli.task, gamma, cli.default_parallelism, Some(&constraints))
            .await?;
        if rec.source == RecommendationSource::FeasibilityViolation {
            warn!(round, "constraints infeasible, running at default");
        }

        let duration = truth.run(rec.parallelism, gamma, load, &mut rng);
        let observation = Observation {
            task_name: cli.task.clone(),
            parallelism: rec.parallelism,
            input_scale_factor: gamma,
            cluster_load: load,
            total_duration: duration,
            cost_metric: Some(duration * rec.parallelism as f64),
        };

        match optimizer.report_execution(observation).await {
            Ok(model) => info!(
                round,
                s = rec.parallelism,
                source = ?rec.source,
                gamma = %format!("{:.2}", gamma),
                load = %format!("{:.1}", load),
                predicted = ?rec.predicted_time.map(|t| (t * 10.0).round() / 10.0),
                actual = %format!("{:.1}", duration),
                p_obs = %format!("{:.3}", model.p_obs),
                t_base_1 = %format!("{:.1}", model.t_base_1),
                "round complete"
            ),
            Err(e) if e.is_recoverable() => warn!(round, error = %e, "feedback not applied"),
            Err(e) => return Err(e.into()),
        }
    }

    if optimizer.pending_feedback() > 0 {
        let applied = optimizer.flush_pending().await?;
        info!(applied, "flushed deferred feedback");
    }

    let metrics = optimizer.metrics();
    info!(
        served = metrics.recommendations_served,
        cold = metrics.cold_starts,
        cache_hits = metrics.cache_hits,
        infeasible = metrics.feasibility_violations,
        applied = metrics.feedback_applied,
        "simulation finished"
    );
    debug!(metrics = %serde_json::to_string(&metrics)?, "final optimizer metrics");
    if let Some(model) = optimizer.task_model(&cli.task).await? {
        info!(
            "learned p_obs={:.3} (true {}), t_base_1={:.1} (true {}), k={:.2} (true {})",
            model.p_obs, truth.p, model.t_base_1, truth.t_base, model.k_exponent, truth.k
        );
    }
    Ok(())
}
