use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use lec_sim::config::{AppConfig, ScenarioConfig};
use lec_sim::db::{InMemoryStore, Persistence};
use lec_sim::error::SimulationError;
use lec_sim::simulator::run_job;
use lec_sim::telemetry;

/// Runs one Local Energy Community simulation job for a scenario.
#[derive(Debug, Parser)]
#[command(name = "lec-sim", version, about)]
struct Cli {
    /// Identifier of the scenario document to simulate.
    #[arg(long)]
    config_id: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let app_config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    let cancel = CancellationToken::new();
    telemetry::init_tracing(app_config.telemetry.log_json, cancel.clone());

    // A broken scenario is fatal before any job row exists
    let scenario = match ScenarioConfig::load(&app_config.scenario_dir, &cli.config_id) {
        Ok(scenario) => scenario,
        Err(e) => {
            error!(config_id = %cli.config_id, error = %e, "invalid scenario configuration");
            return ExitCode::FAILURE;
        }
    };

    let store = match build_store(&app_config).await {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "could not initialise persistence");
            return ExitCode::FAILURE;
        }
    };

    let job_id = Uuid::new_v4().to_string();
    info!(job_id, config_id = %cli.config_id, "running simulation job");
    match run_job(
        &job_id,
        &cli.config_id,
        scenario,
        app_config.simulation.clone(),
        store,
        cancel,
    )
    .await
    {
        Ok(()) => {
            info!(job_id, "job finished");
            ExitCode::SUCCESS
        }
        Err(SimulationError::Infeasibility(e)) => {
            error!(job_id, error = %e, constraints = ?e.constraint_names, "job infeasible");
            ExitCode::from(2)
        }
        Err(SimulationError::UnfillableDemand(e)) => {
            error!(job_id, error = %e, "job infeasible before solving");
            ExitCode::from(2)
        }
        Err(e) => {
            error!(job_id, error = %e, "job failed");
            ExitCode::FAILURE
        }
    }
}

async fn build_store(config: &AppConfig) -> anyhow::Result<Arc<dyn Persistence>> {
    #[cfg(feature = "db")]
    if let Some(database) = &config.database {
        let store =
            lec_sim::db::pg::PgStore::connect(&database.url, database.max_connections).await?;
        store.create_tables().await?;
        return Ok(Arc::new(store));
    }
    #[cfg(not(feature = "db"))]
    if config.database.is_some() {
        tracing::warn!("database configured but the binary was built without the 'db' feature");
    }
    Ok(Arc::new(InMemoryStore::new()))
}
