// packages/simlink/src/main.rs
//! Simlink driver
//!
//! Launches the configured simulation engine, runs the control loop with the
//! hold policy and prints the run report as JSON.

use anyhow::{Context, Result};
use simlink::container::{DecisionContainer, HoldPolicy};
use simlink::observability::{init_metrics, init_tracing};
use simlink::utils::config::SimlinkConfig;
use simlink::{run_experiment, VERSION};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration (explicit file argument wins over layered sources)
    let config = match std::env::args().nth(1) {
        Some(path) => SimlinkConfig::from_file(&path)
            .with_context(|| format!("Failed to load configuration from {}", path))?,
        None => SimlinkConfig::load().context("Failed to load configuration")?,
    };

    init_tracing(&config.logging);
    let metrics = init_metrics()?;

    info!("Starting simlink v{}", VERSION);
    info!("Configuration loaded: {:?}", config);

    let container = DecisionContainer::from_settings(&config.container, Box::new(HoldPolicy));
    let report = run_experiment(&config, container).await?;

    println!("{}", serde_json::to_string_pretty(&report.to_json())?);

    if config.logging.print_metrics {
        print!("{}", metrics.render());
    }

    match report.into_result() {
        Ok(summary) => {
            info!("Run completed after {} steps", summary.steps);
            Ok(())
        }
        Err(e) => {
            error!("Run failed: {}", e);
            Err(e.into())
        }
    }
}
