// packages/simlink/src/observability.rs
//! Tracing and metrics initialisation

use crate::utils::config::LoggingSettings;
use crate::utils::errors::{Result, SimlinkError};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global fmt subscriber; `RUST_LOG` overrides `settings.level`
///
/// Calling this again after a subscriber is installed is a no-op.
pub fn init_tracing(settings: &LoggingSettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("simlink={0},{0}", settings.level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    let _ = if settings.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

/// Install the Prometheus recorder once and return its handle
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = PROM_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| SimlinkError::RuntimeError(format!("Failed to install metrics recorder: {}", e)))?;

    let _ = PROM_HANDLE.set(handle.clone());
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let settings = LoggingSettings::default();
        init_tracing(&settings);
        init_tracing(&settings);

        let first = init_metrics().unwrap();
        let second = init_metrics().unwrap();
        metrics::counter!("simlink_steps_total").increment(1);
        assert!(first.render().contains("simlink_steps_total"));
        assert!(second.render().contains("simlink_steps_total"));
    }
}
