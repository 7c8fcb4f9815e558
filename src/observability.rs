//! Observability for the Arbor replication core.
//!
//! Provides structured logging through `tracing` and registers the consensus
//! metrics on the `metrics` facade. Exporters are wired up by the host.

use metrics::{counter, gauge};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::ObservabilityConfig;
use crate::error::{ArborError, Result};

/// Initialize logging and register the consensus metrics.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| ArborError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| ArborError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    register_metrics();

    info!("Observability initialized");
    Ok(())
}

/// Register standard consensus metrics.
fn register_metrics() {
    gauge!("arbor_raft_term").set(0.0);
    gauge!("arbor_raft_commit_index").set(0.0);
    counter!("arbor_raft_elections_total").absolute(0);
    counter!("arbor_raft_appended_entries_total").absolute(0);
}
