//! Realtime worker process.
//!
//! Runs every queue of the routing table, the completion tracker, the
//! scheduled reconciliation and, when `EARTHQUAKE_MONITORED_DIRECTORY` is
//! set, the shake grid watch. Stops on Ctrl-C.

use realtime::{Pipeline, PipelineConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer())
        .init();

    let config = PipelineConfig::from_env()?;
    tracing::info!(
        broker = %config.broker_url,
        ash_output = %config.ash_output_root.display(),
        earthquake_output = %config.earthquake_output_root.display(),
        storage = config.storage_backend.as_str(),
        "Loaded configuration"
    );

    let pipeline = Pipeline::start(config).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    pipeline.shutdown().await;

    Ok(())
}
