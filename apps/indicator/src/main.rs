//! TRADFRI indicator entry point.

mod app;
mod config;

use std::time::Duration;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting TRADFRI indicator"
    );

    let config = config::Config::load()?;
    tracing::info!(
        gateway = ?config.gateway_host,
        observe = %config.observe,
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(app::run(config));
    // A pending stdin read would otherwise hold the runtime open.
    rt.shutdown_timeout(Duration::from_secs(1));
    result?;

    tracing::info!("indicator shut down cleanly");
    Ok(())
}
