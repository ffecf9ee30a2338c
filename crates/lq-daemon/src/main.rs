//! lyquor-devd: local backend for the Lyquor developer dashboard.

use anyhow::{Context, Result};
use lq_core::config::Config;
use lq_daemon::daemon::Daemon;
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let mut config = Config::load().context("failed to load config")?;
    config.apply_env_overrides();
    lq_telemetry::logging::init_logging("lyquor-devd", &config.general);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        config = %Config::default_path().display(),
        "lyquor-devd starting"
    );

    let daemon = Daemon::new(config);
    let shutdown = daemon.shutdown_handle();

    // Wire ctrl-c to trigger graceful shutdown.
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    daemon.run().await
}
