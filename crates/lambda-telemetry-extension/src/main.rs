//! AWS Lambda telemetry extension binary.
//!
//! Registers as an external extension, subscribes to the Telemetry API, and
//! holds the execution environment open after each invocation until its
//! telemetry has drained.
//!
//! # Configuration
//!
//! Configuration is loaded from (in order of priority):
//! 1. Default values
//! 2. Config file: `/var/task/telemetry-extension.toml`
//! 3. Platform environment (`AWS_LAMBDA_RUNTIME_API`, `AWS_SAM_LOCAL`)
//! 4. Environment variables with `LAMBDA_TELEMETRY_` prefix

use anyhow::{Context, Result};
use lambda_telemetry_extension::{Config, ExtensionRuntime};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing().context("failed to initialise tracing subscriber")?;

    let config = Config::load().context("failed to load configuration")?;
    tracing::debug!(?config, "Configuration loaded");

    let runtime = ExtensionRuntime::new(config);

    let cancel = runtime.cancellation_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Termination signal received");
        cancel.cancel();
    });

    runtime.run().await.context("extension runtime failed")?;

    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,lambda_telemetry_extension=debug"));

    tracing_subscriber::registry()
        // Lambda prefixes log lines with a timestamp already.
        .with(fmt::layer().with_target(true).without_time())
        .with(filter)
        .try_init()
        .context("failed to initialise tracing registry")?;

    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::error!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
