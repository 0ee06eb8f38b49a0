mod bootstrap;
mod health;

use std::time::Duration;

use anyhow::Result;
use perkbot_core::config::{AppConfig, LoadOptions};

fn init_logging(config: &AppConfig) {
    use perkbot_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Load config and initialize logging before any other operations
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);
    for warning in config.warnings() {
        tracing::warn!(
            event_name = "system.config.warning",
            correlation_id = "bootstrap",
            "{warning}"
        );
    }

    let app = bootstrap::bootstrap_with_config(config).await?;

    health::spawn(
        &app.config.server.bind_address,
        app.config.server.health_check_port,
        health::HealthState::new(app.cache.clone(), app.campaign.clone()),
    )
    .await?;

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        welcome_channel_id = %app.config.broadcast.welcome_channel_id,
        send_dm = app.config.broadcast.send_dm,
        "perkbot-server started"
    );

    let slack_runner = app.slack_runner;
    let runner = tokio::spawn(async move { slack_runner.start().await });

    wait_for_shutdown().await?;

    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "perkbot-server stopping"
    );
    runner.abort();
    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    if !app.broadcast.drain(grace).await {
        tracing::warn!(
            event_name = "system.server.broadcast_interrupted",
            correlation_id = "shutdown",
            "running broadcast did not deliver its report within the grace period"
        );
    }
    app.shutdown.cancel();
    if tokio::time::timeout(grace, app.sweeper).await.is_err() {
        tracing::warn!(
            event_name = "system.server.shutdown_timeout",
            correlation_id = "shutdown",
            "cache sweeper did not stop within the grace period"
        );
    }

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
