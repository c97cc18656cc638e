mod bootstrap;
mod health;

use std::future::Future;

use anyhow::{Context, Result};
use greeter_core::config::{AppConfig, LoadOptions, LogFormat, LoggingConfig};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins over the configured level when set.
fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    match logging.format {
        LogFormat::Compact => subscriber.compact().init(),
        LogFormat::Pretty => subscriber.pretty().init(),
        LogFormat::Json => subscriber.json().flatten_event(true).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config.logging);

    let app = bootstrap::bootstrap_with_config(config)?;

    if app.config.server.health_check_port != 0 {
        health::spawn(
            &app.config.server.bind_address,
            app.config.server.health_check_port,
            health::HealthState::new(app.mode, app.pipeline.dispatcher().handler_count()),
        )
        .await?;
    }

    let signals =
        install_shutdown_signals().context("could not install shutdown signal handlers")?;
    let shutdown_rx = shutdown_channel(signals);

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        transport_mode = app.mode.as_str(),
        "greeter-server started"
    );
    app.run(shutdown_rx).await?;
    tracing::info!(
        event_name = "system.server.stopped",
        correlation_id = "shutdown",
        "greeter-server stopped"
    );

    Ok(())
}

/// Flips the returned receiver to `true` once `signals` resolves.
fn shutdown_channel<F>(signals: F) -> watch::Receiver<bool>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        signals.await;
        tracing::info!(
            event_name = "system.server.stopping",
            correlation_id = "shutdown",
            "greeter-server stopping"
        );
        let _ = shutdown_tx.send(true);
    });
    shutdown_rx
}

/// Registers the handlers up front so a registration failure is a startup
/// error rather than an immediate shutdown.
#[cfg(unix)]
fn install_shutdown_signals() -> std::io::Result<impl Future<Output = ()> + Send + 'static> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
    })
}

#[cfg(windows)]
fn install_shutdown_signals() -> std::io::Result<impl Future<Output = ()> + Send + 'static> {
    let mut ctrl_c = tokio::signal::windows::ctrl_c()?;
    Ok(async move {
        ctrl_c.recv().await;
    })
}
