//! ember actor host
//!
//! Runs the actor manager over a SQLite driver and serves clients on the
//! line-delimited JSON transport.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use ember_host::clock::{Clock, SystemClock};
use ember_host::demo::counter_definition;
use ember_host::{tcp, ActorManager, HostConfig, SqliteDriver};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = HostConfig::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting ember actor host");
    info!(
        data_dir = %config.data_dir,
        listen_addr = %config.listen_addr,
        "Configuration loaded"
    );

    let data_dir = Path::new(&config.data_dir);
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let driver = Arc::new(
        SqliteDriver::open(data_dir.join("actors.db"), Arc::clone(&clock))?
            .with_databases_dir(data_dir.join("databases")),
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let manager = ActorManager::builder(driver)
        .clock(clock)
        .register(counter_definition(config.instance.clone())?)
        .build(shutdown_rx.clone())?;

    let restored = manager.restore_alarms().await?;
    info!(alarms = restored, "Actor manager ready");

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let server_handle = tokio::spawn(tcp::serve(listener, manager.clone(), shutdown_rx));

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Listener exited normally"),
                Ok(Err(e)) => error!(error = %e, "Listener error"),
                Err(e) => error!(error = %e, "Listener task panicked"),
            }
        }
    }

    // Stop actors before signalling so their final saves run in order
    manager.shutdown().await;
    let _ = shutdown_tx.send(true);

    info!(stats = ?manager.stats(), "Actor host shutdown complete");
    Ok(())
}
