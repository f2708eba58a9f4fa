//! Worker process wiring: Postgres backend, dispatcher and garbage collector.
//!
//! Plugin binaries build their [`ProgRegistry`] and hand it to [`run_worker`].

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::backends::{PostgresBackend, SharedBackend};
use crate::config::Config;
use crate::db;
use crate::failure::RetryPolicy;
use crate::garbage_collector::spawn_garbage_collector;
use crate::prog::ProgRegistry;
use crate::runtime::{Dispatcher, Runtime};

/// Run a worker until `shutdown` flips to `true`.
pub async fn run_worker(
    config: Config,
    registry: ProgRegistry,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let pool = db::connect_pool(&config.database_url, config.worker_concurrency)
        .await
        .context("connect to database")?;
    db::run_migrations(&pool)
        .await
        .context("run migrations")?;
    let backend = PostgresBackend::new(pool);
    info!(progs = ?registry.names(), "connected to database");

    let gc_handle = spawn_garbage_collector(backend.clone(), config.gc_config(), shutdown.clone());

    let shared: SharedBackend = Arc::new(backend);
    let runtime = Runtime::new(Arc::new(registry), RetryPolicy::from_config(&config));
    let dispatcher = Dispatcher::new(shared, runtime, config.dispatcher_config());
    dispatcher.run(shutdown).await;

    if let Err(err) = gc_handle.await {
        warn!(error = %err, "garbage collector task failed");
    }
    info!("worker stopped");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM.
pub async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal as unix_signal};

        let mut terminate = unix_signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received");
            }
            _ = terminate.recv() => {
                info!("SIGTERM received");
            }
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Ctrl+C received");
        Ok(())
    }
}

/// Shutdown channel flipped by [`wait_for_shutdown`].
pub fn shutdown_on_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(err) = wait_for_shutdown().await {
            warn!(error = %err, "signal handler failed; shutting down");
        }
        let _ = tx.send(true);
    });
    rx
}
