//! Retention sweeper for exited strands.
//!
//! A strand that exited more than `retention` ago, and whose parent row is
//! gone, is deleted along with any semaphores nobody will consume.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::backends::{
    BackendError, BackendResult, GarbageCollectionResult, GarbageCollectorBackend,
};

#[derive(Debug, Clone)]
pub struct GarbageCollectorConfig {
    /// Pause between sweeps.
    pub interval: Duration,
    /// Rows deleted per backend call.
    pub batch_size: usize,
    /// Exited strands younger than this are kept for inspection.
    pub retention: Duration,
}

impl Default for GarbageCollectorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            batch_size: 100,
            retention: Duration::from_secs(86_400),
        }
    }
}

impl GarbageCollectorConfig {
    /// Strands that exited at or before the returned instant are eligible.
    pub fn cutoff(&self, now: DateTime<Utc>) -> BackendResult<DateTime<Utc>> {
        chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
            .ok_or_else(|| {
                BackendError::Message(format!(
                    "retention {:?} is out of range",
                    self.retention
                ))
            })
    }
}

/// Periodically deletes exited strands past their retention window.
pub struct RetentionSweeper<B> {
    backend: B,
    config: GarbageCollectorConfig,
}

impl<B> RetentionSweeper<B>
where
    B: GarbageCollectorBackend + Send + Sync + 'static,
{
    pub fn new(backend: B, config: GarbageCollectorConfig) -> Self {
        Self { backend, config }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; sweeping at startup is not wanted.
        ticker.tick().await;
        debug!(
            every_secs = self.config.interval.as_secs(),
            retention_secs = self.config.retention.as_secs(),
            "retention sweeper running"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep(Utc::now()).await {
                        warn!(error = %err, "retention sweep failed; will retry next interval");
                    }
                }
            }
        }
        debug!("retention sweeper stopped");
    }

    /// Delete eligible strands as of `now`, one batch at a time, until a
    /// batch comes back short.
    pub async fn sweep(&self, now: DateTime<Utc>) -> BackendResult<GarbageCollectionResult> {
        let cutoff = self.config.cutoff(now)?;
        let mut swept = GarbageCollectionResult::default();
        loop {
            let batch = self
                .backend
                .collect_terminal_strands(cutoff, self.config.batch_size)
                .await?;
            swept.deleted_strands += batch.deleted_strands;
            swept.deleted_semaphores += batch.deleted_semaphores;
            if batch.deleted_strands < self.config.batch_size.max(1) {
                break;
            }
        }

        if swept.deleted_strands > 0 {
            info!(
                strands = swept.deleted_strands,
                semaphores = swept.deleted_semaphores,
                %cutoff,
                "swept exited strands"
            );
        }
        Ok(swept)
    }
}

/// Spawn a [`RetentionSweeper`] that stops when `shutdown` flips to `true`.
pub fn spawn_garbage_collector<B>(
    backend: B,
    config: GarbageCollectorConfig,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    B: GarbageCollectorBackend + Send + Sync + 'static,
{
    tokio::spawn(RetentionSweeper::new(backend, config).run(shutdown))
}
