//! Poll loop that claims due strands and runs their hops on a bounded pool.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::executor::{HopOutcome, Runtime};
use super::lease::{LeaseTracker, spawn_lease_heartbeat};
use crate::backends::{BackendError, BackendResult, SharedBackend, StrandBackend};
use crate::strand::{ClaimedStrand, LeaseClaim, StrandId};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Lease owner id written on claimed strands.
    pub worker_id: Uuid,
    /// Hops run in parallel.
    pub concurrency: usize,
    pub claim_batch_size: usize,
    pub poll_interval: Duration,
    pub lease_duration: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_id: Uuid::new_v4(),
            concurrency: 8,
            claim_batch_size: 8,
            poll_interval: Duration::from_millis(500),
            lease_duration: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(20),
        }
    }
}

/// How one claimed hop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HopReport {
    Released(HopOutcome),
    /// The lease expired or was taken over before release; nothing was written.
    LeaseLost,
    Error(String),
}

/// Summary of one claim-and-run round.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub claimed: usize,
    pub hops: Vec<(StrandId, HopReport)>,
}

impl TickReport {
    pub fn released(&self) -> usize {
        self.hops
            .iter()
            .filter(|(_, report)| matches!(report, HopReport::Released(_)))
            .count()
    }

    pub fn lost(&self) -> usize {
        self.hops
            .iter()
            .filter(|(_, report)| *report == HopReport::LeaseLost)
            .count()
    }

    pub fn outcome(&self, id: StrandId) -> Option<&HopOutcome> {
        self.hops.iter().find_map(|(hop_id, report)| match report {
            HopReport::Released(outcome) if *hop_id == id => Some(outcome),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Clock {
    Fixed(DateTime<Utc>),
    System,
}

impl Clock {
    fn now(&self) -> DateTime<Utc> {
        match self {
            Self::Fixed(now) => *now,
            Self::System => Utc::now(),
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    backend: SharedBackend,
    runtime: Runtime,
    config: DispatcherConfig,
    tracker: LeaseTracker,
}

impl Dispatcher {
    pub fn new(backend: SharedBackend, runtime: Runtime, mut config: DispatcherConfig) -> Self {
        config.concurrency = config.concurrency.max(1);
        config.claim_batch_size = config.claim_batch_size.max(1);
        let tracker = LeaseTracker::new(config.worker_id);
        Self {
            backend,
            runtime,
            config,
            tracker,
        }
    }

    pub fn worker_id(&self) -> Uuid {
        self.config.worker_id
    }

    pub fn tracker(&self) -> &LeaseTracker {
        &self.tracker
    }

    async fn claim(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BackendResult<Vec<ClaimedStrand>> {
        let claim = LeaseClaim::new(self.config.worker_id, now, self.config.lease_duration);
        self.backend.claim_due_batch(&claim, now, limit).await
    }

    async fn run_hop(&self, claimed: ClaimedStrand, clock: Clock) -> HopReport {
        let id = claimed.strand.id;
        let token = self.tracker.track(id);
        let executed = self.runtime.execute(&claimed, clock.now(), &token).await;
        self.tracker.untrack(id);
        let Some(executed) = executed else {
            return HopReport::LeaseLost;
        };

        match self
            .backend
            .release(&claimed.lease, &executed.transition, clock.now())
            .await
        {
            Ok(()) => {
                debug!(
                    strand_id = %id,
                    prog = %claimed.strand.prog,
                    label = %claimed.strand.label,
                    outcome = ?executed.outcome,
                    "hop committed"
                );
                HopReport::Released(executed.outcome)
            }
            Err(BackendError::LeaseLost(_)) => {
                warn!(strand_id = %id, "lease lost before release; hop will be rerun");
                HopReport::LeaseLost
            }
            Err(err) => {
                error!(strand_id = %id, error = %err, "failed to release strand");
                HopReport::Error(err.to_string())
            }
        }
    }

    async fn run_batch(&self, batch: Vec<ClaimedStrand>, clock: Clock) -> TickReport {
        let claimed = batch.len();
        let mut tasks = JoinSet::new();
        for strand in batch {
            let dispatcher = self.clone();
            tasks.spawn(async move {
                let id = strand.strand.id;
                (id, dispatcher.run_hop(strand, clock).await)
            });
        }
        let mut hops = Vec::with_capacity(claimed);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(hop) => hops.push(hop),
                Err(err) => error!(error = %err, "hop task failed"),
            }
        }
        TickReport { claimed, hops }
    }

    /// Claim whatever is due at `now` and run those hops, treating `now` as the
    /// current time throughout.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> BackendResult<TickReport> {
        let limit = self.config.claim_batch_size.min(self.config.concurrency);
        let batch = self.claim(now, limit).await?;
        Ok(self.run_batch(batch, Clock::Fixed(now)).await)
    }

    pub async fn tick(&self) -> BackendResult<TickReport> {
        let limit = self.config.claim_batch_size.min(self.config.concurrency);
        let batch = self.claim(Utc::now(), limit).await?;
        Ok(self.run_batch(batch, Clock::System).await)
    }

    /// Tick at `now` until nothing is due or `max_ticks` is reached; returns
    /// the number of hops run.
    pub async fn drain_at(&self, now: DateTime<Utc>, max_ticks: usize) -> BackendResult<usize> {
        let mut hops = 0;
        for _ in 0..max_ticks {
            let report = self.tick_at(now).await?;
            if report.claimed == 0 {
                break;
            }
            hops += report.claimed;
        }
        Ok(hops)
    }

    /// Poll until shutdown, keeping up to `concurrency` hops in flight.
    ///
    /// In-flight hops run to completion after shutdown is requested; any lease
    /// still tracked afterwards is abandoned.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            poll_interval_ms = self.config.poll_interval.as_millis(),
            lease_secs = self.config.lease_duration.as_secs(),
            "dispatcher starting"
        );
        let (heartbeat_tx, heartbeat_rx) = watch::channel(false);
        let heartbeat = spawn_lease_heartbeat(
            self.backend.clone(),
            self.tracker.clone(),
            self.config.heartbeat_interval,
            self.config.lease_duration,
            heartbeat_rx,
        );

        let mut in_flight: JoinSet<(StrandId, HopReport)> = JoinSet::new();
        let mut backoff = Duration::from_millis(200);
        let max_backoff = Duration::from_secs(5);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            let slots = self.config.concurrency.saturating_sub(in_flight.len());
            let mut idle_for = self.config.poll_interval;
            if slots > 0 {
                match self
                    .claim(Utc::now(), slots.min(self.config.claim_batch_size))
                    .await
                {
                    Ok(batch) => {
                        backoff = Duration::from_millis(200);
                        let filled = batch.len() == slots.min(self.config.claim_batch_size);
                        for claimed in batch {
                            let dispatcher = self.clone();
                            in_flight.spawn(async move {
                                let id = claimed.strand.id;
                                (id, dispatcher.run_hop(claimed, Clock::System).await)
                            });
                        }
                        if filled && in_flight.len() < self.config.concurrency {
                            continue;
                        }
                    }
                    Err(err) => {
                        error!(error = %err, "claiming strands failed; backing off");
                        idle_for = backoff;
                        backoff = std::cmp::min(backoff * 2, max_backoff);
                    }
                }
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(err) = joined {
                        error!(error = %err, "hop task failed");
                    }
                }
                _ = tokio::time::sleep(idle_for) => {}
            }
        }

        info!(in_flight = in_flight.len(), "dispatcher draining in-flight hops");
        while let Some(joined) = in_flight.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "hop task failed");
            }
        }

        let _ = heartbeat_tx.send(true);
        if let Err(err) = heartbeat.await {
            warn!(error = %err, "lease heartbeat task failed");
        }

        let remaining = self.tracker.snapshot();
        if !remaining.is_empty()
            && let Err(err) = self
                .backend
                .abandon(self.config.worker_id, &remaining)
                .await
        {
            warn!(error = %err, count = remaining.len(), "failed to abandon leases on shutdown");
        }
        info!(worker_id = %self.config.worker_id, "dispatcher stopped");
    }
}
