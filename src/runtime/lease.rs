//! Tracking of leases held by a dispatcher and their heartbeat.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backends::{SharedBackend, StrandBackend};
use crate::strand::{LeaseClaim, StrandId};

/// Strands this worker currently holds, each with a token cancelled when its
/// lease is found lost.
#[derive(Clone)]
pub struct LeaseTracker {
    owner: Uuid,
    held: Arc<Mutex<HashMap<StrandId, CancellationToken>>>,
}

impl LeaseTracker {
    pub fn new(owner: Uuid) -> Self {
        Self {
            owner,
            held: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    /// Start tracking `id`; the returned token fires if the lease is lost.
    pub fn track(&self, id: StrandId) -> CancellationToken {
        let token = CancellationToken::new();
        self.held
            .lock()
            .expect("lease tracker poisoned")
            .insert(id, token.clone());
        token
    }

    pub fn untrack(&self, id: StrandId) {
        self.held
            .lock()
            .expect("lease tracker poisoned")
            .remove(&id);
    }

    pub fn snapshot(&self) -> Vec<StrandId> {
        self.held
            .lock()
            .expect("lease tracker poisoned")
            .keys()
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.held.lock().expect("lease tracker poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel and forget every tracked id missing from `still_held`.
    pub fn retain_held(&self, still_held: &[StrandId]) -> Vec<StrandId> {
        let mut guard = self.held.lock().expect("lease tracker poisoned");
        let lost: Vec<StrandId> = guard
            .keys()
            .filter(|id| !still_held.contains(id))
            .copied()
            .collect();
        for id in &lost {
            if let Some(token) = guard.remove(id) {
                token.cancel();
            }
        }
        lost
    }

    /// Extend every tracked lease once.
    pub async fn refresh(&self, backend: &SharedBackend, lease_duration: Duration) {
        let ids = self.snapshot();
        if ids.is_empty() {
            return;
        }
        let now = Utc::now();
        let claim = LeaseClaim::new(self.owner, now, lease_duration);
        debug!(count = ids.len(), "refreshing strand leases");
        match backend.extend_leases(&claim, &ids, now).await {
            Ok(held) => {
                // Ids released while the query ran are gone from the tracker already.
                let current = self.snapshot();
                let lost: Vec<StrandId> = ids
                    .iter()
                    .filter(|id| !held.contains(id) && current.contains(id))
                    .copied()
                    .collect();
                if !lost.is_empty() {
                    let keep: Vec<StrandId> =
                        current.into_iter().filter(|id| !lost.contains(id)).collect();
                    self.retain_held(&keep);
                    warn!(count = lost.len(), lost = ?lost, "strand leases lost");
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to refresh strand leases");
            }
        }
    }
}

pub fn spawn_lease_heartbeat(
    backend: SharedBackend,
    tracker: LeaseTracker,
    heartbeat_interval: Duration,
    lease_duration: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if *shutdown_rx.borrow() {
                info!("lease heartbeat shutdown flag set");
                break;
            }
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("lease heartbeat shutdown notified");
                        break;
                    }
                    continue;
                }
                _ = tokio::time::sleep(heartbeat_interval) => {}
            };
            tracker.refresh(&backend, lease_duration).await;
        }
        info!("lease heartbeat exiting");
    })
}
