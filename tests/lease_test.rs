//! Lease exclusivity under concurrent claimers.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use uuid::Uuid;

use strand::backends::{MemoryBackend, StrandBackend};
use strand::runtime::{LeaseTracker, spawn_lease_heartbeat};
use strand::strand::{Frame, LeaseClaim, NewStrand};

use common::assert_claims_are_exclusive;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_never_share_a_strand() {
    assert_claims_are_exclusive(Arc::new(MemoryBackend::new())).await;
}

#[tokio::test]
async fn abandoned_leases_are_immediately_claimable() {
    let memory = MemoryBackend::new();
    let new = NewStrand::new("Vm", "start", Frame::new());
    let id = new.id;
    memory.insert_strands(&[new]).await.expect("insert");

    let now = Utc::now();
    let owner = Uuid::new_v4();
    let claim = LeaseClaim::new(owner, now, Duration::from_secs(30));
    assert!(memory.claim_due(&claim, now).await.expect("claim").is_some());
    assert!(memory.claim_due(&claim, now).await.expect("claim").is_none());

    memory.abandon(owner, &[id]).await.expect("abandon");
    let other = LeaseClaim::new(Uuid::new_v4(), now, Duration::from_secs(30));
    let claimed = memory.claim_due(&other, now).await.expect("claim");
    assert_eq!(claimed.map(|c| c.strand.id), Some(id));
}

#[tokio::test]
async fn heartbeat_keeps_leases_alive_and_cancels_stolen_ones() {
    let memory = MemoryBackend::new();
    let backend: strand::backends::SharedBackend = Arc::new(memory.clone());
    let kept = NewStrand::new("Vm", "start", Frame::new());
    let stolen = NewStrand::new("Vm", "start", Frame::new());
    let (kept_id, stolen_id) = (kept.id, stolen.id);
    memory.insert_strands(&[kept, stolen]).await.expect("insert");

    let owner = Uuid::new_v4();
    let lease = Duration::from_millis(600);
    let claim = LeaseClaim::new(owner, Utc::now(), lease);
    let claimed = memory
        .claim_due_batch(&claim, Utc::now(), 10)
        .await
        .expect("claim");
    assert_eq!(claimed.len(), 2);

    let tracker = LeaseTracker::new(owner);
    let kept_token = tracker.track(kept_id);
    let stolen_token = tracker.track(stolen_id);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let heartbeat = spawn_lease_heartbeat(
        backend,
        tracker.clone(),
        Duration::from_millis(100),
        lease,
        shutdown_rx,
    );

    // Another worker takes one strand over; the heartbeat notices.
    memory.abandon(owner, &[stolen_id]).await.expect("abandon");
    let thief = LeaseClaim::new(Uuid::new_v4(), Utc::now(), Duration::from_secs(60));
    assert!(memory.claim_due(&thief, Utc::now()).await.expect("claim").is_some());

    tokio::time::timeout(Duration::from_secs(5), stolen_token.cancelled())
        .await
        .expect("stolen lease cancelled");

    // Well past the original expiry, the kept lease is still ours.
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert!(!kept_token.is_cancelled());
    assert_eq!(tracker.snapshot(), vec![kept_id]);
    let other = LeaseClaim::new(Uuid::new_v4(), Utc::now(), lease);
    assert!(memory.claim_due(&other, Utc::now()).await.expect("claim").is_none());

    shutdown_tx.send(true).expect("shutdown");
    heartbeat.await.expect("heartbeat");
}
