//! Backend interfaces for persisting strands, semaphores and pages.
//!
//! The engine only talks to the store through these traits, so the backing
//! store (Postgres, in-memory) is swappable without touching runtime logic.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::page::{NewPage, Page};
use crate::semaphore::Semaphore;
use crate::strand::{ClaimedStrand, FrameStack, LeaseClaim, NewStrand, Strand, StrandId};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{0}")]
    Message(String),
    #[error("strand not found: {0}")]
    StrandNotFound(StrandId),
    #[error("strand {0} has already exited")]
    StrandTerminal(StrandId),
    #[error("page not found: {0}")]
    PageNotFound(Uuid),
    #[error("lease on strand {0} is no longer held")]
    LeaseLost(StrandId),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// New persisted state for a claimed strand, written atomically on release.
///
/// Side effects recorded during the hop (consumed semaphores, spawned and
/// reaped children, outgoing signals, a page) commit in the same transaction
/// as the state change, or not at all.
#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub strand_id: StrandId,
    pub prog: String,
    pub label: String,
    pub stack: FrameStack,
    pub scheduled_at: DateTime<Utc>,
    pub retry_count: u32,
    pub deadline_at: Option<DateTime<Utc>>,
    pub waiting_on: Option<StrandId>,
    /// Set when the strand reaches a terminal exit.
    pub exit: Option<Value>,
    pub failed_at: Option<DateTime<Utc>>,
    pub consumed_semaphores: Vec<Uuid>,
    pub spawned: Vec<NewStrand>,
    pub reaped: Vec<StrandId>,
    pub signals: Vec<(StrandId, String)>,
    pub page: Option<NewPage>,
    /// Semaphores pending when the strand was claimed.
    pub observed_semaphores: Vec<Uuid>,
    /// Children that had not exited when the strand was claimed.
    pub observed_live_children: Vec<StrandId>,
}

impl Transition {
    /// A transition that rewrites the strand exactly as it was claimed.
    pub fn unchanged(strand: &Strand) -> Self {
        Self {
            strand_id: strand.id,
            prog: strand.prog.clone(),
            label: strand.label.clone(),
            stack: strand.stack.clone(),
            scheduled_at: strand.scheduled_at,
            retry_count: strand.retry_count,
            deadline_at: strand.deadline_at,
            waiting_on: None,
            exit: None,
            failed_at: strand.failed_at,
            consumed_semaphores: Vec::new(),
            spawned: Vec::new(),
            reaped: Vec::new(),
            signals: Vec::new(),
            page: None,
            observed_semaphores: Vec::new(),
            observed_live_children: Vec::new(),
        }
    }

    /// Start from the claimed state, remembering what the hop could see.
    ///
    /// Release uses the observed sets to wake the strand when a signal or a
    /// child exit arrived while it was leased.
    pub fn from_claimed(claimed: &ClaimedStrand) -> Self {
        let mut transition = Self::unchanged(&claimed.strand);
        transition.observed_semaphores = claimed.semaphores.iter().map(|sem| sem.id).collect();
        transition.observed_live_children = claimed
            .children
            .iter()
            .filter(|child| !child.is_terminal())
            .map(|child| child.id)
            .collect();
        transition
    }

    /// Whether release may pull the schedule forward for missed wake-ups.
    pub fn wakeable(&self) -> bool {
        self.exit.is_none() && self.failed_at.is_none()
    }

    pub fn is_exit(&self) -> bool {
        self.exit.is_some()
    }

    /// Copy the transition onto the strand record it was produced from.
    pub fn apply_to(&self, strand: &mut Strand, now: DateTime<Utc>) {
        strand.prog = self.prog.clone();
        strand.label = self.label.clone();
        strand.stack = self.stack.clone();
        strand.scheduled_at = self.scheduled_at;
        strand.retry_count = self.retry_count;
        strand.deadline_at = self.deadline_at;
        strand.waiting_on = self.waiting_on;
        strand.failed_at = self.failed_at;
        if let Some(value) = &self.exit {
            strand.exit_value = Some(value.clone());
            strand.exited_at = Some(now);
        }
        strand.lease_owner = None;
        strand.lease_expires_at = None;
        strand.updated_at = now;
    }
}

/// Filter for strand inspection queries.
#[derive(Clone, Debug)]
pub struct StrandFilter {
    pub prog: Option<String>,
    pub label: Option<String>,
    /// Only strands whose lease expired at or before this instant.
    pub stale_as_of: Option<DateTime<Utc>>,
    pub failed_only: bool,
    pub include_terminal: bool,
    pub limit: usize,
}

impl Default for StrandFilter {
    fn default() -> Self {
        Self {
            prog: None,
            label: None,
            stale_as_of: None,
            failed_only: false,
            include_terminal: false,
            limit: 100,
        }
    }
}

impl StrandFilter {
    pub fn matches(&self, strand: &Strand) -> bool {
        if let Some(prog) = &self.prog
            && &strand.prog != prog
        {
            return false;
        }
        if let Some(label) = &self.label
            && &strand.label != label
        {
            return false;
        }
        if let Some(now) = self.stale_as_of {
            let stale = strand.lease_owner.is_some()
                && strand.lease_expires_at.is_some_and(|expires| expires <= now);
            if !stale {
                return false;
            }
        }
        if self.failed_only && strand.failed_at.is_none() {
            return false;
        }
        if !self.include_terminal && strand.is_terminal() {
            return false;
        }
        true
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
/// Summary of a garbage collection sweep.
pub struct GarbageCollectionResult {
    pub deleted_strands: usize,
    pub deleted_semaphores: usize,
}

/// Claim, lease and release strands.
#[async_trait]
pub trait StrandBackend: Send + Sync {
    /// Insert new root or child strands.
    async fn insert_strands(&self, strands: &[NewStrand]) -> BackendResult<()>;

    /// Atomically lease up to `limit` due strands to `claim.owner`.
    async fn claim_due_batch(
        &self,
        claim: &LeaseClaim,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BackendResult<Vec<ClaimedStrand>>;

    /// Lease a single due strand, if any.
    async fn claim_due(
        &self,
        claim: &LeaseClaim,
        now: DateTime<Utc>,
    ) -> BackendResult<Option<ClaimedStrand>> {
        Ok(self.claim_due_batch(claim, now, 1).await?.into_iter().next())
    }

    /// Push lease expiry forward; returns the ids still held by `claim.owner`.
    async fn extend_leases(
        &self,
        claim: &LeaseClaim,
        ids: &[StrandId],
        now: DateTime<Utc>,
    ) -> BackendResult<Vec<StrandId>>;

    /// Persist a hop's transition and drop the lease in one transaction.
    ///
    /// Fails with [`BackendError::LeaseLost`] and writes nothing when the
    /// caller no longer holds a valid lease.
    async fn release(
        &self,
        claim: &LeaseClaim,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> BackendResult<()>;

    /// Drop leases without changing state, e.g. on shutdown.
    async fn abandon(&self, owner: Uuid, ids: &[StrandId]) -> BackendResult<()>;
}

/// Record asynchronous signals.
#[async_trait]
pub trait SemaphoreBackend: Send + Sync {
    /// Append a signal and make the strand due now.
    async fn signal(
        &self,
        strand_id: StrandId,
        name: &str,
        now: DateTime<Utc>,
    ) -> BackendResult<Semaphore>;

    async fn pending_semaphores(&self, strand_id: StrandId) -> BackendResult<Vec<Semaphore>>;
}

#[async_trait]
pub trait PageBackend: Send + Sync {
    async fn list_pages(&self, unresolved_only: bool, limit: usize) -> BackendResult<Vec<Page>>;

    async fn resolve_page(&self, page_id: Uuid, now: DateTime<Utc>) -> BackendResult<Page>;

    /// Record a page outside a hop; deduplicated against unresolved pages by tag.
    async fn raise_page(&self, page: &NewPage, now: DateTime<Utc>) -> BackendResult<Option<Page>>;
}

/// Read-side queries and operator actions.
#[async_trait]
pub trait InspectionBackend: Send + Sync {
    async fn get_strand(&self, id: StrandId) -> BackendResult<Option<Strand>>;

    async fn list_strands(&self, filter: &StrandFilter) -> BackendResult<Vec<Strand>>;

    /// Make a halted strand due now, optionally at another label.
    async fn resume(
        &self,
        id: StrandId,
        label: Option<&str>,
        now: DateTime<Utc>,
    ) -> BackendResult<Strand>;
}

/// Backend capability for deleting old terminal strands.
#[async_trait]
pub trait GarbageCollectorBackend: Send + Sync {
    async fn collect_terminal_strands(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> BackendResult<GarbageCollectionResult>;
}

/// Everything the engine needs from a store.
pub trait Backend:
    StrandBackend + SemaphoreBackend + PageBackend + InspectionBackend + GarbageCollectorBackend
{
}

impl<T> Backend for T where
    T: StrandBackend + SemaphoreBackend + PageBackend + InspectionBackend + GarbageCollectorBackend
{
}

pub type SharedBackend = Arc<dyn Backend>;
