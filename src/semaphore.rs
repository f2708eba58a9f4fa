//! Named asynchronous signals targeted at a strand.
//!
//! Semaphores are stored apart from the strand row so a signal sent while the
//! strand sleeps (or while another worker runs it) is never lost. Programs
//! decide per name whether repeated signals coalesce or accumulate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::strand::StrandId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Semaphore {
    pub id: Uuid,
    pub strand_id: StrandId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Semaphore {
    pub fn new(strand_id: StrandId, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            strand_id,
            name: name.into(),
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemaphoreKind {
    /// Boolean request: any number of pending signals is consumed at once.
    Flag,
    /// Count: each consumption takes exactly one pending signal.
    Counter,
}

impl SemaphoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Counter => "counter",
        }
    }
}

/// A semaphore name a program reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemaphoreDecl {
    pub name: String,
    pub kind: SemaphoreKind,
    /// Label the strand is forced to when this semaphore is pending.
    pub trigger: Option<String>,
}

/// Pick the ids one consumption of `name` removes, oldest first.
pub fn consumption_ids(pending: &[Semaphore], name: &str, kind: SemaphoreKind) -> Vec<Uuid> {
    let mut matching: Vec<&Semaphore> = pending.iter().filter(|sem| sem.name == name).collect();
    matching.sort_by_key(|sem| (sem.created_at, sem.id));
    match kind {
        SemaphoreKind::Flag => matching.into_iter().map(|sem| sem.id).collect(),
        SemaphoreKind::Counter => matching.first().map(|sem| sem.id).into_iter().collect(),
    }
}
