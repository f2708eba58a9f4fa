//! In-memory backend with the same transactional semantics as Postgres.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use super::base::{
    BackendError, BackendResult, GarbageCollectionResult, GarbageCollectorBackend,
    InspectionBackend, PageBackend, SemaphoreBackend, StrandBackend, StrandFilter, Transition,
};
use crate::page::{NewPage, Page, strand_tag};
use crate::semaphore::Semaphore;
use crate::strand::{ChildSummary, ClaimedStrand, LeaseClaim, NewStrand, Strand, StrandId};

#[derive(Default)]
struct MemoryState {
    strands: HashMap<StrandId, Strand>,
    semaphores: Vec<Semaphore>,
    pages: Vec<Page>,
}

impl MemoryState {
    fn strand(&self, id: StrandId) -> BackendResult<&Strand> {
        self.strands
            .get(&id)
            .ok_or(BackendError::StrandNotFound(id))
    }

    fn live_strand_mut(&mut self, id: StrandId) -> BackendResult<&mut Strand> {
        let strand = self
            .strands
            .get_mut(&id)
            .ok_or(BackendError::StrandNotFound(id))?;
        if strand.is_terminal() {
            return Err(BackendError::StrandTerminal(id));
        }
        Ok(strand)
    }

    fn pending_for(&self, id: StrandId) -> Vec<Semaphore> {
        let mut pending: Vec<Semaphore> = self
            .semaphores
            .iter()
            .filter(|sem| sem.strand_id == id)
            .cloned()
            .collect();
        pending.sort_by_key(|sem| (sem.created_at, sem.id));
        pending
    }

    fn children_of(&self, id: StrandId) -> Vec<ChildSummary> {
        let mut children: Vec<&Strand> = self
            .strands
            .values()
            .filter(|strand| strand.parent_id == Some(id))
            .collect();
        children.sort_by_key(|strand| (strand.created_at, strand.id));
        children.into_iter().map(ChildSummary::from).collect()
    }

    fn insert_page(&mut self, page: &NewPage, now: DateTime<Utc>) -> Option<Page> {
        let duplicate = self
            .pages
            .iter()
            .any(|existing| existing.tag == page.tag && !existing.is_resolved());
        if duplicate {
            return None;
        }
        let page = page.clone().into_page(now);
        self.pages.push(page.clone());
        Some(page)
    }

    fn remove_strand(&mut self, id: StrandId) -> usize {
        if self.strands.remove(&id).is_none() {
            return 0;
        }
        let before = self.semaphores.len();
        self.semaphores.retain(|sem| sem.strand_id != id);
        before - self.semaphores.len()
    }

    /// A signal or child exit landed after the strand was claimed.
    fn missed_wakeup(&self, transition: &Transition) -> bool {
        let id = transition.strand_id;
        let new_signal = self.semaphores.iter().any(|sem| {
            sem.strand_id == id && !transition.observed_semaphores.contains(&sem.id)
        });
        new_signal
            || transition.observed_live_children.iter().any(|child| {
                self.strands
                    .get(child)
                    .is_some_and(|child| child.is_terminal())
            })
    }

    fn deliver_exit(&mut self, child_id: StrandId, now: DateTime<Utc>) {
        let Some(child) = self.strands.get(&child_id) else {
            return;
        };
        let (Some(parent_id), Some(value)) = (child.parent_id, child.exit_value.clone()) else {
            return;
        };
        let Some(parent) = self.strands.get_mut(&parent_id) else {
            return;
        };
        if parent.is_terminal() {
            return;
        }
        if parent.waiting_on == Some(child_id) {
            parent.stack.deliver(value);
            parent.waiting_on = None;
            parent.scheduled_at = parent.scheduled_at.min(now);
            parent.updated_at = now;
            self.remove_strand(child_id);
        } else if parent.failed_at.is_none() {
            parent.scheduled_at = parent.scheduled_at.min(now);
            parent.updated_at = now;
        }
    }
}

/// Backend that keeps every table in process memory for tests or local runs.
///
/// All operations take one lock, so each call is atomic the way a Postgres
/// transaction would be.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strands(&self) -> Vec<Strand> {
        let state = self.state.lock().expect("memory state poisoned");
        let mut strands: Vec<Strand> = state.strands.values().cloned().collect();
        strands.sort_by_key(|strand| (strand.created_at, strand.id));
        strands
    }

    pub fn semaphores(&self) -> Vec<Semaphore> {
        self.state
            .lock()
            .expect("memory state poisoned")
            .semaphores
            .clone()
    }

    pub fn pages(&self) -> Vec<Page> {
        self.state
            .lock()
            .expect("memory state poisoned")
            .pages
            .clone()
    }
}

#[async_trait]
impl StrandBackend for MemoryBackend {
    async fn insert_strands(&self, strands: &[NewStrand]) -> BackendResult<()> {
        let now = Utc::now();
        let mut state = self.state.lock().expect("memory state poisoned");
        if let Some(dup) = strands
            .iter()
            .find(|new| state.strands.contains_key(&new.id))
        {
            return Err(BackendError::Message(format!(
                "strand {} already exists",
                dup.id
            )));
        }
        for new in strands {
            state.strands.insert(new.id, new.clone().into_strand(now));
        }
        Ok(())
    }

    async fn claim_due_batch(
        &self,
        claim: &LeaseClaim,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BackendResult<Vec<ClaimedStrand>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut state = self.state.lock().expect("memory state poisoned");
        let mut due: Vec<(DateTime<Utc>, DateTime<Utc>, StrandId)> = state
            .strands
            .values()
            .filter(|strand| strand.is_due(now))
            .map(|strand| (strand.scheduled_at, strand.created_at, strand.id))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, _, id) in due {
            let Some(strand) = state.strands.get_mut(&id) else {
                continue;
            };
            strand.lease_owner = Some(claim.owner);
            strand.lease_expires_at = Some(claim.expires_at);
            let strand = strand.clone();
            claimed.push(ClaimedStrand {
                semaphores: state.pending_for(id),
                children: state.children_of(id),
                lease: *claim,
                strand,
            });
        }
        Ok(claimed)
    }

    async fn extend_leases(
        &self,
        claim: &LeaseClaim,
        ids: &[StrandId],
        now: DateTime<Utc>,
    ) -> BackendResult<Vec<StrandId>> {
        let mut state = self.state.lock().expect("memory state poisoned");
        let mut held = Vec::new();
        for id in ids {
            let Some(strand) = state.strands.get_mut(id) else {
                continue;
            };
            if strand.lease_owner == Some(claim.owner)
                && strand.lease_held_at(now)
                && !strand.is_terminal()
            {
                strand.lease_expires_at = Some(claim.expires_at);
                held.push(*id);
            }
        }
        Ok(held)
    }

    async fn release(
        &self,
        claim: &LeaseClaim,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> BackendResult<()> {
        let mut state = self.state.lock().expect("memory state poisoned");
        let id = transition.strand_id;
        let strand = state.strand(id)?;
        if strand.lease_owner != Some(claim.owner)
            || !strand.lease_held_at(now)
            || strand.is_terminal()
        {
            return Err(BackendError::LeaseLost(id));
        }
        if let Some(dup) = transition
            .spawned
            .iter()
            .find(|new| state.strands.contains_key(&new.id))
        {
            return Err(BackendError::Message(format!(
                "strand {} already exists",
                dup.id
            )));
        }

        state
            .semaphores
            .retain(|sem| !(sem.strand_id == id && transition.consumed_semaphores.contains(&sem.id)));

        if let Some(strand) = state.strands.get_mut(&id) {
            transition.apply_to(strand, now);
        }

        for new in &transition.spawned {
            state.strands.insert(new.id, new.clone().into_strand(now));
        }

        for child_id in &transition.reaped {
            let reapable = state
                .strands
                .get(child_id)
                .is_some_and(|child| child.parent_id == Some(id) && child.is_terminal());
            if reapable {
                state.remove_strand(*child_id);
            }
        }

        for (target, name) in &transition.signals {
            match state.live_strand_mut(*target) {
                Ok(strand) => {
                    strand.wake(now);
                    state.semaphores.push(Semaphore::new(*target, name, now));
                }
                Err(err) => {
                    warn!(strand_id = %id, target = %target, semaphore = %name, error = %err, "dropping signal");
                }
            }
        }

        if let Some(page) = &transition.page {
            state.insert_page(page, now);
        }

        if transition.is_exit() {
            state.deliver_exit(id, now);
        } else if transition.wakeable() && state.missed_wakeup(transition) {
            if let Some(strand) = state.strands.get_mut(&id) {
                strand.scheduled_at = strand.scheduled_at.min(now);
            }
        }
        Ok(())
    }

    async fn abandon(&self, owner: Uuid, ids: &[StrandId]) -> BackendResult<()> {
        let mut state = self.state.lock().expect("memory state poisoned");
        for id in ids {
            if let Some(strand) = state.strands.get_mut(id)
                && strand.lease_owner == Some(owner)
            {
                strand.lease_owner = None;
                strand.lease_expires_at = None;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SemaphoreBackend for MemoryBackend {
    async fn signal(
        &self,
        strand_id: StrandId,
        name: &str,
        now: DateTime<Utc>,
    ) -> BackendResult<Semaphore> {
        let mut state = self.state.lock().expect("memory state poisoned");
        state.live_strand_mut(strand_id)?.wake(now);
        let semaphore = Semaphore::new(strand_id, name, now);
        state.semaphores.push(semaphore.clone());
        Ok(semaphore)
    }

    async fn pending_semaphores(&self, strand_id: StrandId) -> BackendResult<Vec<Semaphore>> {
        let state = self.state.lock().expect("memory state poisoned");
        Ok(state.pending_for(strand_id))
    }
}

#[async_trait]
impl PageBackend for MemoryBackend {
    async fn list_pages(&self, unresolved_only: bool, limit: usize) -> BackendResult<Vec<Page>> {
        let state = self.state.lock().expect("memory state poisoned");
        let mut pages: Vec<Page> = state
            .pages
            .iter()
            .filter(|page| !unresolved_only || !page.is_resolved())
            .cloned()
            .collect();
        pages.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        pages.truncate(limit);
        Ok(pages)
    }

    async fn resolve_page(&self, page_id: Uuid, now: DateTime<Utc>) -> BackendResult<Page> {
        let mut state = self.state.lock().expect("memory state poisoned");
        let page = state
            .pages
            .iter_mut()
            .find(|page| page.id == page_id)
            .ok_or(BackendError::PageNotFound(page_id))?;
        if page.resolved_at.is_none() {
            page.resolved_at = Some(now);
        }
        Ok(page.clone())
    }

    async fn raise_page(&self, page: &NewPage, now: DateTime<Utc>) -> BackendResult<Option<Page>> {
        let mut state = self.state.lock().expect("memory state poisoned");
        Ok(state.insert_page(page, now))
    }
}

#[async_trait]
impl InspectionBackend for MemoryBackend {
    async fn get_strand(&self, id: StrandId) -> BackendResult<Option<Strand>> {
        let state = self.state.lock().expect("memory state poisoned");
        Ok(state.strands.get(&id).cloned())
    }

    async fn list_strands(&self, filter: &StrandFilter) -> BackendResult<Vec<Strand>> {
        let state = self.state.lock().expect("memory state poisoned");
        let mut strands: Vec<Strand> = state
            .strands
            .values()
            .filter(|strand| filter.matches(strand))
            .cloned()
            .collect();
        strands.sort_by_key(|strand| (strand.created_at, strand.id));
        strands.truncate(filter.limit);
        Ok(strands)
    }

    async fn resume(
        &self,
        id: StrandId,
        label: Option<&str>,
        now: DateTime<Utc>,
    ) -> BackendResult<Strand> {
        let mut state = self.state.lock().expect("memory state poisoned");
        let strand = state.live_strand_mut(id)?;
        if let Some(label) = label {
            strand.label = label.to_string();
        }
        strand.retry_count = 0;
        strand.deadline_at = None;
        strand.wake(now);
        let strand = strand.clone();

        let tag = strand_tag(id);
        for page in state.pages.iter_mut() {
            if page.tag == tag && page.resolved_at.is_none() {
                page.resolved_at = Some(now);
            }
        }
        Ok(strand)
    }
}

#[async_trait]
impl GarbageCollectorBackend for MemoryBackend {
    async fn collect_terminal_strands(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> BackendResult<GarbageCollectionResult> {
        let mut state = self.state.lock().expect("memory state poisoned");
        let mut candidates: Vec<(DateTime<Utc>, StrandId)> = state
            .strands
            .values()
            .filter(|strand| {
                strand.exited_at.is_some_and(|exited| exited <= older_than)
                    && strand
                        .parent_id
                        .is_none_or(|parent| !state.strands.contains_key(&parent))
            })
            .filter_map(|strand| strand.exited_at.map(|exited| (exited, strand.id)))
            .collect();
        candidates.sort();
        candidates.truncate(limit);

        let mut result = GarbageCollectionResult::default();
        for (_, id) in candidates {
            result.deleted_semaphores += state.remove_strand(id);
            result.deleted_strands += 1;
        }
        Ok(result)
    }
}
