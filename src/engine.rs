//! Entry points for API layers and operators: create, signal, inspect, resume.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::backends::{
    BackendError, InspectionBackend, PageBackend, SemaphoreBackend, SharedBackend, StrandBackend,
    StrandFilter,
};
use crate::page::{NewPage, Page};
use crate::prog::ProgRegistry;
use crate::semaphore::Semaphore;
use crate::strand::{Frame, NewStrand, Strand, StrandId};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unknown prog {0}")]
    UnknownProg(String),
    #[error("prog {prog} has no label {label}")]
    UnknownLabel { prog: String, label: String },
    #[error("strand {strand_id} does not declare semaphore {name}")]
    UnknownSemaphore { strand_id: StrandId, name: String },
    #[error("parent strand {0} not found")]
    ParentNotFound(StrandId),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Clone)]
pub struct Engine {
    backend: SharedBackend,
    registry: Arc<ProgRegistry>,
}

impl Engine {
    pub fn new(backend: SharedBackend, registry: Arc<ProgRegistry>) -> Self {
        Self { backend, registry }
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    pub fn registry(&self) -> &Arc<ProgRegistry> {
        &self.registry
    }

    fn require_label(&self, prog: &str, label: &str) -> EngineResult<()> {
        let found = self
            .registry
            .get(prog)
            .ok_or_else(|| EngineError::UnknownProg(prog.to_string()))?;
        if !found.has_label(label) {
            return Err(EngineError::UnknownLabel {
                prog: prog.to_string(),
                label: label.to_string(),
            });
        }
        Ok(())
    }

    /// Enqueue a root or child strand at `label` with `frame`.
    pub async fn create(
        &self,
        prog: &str,
        label: &str,
        frame: Frame,
        parent_id: Option<StrandId>,
    ) -> EngineResult<StrandId> {
        let mut new = NewStrand::new(prog, label, frame);
        if let Some(parent_id) = parent_id {
            new = new.with_parent(parent_id);
        }
        self.create_strand(new).await
    }

    /// Like [`Engine::create`] for a fully specified request (deadline, delayed start).
    pub async fn create_strand(&self, new: NewStrand) -> EngineResult<StrandId> {
        self.require_label(&new.prog, &new.label)?;
        if let Some(parent_id) = new.parent_id
            && self.backend.get_strand(parent_id).await?.is_none()
        {
            return Err(EngineError::ParentNotFound(parent_id));
        }
        let id = new.id;
        self.backend.insert_strands(std::slice::from_ref(&new)).await?;
        info!(strand_id = %id, prog = %new.prog, label = %new.label, "strand created");
        Ok(id)
    }

    /// Send a semaphore the strand's progs declare and make it due now.
    pub async fn signal(&self, id: StrandId, name: &str) -> EngineResult<Semaphore> {
        let strand = self
            .backend
            .get_strand(id)
            .await?
            .ok_or(BackendError::StrandNotFound(id))?;
        let declared = progs_on_stack(&strand).into_iter().any(|prog| {
            self.registry
                .get(prog)
                .is_some_and(|prog| prog.semaphores().iter().any(|decl| decl.name == name))
        });
        if !declared {
            return Err(EngineError::UnknownSemaphore {
                strand_id: id,
                name: name.to_string(),
            });
        }
        let semaphore = self.backend.signal(id, name, Utc::now()).await?;
        info!(strand_id = %id, semaphore = %name, "semaphore sent");
        Ok(semaphore)
    }

    /// Semaphores sent to `id` that no hop has consumed yet, oldest first.
    pub async fn pending_signals(&self, id: StrandId) -> EngineResult<Vec<Semaphore>> {
        if self.backend.get_strand(id).await?.is_none() {
            return Err(BackendError::StrandNotFound(id).into());
        }
        Ok(self.backend.pending_semaphores(id).await?)
    }

    pub async fn get(&self, id: StrandId) -> EngineResult<Option<Strand>> {
        Ok(self.backend.get_strand(id).await?)
    }

    pub async fn list(&self, filter: &StrandFilter) -> EngineResult<Vec<Strand>> {
        Ok(self.backend.list_strands(filter).await?)
    }

    /// Strands whose lease expired without a release: their worker likely died.
    pub async fn stuck(&self, now: DateTime<Utc>, limit: usize) -> EngineResult<Vec<Strand>> {
        let filter = StrandFilter {
            stale_as_of: Some(now),
            limit,
            ..StrandFilter::default()
        };
        Ok(self.backend.list_strands(&filter).await?)
    }

    pub async fn pages(&self, unresolved_only: bool, limit: usize) -> EngineResult<Vec<Page>> {
        Ok(self.backend.list_pages(unresolved_only, limit).await?)
    }

    /// Raise a page outside any hop. `None` when an unresolved page with the
    /// same tag already exists.
    pub async fn raise_page(&self, page: NewPage) -> EngineResult<Option<Page>> {
        if let Some(strand_id) = page.strand_id
            && self.backend.get_strand(strand_id).await?.is_none()
        {
            return Err(BackendError::StrandNotFound(strand_id).into());
        }
        let raised = self.backend.raise_page(&page, Utc::now()).await?;
        match &raised {
            Some(raised) => info!(page_id = %raised.id, tag = %raised.tag, "page raised"),
            None => info!(tag = %page.tag, "page already open for tag"),
        }
        Ok(raised)
    }

    pub async fn resolve_page(&self, id: Uuid) -> EngineResult<Page> {
        let page = self.backend.resolve_page(id, Utc::now()).await?;
        info!(page_id = %id, tag = %page.tag, "page resolved");
        Ok(page)
    }

    /// Clear a halted strand's failure and make it due now, optionally at `label`.
    pub async fn resume(&self, id: StrandId, label: Option<&str>) -> EngineResult<Strand> {
        if let Some(label) = label {
            let strand = self
                .backend
                .get_strand(id)
                .await?
                .ok_or(BackendError::StrandNotFound(id))?;
            self.require_label(&strand.prog, label)?;
        }
        let strand = self.backend.resume(id, label, Utc::now()).await?;
        info!(strand_id = %id, label = %strand.label, "strand resumed");
        Ok(strand)
    }
}

/// The running prog and every caller waiting on the frame stack.
fn progs_on_stack(strand: &Strand) -> Vec<&str> {
    let mut progs = vec![strand.prog.as_str()];
    progs.extend(
        strand
            .stack
            .frames()
            .iter()
            .filter_map(|frame| frame.link.as_ref().map(|link| link.prog.as_str())),
    );
    progs
}
