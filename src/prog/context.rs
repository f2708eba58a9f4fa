//! The view of a strand a label handler works against.
//!
//! Everything a handler does through the context (frame edits, consumed
//! semaphores, budded children, outgoing signals) is buffered and only
//! committed together with the directive it returns.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::failure::HopError;
use crate::semaphore::{Semaphore, SemaphoreKind, consumption_ids};
use crate::strand::{CHILD_EXIT_KEY, ChildSummary, Frame, NewStrand, Strand, StrandId};

pub struct HopContext {
    id: StrandId,
    parent_id: Option<StrandId>,
    prog: String,
    label: String,
    depth: usize,
    retry_count: u32,
    now: DateTime<Utc>,
    frame: Frame,
    semaphores: Vec<Semaphore>,
    kinds: HashMap<String, SemaphoreKind>,
    children: Vec<ChildSummary>,
    consumed: Vec<Uuid>,
    spawned: Vec<NewStrand>,
    reaped: Vec<StrandId>,
    signals: Vec<(StrandId, String)>,
}

/// Side effects a hop accumulated, applied by the runtime on success.
#[derive(Debug, Default)]
pub struct HopEffects {
    pub frame: Frame,
    pub consumed: Vec<Uuid>,
    pub spawned: Vec<NewStrand>,
    pub reaped: Vec<StrandId>,
    pub signals: Vec<(StrandId, String)>,
}

impl HopContext {
    pub fn new(
        strand: &Strand,
        semaphores: Vec<Semaphore>,
        children: Vec<ChildSummary>,
        kinds: HashMap<String, SemaphoreKind>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: strand.id,
            parent_id: strand.parent_id,
            prog: strand.prog.clone(),
            label: strand.label.clone(),
            depth: strand.stack.depth(),
            retry_count: strand.retry_count,
            now,
            frame: strand.frame().cloned().unwrap_or_default(),
            semaphores,
            kinds,
            children,
            consumed: Vec::new(),
            spawned: Vec::new(),
            reaped: Vec::new(),
            signals: Vec::new(),
        }
    }

    pub fn id(&self) -> StrandId {
        self.id
    }

    pub fn parent_id(&self) -> Option<StrandId> {
        self.parent_id
    }

    pub fn prog(&self) -> &str {
        &self.prog
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Number of frames on the strand's stack, 1 at the root program.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Consecutive transient failures at this label so far.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn frame_mut(&mut self) -> &mut Frame {
        &mut self.frame
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.frame.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.frame.insert(key.into(), value.into());
    }

    /// Decode a frame value, failing the hop fatally when it is absent or malformed.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T, HopError> {
        let value = self
            .frame
            .get(key)
            .ok_or_else(|| HopError::fatal(format!("frame is missing {key:?}")))?;
        serde_json::from_value(value.clone())
            .map_err(|err| HopError::fatal(format!("frame value {key:?} is invalid: {err}")))
    }

    pub fn require_str(&self, key: &str) -> Result<&str, HopError> {
        self.frame
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| HopError::fatal(format!("frame is missing string {key:?}")))
    }

    /// Exit value of the last pushed child or called prog, if one was delivered.
    pub fn child_exit(&self) -> Option<&Value> {
        self.frame.get(CHILD_EXIT_KEY)
    }

    pub fn take_child_exit(&mut self) -> Option<Value> {
        self.frame.remove(CHILD_EXIT_KEY)
    }

    /// Pending signals of `name` not yet consumed during this hop.
    pub fn pending(&self, name: &str) -> usize {
        self.semaphores
            .iter()
            .filter(|sem| sem.name == name && !self.consumed.contains(&sem.id))
            .count()
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.pending(name) > 0
    }

    /// Consume `name` according to its declared kind; returns how many
    /// signals were taken. Undeclared names are consumed like flags.
    pub fn consume(&mut self, name: &str) -> usize {
        let kind = self
            .kinds
            .get(name)
            .copied()
            .unwrap_or(SemaphoreKind::Flag);
        let available: Vec<Semaphore> = self
            .semaphores
            .iter()
            .filter(|sem| !self.consumed.contains(&sem.id))
            .cloned()
            .collect();
        let ids = consumption_ids(&available, name, kind);
        let taken = ids.len();
        self.consumed.extend(ids);
        taken
    }

    pub fn children(&self) -> &[ChildSummary] {
        &self.children
    }

    /// Children (budded or pushed) that have not exited yet.
    pub fn live_children(&self) -> usize {
        self.children
            .iter()
            .filter(|child| !child.is_terminal())
            .count()
    }

    /// Collect exit values of terminal children; their records are deleted
    /// when the hop commits.
    pub fn reap(&mut self) -> Vec<(StrandId, Value)> {
        let mut reaped = Vec::new();
        for child in &self.children {
            if self.reaped.contains(&child.id) {
                continue;
            }
            if let Some(value) = child.exit_value.clone()
                && child.is_terminal()
            {
                reaped.push((child.id, value));
            }
        }
        self.reaped.extend(reaped.iter().map(|(id, _)| *id));
        reaped
    }

    /// Start a child strand that runs alongside this one.
    pub fn bud(
        &mut self,
        prog: impl Into<String>,
        label: impl Into<String>,
        frame: Frame,
    ) -> StrandId {
        let child = NewStrand::new(prog, label, frame).with_parent(self.id);
        let id = child.id;
        self.spawned.push(child);
        id
    }

    /// Send a semaphore to another strand when this hop commits.
    pub fn signal(&mut self, target: StrandId, name: impl Into<String>) {
        self.signals.push((target, name.into()));
    }

    pub fn into_effects(self) -> HopEffects {
        HopEffects {
            frame: self.frame,
            consumed: self.consumed,
            spawned: self.spawned,
            reaped: self.reaped,
            signals: self.signals,
        }
    }
}
