//! Persisted workflow instances and their scheduling metadata.
//!
//! A [`Strand`] is the whole execution state of one workflow: which program
//! and label it sits at, the stack of scratch frames, when it may run next,
//! and which worker (if any) currently holds its lease. Everything the
//! runtime needs to resume after a crash lives here.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::semaphore::Semaphore;

/// Mutable scratch data for one program invocation.
pub type Frame = Map<String, Value>;

/// Frame key that receives a finished sub-workflow's exit value.
pub const CHILD_EXIT_KEY: &str = "child_exit";

/// How far a fatally failed strand is pushed into the future.
pub const PAUSE_HORIZON_DAYS: i64 = 3650;

/// Schedule time used to park a strand until an operator intervenes.
pub fn paused_until(now: DateTime<Utc>) -> DateTime<Utc> {
    now + ChronoDuration::days(PAUSE_HORIZON_DAYS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StrandId(pub Uuid);

impl StrandId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StrandId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StrandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StrandId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Where a called program returns to once it pops its frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub prog: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackFrame {
    pub data: Frame,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<Link>,
}

/// Ordered frames of a strand; the last element is the top.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameStack(Vec<StackFrame>);

impl FrameStack {
    pub fn new(frame: Frame) -> Self {
        Self(vec![StackFrame {
            data: frame,
            link: None,
        }])
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn frames(&self) -> &[StackFrame] {
        &self.0
    }

    pub fn top(&self) -> Option<&Frame> {
        self.0.last().map(|frame| &frame.data)
    }

    pub fn top_mut(&mut self) -> &mut Frame {
        if self.0.is_empty() {
            self.0.push(StackFrame {
                data: Frame::new(),
                link: None,
            });
        }
        let last = self.0.len() - 1;
        &mut self.0[last].data
    }

    pub fn replace_top(&mut self, frame: Frame) {
        *self.top_mut() = frame;
    }

    pub fn push(&mut self, frame: Frame, link: Link) {
        self.0.push(StackFrame {
            data: frame,
            link: Some(link),
        });
    }

    /// Pop the top frame. The bottom frame is never popped.
    pub fn pop(&mut self) -> Option<StackFrame> {
        if self.0.len() <= 1 {
            return None;
        }
        self.0.pop()
    }

    /// Hand a child's exit value to the current top frame.
    pub fn deliver(&mut self, value: Value) {
        self.top_mut().insert(CHILD_EXIT_KEY.to_string(), value);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strand {
    pub id: StrandId,
    pub parent_id: Option<StrandId>,
    pub prog: String,
    pub label: String,
    pub stack: FrameStack,
    /// Pushed child this strand is suspended on.
    pub waiting_on: Option<StrandId>,
    pub scheduled_at: DateTime<Utc>,
    pub lease_owner: Option<Uuid>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub deadline_at: Option<DateTime<Utc>>,
    pub exit_value: Option<Value>,
    pub exited_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Strand {
    pub fn is_terminal(&self) -> bool {
        self.exited_at.is_some()
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting_on.is_some()
    }

    pub fn frame(&self) -> Option<&Frame> {
        self.stack.top()
    }

    /// Whether some worker holds an unexpired lease at `now`.
    pub fn lease_held_at(&self, now: DateTime<Utc>) -> bool {
        self.lease_owner.is_some() && self.lease_expires_at.is_some_and(|expires| expires > now)
    }

    /// Whether a worker polling at `now` may claim this strand.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminal()
            && !self.is_waiting()
            && self.scheduled_at <= now
            && !self.lease_held_at(now)
    }

    /// Pull the strand's schedule forward to `now` and clear any failure pause.
    pub fn wake(&mut self, now: DateTime<Utc>) {
        if self.scheduled_at > now {
            self.scheduled_at = now;
        }
        self.failed_at = None;
        self.updated_at = now;
    }
}

/// Request to create a root or child strand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewStrand {
    pub id: StrandId,
    pub parent_id: Option<StrandId>,
    pub prog: String,
    pub label: String,
    pub frame: Frame,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub deadline_at: Option<DateTime<Utc>>,
}

impl NewStrand {
    pub fn new(prog: impl Into<String>, label: impl Into<String>, frame: Frame) -> Self {
        Self {
            id: StrandId::new(),
            parent_id: None,
            prog: prog.into(),
            label: label.into(),
            frame,
            scheduled_at: None,
            deadline_at: None,
        }
    }

    pub fn with_parent(mut self, parent_id: StrandId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_deadline(mut self, deadline_at: DateTime<Utc>) -> Self {
        self.deadline_at = Some(deadline_at);
        self
    }

    pub fn scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }

    pub fn into_strand(self, now: DateTime<Utc>) -> Strand {
        Strand {
            id: self.id,
            parent_id: self.parent_id,
            prog: self.prog,
            label: self.label,
            stack: FrameStack::new(self.frame),
            waiting_on: None,
            scheduled_at: self.scheduled_at.unwrap_or(now),
            lease_owner: None,
            lease_expires_at: None,
            retry_count: 0,
            deadline_at: self.deadline_at,
            exit_value: None,
            exited_at: None,
            failed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Lease settings a worker claims strands with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseClaim {
    pub owner: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl LeaseClaim {
    pub fn new(owner: Uuid, now: DateTime<Utc>, duration: std::time::Duration) -> Self {
        let duration =
            ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::seconds(0));
        Self {
            owner,
            expires_at: now + duration,
        }
    }
}

/// Child strand as seen by its parent at claim time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSummary {
    pub id: StrandId,
    pub prog: String,
    pub label: String,
    pub exit_value: Option<Value>,
    pub exited_at: Option<DateTime<Utc>>,
}

impl ChildSummary {
    pub fn is_terminal(&self) -> bool {
        self.exited_at.is_some()
    }
}

impl From<&Strand> for ChildSummary {
    fn from(strand: &Strand) -> Self {
        Self {
            id: strand.id,
            prog: strand.prog.clone(),
            label: strand.label.clone(),
            exit_value: strand.exit_value.clone(),
            exited_at: strand.exited_at,
        }
    }
}

/// A strand handed to one worker together with everything its hop may read.
#[derive(Debug, Clone)]
pub struct ClaimedStrand {
    pub strand: Strand,
    pub lease: LeaseClaim,
    pub semaphores: Vec<Semaphore>,
    pub children: Vec<ChildSummary>,
}
