//! What a label handler asks the runtime to do next.

use std::time::Duration;

use serde_json::Value;

use crate::strand::Frame;

/// Frame key that receives the reason of a `Fail` directive.
pub const FAIL_REASON_KEY: &str = "fail_reason";

/// How a `Hop` changes the top frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FrameUpdate {
    #[default]
    Keep,
    /// Insert or overwrite the given keys.
    Merge(Frame),
    Replace(Frame),
}

impl FrameUpdate {
    pub fn apply(self, frame: &mut Frame) {
        match self {
            Self::Keep => {}
            Self::Merge(update) => frame.extend(update),
            Self::Replace(replacement) => *frame = replacement,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Move to another label of the same prog.
    Hop { label: String, frame: FrameUpdate },
    /// Start a child strand and suspend until it exits; resume at `return_label`
    /// with the child's exit value in the frame.
    Push {
        prog: String,
        label: String,
        frame: Frame,
        return_label: String,
    },
    /// Run another prog on this strand with a fresh frame; `Return` comes back
    /// to `return_label`.
    Call {
        prog: String,
        label: String,
        frame: Frame,
        return_label: String,
    },
    Return(Value),
    /// Re-run the current label after the delay.
    Nap(Duration),
    Exit(Value),
    /// Take the prog's fail label.
    Fail(String),
}

impl Directive {
    pub fn hop(label: impl Into<String>) -> Self {
        Self::Hop {
            label: label.into(),
            frame: FrameUpdate::Keep,
        }
    }

    pub fn hop_merge(label: impl Into<String>, frame: Frame) -> Self {
        Self::Hop {
            label: label.into(),
            frame: FrameUpdate::Merge(frame),
        }
    }

    pub fn hop_replace(label: impl Into<String>, frame: Frame) -> Self {
        Self::Hop {
            label: label.into(),
            frame: FrameUpdate::Replace(frame),
        }
    }

    pub fn push(
        prog: impl Into<String>,
        label: impl Into<String>,
        frame: Frame,
        return_label: impl Into<String>,
    ) -> Self {
        Self::Push {
            prog: prog.into(),
            label: label.into(),
            frame,
            return_label: return_label.into(),
        }
    }

    pub fn call(
        prog: impl Into<String>,
        label: impl Into<String>,
        frame: Frame,
        return_label: impl Into<String>,
    ) -> Self {
        Self::Call {
            prog: prog.into(),
            label: label.into(),
            frame,
            return_label: return_label.into(),
        }
    }

    pub fn ret(value: impl Into<Value>) -> Self {
        Self::Return(value.into())
    }

    pub fn nap(duration: Duration) -> Self {
        Self::Nap(duration)
    }

    pub fn nap_secs(secs: u64) -> Self {
        Self::Nap(Duration::from_secs(secs))
    }

    pub fn exit(value: impl Into<Value>) -> Self {
        Self::Exit(value.into())
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self::Fail(reason.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hop { .. } => "hop",
            Self::Push { .. } => "push",
            Self::Call { .. } => "call",
            Self::Return(_) => "return",
            Self::Nap(_) => "nap",
            Self::Exit(_) => "exit",
            Self::Fail(_) => "fail",
        }
    }
}
