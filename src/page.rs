//! Operator-visible alerts raised when a strand fails fatally.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::strand::{Strand, StrandId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub id: Uuid,
    pub strand_id: Option<StrandId>,
    /// At most one unresolved page exists per tag.
    pub tag: String,
    pub summary: String,
    pub details: Value,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Page {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPage {
    pub strand_id: Option<StrandId>,
    pub tag: String,
    pub summary: String,
    pub details: Value,
}

impl NewPage {
    pub fn new(tag: impl Into<String>, summary: impl Into<String>, details: Value) -> Self {
        Self {
            strand_id: None,
            tag: tag.into(),
            summary: summary.into(),
            details,
        }
    }

    pub fn for_strand_id(mut self, strand_id: StrandId) -> Self {
        self.strand_id = Some(strand_id);
        self
    }

    /// Page for a halted strand, snapshotting enough state to diagnose and resume it.
    pub fn for_strand(strand: &Strand, kind: &str, message: &str, error_details: Value) -> Self {
        Self {
            strand_id: Some(strand.id),
            tag: strand_tag(strand.id),
            summary: format!("{} {} at {}: {message}", strand.prog, strand.id, strand.label),
            details: json!({
                "kind": kind,
                "error": message,
                "error_details": error_details,
                "prog": strand.prog,
                "label": strand.label,
                "stack": strand.stack,
                "retry_count": strand.retry_count,
                "parent_id": strand.parent_id,
            }),
        }
    }

    pub fn into_page(self, now: DateTime<Utc>) -> Page {
        Page {
            id: Uuid::new_v4(),
            strand_id: self.strand_id,
            tag: self.tag,
            summary: self.summary,
            details: self.details,
            created_at: now,
            resolved_at: None,
        }
    }
}

pub fn strand_tag(id: StrandId) -> String {
    format!("strand:{id}")
}
