//! Provenance events emitted at dispatch transitions.

use serde::{Deserialize, Serialize};

use super::ids::RunId;
use super::index::Index;
use super::token::ProcessId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvenanceKind {
    Invocation,
    Result,
    Error,
    Retry,
    Failover,
    ErrorTranslated,
}

/// Immutable record of one transition. Sinks may keep or drop it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceEvent {
    pub kind: ProvenanceKind,
    /// Lineage parent of `process_id`, if any.
    pub parent_id: Option<ProcessId>,
    pub process_id: ProcessId,
    pub workflow_id: RunId,
    pub index: Index,
    /// Free-form detail such as the activity name or error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ProvenanceEvent {
    pub fn new(kind: ProvenanceKind, workflow_id: RunId, process_id: &ProcessId, index: &Index) -> Self {
        Self {
            kind,
            parent_id: process_id.parent(),
            process_id: process_id.clone(),
            workflow_id,
            index: index.clone(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
