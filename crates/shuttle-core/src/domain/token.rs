//! Tokens, data references and process lineage.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::ReferenceId;
use super::index::Index;

/// Colon-separated lineage path, e.g. `run-01H..:concat`.
///
/// Each level of the engine that spawns work appends one segment, so the
/// id of a processor job names the run that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(String);

impl ProcessId {
    pub fn new(root: impl Into<String>) -> Self {
        Self(root.into())
    }

    pub fn child(&self, segment: &str) -> Self {
        Self(format!("{}:{}", self.0, segment))
    }

    pub fn parent(&self) -> Option<Self> {
        self.0
            .rsplit_once(':')
            .map(|(head, _)| Self(head.to_string()))
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(':')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What a reference points at. Known without dereferencing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefKind {
    Value,
    List,
    Error,
}

/// Opaque handle to a value owned by the reference collaborator.
///
/// Only the collaborator creates these. The engine reads `depth` and
/// `kind` for routing and never looks at the value itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataRef {
    id: ReferenceId,
    depth: usize,
    kind: RefKind,
    contains_errors: bool,
}

impl DataRef {
    pub fn new(id: ReferenceId, depth: usize, kind: RefKind, contains_errors: bool) -> Self {
        Self {
            id,
            depth,
            kind,
            contains_errors: contains_errors || kind == RefKind::Error,
        }
    }

    pub fn id(&self) -> ReferenceId {
        self.id
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn kind(&self) -> RefKind {
        self.kind
    }

    pub fn is_error(&self) -> bool {
        self.kind == RefKind::Error
    }

    /// True for an error reference or a list holding one at any depth.
    pub fn contains_errors(&self) -> bool {
        self.contains_errors
    }
}

/// One unit of data flowing between ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    owning_process: ProcessId,
    index: Index,
    data: DataRef,
    completion: bool,
}

impl Token {
    pub fn new(owning_process: ProcessId, index: Index, data: DataRef) -> Self {
        Self {
            owning_process,
            index,
            data,
            completion: false,
        }
    }

    /// Token that closes `index`: no further children below it will
    /// arrive. `data` is the assembled collection for the prefix.
    pub fn completion(owning_process: ProcessId, index: Index, data: DataRef) -> Self {
        Self {
            owning_process,
            index,
            data,
            completion: true,
        }
    }

    pub fn owning_process(&self) -> &ProcessId {
        &self.owning_process
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn data(&self) -> &DataRef {
        &self.data
    }

    pub fn is_completion(&self) -> bool {
        self.completion
    }

    pub fn is_error(&self) -> bool {
        self.data.is_error()
    }

    /// Same token re-homed under another process, as happens when it
    /// crosses a link into a different processor.
    pub fn with_owner(&self, owning_process: ProcessId) -> Self {
        Self {
            owning_process,
            ..self.clone()
        }
    }
}
