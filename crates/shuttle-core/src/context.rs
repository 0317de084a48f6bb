//! Invocation context: the session handle passed along with every job.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::domain::{ProvenanceEvent, RunId};
use crate::ports::{ProvenanceSink, ReferenceService};

/// Cheap to clone, never mutated. A layer that needs to attach something
/// builds an extended copy with [`InvocationContext::with_property`].
#[derive(Clone)]
pub struct InvocationContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    run_id: RunId,
    references: Arc<dyn ReferenceService>,
    provenance: Option<Arc<dyn ProvenanceSink>>,
    properties: BTreeMap<String, String>,
}

impl InvocationContext {
    pub fn new(
        run_id: RunId,
        references: Arc<dyn ReferenceService>,
        provenance: Option<Arc<dyn ProvenanceSink>>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                run_id,
                references,
                provenance,
                properties: BTreeMap::new(),
            }),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.inner.run_id
    }

    pub fn references(&self) -> &Arc<dyn ReferenceService> {
        &self.inner.references
    }

    pub fn has_provenance(&self) -> bool {
        self.inner.provenance.is_some()
    }

    /// Forward `event` to the provenance sink, if there is one.
    pub fn record(&self, event: ProvenanceEvent) {
        if let Some(sink) = &self.inner.provenance {
            sink.record(event);
        }
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.inner.properties.get(key).map(String::as_str)
    }

    /// A new context equal to this one plus `key = value`. `self` is left
    /// untouched, so jobs already holding it are unaffected.
    pub fn with_property(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut properties = self.inner.properties.clone();
        properties.insert(key.into(), value.into());
        Self {
            inner: Arc::new(ContextInner {
                run_id: self.inner.run_id,
                references: Arc::clone(&self.inner.references),
                provenance: self.inner.provenance.clone(),
                properties,
            }),
        }
    }
}

impl fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationContext")
            .field("run_id", &self.inner.run_id)
            .field("provenance", &self.inner.provenance.is_some())
            .field("properties", &self.inner.properties)
            .finish()
    }
}
