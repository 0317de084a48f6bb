//! Provenance sink port.

use crate::domain::ProvenanceEvent;

/// Receives lineage events. Implementations must not block: events are
/// recorded from worker threads in the middle of dispatch.
pub trait ProvenanceSink: Send + Sync {
    fn record(&self, event: ProvenanceEvent);
}
