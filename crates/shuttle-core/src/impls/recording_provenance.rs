//! Provenance sinks: an in-memory recorder and a tracing forwarder.

use std::sync::Mutex;

use crate::domain::{ProvenanceEvent, ProvenanceKind};
use crate::ports::ProvenanceSink;
use crate::sync::lock;

/// Keeps every event in arrival order. Intended for tests and demos.
#[derive(Debug, Default)]
pub struct RecordingProvenance {
    events: Mutex<Vec<ProvenanceEvent>>,
}

impl RecordingProvenance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProvenanceEvent> {
        lock(&self.events).clone()
    }

    pub fn count(&self, kind: ProvenanceKind) -> usize {
        lock(&self.events).iter().filter(|e| e.kind == kind).count()
    }
}

impl ProvenanceSink for RecordingProvenance {
    fn record(&self, event: ProvenanceEvent) {
        lock(&self.events).push(event);
    }
}

/// Emits each event as a `tracing` debug record on the `provenance` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProvenance;

impl ProvenanceSink for TracingProvenance {
    fn record(&self, event: ProvenanceEvent) {
        tracing::debug!(
            target: "provenance",
            kind = ?event.kind,
            process = %event.process_id,
            index = %event.index,
            workflow = %event.workflow_id,
            detail = event.detail.as_deref().unwrap_or(""),
            "provenance event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Index, ProcessId, RunId};

    #[test]
    fn counts_by_kind() {
        let sink = RecordingProvenance::new();
        let run = RunId::generate();
        let process = ProcessId::new("run:p");
        sink.record(ProvenanceEvent::new(ProvenanceKind::Retry, run, &process, &Index::root()));
        sink.record(ProvenanceEvent::new(ProvenanceKind::Retry, run, &process, &Index::new([1])));
        sink.record(ProvenanceEvent::new(ProvenanceKind::Result, run, &process, &Index::new([1])));

        assert_eq!(sink.count(ProvenanceKind::Retry), 2);
        assert_eq!(sink.count(ProvenanceKind::Failover), 0);
        assert_eq!(sink.events()[2].kind, ProvenanceKind::Result);
    }
}
