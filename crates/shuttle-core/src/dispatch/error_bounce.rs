//! ErrorBounce: turn failures into error values on the output ports.
//!
//! Two cases are handled unless the layer is configured fatal:
//! - a failure coming up is translated into one error document per output
//!   port and sent up as an ordinary result;
//! - a job whose inputs already contain errors is not invoked at all; the
//!   error is reflected onto every output port instead.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::config::parse_config;
use super::events::{Job, JobFailure, JobResult};
use super::layer::DispatchLayer;
use super::stack::Hop;
use crate::domain::{
    DataRef, ErrorDocument, ErrorKind, FailurePayload, Index, ProcessId, ProvenanceEvent,
    ProvenanceKind,
};
use crate::error::{ConfigError, ReferenceError};
use crate::monitor::{
    Counter, ERRORBOUNCE_TOTAL_REFLECTED, ERRORBOUNCE_TOTAL_TRANSLATED, MonitorableProperty,
};
use crate::ports::ReferenceService;

pub const KIND: &str = "errorbounce";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ErrorBounceConfig {
    /// Let failures through unchanged so they end the run.
    pub fatal: bool,
}

pub struct ErrorBounce {
    fatal: bool,
    translated: Arc<Counter>,
    reflected: Arc<Counter>,
}

impl ErrorBounce {
    pub fn new(config: ErrorBounceConfig) -> Self {
        Self {
            fatal: config.fatal,
            translated: Counter::new(ERRORBOUNCE_TOTAL_TRANSLATED),
            reflected: Counter::new(ERRORBOUNCE_TOTAL_REFLECTED),
        }
    }

    pub fn from_config(config: &Value) -> Result<Arc<dyn DispatchLayer>, ConfigError> {
        Ok(Arc::new(Self::new(parse_config(KIND, config)?)))
    }
}

/// Register `document` once per output port at that port's depth.
fn error_outputs(
    references: &dyn ReferenceService,
    hop: &Hop,
    owning_process: ProcessId,
    index: Index,
    document: &ErrorDocument,
) -> Result<JobResult, ReferenceError> {
    let mut data = BTreeMap::new();
    for port in &hop.processor().ports.outputs {
        let reference = references.register_error(document.clone(), port.depth)?;
        data.insert(port.name.clone(), reference);
    }
    Ok(JobResult {
        owning_process,
        index,
        data,
    })
}

impl DispatchLayer for ErrorBounce {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn dispatch(&self, job: Job, hop: &Hop) {
        if self.fatal || !job.contains_errors() {
            hop.down(job);
            return;
        }

        let erroneous: Vec<DataRef> = job
            .data
            .values()
            .filter(|r| r.contains_errors())
            .cloned()
            .collect();
        let document = ErrorDocument::reflected(&hop.processor().name, erroneous);
        let outcome = error_outputs(
            job.context.references().as_ref(),
            hop,
            job.owning_process.clone(),
            job.index.clone(),
            &document,
        );
        match outcome {
            Ok(result) => {
                self.reflected.incr();
                debug!(index = %job.index, "reflected erroneous input");
                hop.result_up(result);
            }
            Err(e) => {
                let payload = FailurePayload::new(ErrorKind::Permanent, format!("cannot reflect error: {e}"));
                hop.error_up(JobFailure::for_job(&job, payload));
            }
        }
    }

    fn receive_error(&self, failure: JobFailure, hop: &Hop) {
        if self.fatal {
            hop.error_up(failure);
            return;
        }
        let context = hop.context();
        let document = ErrorDocument::from_failure(&failure.error);
        match error_outputs(
            context.references().as_ref(),
            hop,
            failure.owning_process.clone(),
            failure.index.clone(),
            &document,
        ) {
            Ok(result) => {
                self.translated.incr();
                context.record(
                    ProvenanceEvent::new(
                        ProvenanceKind::ErrorTranslated,
                        context.run_id(),
                        &failure.owning_process,
                        &failure.index,
                    )
                    .with_detail(document.message.clone()),
                );
                debug!(index = %failure.index, error = %failure.error, "translated failure into error value");
                hop.result_up(result);
            }
            Err(e) => {
                debug!(error = %e, "cannot register error value");
                hop.error_up(failure);
            }
        }
    }

    fn properties(&self) -> Vec<Arc<dyn MonitorableProperty>> {
        vec![self.translated.clone(), self.reflected.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Invoke, Retry};
    use crate::test_support::{ExitEvent, FlakyActivity, Harness, failing, upper};
    use serde_json::json;

    fn bounce(config: Value) -> Arc<dyn DispatchLayer> {
        ErrorBounce::from_config(&config).unwrap()
    }

    #[tokio::test]
    async fn permanent_failure_becomes_one_error_value() {
        let harness = Harness::new(vec![bounce(Value::Null), Arc::new(Invoke::default())]);
        harness.enter(Index::new([4]), json!("x"), vec![failing("broken", ErrorKind::Permanent)]);

        assert_eq!(harness.wait_for(1).await, vec![ExitEvent::Result(Index::new([4]))]);
        let result = harness.results().remove(0);
        let out = &result.data["out"];
        assert!(out.is_error());
        let document = harness.references.error_document(out).unwrap();
        assert_eq!(document.stack[0], "broken: always fails");
        assert_eq!(harness.property(ERRORBOUNCE_TOTAL_TRANSLATED), Some(1));
        assert_eq!(harness.provenance.count(ProvenanceKind::ErrorTranslated), 1);
    }

    #[tokio::test]
    async fn only_exhausted_retries_are_translated() {
        let flaky = Arc::new(FlakyActivity::new("flaky", 1, ErrorKind::Transient));
        let harness = Harness::new(vec![
            bounce(Value::Null),
            Retry::from_config(&json!({"max_retries": 1, "initial_delay_ms": 5, "max_delay_ms": 5})).unwrap(),
            Arc::new(Invoke::default()),
        ]);
        harness.enter(Index::root(), json!("ok"), vec![flaky]);

        harness.wait_for(1).await;
        assert_eq!(harness.output_value(&Index::root()), Some(json!("ok")));
        assert_eq!(harness.property(ERRORBOUNCE_TOTAL_TRANSLATED), Some(0));
    }

    #[tokio::test]
    async fn fatal_lets_failure_through() {
        let harness = Harness::new(vec![bounce(json!({"fatal": true})), Arc::new(Invoke::default())]);
        harness.enter(Index::root(), json!("x"), vec![failing("broken", ErrorKind::Permanent)]);

        assert_eq!(harness.wait_for(1).await, vec![ExitEvent::Failure(Index::root())]);
        assert_eq!(harness.property(ERRORBOUNCE_TOTAL_TRANSLATED), Some(0));
    }

    #[tokio::test]
    async fn erroneous_input_is_reflected_without_invoking() {
        let harness = Harness::new(vec![bounce(Value::Null), Arc::new(Invoke::default())]);
        let bad = harness
            .references
            .register_error(
                ErrorDocument {
                    message: "upstream".into(),
                    stack: vec![],
                    erroneous_inputs: vec![],
                    partial_outputs: Default::default(),
                },
                0,
            )
            .unwrap();
        harness.enter_refs(Index::root(), vec![("in", bad.clone())], vec![upper()]);

        // Reflection is synchronous.
        assert_eq!(harness.events(), vec![ExitEvent::Result(Index::root())]);
        let out = harness.results().remove(0).data["out"].clone();
        let document = harness.references.error_document(&out).unwrap();
        assert_eq!(document.erroneous_inputs, vec![bad]);
        assert_eq!(harness.property(ERRORBOUNCE_TOTAL_REFLECTED), Some(1));
        assert_eq!(harness.property(crate::monitor::INVOKE_TOTAL_INVOCATIONS), Some(0));
    }
}
