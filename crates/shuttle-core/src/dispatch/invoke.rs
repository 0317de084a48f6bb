//! Invoke: the terminal layer that actually calls the activity.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::config::parse_config;
use super::events::{Job, JobFailure, JobResult};
use super::layer::DispatchLayer;
use super::stack::Hop;
use crate::domain::{ActivityError, ErrorKind, FailurePayload, ProvenanceEvent, ProvenanceKind};
use crate::error::ConfigError;
use crate::monitor::{Counter, INVOKE_RUNNING, INVOKE_TOTAL_INVOCATIONS, MonitorableProperty};
use crate::ports::ActivityInputs;

pub const KIND: &str = "invoke";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InvokeConfig {
    /// Per-call limit. A call that runs longer fails as transient.
    pub timeout_ms: Option<u64>,
}

/// Resolves the job's inputs, runs the first bound activity on the shared
/// executor and reports exactly one result or one failure. Never reports
/// synchronously from `dispatch`.
#[derive(Debug)]
pub struct Invoke {
    timeout: Option<Duration>,
    running: Arc<Counter>,
    total: Arc<Counter>,
}

impl Invoke {
    pub fn new(config: InvokeConfig) -> Result<Self, ConfigError> {
        if config.timeout_ms == Some(0) {
            return Err(ConfigError::InvalidLayerValue {
                layer: KIND.to_string(),
                reason: "timeout_ms must be greater than zero".to_string(),
            });
        }
        Ok(Self {
            timeout: config.timeout_ms.map(Duration::from_millis),
            running: Counter::new(INVOKE_RUNNING),
            total: Counter::new(INVOKE_TOTAL_INVOCATIONS),
        })
    }

    pub fn from_config(config: &Value) -> Result<Arc<dyn DispatchLayer>, ConfigError> {
        Ok(Arc::new(Self::new(parse_config(KIND, config)?)?))
    }
}

impl Default for Invoke {
    fn default() -> Self {
        Self {
            timeout: None,
            running: Counter::new(INVOKE_RUNNING),
            total: Counter::new(INVOKE_TOTAL_INVOCATIONS),
        }
    }
}

fn permanent(job: &Job, message: String) -> JobFailure {
    JobFailure::for_job(job, FailurePayload::new(ErrorKind::Permanent, message))
}

async fn invoke_job(
    job: Job,
    hop: Hop,
    timeout: Option<Duration>,
    running: Arc<Counter>,
    total: Arc<Counter>,
) {
    let Some(activity) = job.activities.first().cloned() else {
        let failure = permanent(&job, format!("processor '{}' has no activity bound", hop.processor().name));
        hop.error_up(failure);
        return;
    };
    let context = job.context.clone();

    let mut inputs = ActivityInputs::new();
    for (port, reference) in &job.data {
        match context.references().resolve(reference) {
            Ok(value) => {
                inputs.insert(port.clone(), value);
            }
            Err(e) => {
                hop.error_up(permanent(&job, format!("input '{port}': {e}")));
                return;
            }
        }
    }

    running.incr();
    total.incr();
    context.record(
        ProvenanceEvent::new(
            ProvenanceKind::Invocation,
            context.run_id(),
            &job.owning_process,
            &job.index,
        )
        .with_detail(activity.name()),
    );
    debug!(activity = activity.name(), index = %job.index, "invoking activity");

    let call = AssertUnwindSafe(activity.invoke(inputs, &context))
        .catch_unwind()
        .map(|caught| caught.unwrap_or_else(|panic| Err(panicked(&*panic))));
    let outcome = match timeout {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .unwrap_or_else(|_| {
                Err(ActivityError::transient(format!(
                    "timed out after {}ms",
                    limit.as_millis()
                )))
            }),
        None => call.await,
    };
    running.decr();

    let references = context.references();
    match outcome {
        Ok(mut outputs) => {
            let mut data = BTreeMap::new();
            for port in &hop.processor().ports.outputs {
                let Some(value) = outputs.remove(&port.name) else {
                    let message = format!(
                        "activity '{}' produced no value for output '{}'",
                        activity.name(),
                        port.name
                    );
                    hop.error_up(permanent(&job, message));
                    return;
                };
                match references.register(value, port.depth) {
                    Ok(reference) => {
                        data.insert(port.name.clone(), reference);
                    }
                    Err(e) => {
                        hop.error_up(permanent(&job, format!("output '{}': {e}", port.name)));
                        return;
                    }
                }
            }
            context.record(
                ProvenanceEvent::new(
                    ProvenanceKind::Result,
                    context.run_id(),
                    &job.owning_process,
                    &job.index,
                )
                .with_detail(activity.name()),
            );
            hop.result_up(JobResult {
                owning_process: job.owning_process,
                index: job.index,
                data,
            });
        }
        Err(error) => {
            let mut payload = FailurePayload::from_activity(activity.name(), &error);
            for (port, value) in error.partial_outputs {
                let depth = hop.processor().ports.output(&port).map_or(0, |p| p.depth);
                match references.register(value, depth) {
                    Ok(reference) => {
                        payload.partial_outputs.insert(port, reference);
                    }
                    Err(e) => warn!(port = %port, error = %e, "dropping partial output"),
                }
            }
            context.record(
                ProvenanceEvent::new(
                    ProvenanceKind::Error,
                    context.run_id(),
                    &job.owning_process,
                    &job.index,
                )
                .with_detail(payload.to_string()),
            );
            debug!(activity = activity.name(), index = %job.index, error = %payload, "activity failed");
            hop.error_up(JobFailure::for_job(&job, payload));
        }
    }
}

/// A panic inside an activity is a permanent failure of that call.
fn panicked(panic: &(dyn Any + Send)) -> ActivityError {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    ActivityError::permanent(format!("activity panicked: {detail}"))
}

impl DispatchLayer for Invoke {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn is_terminal(&self) -> bool {
        true
    }

    fn dispatch(&self, job: Job, hop: &Hop) {
        let task = invoke_job(
            job,
            hop.clone(),
            self.timeout,
            Arc::clone(&self.running),
            Arc::clone(&self.total),
        );
        hop.executor().submit(task.boxed());
    }

    fn properties(&self) -> Vec<Arc<dyn MonitorableProperty>> {
        vec![self.running.clone(), self.total.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Index, ProvenanceKind};
    use crate::test_support::{
        ExitEvent, Harness, SlowActivity, failing, upper,
    };
    use serde_json::json;

    #[test]
    fn zero_timeout_is_rejected() {
        let err = Invoke::new(InvokeConfig { timeout_ms: Some(0) }).unwrap_err();
        assert!(err.to_string().contains("timeout_ms"));
    }

    #[tokio::test]
    async fn success_registers_declared_outputs() {
        let harness = Harness::new(vec![Invoke::from_config(&Value::Null).unwrap()]);
        harness.enter(Index::new([2]), json!("abc"), vec![upper()]);

        let events = harness.wait_for(1).await;
        assert_eq!(events, vec![ExitEvent::Result(Index::new([2]))]);
        assert_eq!(harness.output_value(&Index::new([2])), Some(json!("ABC")));
        assert_eq!(harness.provenance.count(ProvenanceKind::Invocation), 1);
        assert_eq!(harness.provenance.count(ProvenanceKind::Result), 1);
        assert_eq!(harness.property(INVOKE_TOTAL_INVOCATIONS), Some(1));
        assert_eq!(harness.property(INVOKE_RUNNING), Some(0));
    }

    #[tokio::test]
    async fn failure_is_reported_upward_not_raised() {
        let harness = Harness::new(vec![Invoke::from_config(&Value::Null).unwrap()]);
        harness.enter(Index::root(), json!("x"), vec![failing("broken", ErrorKind::Permanent)]);

        let events = harness.wait_for(1).await;
        assert_eq!(events, vec![ExitEvent::Failure(Index::root())]);
        let failure = harness.failures().remove(0);
        assert_eq!(failure.activity.as_deref(), Some("broken"));
        assert!(!failure.is_transient());
        assert_eq!(harness.provenance.count(ProvenanceKind::Error), 1);
    }

    #[tokio::test]
    async fn timeout_fails_transiently() {
        let harness = Harness::new(vec![
            Invoke::from_config(&json!({"timeout_ms": 20})).unwrap(),
        ]);
        let slow = Arc::new(SlowActivity::new(Duration::from_millis(500)));
        harness.enter(Index::root(), json!("x"), vec![slow]);

        harness.wait_for(1).await;
        let failure = harness.failures().remove(0);
        assert!(failure.is_transient());
        assert!(failure.message.contains("timed out"));
    }

    #[tokio::test]
    async fn missing_output_is_permanent_failure() {
        let harness = Harness::new(vec![Invoke::from_config(&Value::Null).unwrap()]);
        let silent = Arc::new(crate::ports::FnActivity::new("silent", |_| Ok(BTreeMap::new())));
        harness.enter(Index::root(), json!("x"), vec![silent]);

        harness.wait_for(1).await;
        let failure = harness.failures().remove(0);
        assert!(failure.message.contains("no value for output 'out'"));
        assert!(!failure.is_transient());
    }

    #[tokio::test]
    async fn panicking_activity_fails_permanently() {
        let harness = Harness::new(vec![Invoke::from_config(&Value::Null).unwrap()]);
        let explosive = Arc::new(crate::ports::FnActivity::new(
            "explosive",
            |_: ActivityInputs| -> Result<crate::ports::ActivityOutputs, ActivityError> {
                panic!("boom")
            },
        ));
        harness.enter(Index::new([0]), json!("x"), vec![explosive]);
        harness.enter(Index::new([1]), json!("y"), vec![upper()]);

        let mut events = harness.wait_for(2).await;
        events.sort_by_key(|e| format!("{e:?}"));
        assert_eq!(
            events,
            vec![ExitEvent::Failure(Index::new([0])), ExitEvent::Result(Index::new([1]))]
        );
        let failure = harness.failures().remove(0);
        assert!(!failure.is_transient());
        assert_eq!(failure.activity.as_deref(), Some("explosive"));
        assert!(failure.message.contains("panicked: boom"), "{}", failure.message);
        assert_eq!(harness.property(INVOKE_RUNNING), Some(0));
    }
}
