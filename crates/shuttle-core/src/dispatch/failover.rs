//! Failover: walk the processor's alternative activities in declared order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::config::parse_config;
use super::events::{Job, JobFailure, JobResult};
use super::layer::DispatchLayer;
use super::stack::Hop;
use crate::domain::{FailurePayload, Index, ProvenanceEvent, ProvenanceKind};
use crate::error::ConfigError;
use crate::monitor::{Counter, FAILOVER_TOTAL_FAILOVERS, MonitorableProperty};
use crate::sync::lock;

pub const KIND: &str = "failover";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FailoverConfig {
    /// Fold the failures of earlier alternatives into the final failure's
    /// cause chain.
    pub aggregate_errors: bool,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            aggregate_errors: true,
        }
    }
}

struct InFlight {
    job: Job,
    next: usize,
    failures: Vec<FailurePayload>,
}

pub struct Failover {
    config: FailoverConfig,
    in_flight: Mutex<HashMap<Index, InFlight>>,
    total_failovers: Arc<Counter>,
}

impl Failover {
    pub fn new(config: FailoverConfig) -> Self {
        Self {
            config,
            in_flight: Mutex::new(HashMap::new()),
            total_failovers: Counter::new(FAILOVER_TOTAL_FAILOVERS),
        }
    }

    pub fn from_config(config: &Value) -> Result<Arc<dyn DispatchLayer>, ConfigError> {
        Ok(Arc::new(Self::new(parse_config(KIND, config)?)))
    }

    fn exhausted(&self, mut failures: Vec<FailurePayload>) -> Option<FailurePayload> {
        let mut last = failures.pop()?;
        if self.config.aggregate_errors && !failures.is_empty() {
            last.message = format!("all {} alternatives failed; last: {}", failures.len() + 1, last.message);
            last.causes
                .extend(failures.iter().map(|earlier| earlier.to_string()));
        }
        Some(last)
    }
}

impl DispatchLayer for Failover {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn dispatch(&self, job: Job, hop: &Hop) {
        let Some(first) = job.activities.first().cloned() else {
            hop.down(job);
            return;
        };
        let attempt = job.with_activity(first);
        lock(&self.in_flight).insert(
            job.index.clone(),
            InFlight {
                job,
                next: 1,
                failures: Vec::new(),
            },
        );
        hop.down(attempt);
    }

    fn receive_result(&self, result: JobResult, hop: &Hop) {
        lock(&self.in_flight).remove(&result.index);
        hop.result_up(result);
    }

    fn receive_error(&self, failure: JobFailure, hop: &Hop) {
        let next_attempt = {
            let mut in_flight = lock(&self.in_flight);
            let Some(entry) = in_flight.get_mut(&failure.index) else {
                drop(in_flight);
                hop.error_up(failure);
                return;
            };
            entry.failures.push(failure.error.clone());
            let alternative = entry.job.activities.get(entry.next).cloned();
            match alternative {
                Some(alternative) if !hop.control().is_cancelled() => {
                    entry.next += 1;
                    Some(entry.job.with_activity(alternative))
                }
                _ => {
                    let failures = in_flight
                        .remove(&failure.index)
                        .map(|entry| entry.failures)
                        .unwrap_or_default();
                    drop(in_flight);
                    let error = self.exhausted(failures).unwrap_or(failure.error);
                    hop.error_up(JobFailure { error, ..failure });
                    return;
                }
            }
        };

        if let Some(job) = next_attempt {
            let name = job.activities.first().map(|a| a.name().to_string()).unwrap_or_default();
            self.total_failovers.incr();
            job.context.record(
                ProvenanceEvent::new(
                    ProvenanceKind::Failover,
                    job.context.run_id(),
                    &job.owning_process,
                    &job.index,
                )
                .with_detail(name.clone()),
            );
            debug!(index = %job.index, alternative = %name, "failing over");
            hop.down(job);
        }
    }

    fn properties(&self) -> Vec<Arc<dyn MonitorableProperty>> {
        vec![self.total_failovers.clone()]
    }

    fn cancel(&self) {
        lock(&self.in_flight).clear();
    }
}
