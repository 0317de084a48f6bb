//! Messages that travel through a dispatch stack.
//!
//! Downward: `Job`. Upward: `JobResult`, `JobFailure`, `Completion`. All of
//! them are keyed by the owning process and an `Index`; nothing else is
//! needed to route or reassemble them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::context::InvocationContext;
use crate::domain::{DataRef, FailurePayload, Index, ProcessId};
use crate::ports::Activity;

/// One token per input port, all at one index, plus the activities that
/// may serve it (in failover order).
#[derive(Clone)]
pub struct Job {
    pub owning_process: ProcessId,
    pub index: Index,
    pub data: BTreeMap<String, DataRef>,
    pub activities: Vec<Arc<dyn Activity>>,
    pub context: InvocationContext,
}

impl Job {
    /// Same job, different position. Used when fanning out.
    pub fn at(&self, index: Index, data: BTreeMap<String, DataRef>) -> Self {
        Self {
            owning_process: self.owning_process.clone(),
            index,
            data,
            activities: self.activities.clone(),
            context: self.context.clone(),
        }
    }

    /// Same job bound to a single activity.
    pub fn with_activity(&self, activity: Arc<dyn Activity>) -> Self {
        Self {
            activities: vec![activity],
            ..self.clone()
        }
    }

    pub fn contains_errors(&self) -> bool {
        self.data.values().any(DataRef::contains_errors)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let activities: Vec<&str> = self.activities.iter().map(|a| a.name()).collect();
        f.debug_struct("Job")
            .field("owning_process", &self.owning_process)
            .field("index", &self.index)
            .field("data", &self.data)
            .field("activities", &activities)
            .finish()
    }
}

/// Outputs for one index, keyed by output port.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub owning_process: ProcessId,
    pub index: Index,
    pub data: BTreeMap<String, DataRef>,
}

/// A job at `index` did not produce outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFailure {
    pub owning_process: ProcessId,
    pub index: Index,
    pub error: FailurePayload,
}

impl JobFailure {
    pub fn for_job(job: &Job, error: FailurePayload) -> Self {
        Self {
            owning_process: job.owning_process.clone(),
            index: job.index.clone(),
            error,
        }
    }
}

/// No more results will appear under `index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub owning_process: ProcessId,
    pub index: Index,
}
