//! The shared contract of every dispatch layer.

use std::sync::Arc;

use super::events::{Completion, Job, JobFailure, JobResult};
use super::stack::Hop;
use crate::monitor::MonitorableProperty;

/// One stage of a dispatch stack.
///
/// Jobs travel down through `dispatch`; results, failures and completions
/// travel back up through the `receive_*` callbacks. Every method gets the
/// layer's own [`Hop`], which is how it talks to its neighbours. The
/// default implementations pass everything through untouched, so a layer
/// only overrides the directions it cares about.
///
/// Methods are called from arbitrary worker threads and must not block.
/// Anything that waits goes through `hop.executor()`.
pub trait DispatchLayer: Send + Sync {
    /// Registry name of the layer kind, e.g. `"parallelize"`.
    fn kind(&self) -> &'static str;

    /// The single layer at the bottom of a stack that performs the call.
    fn is_terminal(&self) -> bool {
        false
    }

    fn dispatch(&self, job: Job, hop: &Hop) {
        hop.down(job);
    }

    fn receive_result(&self, result: JobResult, hop: &Hop) {
        hop.result_up(result);
    }

    fn receive_error(&self, failure: JobFailure, hop: &Hop) {
        hop.error_up(failure);
    }

    fn receive_completion(&self, completion: Completion, hop: &Hop) {
        hop.completion_up(completion);
    }

    fn properties(&self) -> Vec<Arc<dyn MonitorableProperty>> {
        Vec::new()
    }

    /// Called after the run is resumed or a property was steered. Layers
    /// that hold back work should try to make progress again.
    fn resume(&self, hop: &Hop) {
        let _ = hop;
    }

    /// Drop any work that has not started yet. Work already handed to the
    /// executor is left to finish.
    fn cancel(&self) {}
}
