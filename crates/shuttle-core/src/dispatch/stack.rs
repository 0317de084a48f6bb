//! Dispatch stack assembly and routing.
//!
//! A stack is an ordered list of layers, top first, ending in exactly one
//! terminal layer. Jobs enter at the top; whatever emerges from the top in
//! the upward direction goes to the processor's [`StackExit`].
//!
//! The stack also tracks which indices are in flight. A completion for a
//! prefix `P` handed in by the processor is held back until every job
//! entered under `P` has produced its result or failure, so the exit never
//! sees a completion ahead of the results it covers.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::warn;

use super::control::RunControl;
use crate::context::InvocationContext;
use super::events::{Completion, Job, JobFailure, JobResult};
use super::layer::DispatchLayer;
use crate::domain::{Index, PortSet, ProcessId};
use crate::error::ConfigError;
use crate::monitor::MonitorableProperty;
use crate::ports::TaskExecutor;
use crate::sync::lock;

/// Name and ports of the processor a stack serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorInfo {
    pub name: String,
    pub ports: PortSet,
}

/// Receiver of everything that leaves the top of a stack.
pub trait StackExit: Send + Sync {
    fn result(&self, result: JobResult);

    /// A failure no layer absorbed.
    fn failure(&self, failure: JobFailure);

    fn completion(&self, completion: Completion);

    /// The root index has settled; nothing more will come out.
    fn finished(&self);
}

/// Layers that passed assembly checks: non-empty, one terminal, terminal
/// last.
#[derive(Clone)]
pub struct StackLayers(Vec<Arc<dyn DispatchLayer>>);

impl StackLayers {
    pub fn new(layers: Vec<Arc<dyn DispatchLayer>>) -> Result<Self, ConfigError> {
        let Some(last) = layers.last() else {
            return Err(ConfigError::EmptyStack);
        };
        let terminals = layers.iter().filter(|l| l.is_terminal()).count();
        match terminals {
            0 => return Err(ConfigError::NoTerminalLayer),
            1 => {}
            n => return Err(ConfigError::MultipleTerminalLayers(n)),
        }
        if !last.is_terminal() {
            let terminal = layers
                .iter()
                .find(|l| l.is_terminal())
                .map(|l| l.kind())
                .unwrap_or_default();
            return Err(ConfigError::TerminalNotLast(terminal.to_string()));
        }
        Ok(Self(layers))
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.0.iter().map(|l| l.kind()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn DispatchLayer>> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for StackLayers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.kinds()).finish()
    }
}

/// What a stack needs from the run that owns it.
pub struct StackEnv {
    pub processor: ProcessorInfo,
    pub process_id: ProcessId,
    pub executor: Arc<dyn TaskExecutor>,
    pub control: Arc<RunControl>,
    /// Run-level context, for layers that act without a job in hand.
    pub context: InvocationContext,
    pub exit: Arc<dyn StackExit>,
}

#[derive(Debug, Default)]
struct EntryTracker {
    outstanding: BTreeSet<Index>,
    pending: BTreeSet<Index>,
    finished: bool,
}

impl EntryTracker {
    /// Any entered index equal to or below `prefix` still in flight.
    fn busy_under(&self, prefix: &Index) -> bool {
        // Descendants sort directly after their prefix.
        self.outstanding
            .range(prefix.clone()..)
            .next()
            .is_some_and(|index| prefix.is_prefix_of(index))
    }

    /// Mark `index` settled and return the held-back completions that are
    /// now clear, deepest first.
    fn settle(&mut self, index: &Index) -> Vec<Index> {
        if !self.outstanding.remove(index) {
            return Vec::new();
        }
        let mut ready: Vec<Index> = self
            .pending
            .iter()
            .filter(|prefix| !self.busy_under(prefix))
            .cloned()
            .collect();
        for prefix in &ready {
            self.pending.remove(prefix);
        }
        ready.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        ready
    }
}

struct StackShared {
    layers: Vec<Arc<dyn DispatchLayer>>,
    env: StackEnv,
    tracker: Mutex<EntryTracker>,
}

impl StackShared {
    fn exit_result(&self, result: JobResult) {
        let index = result.index.clone();
        self.env.exit.result(result);
        self.settle(&index);
    }

    fn exit_failure(&self, failure: JobFailure) {
        let index = failure.index.clone();
        self.env.exit.failure(failure);
        self.settle(&index);
    }

    fn exit_completion(&self, completion: Completion) {
        let index = completion.index.clone();
        self.env.exit.completion(completion);
        self.settle(&index);
    }

    fn settle(&self, index: &Index) {
        let ready = lock(&self.tracker).settle(index);
        for prefix in ready {
            self.release(prefix);
        }
    }

    fn release(&self, index: Index) {
        let root = index.is_root();
        if root {
            let mut tracker = lock(&self.tracker);
            if tracker.finished {
                return;
            }
            tracker.finished = true;
        }
        self.env.exit.completion(Completion {
            owning_process: self.env.process_id.clone(),
            index,
        });
        if root {
            self.env.exit.finished();
        }
    }
}

/// A layer's view of its position in the stack.
///
/// Cheap to clone and `'static`, so a layer can move it into a task and
/// report back from whichever worker finishes.
#[derive(Clone)]
pub struct Hop {
    shared: Arc<StackShared>,
    position: usize,
}

impl Hop {
    fn at(&self, position: usize) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            position,
        }
    }

    /// Hand `job` to the layer below.
    pub fn down(&self, job: Job) {
        let below = self.position + 1;
        match self.shared.layers.get(below) {
            Some(layer) => layer.dispatch(job, &self.at(below)),
            None => warn!(
                processor = %self.shared.env.processor.name,
                index = %job.index,
                "job sent below the terminal layer was dropped"
            ),
        }
    }

    pub fn result_up(&self, result: JobResult) {
        match self.position.checked_sub(1) {
            Some(above) => self.shared.layers[above].receive_result(result, &self.at(above)),
            None => self.shared.exit_result(result),
        }
    }

    pub fn error_up(&self, failure: JobFailure) {
        match self.position.checked_sub(1) {
            Some(above) => self.shared.layers[above].receive_error(failure, &self.at(above)),
            None => self.shared.exit_failure(failure),
        }
    }

    pub fn completion_up(&self, completion: Completion) {
        match self.position.checked_sub(1) {
            Some(above) => {
                self.shared.layers[above].receive_completion(completion, &self.at(above))
            }
            None => self.shared.exit_completion(completion),
        }
    }

    pub fn executor(&self) -> &Arc<dyn TaskExecutor> {
        &self.shared.env.executor
    }

    pub fn processor(&self) -> &ProcessorInfo {
        &self.shared.env.processor
    }

    pub fn process_id(&self) -> &ProcessId {
        &self.shared.env.process_id
    }

    pub fn control(&self) -> &RunControl {
        &self.shared.env.control
    }

    pub fn context(&self) -> &InvocationContext {
        &self.shared.env.context
    }

    pub fn position(&self) -> usize {
        self.position
    }
}

impl fmt::Debug for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hop")
            .field("processor", &self.shared.env.processor.name)
            .field("position", &self.position)
            .finish()
    }
}

/// One processor's dispatch stack for one run.
#[derive(Clone)]
pub struct DispatchStack {
    shared: Arc<StackShared>,
}

impl DispatchStack {
    pub fn new(layers: StackLayers, env: StackEnv) -> Self {
        Self {
            shared: Arc::new(StackShared {
                layers: layers.0,
                env,
                tracker: Mutex::new(EntryTracker::default()),
            }),
        }
    }

    fn hop(&self, position: usize) -> Hop {
        Hop {
            shared: Arc::clone(&self.shared),
            position,
        }
    }

    /// Route `job` into the top layer.
    pub fn enter(&self, job: Job) {
        lock(&self.shared.tracker).outstanding.insert(job.index.clone());
        self.shared.layers[0].dispatch(job, &self.hop(0));
    }

    /// No more jobs will enter under `index`. The exit receives the
    /// completion once everything already entered under it has settled.
    pub fn complete(&self, index: Index) {
        {
            let mut tracker = lock(&self.shared.tracker);
            if tracker.busy_under(&index) {
                tracker.pending.insert(index);
                return;
            }
        }
        self.shared.release(index);
    }

    pub fn resume(&self) {
        for (position, layer) in self.shared.layers.iter().enumerate() {
            layer.resume(&self.hop(position));
        }
    }

    pub fn cancel(&self) {
        for layer in &self.shared.layers {
            layer.cancel();
        }
    }

    pub fn properties(&self) -> Vec<Arc<dyn MonitorableProperty>> {
        self.shared
            .layers
            .iter()
            .flat_map(|layer| layer.properties())
            .collect()
    }

    /// Entered indices that have not settled yet.
    pub fn outstanding(&self) -> usize {
        lock(&self.shared.tracker).outstanding.len()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.shared.layers.iter().map(|l| l.kind()).collect()
    }

    pub fn processor(&self) -> &ProcessorInfo {
        &self.shared.env.processor
    }
}

impl fmt::Debug for DispatchStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchStack")
            .field("processor", &self.shared.env.processor.name)
            .field("layers", &self.kinds())
            .finish()
    }
}
