//! WorkflowInstance: one run of a workflow.
//!
//! The facade owns every per-run piece: a dispatch stack per processor,
//! the input ledger, the listener lists and the run state. Nothing here is
//! shared with another run except the collaborators passed in through
//! [`RunEnvironment`].
//!
//! Listener callbacks arrive on whatever worker produced the token. A
//! callback may add or remove listeners, or cancel the run, but must not
//! push data into the run it is listening to.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{error, info};

use super::builder::{Sink, Source, Workflow};
use super::listener::{FailureListener, ListenerSet, ResultListener};
use super::ordering::InputLedger;
use super::processor::{NodeParts, OutputCollector, ProcessorNode};
use super::report::{ProcessorStats, ReportRow, RunReport};
use crate::context::InvocationContext;
use crate::dispatch::{DispatchStack, ProcessorInfo, RunControl, StackEnv};
use crate::domain::{
    FailurePayload, Index, ListenerId, ProcessId, ProcessorStatus, RunId, RunState, Token,
};
use crate::error::{ConfigError, MonitorError, RunStateError, ShuttleError, TokenOrderViolation};
use crate::monitor::{
    PARALLELIZE_COMPLETED_JOBS, PARALLELIZE_FAILED_JOBS, PARALLELIZE_QUEUE_SIZE,
    PARALLELIZE_SENT_JOBS, PropertySnapshot,
};
use crate::ports::{Clock, ProvenanceSink, ReferenceService, SystemClock, TaskExecutor};
use crate::sync::{lock, read, write};

thread_local! {
    static IN_DELIVERY: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as inside a listener callback.
struct DeliveryScope {
    outer: bool,
}

impl DeliveryScope {
    fn enter() -> Self {
        Self {
            outer: IN_DELIVERY.with(|flag| flag.replace(true)),
        }
    }

    fn active() -> bool {
        IN_DELIVERY.with(Cell::get)
    }
}

impl Drop for DeliveryScope {
    fn drop(&mut self) {
        IN_DELIVERY.with(|flag| flag.set(self.outer));
    }
}

/// Collaborators a run uses. The executor and reference service may be
/// shared by any number of runs.
#[derive(Clone)]
pub struct RunEnvironment {
    pub references: Arc<dyn ReferenceService>,
    pub executor: Arc<dyn TaskExecutor>,
    pub provenance: Option<Arc<dyn ProvenanceSink>>,
    pub clock: Arc<dyn Clock>,
}

impl RunEnvironment {
    pub fn new(references: Arc<dyn ReferenceService>, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            references,
            executor,
            provenance: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_provenance(mut self, provenance: Arc<dyn ProvenanceSink>) -> Self {
        self.provenance = Some(provenance);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[derive(Debug, Clone)]
enum Target {
    Processor { slot: usize, port: String },
    Output(String),
}

#[derive(Debug, Default)]
struct Routes {
    from_inputs: HashMap<String, Vec<Target>>,
    /// Indexed by processor slot, then output port.
    from_outputs: Vec<HashMap<String, Vec<Target>>>,
}

impl Routes {
    fn new(workflow: &Workflow) -> Self {
        let slots: HashMap<&str, usize> = workflow
            .processors()
            .iter()
            .enumerate()
            .map(|(slot, plan)| (plan.def.name.as_str(), slot))
            .collect();
        let mut routes = Routes {
            from_inputs: HashMap::new(),
            from_outputs: vec![HashMap::new(); slots.len()],
        };
        for link in workflow.links() {
            let target = match &link.to {
                Sink::ProcessorInput { processor, port } => {
                    let Some(&slot) = slots.get(processor.as_str()) else {
                        continue;
                    };
                    Target::Processor {
                        slot,
                        port: port.clone(),
                    }
                }
                Sink::WorkflowOutput(port) => Target::Output(port.clone()),
            };
            match &link.from {
                Source::WorkflowInput(port) => {
                    routes.from_inputs.entry(port.clone()).or_default().push(target)
                }
                Source::ProcessorOutput { processor, port } => {
                    if let Some(outputs) = slots
                        .get(processor.as_str())
                        .and_then(|&slot| routes.from_outputs.get_mut(slot))
                    {
                        outputs.entry(port.clone()).or_default().push(target);
                    }
                }
            }
        }
        routes
    }
}

#[derive(Debug, Clone, Default)]
struct RunTimes {
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

/// `a` is closer to the final result than `b`: shallower, or a completion
/// at the same depth.
fn outranks(a: &Token, b: &Token) -> bool {
    (a.index().len(), !a.is_completion()) < (b.index().len(), !b.is_completion())
}

pub(crate) struct RunShared {
    workflow: Arc<Workflow>,
    run_id: RunId,
    process_id: ProcessId,
    nodes: Vec<ProcessorNode>,
    routes: Routes,
    control: Arc<RunControl>,
    state: watch::Sender<RunState>,
    ledger: Mutex<InputLedger>,
    /// Workflow inputs not yet closed plus processors not yet finished.
    remaining: AtomicUsize,
    result_listeners: ListenerSet<dyn ResultListener>,
    failure_listeners: ListenerSet<dyn FailureListener>,
    /// Highest-level token seen per workflow output.
    replay: Mutex<BTreeMap<String, Token>>,
    /// Held shared while notifying; `cancel` takes it exclusively to wait
    /// out notifications already under way.
    delivery: RwLock<()>,
    times: Mutex<RunTimes>,
    clock: Arc<dyn Clock>,
    references: Arc<dyn ReferenceService>,
}

impl RunShared {
    fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Apply `step` to the current state atomically. Listeners are not
    /// notified here.
    fn transition(
        &self,
        step: impl FnOnce(RunState) -> Result<RunState, RunStateError>,
    ) -> Result<RunState, RunStateError> {
        let mut outcome = None;
        self.state.send_if_modified(|state| match step(*state) {
            Ok(next) => {
                *state = next;
                outcome = Some(Ok(next));
                true
            }
            Err(e) => {
                outcome = Some(Err(e));
                false
            }
        });
        outcome.unwrap_or_else(|| Err(RunStateError::Terminated(self.state())))
    }

    fn start(&self) {
        lock(&self.times).started_at = Some(self.clock.now());
        info!(run = %self.run_id, workflow = self.workflow.name(), "run started");
        self.notify_state(RunState::Running);
        for node in self.nodes.iter().filter(|node| !node.has_inputs()) {
            node.fire();
        }
        if self.remaining.load(Ordering::SeqCst) == 0 {
            self.complete();
        }
    }

    fn route(&self, targets: Option<&Vec<Target>>, token: &Token) {
        for target in targets.into_iter().flatten() {
            match target {
                Target::Processor { slot, port } => {
                    if let Some(node) = self.nodes.get(*slot) {
                        node.accept(port, token);
                    }
                }
                Target::Output(port) => self.deliver(port, token),
            }
        }
    }

    pub(crate) fn route_output(&self, slot: usize, port: &str, token: Token) {
        let targets = self.routes.from_outputs.get(slot).and_then(|outputs| outputs.get(port));
        self.route(targets, &token);
    }

    fn deliver(&self, port: &str, token: &Token) {
        let _guard = (!DeliveryScope::active()).then(|| read(&self.delivery));
        let _scope = DeliveryScope::enter();
        if matches!(self.state(), RunState::Cancelled | RunState::Failed) {
            return;
        }
        let listeners = {
            let mut replay = lock(&self.replay);
            if replay.get(port).is_none_or(|held| outranks(token, held)) {
                replay.insert(port.to_string(), token.clone());
            }
            self.result_listeners.snapshot()
        };
        for listener in listeners {
            listener.result_token(port, token);
        }
    }

    fn notify_state(&self, state: RunState) {
        let _scope = DeliveryScope::enter();
        for listener in self.result_listeners.snapshot() {
            listener.run_state_changed(state);
        }
    }

    fn mark_finished(&self) {
        lock(&self.times).finished_at = Some(self.clock.now());
    }

    /// One workflow input closed or one processor finished.
    fn settle_one(&self) {
        let previous = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.complete();
        }
    }

    fn complete(&self) {
        let done = self.transition(|state| match state {
            RunState::Running | RunState::Paused => Ok(RunState::Completed),
            other => Err(RunStateError::Terminated(other)),
        });
        if done.is_ok() {
            self.mark_finished();
            info!(run = %self.run_id, "run completed");
            self.notify_state(RunState::Completed);
        }
    }

    pub(crate) fn processor_finished(&self, slot: usize) {
        if let Some(node) = self.nodes.get(slot) {
            node.settle_status(ProcessorStatus::Completed);
            info!(run = %self.run_id, processor = %node.name, "processor finished");
        }
        self.settle_one();
    }

    /// Stop every stack. Queued work is dropped; running activities finish
    /// but their results go nowhere.
    fn halt(&self, failed: Option<&str>) {
        self.control.cancel();
        self.mark_finished();
        for node in &self.nodes {
            node.stack.cancel();
            let status = match failed {
                Some(name) if name == node.name => ProcessorStatus::Failed,
                _ => ProcessorStatus::Cancelled,
            };
            node.settle_status(status);
        }
    }

    /// A failure no layer absorbed ends the run.
    pub(crate) fn fail(&self, processor: &str, failure: &FailurePayload) {
        let failed = self.transition(|state| {
            if state.is_terminal() {
                Err(RunStateError::Terminated(state))
            } else {
                Ok(RunState::Failed)
            }
        });
        if failed.is_err() {
            return;
        }
        self.halt(Some(processor));
        error!(run = %self.run_id, processor, error = %failure, "run failed");
        {
            let _scope = DeliveryScope::enter();
            for listener in self.failure_listeners.snapshot() {
                listener.run_failed(processor, failure);
            }
        }
        self.notify_state(RunState::Failed);
    }
}

/// Handle to one run. Cheap to clone; clones drive the same run.
#[derive(Clone)]
pub struct WorkflowInstance {
    shared: Arc<RunShared>,
}

impl WorkflowInstance {
    pub fn new(workflow: Arc<Workflow>, env: RunEnvironment) -> Result<Self, ConfigError> {
        let layers = workflow
            .processors()
            .iter()
            .map(|plan| plan.template.instantiate())
            .collect::<Result<Vec<_>, _>>()?;

        let run_id = RunId::generate();
        let process_id = ProcessId::new(run_id.to_string());
        let context = InvocationContext::new(run_id, Arc::clone(&env.references), env.provenance.clone());
        let control = Arc::new(RunControl::new());
        let routes = Routes::new(&workflow);
        let (state, _) = watch::channel(RunState::NotStarted);

        let shared = Arc::new_cyclic(|run: &Weak<RunShared>| {
            let nodes = workflow
                .processors()
                .iter()
                .zip(layers)
                .enumerate()
                .map(|(slot, (plan, layers))| {
                    let def = &plan.def;
                    let node_id = process_id.child(&def.name);
                    let stats = Arc::new(Mutex::new(ProcessorStats::default()));
                    let exit = Arc::new(OutputCollector::new(
                        run.clone(),
                        slot,
                        def.name.clone(),
                        node_id.clone(),
                        def.ports.outputs.clone(),
                        Arc::clone(&env.references),
                        Arc::clone(&stats),
                    ));
                    let stack = DispatchStack::new(
                        layers,
                        StackEnv {
                            processor: ProcessorInfo {
                                name: def.name.clone(),
                                ports: def.ports.clone(),
                            },
                            process_id: node_id.clone(),
                            executor: Arc::clone(&env.executor),
                            control: Arc::clone(&control),
                            context: context.clone(),
                            exit,
                        },
                    );
                    ProcessorNode::new(NodeParts {
                        name: def.name.clone(),
                        process_id: node_id,
                        inputs: def.ports.inputs.clone(),
                        activities: def.activities.clone(),
                        stack,
                        stats,
                        control: Arc::clone(&control),
                        context: context.clone(),
                        clock: Arc::clone(&env.clock),
                    })
                })
                .collect::<Vec<_>>();

            RunShared {
                remaining: AtomicUsize::new(workflow.inputs().len() + nodes.len()),
                ledger: Mutex::new(InputLedger::new(workflow.inputs())),
                workflow: Arc::clone(&workflow),
                run_id,
                process_id,
                nodes,
                routes,
                control,
                state,
                result_listeners: ListenerSet::new(),
                failure_listeners: ListenerSet::new(),
                replay: Mutex::new(BTreeMap::new()),
                delivery: RwLock::new(()),
                times: Mutex::new(RunTimes::default()),
                clock: Arc::clone(&env.clock),
                references: Arc::clone(&env.references),
            }
        });
        Ok(Self { shared })
    }

    pub fn run_id(&self) -> RunId {
        self.shared.run_id
    }

    pub fn workflow(&self) -> &Workflow {
        &self.shared.workflow
    }

    pub fn state(&self) -> RunState {
        self.shared.state()
    }

    /// Start the run. Processors without inputs are invoked once.
    pub fn fire(&self) -> Result<(), RunStateError> {
        self.shared.transition(|state| match state {
            RunState::NotStarted => Ok(RunState::Running),
            _ => Err(RunStateError::AlreadyStarted),
        })?;
        self.shared.start();
        Ok(())
    }

    /// Push one token into workflow input `port`. The first push starts the
    /// run. A token that breaks the port's index order is rejected with
    /// [`TokenOrderViolation`]; the run carries on.
    pub fn push_data(&self, port: &str, token: Token) -> Result<(), ShuttleError> {
        let shared = &self.shared;
        let state = shared.state();
        if state.is_terminal() {
            return Err(RunStateError::Terminated(state).into());
        }

        let mut ledger = lock(&shared.ledger);
        let closes_root = ledger.admit(port, &token)?;
        let started = shared.transition(|state| match state {
            RunState::NotStarted => Ok(RunState::Running),
            _ => Err(RunStateError::AlreadyStarted),
        });
        if started.is_ok() {
            shared.start();
        }
        let token = token.with_owner(shared.process_id.clone());
        shared.route(shared.routes.from_inputs.get(port), &token);
        drop(ledger);

        if closes_root {
            shared.settle_one();
        }
        Ok(())
    }

    /// Register `value` at the port's depth and push it as the whole input.
    pub fn push_value(&self, port: &str, value: Value) -> Result<(), ShuttleError> {
        let depth = self
            .shared
            .workflow
            .input(port)
            .map(|p| p.depth)
            .ok_or_else(|| TokenOrderViolation::UnknownPort(port.to_string()))?;
        let data = self.shared.references.register(value, depth)?;
        let token = Token::new(self.shared.process_id.clone(), Index::root(), data);
        self.push_data(port, token)
    }

    /// Register a listener for workflow output tokens. It is handed the
    /// highest-level token seen so far on each output before anything new.
    pub fn add_result_listener(&self, listener: Arc<dyn ResultListener>) -> ListenerId {
        let shared = &self.shared;
        let (id, replay) = {
            let replay = lock(&shared.replay);
            (shared.result_listeners.add(Arc::clone(&listener)), replay.clone())
        };
        let _guard = (!DeliveryScope::active()).then(|| read(&shared.delivery));
        let _scope = DeliveryScope::enter();
        if !matches!(shared.state(), RunState::Cancelled | RunState::Failed) {
            for (port, token) in &replay {
                listener.result_token(port, token);
            }
        }
        id
    }

    pub fn remove_result_listener(&self, id: ListenerId) -> bool {
        self.shared.result_listeners.remove(id)
    }

    pub fn add_failure_listener(&self, listener: Arc<dyn FailureListener>) -> ListenerId {
        self.shared.failure_listeners.add(listener)
    }

    pub fn remove_failure_listener(&self, id: ListenerId) -> bool {
        self.shared.failure_listeners.remove(id)
    }

    /// Stop admitting new work. Jobs already sent keep running.
    pub fn pause(&self) -> Result<(), RunStateError> {
        self.shared.transition(|state| match state {
            RunState::Running => Ok(RunState::Paused),
            other => Err(RunStateError::NotRunning(other)),
        })?;
        self.shared.control.pause();
        info!(run = %self.shared.run_id, "run paused");
        self.shared.notify_state(RunState::Paused);
        Ok(())
    }

    pub fn resume(&self) -> Result<(), RunStateError> {
        self.shared.transition(|state| match state {
            RunState::Paused => Ok(RunState::Running),
            _ => Err(RunStateError::NotPaused),
        })?;
        self.shared.control.resume();
        info!(run = %self.shared.run_id, "run resumed");
        self.shared.notify_state(RunState::Running);
        for node in &self.shared.nodes {
            node.stack.resume();
        }
        Ok(())
    }

    /// Cancel the run from any state. Once this returns no listener hears
    /// anything further except the `Cancelled` state change. A no-op on a
    /// run that already ended.
    ///
    /// Blocks until listener callbacks already under way on other threads
    /// have returned, so a listener that blocks also blocks `cancel`.
    /// Called from inside a callback it does not wait.
    pub fn cancel(&self) {
        let shared = &self.shared;
        let cancelled = shared.transition(|state| {
            if state.is_terminal() {
                Err(RunStateError::Terminated(state))
            } else {
                Ok(RunState::Cancelled)
            }
        });
        if cancelled.is_err() {
            return;
        }
        shared.halt(None);
        info!(run = %shared.run_id, "run cancelled");
        if !DeliveryScope::active() {
            drop(write(&shared.delivery));
        }
        shared.notify_state(RunState::Cancelled);
    }

    /// Every monitored property of every processor.
    pub fn monitor(&self) -> Vec<PropertySnapshot> {
        self.shared
            .nodes
            .iter()
            .flat_map(|node| {
                node.stack
                    .properties()
                    .into_iter()
                    .map(|property| PropertySnapshot::read(&node.name, property.as_ref()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Write a steerable property, then let the stack act on it.
    pub fn steer(&self, processor: &str, property: &str, value: u64) -> Result<(), MonitorError> {
        let unknown = || MonitorError::UnknownProperty {
            processor: processor.to_string(),
            property: property.to_string(),
        };
        let node = self
            .shared
            .nodes
            .iter()
            .find(|node| node.name == processor)
            .ok_or_else(unknown)?;
        let target = node
            .stack
            .properties()
            .into_iter()
            .find(|p| p.name() == property)
            .ok_or_else(unknown)?;
        target.set(value)?;
        info!(processor, property, value, "property steered");
        node.stack.resume();
        Ok(())
    }

    pub fn processor_stats(&self, processor: &str) -> Option<ProcessorStats> {
        self.shared
            .nodes
            .iter()
            .find(|node| node.name == processor)
            .map(|node| lock(&node.stats).clone())
    }

    pub fn report(&self) -> RunReport {
        let rows = self
            .shared
            .nodes
            .iter()
            .map(|node| {
                let stats = lock(&node.stats).clone();
                let properties = node.stack.properties();
                let read = |name: &str| properties.iter().find(|p| p.name() == name).map(|p| p.value());
                let queued = read(PARALLELIZE_QUEUE_SIZE).unwrap_or(0);
                let started = match (
                    read(PARALLELIZE_SENT_JOBS),
                    read(PARALLELIZE_COMPLETED_JOBS),
                    read(PARALLELIZE_FAILED_JOBS),
                ) {
                    (Some(sent), Some(completed), Some(failed)) => sent + completed + failed,
                    _ => stats.started,
                };
                ReportRow::for_processor(&node.name, &stats, queued, started)
            })
            .collect();
        let times = lock(&self.shared.times).clone();
        RunReport::new(
            self.shared.workflow.name(),
            self.state(),
            times.started_at,
            times.finished_at,
            rows,
        )
    }

    /// Resolve once the run reaches a terminal state.
    pub async fn wait(&self) -> RunState {
        let mut states = self.shared.state.subscribe();
        match states.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }
}

impl std::fmt::Debug for WorkflowInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowInstance")
            .field("run_id", &self.shared.run_id)
            .field("workflow", &self.shared.workflow.name())
            .field("state", &self.state())
            .finish()
    }
}
