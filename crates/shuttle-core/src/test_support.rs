//! Shared fixtures for unit tests: stack exits, stub layers, a harness
//! around a single dispatch stack, and a handful of activities.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::context::InvocationContext;
use crate::dispatch::{
    Completion, DispatchLayer, DispatchStack, Hop, Job, JobFailure, JobResult, ProcessorInfo,
    RunControl, StackEnv, StackExit, StackLayers,
};
use crate::domain::{
    ActivityError, DataRef, ErrorKind, FailurePayload, Index, PortSet, PortSpec, ProcessId, RunId,
};
use crate::impls::{InMemoryReferenceService, RecordingProvenance, TokioExecutor};
use crate::ports::{
    Activity, ActivityInputs, ActivityOutputs, FnActivity, ProvenanceSink, ReferenceService,
};
use crate::sync::lock;

const WAIT_LIMIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitEvent {
    Result(Index),
    Failure(Index),
    Completion(Index),
    Finished,
}

#[derive(Debug, Default)]
pub struct RecordingExit {
    events: Mutex<Vec<ExitEvent>>,
    results: Mutex<Vec<JobResult>>,
    failures: Mutex<Vec<JobFailure>>,
}

impl RecordingExit {
    pub fn events(&self) -> Vec<ExitEvent> {
        lock(&self.events).clone()
    }

    pub fn results(&self) -> Vec<JobResult> {
        lock(&self.results).clone()
    }

    pub fn failures(&self) -> Vec<JobFailure> {
        lock(&self.failures).clone()
    }
}

impl StackExit for RecordingExit {
    fn result(&self, result: JobResult) {
        lock(&self.events).push(ExitEvent::Result(result.index.clone()));
        lock(&self.results).push(result);
    }

    fn failure(&self, failure: JobFailure) {
        lock(&self.events).push(ExitEvent::Failure(failure.index.clone()));
        lock(&self.failures).push(failure);
    }

    fn completion(&self, completion: Completion) {
        lock(&self.events).push(ExitEvent::Completion(completion.index));
    }

    fn finished(&self) {
        lock(&self.events).push(ExitEvent::Finished);
    }
}

/// Layer that does nothing but forward.
pub struct PassThrough;

impl DispatchLayer for PassThrough {
    fn kind(&self) -> &'static str {
        "passthrough"
    }
}

/// Terminal layer that keeps jobs until the test releases them.
#[derive(Default)]
pub struct HoldingTerminal {
    held: Mutex<VecDeque<(Job, Hop)>>,
}

impl HoldingTerminal {
    /// Answer the oldest held job with an empty result.
    pub fn release_next(&self) {
        let next = lock(&self.held).pop_front();
        if let Some((job, hop)) = next {
            hop.result_up(JobResult {
                owning_process: job.owning_process,
                index: job.index,
                data: BTreeMap::new(),
            });
        }
    }
}

impl DispatchLayer for HoldingTerminal {
    fn kind(&self) -> &'static str {
        "holding"
    }

    fn is_terminal(&self) -> bool {
        true
    }

    fn dispatch(&self, job: Job, hop: &Hop) {
        lock(&self.held).push_back((job, hop.clone()));
    }
}

fn process_id() -> ProcessId {
    ProcessId::new("run").child("test")
}

fn simple_ports() -> PortSet {
    PortSet {
        inputs: vec![PortSpec::new("in", 0)],
        outputs: vec![PortSpec::new("out", 0)],
    }
}

fn test_context() -> InvocationContext {
    InvocationContext::new(RunId::generate(), Arc::new(InMemoryReferenceService::new()), None)
}

pub fn job_at(index: Index) -> Job {
    Job {
        owning_process: process_id(),
        index,
        data: BTreeMap::new(),
        activities: Vec::new(),
        context: test_context(),
    }
}

/// Needs a tokio runtime.
pub fn stack_env(exit: Arc<RecordingExit>) -> StackEnv {
    StackEnv {
        processor: ProcessorInfo {
            name: "test".to_string(),
            ports: simple_ports(),
        },
        process_id: process_id(),
        executor: Arc::new(TokioExecutor::from_current(16).unwrap()),
        control: Arc::new(RunControl::new()),
        context: test_context(),
        exit,
    }
}

/// One stack wired to a recording exit, with its own reference store and
/// provenance log.
pub struct Harness {
    pub references: Arc<InMemoryReferenceService>,
    pub provenance: Arc<RecordingProvenance>,
    pub control: Arc<RunControl>,
    exit: Arc<RecordingExit>,
    context: InvocationContext,
    stack: DispatchStack,
}

impl Harness {
    pub fn new(layers: Vec<Arc<dyn DispatchLayer>>) -> Self {
        Self::with_ports(layers, simple_ports())
    }

    pub fn with_ports(layers: Vec<Arc<dyn DispatchLayer>>, ports: PortSet) -> Self {
        let references = Arc::new(InMemoryReferenceService::new());
        let provenance = Arc::new(RecordingProvenance::new());
        let control = Arc::new(RunControl::new());
        let exit = Arc::new(RecordingExit::default());
        let context = InvocationContext::new(
            RunId::generate(),
            references.clone(),
            Some(provenance.clone() as Arc<dyn ProvenanceSink>),
        );
        let stack = DispatchStack::new(
            StackLayers::new(layers).unwrap(),
            StackEnv {
                processor: ProcessorInfo {
                    name: "test".to_string(),
                    ports,
                },
                process_id: process_id(),
                executor: Arc::new(TokioExecutor::from_current(16).unwrap()),
                control: control.clone(),
                context: context.clone(),
                exit: exit.clone(),
            },
        );
        Self {
            references,
            provenance,
            control,
            exit,
            context,
            stack,
        }
    }

    pub fn stack(&self) -> &DispatchStack {
        &self.stack
    }

    pub fn enter(&self, index: Index, value: Value, activities: Vec<Arc<dyn Activity>>) {
        self.enter_at_depth(index, value, 0, activities);
    }

    pub fn enter_at_depth(
        &self,
        index: Index,
        value: Value,
        depth: usize,
        activities: Vec<Arc<dyn Activity>>,
    ) {
        self.enter_ports(index, vec![("in", value, depth)], activities);
    }

    pub fn enter_ports(
        &self,
        index: Index,
        ports: Vec<(&str, Value, usize)>,
        activities: Vec<Arc<dyn Activity>>,
    ) {
        let refs = ports
            .into_iter()
            .map(|(port, value, depth)| (port, self.references.register(value, depth).unwrap()))
            .collect();
        self.enter_refs(index, refs, activities);
    }

    pub fn enter_refs(
        &self,
        index: Index,
        refs: Vec<(&str, DataRef)>,
        activities: Vec<Arc<dyn Activity>>,
    ) {
        self.stack.enter(Job {
            owning_process: process_id(),
            index,
            data: refs
                .into_iter()
                .map(|(port, data)| (port.to_string(), data))
                .collect(),
            activities,
            context: self.context.clone(),
        });
    }

    pub fn events(&self) -> Vec<ExitEvent> {
        self.exit.events()
    }

    pub fn results(&self) -> Vec<JobResult> {
        self.exit.results()
    }

    pub fn failures(&self) -> Vec<FailurePayload> {
        self.exit.failures().into_iter().map(|f| f.error).collect()
    }

    /// Resolved value of port "out" in the result at `index`.
    pub fn output_value(&self, index: &Index) -> Option<Value> {
        let result = self.results().into_iter().find(|r| &r.index == index)?;
        let data = result.data.get("out")?;
        self.references.resolve(data).ok()
    }

    pub fn property(&self, name: &str) -> Option<u64> {
        self.stack
            .properties()
            .into_iter()
            .find(|p| p.name() == name)
            .map(|p| p.value())
    }

    pub fn set_property(&self, name: &str, value: u64) {
        let property = self
            .stack
            .properties()
            .into_iter()
            .find(|p| p.name() == name)
            .unwrap();
        property.set(value).unwrap();
    }

    /// All exit events, once there are at least `count` of them.
    pub async fn wait_for(&self, count: usize) -> Vec<ExitEvent> {
        self.wait_until(|| self.exit.events().len() >= count).await;
        self.events()
    }

    pub async fn wait_until(&self, condition: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
        while !condition() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting; exit saw {:?}",
                self.events()
            );
            tokio::time::sleep(POLL).await;
        }
    }
}

fn input_str(inputs: &ActivityInputs, port: &str) -> Result<String, ActivityError> {
    inputs
        .get(port)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ActivityError::permanent(format!("input '{port}' is not a string")))
}

fn echo(inputs: &ActivityInputs) -> ActivityOutputs {
    let value = inputs.get("in").cloned().unwrap_or(Value::Null);
    BTreeMap::from([("out".to_string(), value)])
}

fn error_of(kind: ErrorKind, message: &str) -> ActivityError {
    match kind {
        ErrorKind::Transient => ActivityError::transient(message),
        ErrorKind::Permanent => ActivityError::permanent(message),
    }
}

/// "in" upper-cased into "out".
pub fn upper() -> Arc<dyn Activity> {
    Arc::new(FnActivity::new("upper", |inputs: ActivityInputs| {
        let s = input_str(&inputs, "in")?;
        Ok(BTreeMap::from([("out".to_string(), json!(s.to_uppercase()))]))
    }))
}

/// "a" followed by "b" into "out".
pub fn concat() -> Arc<dyn Activity> {
    Arc::new(FnActivity::new("concat", |inputs: ActivityInputs| {
        let joined = input_str(&inputs, "a")? + &input_str(&inputs, "b")?;
        Ok(BTreeMap::from([("out".to_string(), json!(joined))]))
    }))
}

pub fn failing(name: &str, kind: ErrorKind) -> Arc<dyn Activity> {
    Arc::new(FnActivity::new(name, move |_: ActivityInputs| Err(error_of(kind, "always fails"))))
}

/// Fails its first `fail_times` calls (over all indices), then echoes.
pub struct FlakyActivity {
    name: String,
    fail_times: usize,
    kind: ErrorKind,
    calls: AtomicUsize,
}

impl FlakyActivity {
    pub fn new(name: &str, fail_times: usize, kind: ErrorKind) -> Self {
        Self {
            name: name.to_string(),
            fail_times,
            kind,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Activity for FlakyActivity {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        inputs: ActivityInputs,
        _context: &InvocationContext,
    ) -> Result<ActivityOutputs, ActivityError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_times {
            return Err(error_of(self.kind, &format!("flaky call {}", call + 1)));
        }
        Ok(echo(&inputs))
    }
}

/// Echoes "in" to "out" after a delay, recording peak concurrency.
pub struct SlowActivity {
    delay: Duration,
    current: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl SlowActivity {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Activity for SlowActivity {
    fn name(&self) -> &str {
        "slow"
    }

    async fn invoke(
        &self,
        inputs: ActivityInputs,
        _context: &InvocationContext,
    ) -> Result<ActivityOutputs, ActivityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(echo(&inputs))
    }
}

/// Order in which scripted activities were called.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn calls(&self) -> Vec<String> {
        lock(&self.0).clone()
    }
}

/// Activity that logs its name and answers with `outcome`.
pub fn scripted(name: &str, log: &CallLog, outcome: Result<Value, ErrorKind>) -> Arc<dyn Activity> {
    let log = log.clone();
    let label = name.to_string();
    Arc::new(FnActivity::new(name, move |_: ActivityInputs| {
        lock(&log.0).push(label.clone());
        match &outcome {
            Ok(value) => Ok(BTreeMap::from([("out".to_string(), value.clone())])),
            Err(kind) => Err(error_of(*kind, &format!("{label} refused"))),
        }
    }))
}
