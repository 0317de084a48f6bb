//! One processor inside a run: input joining on the way into its stack,
//! output assembly on the way out.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use super::instance::RunShared;
use super::report::ProcessorStats;
use crate::context::InvocationContext;
use crate::dispatch::{Completion, DispatchStack, Job, JobFailure, JobResult, RunControl, StackExit};
use crate::domain::{
    DataRef, ErrorKind, FailurePayload, Index, PortSpec, ProcessId, ProcessorStatus, Token,
};
use crate::error::ReferenceError;
use crate::ports::{Activity, Clock, ReferenceService};
use crate::sync::lock;

/// `index` and all of its ancestors, shortest first.
fn prefixes(index: &Index) -> impl Iterator<Item = Index> + '_ {
    (0..=index.len()).map(move |n| Index::new(&index.positions()[..n]))
}

#[derive(Debug)]
struct PortBuffer {
    depth: usize,
    accepted: BTreeMap<Index, DataRef>,
    markers: BTreeSet<Index>,
}

impl PortBuffer {
    fn new(depth: usize) -> Self {
        Self {
            depth,
            accepted: BTreeMap::new(),
            markers: BTreeSet::new(),
        }
    }

    /// Accepted token at `index` or at one of its prefixes.
    fn covering(&self, index: &Index) -> Option<&DataRef> {
        prefixes(index).find_map(|prefix| self.accepted.get(&prefix))
    }

    fn has_accepted_under(&self, prefix: &Index) -> bool {
        self.accepted
            .range(prefix.clone()..)
            .take_while(|(index, _)| prefix.is_prefix_of(index))
            .any(|(index, _)| index != prefix)
    }

    /// Nothing more will arrive on this port at or below `index`.
    fn closed_at(&self, index: &Index) -> bool {
        prefixes(index).any(|prefix| self.markers.contains(&prefix) || self.accepted.contains_key(&prefix))
    }
}

/// What a token made ready.
#[derive(Debug, Default, PartialEq)]
struct Ready {
    jobs: Vec<(Index, BTreeMap<String, DataRef>)>,
    /// Deepest first.
    completions: Vec<Index>,
}

/// Matches tokens across input ports into jobs.
///
/// A port of depth `d` takes data of depth `d` or deeper; deeper data is
/// split by Parallelize further down. Shallower tokens are skipped and
/// picked up later inside the completion that wraps them.
#[derive(Debug)]
struct Joiner {
    ports: BTreeMap<String, PortBuffer>,
    fired: BTreeSet<Index>,
    completed: BTreeSet<Index>,
}

impl Joiner {
    fn new(inputs: &[PortSpec]) -> Self {
        Self {
            ports: inputs
                .iter()
                .map(|p| (p.name.clone(), PortBuffer::new(p.depth)))
                .collect(),
            fired: BTreeSet::new(),
            completed: BTreeSet::new(),
        }
    }

    fn offer(&mut self, port: &str, token: &Token) -> Ready {
        let Some(buffer) = self.ports.get_mut(port) else {
            warn!(port, "token for unknown processor port dropped");
            return Ready::default();
        };
        let index = token.index().clone();
        let deep_enough = token.data().depth() >= buffer.depth;

        let accepted = if token.is_completion() {
            if buffer.has_accepted_under(&index) {
                buffer.markers.insert(index.clone());
                false
            } else if deep_enough {
                buffer.accepted.insert(index.clone(), token.data().clone());
                true
            } else {
                return Ready::default();
            }
        } else if deep_enough {
            buffer.accepted.insert(index.clone(), token.data().clone());
            true
        } else {
            return Ready::default();
        };

        let mut ready = Ready::default();
        if accepted {
            ready.jobs = self.jobs_from(&index);
        }
        ready.completions = self.completions();
        ready
    }

    /// Jobs that `index` completes: at `index` itself, or below it where
    /// another port already holds deeper tokens.
    fn jobs_from(&mut self, index: &Index) -> Vec<(Index, BTreeMap<String, DataRef>)> {
        let mut candidates = BTreeSet::from([index.clone()]);
        for buffer in self.ports.values() {
            candidates.extend(
                buffer
                    .accepted
                    .range(index.clone()..)
                    .take_while(|(other, _)| index.is_prefix_of(other))
                    .map(|(other, _)| other.clone()),
            );
        }

        let mut jobs = Vec::new();
        for candidate in candidates {
            if self.fired.contains(&candidate) {
                continue;
            }
            let data: Option<BTreeMap<String, DataRef>> = self
                .ports
                .iter()
                .map(|(name, buffer)| buffer.covering(&candidate).map(|r| (name.clone(), r.clone())))
                .collect();
            if let Some(data) = data {
                self.fired.insert(candidate.clone());
                jobs.push((candidate, data));
            }
        }
        jobs
    }

    fn completions(&mut self) -> Vec<Index> {
        let mut candidates: BTreeSet<Index> = self
            .ports
            .values()
            .flat_map(|buffer| buffer.markers.iter().cloned())
            .collect();
        candidates.insert(Index::root());

        let mut ready: Vec<Index> = candidates
            .into_iter()
            .filter(|c| !self.completed.contains(c))
            .filter(|c| self.ports.values().all(|buffer| buffer.closed_at(c)))
            .collect();
        self.completed.extend(ready.iter().cloned());
        ready.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        ready
    }
}

/// Processor slot in a run.
pub(crate) struct ProcessorNode {
    pub(crate) name: String,
    process_id: ProcessId,
    has_inputs: bool,
    activities: Vec<Arc<dyn Activity>>,
    pub(crate) stack: DispatchStack,
    joiner: Mutex<Joiner>,
    pub(crate) stats: Arc<Mutex<ProcessorStats>>,
    control: Arc<RunControl>,
    context: InvocationContext,
    clock: Arc<dyn Clock>,
}

pub(crate) struct NodeParts {
    pub(crate) name: String,
    pub(crate) process_id: ProcessId,
    pub(crate) inputs: Vec<PortSpec>,
    pub(crate) activities: Vec<Arc<dyn Activity>>,
    pub(crate) stack: DispatchStack,
    pub(crate) stats: Arc<Mutex<ProcessorStats>>,
    pub(crate) control: Arc<RunControl>,
    pub(crate) context: InvocationContext,
    pub(crate) clock: Arc<dyn Clock>,
}

impl ProcessorNode {
    pub(crate) fn new(parts: NodeParts) -> Self {
        Self {
            name: parts.name,
            process_id: parts.process_id,
            has_inputs: !parts.inputs.is_empty(),
            activities: parts.activities,
            stack: parts.stack,
            joiner: Mutex::new(Joiner::new(&parts.inputs)),
            stats: parts.stats,
            control: parts.control,
            context: parts.context,
            clock: parts.clock,
        }
    }

    pub(crate) fn has_inputs(&self) -> bool {
        self.has_inputs
    }

    /// Take `token` on input `port` and enter whatever it makes ready.
    ///
    /// The joiner stays locked while entering so a completion can never
    /// overtake a job formed just before it.
    pub(crate) fn accept(&self, port: &str, token: &Token) {
        if self.control.is_cancelled() {
            return;
        }
        let mut joiner = lock(&self.joiner);
        let ready = joiner.offer(port, token);
        for (index, data) in ready.jobs {
            self.enter(index, data);
        }
        for index in ready.completions {
            self.stack.complete(index);
        }
    }

    /// Start a processor without inputs: one empty job at the root.
    pub(crate) fn fire(&self) {
        let _joiner = lock(&self.joiner);
        self.enter(Index::root(), BTreeMap::new());
        self.stack.complete(Index::root());
    }

    fn enter(&self, index: Index, data: BTreeMap<String, DataRef>) {
        {
            let mut stats = lock(&self.stats);
            if stats.status == ProcessorStatus::Pending {
                stats.status = ProcessorStatus::Running;
                stats.started_at = Some(self.clock.now());
            }
            stats.started += 1;
        }
        debug!(processor = %self.name, %index, "job entered");
        self.stack.enter(Job {
            owning_process: self.process_id.clone(),
            index,
            data,
            activities: self.activities.clone(),
            context: self.context.clone(),
        });
    }

    /// Move to a terminal status unless already in one.
    pub(crate) fn settle_status(&self, status: ProcessorStatus) {
        let mut stats = lock(&self.stats);
        if matches!(stats.status, ProcessorStatus::Pending | ProcessorStatus::Running) {
            stats.status = status;
            stats.finished_at = Some(self.clock.now());
        }
    }
}

#[derive(Debug, Default)]
struct Collected {
    results: BTreeMap<String, BTreeMap<Index, DataRef>>,
    closed: BTreeSet<Index>,
}

/// Exit of a processor's stack. Turns results into tokens on the output
/// ports and completions into assembled lists.
pub(crate) struct OutputCollector {
    run: Weak<RunShared>,
    slot: usize,
    processor: String,
    process_id: ProcessId,
    outputs: Vec<PortSpec>,
    references: Arc<dyn ReferenceService>,
    stats: Arc<Mutex<ProcessorStats>>,
    collected: Mutex<Collected>,
}

impl OutputCollector {
    pub(crate) fn new(
        run: Weak<RunShared>,
        slot: usize,
        processor: String,
        process_id: ProcessId,
        outputs: Vec<PortSpec>,
        references: Arc<dyn ReferenceService>,
        stats: Arc<Mutex<ProcessorStats>>,
    ) -> Self {
        Self {
            run,
            slot,
            processor,
            process_id,
            outputs,
            references,
            stats,
            collected: Mutex::new(Collected::default()),
        }
    }

    /// Results strictly under `prefix` on `port`, or `None` when `prefix`
    /// already carries a result of its own.
    fn gather(&self, port: &str, prefix: &Index) -> Option<Vec<(Index, DataRef)>> {
        let collected = lock(&self.collected);
        let results = collected.results.get(port);
        let covered = results.is_some_and(|r| prefixes(prefix).any(|p| r.contains_key(&p)));
        if covered {
            return None;
        }
        Some(
            results
                .map(|r| {
                    r.range(prefix.clone()..)
                        .take_while(|(index, _)| prefix.is_prefix_of(index))
                        .map(|(index, data)| (index.clone(), data.clone()))
                        .collect()
                })
                .unwrap_or_default(),
        )
    }

    /// Nest `entries` (all strictly under `prefix`, sorted) into one list
    /// ordered by index position.
    fn assemble(&self, prefix: &Index, entries: &[(Index, DataRef)]) -> Result<DataRef, ReferenceError> {
        let level = prefix.len();
        let mut members = Vec::new();
        let mut rest = entries;
        while let Some((first, _)) = rest.first() {
            let position = first.positions()[level];
            let child = prefix.child(position);
            let split = rest
                .iter()
                .position(|(index, _)| index.positions()[level] != position)
                .unwrap_or(rest.len());
            let (group, tail) = rest.split_at(split);
            rest = tail;

            let member = match group.iter().find(|(index, _)| *index == child) {
                Some((_, data)) => data.clone(),
                None => self.assemble(&child, group)?,
            };
            members.push(member);
        }
        let depth = members.first().map(|m| m.depth() + 1).unwrap_or(1);
        self.references.register_list(members, depth)
    }

    fn list_for(&self, port: &PortSpec, prefix: &Index) -> Result<Option<DataRef>, ReferenceError> {
        let Some(entries) = self.gather(&port.name, prefix) else {
            return Ok(None);
        };
        let list = if entries.is_empty() {
            self.references.register_list(Vec::new(), port.depth + 1)?
        } else {
            self.assemble(prefix, &entries)?
        };
        lock(&self.collected)
            .results
            .entry(port.name.clone())
            .or_default()
            .insert(prefix.clone(), list.clone());
        Ok(Some(list))
    }
}

impl StackExit for OutputCollector {
    fn result(&self, result: JobResult) {
        let Some(run) = self.run.upgrade() else {
            return;
        };
        {
            let mut stats = lock(&self.stats);
            stats.completed += 1;
            if result.data.values().any(DataRef::contains_errors) {
                stats.errors += 1;
            }
        }
        {
            let mut collected = lock(&self.collected);
            for (port, data) in &result.data {
                collected
                    .results
                    .entry(port.clone())
                    .or_default()
                    .insert(result.index.clone(), data.clone());
            }
        }
        for (port, data) in result.data {
            let token = Token::new(self.process_id.clone(), result.index.clone(), data);
            run.route_output(self.slot, &port, token);
        }
    }

    fn failure(&self, failure: JobFailure) {
        lock(&self.stats).errors += 1;
        if let Some(run) = self.run.upgrade() {
            run.fail(&self.processor, &failure.error);
        }
    }

    fn completion(&self, completion: Completion) {
        if !lock(&self.collected).closed.insert(completion.index.clone()) {
            return;
        }
        let Some(run) = self.run.upgrade() else {
            return;
        };
        for port in &self.outputs {
            match self.list_for(port, &completion.index) {
                Ok(Some(list)) => {
                    let token = Token::completion(self.process_id.clone(), completion.index.clone(), list);
                    run.route_output(self.slot, &port.name, token);
                }
                Ok(None) => {}
                Err(e) => {
                    let failure = FailurePayload::new(
                        ErrorKind::Permanent,
                        format!("cannot assemble output '{}' at {}: {e}", port.name, completion.index),
                    );
                    run.fail(&self.processor, &failure);
                    return;
                }
            }
        }
    }

    fn finished(&self) {
        if let Some(run) = self.run.upgrade() {
            run.processor_finished(self.slot);
        }
    }
}
