//! Parallelize: fan-out over collection inputs with bounded admission.
//!
//! A job whose input references are deeper than the processor's declared
//! input depths is split into one child job per element combination. The
//! child's index is the parent's index followed by the element's position.
//! Children queue here and are admitted below only while fewer than
//! `max_jobs` are outstanding. Every result or failure frees a slot.
//!
//! Once all children of a parent have reported, a `Completion` for the
//! parent index goes up. Reassembly above is purely index driven, so
//! children are free to finish in any order.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use super::config::parse_config;
use super::events::{Completion, Job, JobFailure, JobResult};
use super::layer::DispatchLayer;
use super::stack::Hop;
use crate::domain::{DataRef, ErrorKind, FailurePayload, Index};
use crate::error::{ConfigError, ReferenceError};
use crate::monitor::{
    Counter, MonitorableProperty, PARALLELIZE_COMPLETED_JOBS, PARALLELIZE_FAILED_JOBS,
    PARALLELIZE_MAX_JOBS, PARALLELIZE_QUEUE_SIZE, PARALLELIZE_SENT_JOBS, Steerable,
};
use crate::ports::ReferenceService;
use crate::sync::lock;

pub const KIND: &str = "parallelize";

/// How element positions of several iterated ports combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStrategy {
    /// Every combination; child index is the concatenation of positions.
    #[default]
    Cross,
    /// Pairwise by position, truncated to the shortest port.
    Dot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParallelizeConfig {
    pub max_jobs: usize,
    pub iteration: IterationStrategy,
}

impl Default for ParallelizeConfig {
    fn default() -> Self {
        Self {
            max_jobs: 1,
            iteration: IterationStrategy::Cross,
        }
    }
}

#[derive(Debug)]
struct Queued {
    job: Job,
    parent: Option<Index>,
}

#[derive(Debug, Default)]
struct ParallelizeState {
    queue: VecDeque<Queued>,
    /// Sent child index -> parent index (None when the job was not split).
    sent: HashMap<Index, Option<Index>>,
    /// Parent index -> children not yet reported.
    remaining: HashMap<Index, usize>,
    pumping: bool,
    cancelled: bool,
}

pub struct Parallelize {
    iteration: IterationStrategy,
    state: Mutex<ParallelizeState>,
    max_jobs: Arc<Steerable>,
    queue_size: Arc<Counter>,
    sent_jobs: Arc<Counter>,
    completed_jobs: Arc<Counter>,
    failed_jobs: Arc<Counter>,
}

impl Parallelize {
    pub fn new(config: ParallelizeConfig) -> Result<Self, ConfigError> {
        if config.max_jobs == 0 {
            return Err(ConfigError::InvalidLayerValue {
                layer: KIND.to_string(),
                reason: "max_jobs must be at least 1".to_string(),
            });
        }
        Ok(Self {
            iteration: config.iteration,
            state: Mutex::new(ParallelizeState::default()),
            max_jobs: Steerable::new(PARALLELIZE_MAX_JOBS, config.max_jobs as u64, 1),
            queue_size: Counter::new(PARALLELIZE_QUEUE_SIZE),
            sent_jobs: Counter::new(PARALLELIZE_SENT_JOBS),
            completed_jobs: Counter::new(PARALLELIZE_COMPLETED_JOBS),
            failed_jobs: Counter::new(PARALLELIZE_FAILED_JOBS),
        })
    }

    pub fn from_config(config: &Value) -> Result<Arc<dyn DispatchLayer>, ConfigError> {
        Ok(Arc::new(Self::new(parse_config(KIND, config)?)?))
    }

    fn publish(&self, state: &ParallelizeState) {
        self.queue_size.store(state.queue.len());
        self.sent_jobs.store(state.sent.len());
    }

    /// Admit queued children while there is room. Only one thread pumps at
    /// a time; a thread that finds the pump busy leaves the work to it.
    fn pump(&self, hop: &Hop) {
        {
            let mut state = lock(&self.state);
            if state.pumping {
                return;
            }
            state.pumping = true;
        }
        loop {
            let next = {
                let mut state = lock(&self.state);
                let room = (state.sent.len() as u64) < self.max_jobs.get();
                let admitted = if room && !state.cancelled && hop.control().admits() {
                    state.queue.pop_front()
                } else {
                    None
                };
                match admitted {
                    Some(queued) => {
                        state.sent.insert(queued.job.index.clone(), queued.parent);
                        self.publish(&state);
                        Some(queued.job)
                    }
                    None => {
                        // Checked and released under the same lock, so a
                        // slot freed after this point finds the pump idle.
                        state.pumping = false;
                        None
                    }
                }
            };
            match next {
                Some(job) => {
                    trace!(index = %job.index, "admitting job");
                    hop.down(job);
                }
                None => break,
            }
        }
    }

    /// Account for a child that reported. Returns the parent index if it
    /// was the last outstanding child.
    fn settle(&self, index: &Index, failed: bool) -> Option<Index> {
        let mut state = lock(&self.state);
        let parent = state.sent.remove(index)?;
        if failed {
            self.failed_jobs.incr();
        } else {
            self.completed_jobs.incr();
        }
        self.publish(&state);
        let parent = parent?;
        let left = state.remaining.get_mut(&parent)?;
        *left = left.saturating_sub(1);
        if *left == 0 {
            state.remaining.remove(&parent);
            Some(parent)
        } else {
            None
        }
    }

    fn after_report(&self, index: &Index, failed: bool, hop: &Hop) {
        if let Some(parent) = self.settle(index, failed) {
            hop.completion_up(Completion {
                owning_process: hop.process_id().clone(),
                index: parent,
            });
        }
        self.pump(hop);
    }

    /// Break `job` into children. `None` means no port is deeper than
    /// declared and the job runs as is.
    fn split(&self, job: &Job, hop: &Hop) -> Result<Option<Vec<Job>>, ReferenceError> {
        let references = job.context.references();
        let mut fixed = BTreeMap::new();
        let mut iterated: Vec<(String, Vec<(Vec<usize>, DataRef)>)> = Vec::new();

        for (port, reference) in &job.data {
            let declared = hop.processor().ports.input(port).map_or(reference.depth(), |p| p.depth);
            let excess = reference.depth().saturating_sub(declared);
            // An error stands for the whole collection it replaces.
            if excess == 0 || reference.is_error() {
                fixed.insert(port.clone(), reference.clone());
            } else {
                iterated.push((port.clone(), leaves(references.as_ref(), reference, excess)?));
            }
        }
        if iterated.is_empty() {
            return Ok(None);
        }

        let combinations = match self.iteration {
            IterationStrategy::Cross => cross(&iterated),
            IterationStrategy::Dot => dot(&iterated),
        };
        let children = combinations
            .into_iter()
            .map(|(suffix, bound)| {
                let mut data = fixed.clone();
                data.extend(bound);
                job.at(job.index.extend(&suffix), data)
            })
            .collect();
        Ok(Some(children))
    }
}

/// Elements `depth` levels below `reference`, each with its relative
/// position. An error member is a leaf at its own, shorter position.
fn leaves(
    references: &dyn ReferenceService,
    reference: &DataRef,
    depth: usize,
) -> Result<Vec<(Vec<usize>, DataRef)>, ReferenceError> {
    if depth == 0 || reference.is_error() {
        return Ok(vec![(Vec::new(), reference.clone())]);
    }
    let mut out = Vec::new();
    for (position, member) in references.members(reference)?.into_iter().enumerate() {
        for (mut suffix, leaf) in leaves(references, &member, depth - 1)? {
            suffix.insert(0, position);
            out.push((suffix, leaf));
        }
    }
    Ok(out)
}

type Combination = (Vec<usize>, Vec<(String, DataRef)>);

fn cross(iterated: &[(String, Vec<(Vec<usize>, DataRef)>)]) -> Vec<Combination> {
    let mut combinations: Vec<Combination> = vec![(Vec::new(), Vec::new())];
    for (port, elements) in iterated {
        let mut next = Vec::with_capacity(combinations.len() * elements.len());
        for (suffix, bound) in &combinations {
            for (position, leaf) in elements {
                let mut suffix = suffix.clone();
                suffix.extend_from_slice(position);
                let mut bound = bound.clone();
                bound.push((port.clone(), leaf.clone()));
                next.push((suffix, bound));
            }
        }
        combinations = next;
    }
    combinations
}

fn dot(iterated: &[(String, Vec<(Vec<usize>, DataRef)>)]) -> Vec<Combination> {
    let shortest = iterated.iter().map(|(_, e)| e.len()).min().unwrap_or(0);
    (0..shortest)
        .map(|i| {
            let suffix = iterated[0].1[i].0.clone();
            let bound = iterated
                .iter()
                .map(|(port, elements)| (port.clone(), elements[i].1.clone()))
                .collect();
            (suffix, bound)
        })
        .collect()
}

impl DispatchLayer for Parallelize {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn dispatch(&self, job: Job, hop: &Hop) {
        let children = match self.split(&job, hop) {
            Ok(children) => children,
            Err(e) => {
                let payload = FailurePayload::new(ErrorKind::Permanent, format!("cannot iterate inputs: {e}"));
                hop.error_up(JobFailure::for_job(&job, payload));
                return;
            }
        };

        match children {
            None => {
                let mut state = lock(&self.state);
                state.queue.push_back(Queued { job, parent: None });
                self.publish(&state);
            }
            Some(children) if children.is_empty() => {
                debug!(index = %job.index, "empty iteration");
                hop.completion_up(Completion {
                    owning_process: job.owning_process,
                    index: job.index,
                });
                return;
            }
            Some(children) => {
                debug!(index = %job.index, children = children.len(), "split job");
                let mut state = lock(&self.state);
                state.remaining.insert(job.index.clone(), children.len());
                state.queue.extend(children.into_iter().map(|child| Queued {
                    job: child,
                    parent: Some(job.index.clone()),
                }));
                self.publish(&state);
            }
        }
        self.pump(hop);
    }

    fn receive_result(&self, result: JobResult, hop: &Hop) {
        let index = result.index.clone();
        hop.result_up(result);
        self.after_report(&index, false, hop);
    }

    fn receive_error(&self, failure: JobFailure, hop: &Hop) {
        let index = failure.index.clone();
        hop.error_up(failure);
        self.after_report(&index, true, hop);
    }

    fn properties(&self) -> Vec<Arc<dyn MonitorableProperty>> {
        vec![
            self.queue_size.clone(),
            self.sent_jobs.clone(),
            self.completed_jobs.clone(),
            self.failed_jobs.clone(),
            self.max_jobs.clone(),
        ]
    }

    fn resume(&self, hop: &Hop) {
        self.pump(hop);
    }

    fn cancel(&self) {
        let mut state = lock(&self.state);
        state.cancelled = true;
        let dropped = state.queue.len();
        state.queue.clear();
        self.publish(&state);
        if dropped > 0 {
            debug!(dropped, "discarded queued jobs");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Invoke;
    use crate::domain::{ErrorDocument, PortSet, PortSpec};
    use crate::test_support::{ExitEvent, Harness, SlowActivity, upper};
    use serde_json::json;
    use std::time::Duration;

    fn parallelize(config: Value) -> Arc<dyn DispatchLayer> {
        Parallelize::from_config(&config).unwrap()
    }

    #[test]
    fn zero_max_jobs_is_rejected() {
        let err = Parallelize::from_config(&json!({"max_jobs": 0})).err().unwrap();
        assert!(err.to_string().contains("max_jobs"));
    }

    #[test]
    fn iteration_strategy_reads_snake_case() {
        let config: ParallelizeConfig =
            parse_config(KIND, &json!({"max_jobs": 3, "iteration": "dot"})).unwrap();
        assert_eq!(config.iteration, IterationStrategy::Dot);
        assert_eq!(config.max_jobs, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn list_is_split_by_index_with_bounded_admission() {
        let slow = Arc::new(SlowActivity::new(Duration::from_millis(30)));
        let harness = Harness::new(vec![
            parallelize(json!({"max_jobs": 2})),
            Arc::new(Invoke::default()),
        ]);
        harness.enter_at_depth(Index::root(), json!(["a", "b", "c"]), 1, vec![slow.clone()]);

        let events = harness.wait_for(4).await;
        let mut results: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ExitEvent::Result(i) => Some(i.clone()),
                _ => None,
            })
            .collect();
        results.sort();
        assert_eq!(results, vec![Index::new([0]), Index::new([1]), Index::new([2])]);
        assert_eq!(events.last(), Some(&ExitEvent::Completion(Index::root())));
        assert_eq!(harness.output_value(&Index::new([1])), Some(json!("b")));
        assert!(slow.peak() <= 2, "peak concurrency {}", slow.peak());
        assert_eq!(slow.calls(), 3);
        assert_eq!(harness.property(PARALLELIZE_COMPLETED_JOBS), Some(3));
        assert_eq!(harness.property(PARALLELIZE_SENT_JOBS), Some(0));
        assert_eq!(harness.property(PARALLELIZE_QUEUE_SIZE), Some(0));
    }

    #[tokio::test]
    async fn empty_list_completes_immediately() {
        let harness = Harness::new(vec![parallelize(Value::Null), Arc::new(Invoke::default())]);
        harness.enter_at_depth(Index::root(), json!([]), 1, vec![upper()]);

        assert_eq!(harness.wait_for(1).await, vec![ExitEvent::Completion(Index::root())]);
    }

    #[tokio::test]
    async fn error_in_place_of_a_list_is_not_iterated() {
        let harness = Harness::new(vec![
            parallelize(json!({"max_jobs": 2})),
            crate::dispatch::ErrorBounce::from_config(&Value::Null).unwrap(),
            Arc::new(Invoke::default()),
        ]);
        let document = ErrorDocument::reflected("upstream", Vec::new());
        let error = harness.references.register_error(document, 1).unwrap();
        let calls = Arc::new(SlowActivity::new(Duration::from_millis(1)));
        harness.enter_refs(Index::new([3]), vec![("in", error)], vec![calls.clone()]);

        assert_eq!(harness.wait_for(1).await, vec![ExitEvent::Result(Index::new([3]))]);
        assert!(harness.results()[0].data["out"].is_error());
        assert!(harness.failures().is_empty());
        assert_eq!(calls.calls(), 0);
    }

    #[tokio::test]
    async fn cross_product_concatenates_positions() {
        let ports = PortSet {
            inputs: vec![PortSpec::new("a", 0), PortSpec::new("b", 0)],
            outputs: vec![PortSpec::new("out", 0)],
        };
        let harness = Harness::with_ports(
            vec![parallelize(json!({"max_jobs": 8})), Arc::new(Invoke::default())],
            ports,
        );
        let concat = crate::test_support::concat();
        harness.enter_ports(
            Index::root(),
            vec![("a", json!(["x", "y"]), 1), ("b", json!(["1", "2", "3"]), 1)],
            vec![concat],
        );

        harness.wait_for(7).await;
        assert_eq!(harness.output_value(&Index::new([0, 0])), Some(json!("x1")));
        assert_eq!(harness.output_value(&Index::new([1, 2])), Some(json!("y3")));
        assert_eq!(harness.results().len(), 6);
    }

    #[tokio::test]
    async fn dot_product_pairs_positions() {
        let ports = PortSet {
            inputs: vec![PortSpec::new("a", 0), PortSpec::new("b", 0)],
            outputs: vec![PortSpec::new("out", 0)],
        };
        let harness = Harness::with_ports(
            vec![
                parallelize(json!({"max_jobs": 4, "iteration": "dot"})),
                Arc::new(Invoke::default()),
            ],
            ports,
        );
        harness.enter_ports(
            Index::root(),
            vec![("a", json!(["x", "y", "z"]), 1), ("b", json!(["1", "2"]), 1)],
            vec![crate::test_support::concat()],
        );

        harness.wait_for(3).await;
        assert_eq!(harness.output_value(&Index::new([0])), Some(json!("x1")));
        assert_eq!(harness.output_value(&Index::new([1])), Some(json!("y2")));
        assert_eq!(harness.results().len(), 2);
    }

    #[tokio::test]
    async fn paused_run_admits_nothing_until_resumed() {
        let harness = Harness::new(vec![parallelize(json!({"max_jobs": 2})), Arc::new(Invoke::default())]);
        harness.control.pause();
        harness.enter_at_depth(Index::root(), json!(["a", "b"]), 1, vec![upper()]);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(harness.events().is_empty());
        assert_eq!(harness.property(PARALLELIZE_QUEUE_SIZE), Some(2));

        harness.control.resume();
        harness.stack().resume();
        assert_eq!(harness.wait_for(3).await.len(), 3);
    }

    #[tokio::test]
    async fn cancel_discards_queue() {
        let harness = Harness::new(vec![parallelize(json!({"max_jobs": 1})), Arc::new(Invoke::default())]);
        harness.control.pause();
        harness.enter_at_depth(Index::root(), json!(["a", "b", "c"]), 1, vec![upper()]);
        harness.stack().cancel();

        assert_eq!(harness.property(PARALLELIZE_QUEUE_SIZE), Some(0));
        harness.control.resume();
        harness.stack().resume();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(harness.events().is_empty());
    }

    #[tokio::test]
    async fn steering_max_jobs_admits_more() {
        let slow = Arc::new(SlowActivity::new(Duration::from_millis(40)));
        let harness = Harness::new(vec![parallelize(json!({"max_jobs": 1})), Arc::new(Invoke::default())]);
        harness.enter_at_depth(Index::root(), json!(["a", "b", "c", "d"]), 1, vec![slow.clone()]);

        harness.set_property(PARALLELIZE_MAX_JOBS, 4);
        harness.stack().resume();
        harness.wait_for(5).await;
        assert!(slow.peak() > 1);
    }
}
