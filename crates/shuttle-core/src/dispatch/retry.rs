//! Retry: re-dispatch a failed job after a backoff delay.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::config::parse_config;
use super::events::{Job, JobFailure, JobResult};
use super::layer::DispatchLayer;
use super::stack::Hop;
use crate::domain::{Index, ProvenanceEvent, ProvenanceKind};
use crate::error::ConfigError;
use crate::monitor::{Counter, MonitorableProperty, RETRY_TOTAL_RETRIES};
use crate::ports::TaskHandle;
use crate::sync::lock;

pub const KIND: &str = "retry";

/// Which failures are worth another attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOn {
    #[default]
    Any,
    TransientOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Extra attempts after the first. Zero disables retrying.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    /// Multiplier applied per attempt. 1.0 gives a constant delay.
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    /// Up to this fraction of the delay is added at random.
    pub jitter: f64,
    pub retry_on: RetryOn,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay_ms: 1000,
            backoff_factor: 2.0,
            max_delay_ms: 60_000,
            jitter: 0.0,
            retry_on: RetryOn::Any,
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let reason = if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            "backoff_factor must be a finite number >= 1.0"
        } else if !(0.0..=1.0).contains(&self.jitter) {
            "jitter must be between 0.0 and 1.0"
        } else if self.max_delay_ms < self.initial_delay_ms {
            "max_delay_ms must not be below initial_delay_ms"
        } else {
            return Ok(());
        };
        Err(ConfigError::InvalidLayerValue {
            layer: KIND.to_string(),
            reason: reason.to_string(),
        })
    }

    /// Delay before retry number `attempt` (1-based), before jitter:
    /// `initial * factor^(attempt - 1)`, capped at `max_delay_ms`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial_delay_ms as f64 * self.backoff_factor.powi(exponent);
        Duration::from_millis(millis.min(self.max_delay_ms as f64) as u64)
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
        delay + delay.mul_f64(extra)
    }
}

struct Attempt {
    job: Job,
    retries: u32,
}

pub struct Retry {
    config: RetryConfig,
    attempts: Mutex<HashMap<Index, Attempt>>,
    scheduled: Mutex<Vec<TaskHandle>>,
    cancelled: AtomicBool,
    total_retries: Arc<Counter>,
}

impl Retry {
    pub fn new(config: RetryConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            attempts: Mutex::new(HashMap::new()),
            scheduled: Mutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
            total_retries: Counter::new(RETRY_TOTAL_RETRIES),
        })
    }

    pub fn from_config(config: &Value) -> Result<Arc<dyn DispatchLayer>, ConfigError> {
        Ok(Arc::new(Self::new(parse_config(KIND, config)?)?))
    }

    /// Decide whether `failure` earns another attempt. Returns the job to
    /// resend and the retry number.
    fn plan(&self, failure: &JobFailure, hop: &Hop) -> Option<(Job, u32)> {
        let mut attempts = lock(&self.attempts);
        let attempt = attempts.get_mut(&failure.index)?;
        let eligible = match self.config.retry_on {
            RetryOn::Any => true,
            RetryOn::TransientOnly => failure.error.is_transient(),
        };
        let stopped = self.cancelled.load(Ordering::SeqCst) || hop.control().is_cancelled();
        if stopped || !eligible || attempt.retries >= self.config.max_retries {
            attempts.remove(&failure.index);
            return None;
        }
        attempt.retries += 1;
        Some((attempt.job.clone(), attempt.retries))
    }
}

impl DispatchLayer for Retry {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn dispatch(&self, job: Job, hop: &Hop) {
        if self.config.max_retries > 0 {
            // A fresh dispatch from above starts a fresh count.
            lock(&self.attempts).insert(
                job.index.clone(),
                Attempt {
                    job: job.clone(),
                    retries: 0,
                },
            );
        }
        hop.down(job);
    }

    fn receive_result(&self, result: JobResult, hop: &Hop) {
        lock(&self.attempts).remove(&result.index);
        hop.result_up(result);
    }

    fn receive_error(&self, failure: JobFailure, hop: &Hop) {
        let Some((job, retry)) = self.plan(&failure, hop) else {
            hop.error_up(failure);
            return;
        };

        let delay = self.config.with_jitter(self.config.next_delay(retry));
        self.total_retries.incr();
        job.context.record(
            ProvenanceEvent::new(
                ProvenanceKind::Retry,
                job.context.run_id(),
                &job.owning_process,
                &job.index,
            )
            .with_detail(format!("retry {retry} after {}ms: {}", delay.as_millis(), failure.error)),
        );
        debug!(
            index = %job.index,
            retry,
            max = self.config.max_retries,
            delay_ms = delay.as_millis() as u64,
            "scheduling retry"
        );

        let below = hop.clone();
        let task = async move {
            if !below.control().is_cancelled() {
                below.down(job);
            }
        };
        let handle = hop.executor().schedule(delay, task.boxed());
        let mut scheduled = lock(&self.scheduled);
        scheduled.retain(|h| !h.is_finished());
        scheduled.push(handle);
    }

    fn properties(&self) -> Vec<Arc<dyn MonitorableProperty>> {
        vec![self.total_retries.clone()]
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        for handle in lock(&self.scheduled).drain(..) {
            handle.abort();
        }
        lock(&self.attempts).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Invoke;
    use crate::domain::ErrorKind;
    use crate::test_support::{ExitEvent, FlakyActivity, Harness};
    use rstest::rstest;
    use serde_json::json;
    use tokio::time::Instant;

    fn retry(config: Value) -> Arc<dyn DispatchLayer> {
        Retry::from_config(&config).unwrap()
    }

    #[rstest]
    #[case::first(1, 100)]
    #[case::second(2, 200)]
    #[case::third(3, 400)]
    #[case::capped(6, 1000)]
    fn exponential_backoff_is_capped(#[case] attempt: u32, #[case] millis: u64) {
        let config = RetryConfig {
            initial_delay_ms: 100,
            backoff_factor: 2.0,
            max_delay_ms: 1000,
            ..RetryConfig::default()
        };
        assert_eq!(config.next_delay(attempt), Duration::from_millis(millis));
    }

    #[test]
    fn jitter_only_lengthens() {
        let config = RetryConfig {
            jitter: 0.5,
            ..RetryConfig::default()
        };
        for _ in 0..20 {
            let d = config.with_jitter(Duration::from_millis(100));
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(150));
        }
    }

    #[rstest]
    #[case::shrinking_backoff(json!({"backoff_factor": 0.5}))]
    #[case::jitter_out_of_range(json!({"jitter": 2.0}))]
    #[case::cap_below_initial(json!({"initial_delay_ms": 500, "max_delay_ms": 100}))]
    fn bad_values_are_rejected(#[case] config: Value) {
        assert!(matches!(
            Retry::from_config(&config),
            Err(ConfigError::InvalidLayerValue { .. })
        ));
    }

    #[tokio::test]
    async fn transient_failures_below_limit_are_invisible() {
        let flaky = Arc::new(FlakyActivity::new("flaky", 2, ErrorKind::Transient));
        let harness = Harness::new(vec![
            retry(json!({"max_retries": 2, "initial_delay_ms": 100, "backoff_factor": 1.0, "max_delay_ms": 100})),
            Arc::new(Invoke::default()),
        ]);
        let start = Instant::now();
        harness.enter(Index::root(), json!("x"), vec![flaky.clone()]);

        let events = harness.wait_for(1).await;
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert_eq!(events, vec![ExitEvent::Result(Index::root())]);
        assert_eq!(flaky.calls(), 3);
        assert_eq!(harness.property(RETRY_TOTAL_RETRIES), Some(2));
        assert_eq!(harness.provenance.count(ProvenanceKind::Retry), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_propagate_once() {
        let flaky = Arc::new(FlakyActivity::new("flaky", 10, ErrorKind::Transient));
        let harness = Harness::new(vec![
            retry(json!({"max_retries": 2, "initial_delay_ms": 5, "max_delay_ms": 20})),
            Arc::new(Invoke::default()),
        ]);
        harness.enter(Index::root(), json!("x"), vec![flaky.clone()]);

        let events = harness.wait_for(1).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(events, vec![ExitEvent::Failure(Index::root())]);
        assert_eq!(harness.events().len(), 1);
        assert_eq!(flaky.calls(), 3);
    }

    #[tokio::test]
    async fn transient_only_skips_permanent_failures() {
        let flaky = Arc::new(FlakyActivity::new("flaky", 1, ErrorKind::Permanent));
        let harness = Harness::new(vec![
            retry(json!({"max_retries": 3, "initial_delay_ms": 5, "retry_on": "transient_only"})),
            Arc::new(Invoke::default()),
        ]);
        harness.enter(Index::root(), json!("x"), vec![flaky.clone()]);

        assert_eq!(harness.wait_for(1).await, vec![ExitEvent::Failure(Index::root())]);
        assert_eq!(flaky.calls(), 1);
        assert_eq!(harness.property(RETRY_TOTAL_RETRIES), Some(0));
    }

    #[tokio::test]
    async fn attempts_are_counted_per_index() {
        let flaky = Arc::new(FlakyActivity::new("flaky", 1, ErrorKind::Transient));
        let harness = Harness::new(vec![
            retry(json!({"max_retries": 1, "initial_delay_ms": 5, "max_delay_ms": 5})),
            Arc::new(Invoke::default()),
        ]);
        // The activity fails once in total, so only the first index to run
        // needs its retry; the other succeeds directly.
        harness.enter(Index::new([0]), json!("a"), vec![flaky.clone()]);
        harness.enter(Index::new([1]), json!("b"), vec![flaky.clone()]);

        let events = harness.wait_for(2).await;
        assert!(events.iter().all(|e| matches!(e, ExitEvent::Result(_))));
        assert_eq!(flaky.calls(), 3);
    }

    #[tokio::test]
    async fn cancel_aborts_pending_retry() {
        let flaky = Arc::new(FlakyActivity::new("flaky", 1, ErrorKind::Transient));
        let harness = Harness::new(vec![
            retry(json!({"max_retries": 1, "initial_delay_ms": 50, "max_delay_ms": 50})),
            Arc::new(Invoke::default()),
        ]);
        harness.enter(Index::root(), json!("x"), vec![flaky.clone()]);
        harness.wait_until(|| flaky.calls() == 1).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        harness.stack().cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(flaky.calls(), 1);
        assert!(harness.events().is_empty());
    }
}
