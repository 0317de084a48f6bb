//! shuttle demo
//!
//! Runs a one-processor workflow over a list of words. The activity
//! upper-cases each word and fails transiently for its first few calls, so
//! the parallelize and retry layers have something to do.
//!
//! Usage:
//!   cargo run -p shuttle-cli -- --items 5 --concurrency 2 --fail-first 2

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use serde_json::{Value, json};
use tracing::info;

use shuttle_core::app::{FailureListener, ProcessorDef, ResultListener, Sink, Source};
use shuttle_core::context::InvocationContext;
use shuttle_core::domain::{ActivityError, FailurePayload, RunState, Token};
use shuttle_core::impls::{InMemoryReferenceService, TokioExecutor, TracingProvenance};
use shuttle_core::ports::{Activity, ActivityInputs, ActivityOutputs, ReferenceService};
use shuttle_core::{LayerRegistry, RunEnvironment, StackConfig, WorkflowBuilder, WorkflowInstance};

#[derive(Parser, Debug)]
#[command(name = "shuttle")]
#[command(about = "Run a demo workflow through the dispatch stack")]
struct Args {
    /// Number of words to push through the workflow
    #[arg(long, default_value_t = 5)]
    items: usize,

    /// Jobs the parallelize layer keeps in flight
    #[arg(long, env = "SHUTTLE_CONCURRENCY", default_value_t = 2)]
    concurrency: usize,

    /// Calls that fail transiently before the activity starts succeeding
    #[arg(long, default_value_t = 2)]
    fail_first: u32,

    /// Retries per job after the first attempt
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// Delay before the first retry, doubled per attempt
    #[arg(long, default_value_t = 100)]
    backoff_ms: u64,

    /// Workers in the shared executor
    #[arg(long, env = "SHUTTLE_WORKERS", default_value_t = 8)]
    workers: usize,
}

struct Shout {
    remaining_failures: AtomicU32,
}

impl Shout {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl Activity for Shout {
    fn name(&self) -> &str {
        "shout"
    }

    async fn invoke(
        &self,
        inputs: ActivityInputs,
        _context: &InvocationContext,
    ) -> Result<ActivityOutputs, ActivityError> {
        let word = inputs
            .get("word")
            .and_then(Value::as_str)
            .ok_or_else(|| ActivityError::permanent("input 'word' is not a string"))?;

        let claimed = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if let Ok(left) = claimed {
            return Err(ActivityError::transient(format!("intentional failure (left={left})")));
        }

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        Ok(BTreeMap::from([("loud".to_string(), json!(word.to_uppercase()))]))
    }
}

/// Prints every token that reaches a workflow output.
struct Printer {
    references: Arc<InMemoryReferenceService>,
}

impl ResultListener for Printer {
    fn result_token(&self, port: &str, token: &Token) {
        let shown = match self.references.resolve(token.data()) {
            Ok(value) => value.to_string(),
            Err(e) => format!("<{e}>"),
        };
        let tag = if token.is_completion() { "final" } else { "item" };
        println!("{port}[{}] {tag}: {shown}", token.index());
    }

    fn run_state_changed(&self, state: RunState) {
        info!(%state, "run state changed");
    }
}

impl FailureListener for Printer {
    fn run_failed(&self, processor: &str, failure: &FailurePayload) {
        eprintln!("run failed in {processor}: {}", failure.message);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let stack = StackConfig::default_stack()
        .configure("parallelize", json!({ "max_jobs": args.concurrency }))
        .configure(
            "retry",
            json!({
                "max_retries": args.max_retries,
                "initial_delay_ms": args.backoff_ms,
            }),
        );
    let workflow = WorkflowBuilder::new("shout-demo")
        .input("words", 1)
        .output("shouted", 1)
        .processor(
            ProcessorDef::new("shout")
                .input("word", 0)
                .output("loud", 0)
                .activity(Arc::new(Shout::new(args.fail_first)))
                .stack(stack),
        )
        .link(Source::input("words"), Sink::input("shout", "word"))
        .link(Source::output("shout", "loud"), Sink::output("shouted"))
        .build(&LayerRegistry::with_builtin())
        .context("invalid demo workflow")?;

    let references = Arc::new(InMemoryReferenceService::new());
    let executor = Arc::new(TokioExecutor::from_current(args.workers)?);
    let env = RunEnvironment::new(references.clone(), executor)
        .with_provenance(Arc::new(TracingProvenance));
    let run = WorkflowInstance::new(Arc::new(workflow), env)?;
    info!(run_id = %run.run_id(), "run created");

    let printer = Arc::new(Printer {
        references: references.clone(),
    });
    run.add_result_listener(printer.clone());
    run.add_failure_listener(printer);

    let words: Vec<Value> = (0..args.items).map(|i| json!(format!("word-{i}"))).collect();
    run.push_value("words", Value::Array(words))?;

    let state = run.wait().await;
    println!();
    print!("{}", run.report());

    if state != RunState::Completed {
        anyhow::bail!("run ended {state}");
    }
    Ok(())
}
