//! shuttle-core
//!
//! Dispatch engine for dataflow workflows: every processor pushes its jobs
//! through a configurable stack of layers (parallelism, error handling,
//! failover, retry) before the activity itself is invoked.
//!
//! # Modules
//! - **domain**: ids, indices, tokens, failure values, states, provenance events
//! - **ports**: interfaces to the outside world (Activity, ReferenceService, TaskExecutor, ...)
//! - **dispatch**: the dispatch stack, its layers and the layer registry
//! - **app**: workflow builder, run instance, listeners, reports
//! - **monitor**: monitorable and steerable layer properties
//! - **impls**: in-memory and tokio-backed port implementations

pub mod app;
pub mod context;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod impls;
pub mod monitor;
pub mod ports;

mod sync;

#[cfg(test)]
mod test_support;

pub use app::{RunEnvironment, WorkflowBuilder, WorkflowInstance};
pub use dispatch::{LayerRegistry, StackConfig};
pub use error::ShuttleError;
