//! Dispatch stack: the per-processor pipeline between a job and the
//! activity call.
//!
//! - `layer`: the `DispatchLayer` trait every stage implements
//! - `stack`: assembly, routing (`Hop`) and completion tracking
//! - `config` / `registry`: declarative stack configuration and the
//!   registry that turns it into layer instances
//! - the built-in layers: `parallelize`, `error_bounce`, `failover`,
//!   `retry`, `invoke`

pub mod config;
pub mod control;
pub mod error_bounce;
pub mod events;
pub mod failover;
pub mod invoke;
pub mod layer;
pub mod parallelize;
pub mod registry;
pub mod retry;
pub mod stack;

pub use self::config::{LayerSpec, StackConfig};
pub use self::control::RunControl;
pub use self::error_bounce::{ErrorBounce, ErrorBounceConfig};
pub use self::events::{Completion, Job, JobFailure, JobResult};
pub use self::failover::{Failover, FailoverConfig};
pub use self::invoke::{Invoke, InvokeConfig};
pub use self::layer::DispatchLayer;
pub use self::parallelize::{IterationStrategy, Parallelize, ParallelizeConfig};
pub use self::registry::{LayerFactory, LayerRegistry, StackTemplate};
pub use self::retry::{Retry, RetryConfig, RetryOn};
pub use self::stack::{DispatchStack, Hop, ProcessorInfo, StackEnv, StackExit, StackLayers};
