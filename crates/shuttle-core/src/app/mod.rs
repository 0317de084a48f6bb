//! App: workflow definition and the per-run facade.
//!
//! - **WorkflowBuilder**: declares and validates a workflow
//! - **WorkflowInstance**: one run; push data, listen, pause, cancel, steer
//! - **RunReport**: fixed-width status table of a run

pub mod builder;
pub mod instance;
pub mod listener;
mod ordering;
mod processor;
pub mod report;

pub use self::builder::{Link, ProcessorDef, ProcessorPlan, Sink, Source, Workflow, WorkflowBuilder};
pub use self::instance::{RunEnvironment, WorkflowInstance};
pub use self::listener::{CollectingListener, FailureListener, ResultListener};
pub use self::report::{ProcessorStats, ReportRow, RunReport};
