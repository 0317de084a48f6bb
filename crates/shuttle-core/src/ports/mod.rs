//! Ports: the narrow interfaces the engine needs from the outside world.
//!
//! - `Activity`: the service a processor calls
//! - `ReferenceService`: storage and dereferencing of data values
//! - `ProvenanceSink`: optional lineage events
//! - `TaskExecutor`: shared, bounded submission of async work
//! - `Clock`: wall-clock time for reports

pub mod activity;
pub mod clock;
pub mod executor;
pub mod provenance;
pub mod reference;

pub use self::activity::{Activity, ActivityInputs, ActivityOutputs, FnActivity};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::executor::{BoxTask, TaskExecutor, TaskHandle};
pub use self::provenance::ProvenanceSink;
pub use self::reference::ReferenceService;
