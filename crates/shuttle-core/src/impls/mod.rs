//! Port implementations for development and tests.
//!
//! - `InMemoryReferenceService`: reference store over a `HashMap`
//! - `TokioExecutor`: semaphore-bounded pool on the tokio runtime
//! - `RecordingProvenance` / `TracingProvenance`: provenance sinks

pub mod inmem_reference;
pub mod recording_provenance;
pub mod tokio_executor;

pub use self::inmem_reference::InMemoryReferenceService;
pub use self::recording_provenance::{RecordingProvenance, TracingProvenance};
pub use self::tokio_executor::{DEFAULT_WORKERS, TokioExecutor};
