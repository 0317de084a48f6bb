//! Domain model: ids, indices, tokens, failure values, states, events.

pub mod errors;
pub mod events;
pub mod ids;
pub mod index;
pub mod spec;
pub mod state;
pub mod token;

pub use errors::{ActivityError, ErrorDocument, ErrorKind, FailurePayload};
pub use events::{ProvenanceEvent, ProvenanceKind};
pub use ids::{ListenerId, ReferenceId, RunId};
pub use index::Index;
pub use spec::{PortSet, PortSpec};
pub use state::{JobState, ProcessorStatus, RunState};
pub use token::{DataRef, ProcessId, RefKind, Token};
