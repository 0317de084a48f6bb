//! Reference collaborator port: storage and dereferencing of data values.
//!
//! The engine moves `DataRef`s around and asks this service to create or
//! open them. Values are opaque `serde_json::Value`s as far as the engine is
//! concerned; only activities look inside.

use crate::domain::{DataRef, ErrorDocument};
use crate::error::ReferenceError;

pub trait ReferenceService: Send + Sync {
    /// Store `value` as a collection of the given depth. At depth > 0 the
    /// value must be nested arrays at least `depth` deep; each level is
    /// registered as a list of member references.
    fn register(&self, value: serde_json::Value, depth: usize) -> Result<DataRef, ReferenceError>;

    /// Store a list whose members are already registered.
    fn register_list(&self, members: Vec<DataRef>, depth: usize) -> Result<DataRef, ReferenceError>;

    /// Store an error-shaped value at `depth`.
    fn register_error(&self, document: ErrorDocument, depth: usize) -> Result<DataRef, ReferenceError>;

    /// Materialize the full value behind `reference`. Fails if the value
    /// is, or contains, an error.
    fn resolve(&self, reference: &DataRef) -> Result<serde_json::Value, ReferenceError>;

    /// Direct members of a list reference, in order.
    fn members(&self, reference: &DataRef) -> Result<Vec<DataRef>, ReferenceError>;

    /// The error document behind an error reference.
    fn error_document(&self, reference: &DataRef) -> Result<ErrorDocument, ReferenceError>;

    fn depth_of(&self, reference: &DataRef) -> usize {
        reference.depth()
    }
}
