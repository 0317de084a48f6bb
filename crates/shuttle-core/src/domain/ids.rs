//! Strongly-typed identifiers.
//!
//! All ids are ULIDs wrapped in `Id<T>`, where `T` is a zero-sized marker
//! type. The marker only exists at compile time, so a `RunId` can never be
//! passed where a `ReferenceId` is expected, while every id shares one
//! implementation of ordering, hashing, serde and `Display`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Marker trait for id kinds. Supplies the `Display` prefix.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID-backed identifier.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    /// Fresh id from the current time and thread-local randomness.
    pub fn generate() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

// ========================================
// Markers
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Run {}

impl IdMarker for Run {
    fn prefix() -> &'static str {
        "run-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reference {}

impl IdMarker for Reference {
    fn prefix() -> &'static str {
        "ref-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Listener {}

impl IdMarker for Listener {
    fn prefix() -> &'static str {
        "listener-"
    }
}

// ========================================
// Aliases
// ========================================

/// Identifier of one workflow run (one facade).
pub type RunId = Id<Run>;

/// Identifier of a value held by the reference collaborator.
pub type ReferenceId = Id<Reference>;

/// Handle returned when a listener is registered on a facade.
pub type ListenerId = Id<Listener>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_marker_prefix() {
        let run = RunId::generate();
        let reference = ReferenceId::generate();
        let listener = ListenerId::generate();

        assert!(run.to_string().starts_with("run-"));
        assert!(reference.to_string().starts_with("ref-"));
        assert!(listener.to_string().starts_with("listener-"));
    }

    #[test]
    fn ids_sort_by_creation_time() {
        let first = RunId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = RunId::generate();
        assert!(first < second);
    }

    #[test]
    fn phantom_marker_is_zero_sized() {
        assert_eq!(std::mem::size_of::<RunId>(), std::mem::size_of::<Ulid>());
    }

    #[test]
    fn ids_survive_json() {
        let id = ReferenceId::generate();
        let json = serde_json::to_string(&id).unwrap();
        let back: ReferenceId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
