//! InMemoryReferenceService: development and test reference store.
//!
//! Every value lives in one `RwLock<HashMap>` keyed by `ReferenceId`. Lists
//! are stored as member references, so a depth-2 value registers one list
//! per level and the leaves individually.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;

use crate::domain::{DataRef, ErrorDocument, RefKind, ReferenceId};
use crate::error::ReferenceError;
use crate::ports::ReferenceService;
use crate::sync::{read, write};

#[derive(Debug, Clone)]
enum Entry {
    Value(Value),
    List(Vec<DataRef>),
    Error(ErrorDocument),
}

#[derive(Debug, Default)]
pub struct InMemoryReferenceService {
    entries: RwLock<HashMap<ReferenceId, Entry>>,
}

impl InMemoryReferenceService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.entries).is_empty()
    }

    fn insert(&self, entry: Entry) -> ReferenceId {
        let id = ReferenceId::generate();
        write(&self.entries).insert(id, entry);
        id
    }

    fn entry(&self, id: ReferenceId) -> Result<Entry, ReferenceError> {
        read(&self.entries)
            .get(&id)
            .cloned()
            .ok_or(ReferenceError::NotFound(id))
    }
}

impl ReferenceService for InMemoryReferenceService {
    fn register(&self, value: Value, depth: usize) -> Result<DataRef, ReferenceError> {
        if depth == 0 {
            let id = self.insert(Entry::Value(value));
            return Ok(DataRef::new(id, 0, RefKind::Value, false));
        }
        let Value::Array(items) = value else {
            return Err(ReferenceError::DepthMismatch { depth });
        };
        let members = items
            .into_iter()
            .map(|item| self.register(item, depth - 1))
            .collect::<Result<Vec<_>, _>>()?;
        self.register_list(members, depth)
    }

    fn register_list(&self, members: Vec<DataRef>, depth: usize) -> Result<DataRef, ReferenceError> {
        if depth == 0 {
            return Err(ReferenceError::DepthMismatch { depth });
        }
        let contains_errors = members.iter().any(DataRef::contains_errors);
        let id = self.insert(Entry::List(members));
        Ok(DataRef::new(id, depth, RefKind::List, contains_errors))
    }

    fn register_error(&self, document: ErrorDocument, depth: usize) -> Result<DataRef, ReferenceError> {
        let id = self.insert(Entry::Error(document));
        Ok(DataRef::new(id, depth, RefKind::Error, true))
    }

    fn resolve(&self, reference: &DataRef) -> Result<Value, ReferenceError> {
        match self.entry(reference.id())? {
            Entry::Value(value) => Ok(value),
            Entry::List(members) => members
                .iter()
                .map(|member| self.resolve(member))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Entry::Error(document) => Err(ReferenceError::ErrorValue {
                id: reference.id(),
                message: document.message,
            }),
        }
    }

    fn members(&self, reference: &DataRef) -> Result<Vec<DataRef>, ReferenceError> {
        match self.entry(reference.id())? {
            Entry::List(members) => Ok(members),
            _ => Err(ReferenceError::NotAList(reference.id())),
        }
    }

    fn error_document(&self, reference: &DataRef) -> Result<ErrorDocument, ReferenceError> {
        match self.entry(reference.id())? {
            Entry::Error(document) => Ok(document),
            _ => Err(ReferenceError::Other(format!(
                "reference {} is not an error",
                reference.id()
            ))),
        }
    }
}
