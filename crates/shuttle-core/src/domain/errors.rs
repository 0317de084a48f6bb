//! Failure values carried through the dispatch stack.
//!
//! Nothing here is a Rust error returned by the engine itself; these are
//! descriptions of activity failures that travel as data, either upward as
//! a failure notification or, once translated, as an error-shaped value on
//! an output port.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::token::DataRef;

/// Operational classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retrying may succeed (timeouts, unavailable services).
    Transient,
    /// Retrying the same target will not help.
    Permanent,
}

/// What an activity reports when an invocation does not succeed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityError {
    pub kind: ErrorKind,
    pub message: String,
    /// Underlying causes, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<String>,
    /// Outputs produced before the failure, if any.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub partial_outputs: BTreeMap<String, serde_json::Value>,
}

impl ActivityError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            causes: Vec::new(),
            partial_outputs: BTreeMap::new(),
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    pub fn with_partial_output(mut self, port: impl Into<String>, value: serde_json::Value) -> Self {
        self.partial_outputs.insert(port.into(), value);
        self
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

impl fmt::Display for ActivityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)?;
        for cause in &self.causes {
            write!(f, "; caused by: {cause}")?;
        }
        Ok(())
    }
}

/// Error payload of an upward failure notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailurePayload {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<String>,
    /// Partial outputs already registered with the reference collaborator.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub partial_outputs: BTreeMap<String, DataRef>,
    /// Name of the activity that failed, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
}

impl FailurePayload {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            causes: Vec::new(),
            partial_outputs: BTreeMap::new(),
            activity: None,
        }
    }

    pub fn from_activity(activity: &str, error: &ActivityError) -> Self {
        Self {
            kind: error.kind,
            message: error.message.clone(),
            causes: error.causes.clone(),
            partial_outputs: BTreeMap::new(),
            activity: Some(activity.to_string()),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }

    /// One line per failure in the chain, starting with this one.
    pub fn stack_description(&self) -> Vec<String> {
        let head = match &self.activity {
            Some(activity) => format!("{activity}: {}", self.message),
            None => self.message.clone(),
        };
        std::iter::once(head).chain(self.causes.iter().cloned()).collect()
    }
}

impl fmt::Display for FailurePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stack_description().join("; caused by: "))
    }
}

/// Error-shaped data value placed on an output port in place of a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDocument {
    pub message: String,
    /// Human-readable chain, outermost first.
    pub stack: Vec<String>,
    /// Erroneous inputs that caused this error, when it was reflected
    /// rather than produced by a failing invocation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub erroneous_inputs: Vec<DataRef>,
    /// Outputs the failing invocation produced before it gave up, by port.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub partial_outputs: BTreeMap<String, DataRef>,
}

impl ErrorDocument {
    pub fn from_failure(failure: &FailurePayload) -> Self {
        Self {
            message: failure.message.clone(),
            stack: failure.stack_description(),
            erroneous_inputs: Vec::new(),
            partial_outputs: failure.partial_outputs.clone(),
        }
    }

    pub fn reflected(processor: &str, inputs: Vec<DataRef>) -> Self {
        Self {
            message: format!("{processor}: input contained an error"),
            stack: Vec::new(),
            erroneous_inputs: inputs,
            partial_outputs: BTreeMap::new(),
        }
    }
}
