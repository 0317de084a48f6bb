use thiserror::Error;

use crate::domain::{Index, ReferenceId, RunState};

/// Invalid workflow or stack configuration. Always raised before a run
/// starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown layer kind '{0}'")]
    UnknownLayer(String),

    #[error("layer kind '{0}' is already registered")]
    DuplicateLayerKind(String),

    #[error("invalid configuration for layer '{layer}': {source}")]
    InvalidLayerConfig {
        layer: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("layer '{layer}': {reason}")]
    InvalidLayerValue { layer: String, reason: String },

    #[error("dispatch stack is empty")]
    EmptyStack,

    #[error("dispatch stack has no terminal layer")]
    NoTerminalLayer,

    #[error("dispatch stack has {0} terminal layers, expected exactly one")]
    MultipleTerminalLayers(usize),

    #[error("terminal layer '{0}' must be the last layer of the stack")]
    TerminalNotLast(String),

    #[error("duplicate {kind} name '{name}'")]
    DuplicateName { kind: &'static str, name: String },

    #[error("processor '{0}' has no activity")]
    NoActivity(String),

    #[error("unknown port '{port}' on {owner}")]
    UnknownPort { owner: String, port: String },

    #[error("unknown processor '{0}'")]
    UnknownProcessor(String),

    #[error("input port '{port}' of {owner} is not linked")]
    UnlinkedPort { owner: String, port: String },

    #[error("input port '{port}' of {owner} has more than one incoming link")]
    MultipleLinks { owner: String, port: String },

    #[error("processor '{0}' is part of a cycle")]
    Cycle(String),
}

/// A `push_data` call that would break the index invariants of a port.
/// The run stays valid; only the offending token is rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenOrderViolation {
    #[error("unknown workflow input port '{0}'")]
    UnknownPort(String),

    #[error("index {index} already delivered on port '{port}'")]
    DuplicateIndex { port: String, index: Index },

    #[error("index {index} on port '{port}' is not after previously delivered {previous}")]
    OutOfOrder {
        port: String,
        index: Index,
        previous: Index,
    },

    #[error("index {index} on port '{port}' falls under already closed prefix {closed}")]
    AfterCompletion {
        port: String,
        index: Index,
        closed: Index,
    },

    #[error("completion at {index} on port '{port}' has no delivered children")]
    EmptyCompletion { port: String, index: Index },

    #[error(
        "token on port '{port}' at {index} has depth {actual}, port needs {expected} \
         (index length + data depth)"
    )]
    DepthMismatch {
        port: String,
        index: Index,
        expected: usize,
        actual: usize,
    },
}

/// Lifecycle misuse of a facade.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunStateError {
    #[error("run already started")]
    AlreadyStarted,

    #[error("run is {0}")]
    Terminated(RunState),

    #[error("run is not paused")]
    NotPaused,

    #[error("run is {0}, not running")]
    NotRunning(RunState),
}

/// Failure reported by the reference collaborator.
#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("reference {0} not found")]
    NotFound(ReferenceId),

    #[error("reference {0} is not a list")]
    NotAList(ReferenceId),

    #[error("value at depth {depth} is not a list")]
    DepthMismatch { depth: usize },

    #[error("reference {id} resolves to an error: {message}")]
    ErrorValue { id: ReferenceId, message: String },

    #[error("reference store: {0}")]
    Other(String),
}

/// Reading or steering a monitored property.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MonitorError {
    #[error("no property '{property}' on processor '{processor}'")]
    UnknownProperty { processor: String, property: String },

    #[error("property '{0}' is read-only")]
    NotSteerable(String),

    #[error("invalid value {value} for '{property}'")]
    InvalidValue { property: String, value: u64 },
}

#[derive(Debug, Error)]
pub enum ShuttleError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    TokenOrder(#[from] TokenOrderViolation),

    #[error(transparent)]
    RunState(#[from] RunStateError),

    #[error(transparent)]
    Reference(#[from] ReferenceError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error("executor unavailable: {0}")]
    Executor(String),
}
