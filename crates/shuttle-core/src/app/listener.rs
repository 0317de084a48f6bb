//! Result and failure listeners of a run.

use std::sync::{Arc, Mutex};

use crate::domain::{FailurePayload, ListenerId, RunState, Token};
use crate::sync::lock;

/// Receives every token that reaches a workflow output port.
///
/// Called from worker threads, possibly concurrently for different ports.
/// Implementations must be quick and must not block.
pub trait ResultListener: Send + Sync {
    fn result_token(&self, port: &str, token: &Token);

    fn run_state_changed(&self, state: RunState) {
        let _ = state;
    }
}

/// Receives the fatal failure that ended a run.
pub trait FailureListener: Send + Sync {
    fn run_failed(&self, processor: &str, failure: &FailurePayload);
}

/// Copy-on-notify listener list: notification iterates a snapshot, so
/// listeners may be added or removed at any time, even from a callback.
pub(crate) struct ListenerSet<L: ?Sized> {
    entries: Mutex<Vec<(ListenerId, Arc<L>)>>,
}

impl<L: ?Sized> ListenerSet<L> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, listener: Arc<L>) -> ListenerId {
        let id = ListenerId::generate();
        lock(&self.entries).push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<L>> {
        lock(&self.entries).iter().map(|(_, l)| Arc::clone(l)).collect()
    }
}

/// Listener that keeps everything it is told. Useful for tests, demos and
/// small embeddings that just want the results at the end.
#[derive(Debug, Default)]
pub struct CollectingListener {
    tokens: Mutex<Vec<(String, Token)>>,
    states: Mutex<Vec<RunState>>,
    failures: Mutex<Vec<(String, FailurePayload)>>,
}

impl CollectingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every token received, in arrival order.
    pub fn tokens(&self) -> Vec<(String, Token)> {
        lock(&self.tokens).clone()
    }

    /// Non-completion tokens on `port`, sorted by index.
    pub fn items(&self, port: &str) -> Vec<Token> {
        let mut items: Vec<Token> = lock(&self.tokens)
            .iter()
            .filter(|(p, t)| p == port && !t.is_completion())
            .map(|(_, t)| t.clone())
            .collect();
        items.sort_by(|a, b| a.index().cmp(b.index()));
        items
    }

    /// The token with the shortest index on `port`, preferring completions.
    pub fn final_token(&self, port: &str) -> Option<Token> {
        lock(&self.tokens)
            .iter()
            .filter(|(p, _)| p == port)
            .map(|(_, t)| t)
            .min_by_key(|t| (t.index().len(), !t.is_completion()))
            .cloned()
    }

    pub fn states(&self) -> Vec<RunState> {
        lock(&self.states).clone()
    }

    pub fn failures(&self) -> Vec<(String, FailurePayload)> {
        lock(&self.failures).clone()
    }
}

impl ResultListener for CollectingListener {
    fn result_token(&self, port: &str, token: &Token) {
        lock(&self.tokens).push((port.to_string(), token.clone()));
    }

    fn run_state_changed(&self, state: RunState) {
        lock(&self.states).push(state);
    }
}

impl FailureListener for CollectingListener {
    fn run_failed(&self, processor: &str, failure: &FailurePayload) {
        lock(&self.failures).push((processor.to_string(), failure.clone()));
    }
}
