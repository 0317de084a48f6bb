//! Index bookkeeping for tokens pushed into workflow input ports.

use std::collections::{BTreeMap, BTreeSet};

use crate::domain::{Index, PortSpec, Token};
use crate::error::TokenOrderViolation;

#[derive(Debug, Default)]
struct PortLedger {
    depth: usize,
    data: BTreeSet<Index>,
    completions: BTreeSet<Index>,
    last: Option<Index>,
}

impl PortLedger {
    fn delivered(&self, index: &Index) -> bool {
        self.data.contains(index) || self.completions.contains(index)
    }

    /// A completion or data leaf at `index` or above it.
    fn closed_above(&self, index: &Index) -> Option<Index> {
        (0..index.len())
            .map(|n| Index::new(&index.positions()[..n]))
            .find(|prefix| self.completions.contains(prefix) || self.data.contains(prefix))
    }

    fn has_data_under(&self, prefix: &Index) -> bool {
        self.data
            .range(prefix.clone()..)
            .next()
            .is_some_and(|index| prefix.is_strict_prefix_of(index))
    }
}

/// Per-port record of what has been delivered. Rejects a token before it
/// reaches any processor, leaving the run untouched.
#[derive(Debug, Default)]
pub(crate) struct InputLedger {
    ports: BTreeMap<String, PortLedger>,
}

impl InputLedger {
    pub(crate) fn new(inputs: &[PortSpec]) -> Self {
        let ports = inputs
            .iter()
            .map(|port| {
                let ledger = PortLedger {
                    depth: port.depth,
                    ..PortLedger::default()
                };
                (port.name.clone(), ledger)
            })
            .collect();
        Self { ports }
    }

    /// Validate `token` for `port` and record it. Returns true when the
    /// token closes the port at the root, so nothing more may follow.
    pub(crate) fn admit(&mut self, port: &str, token: &Token) -> Result<bool, TokenOrderViolation> {
        let ledger = self
            .ports
            .get_mut(port)
            .ok_or_else(|| TokenOrderViolation::UnknownPort(port.to_string()))?;
        let index = token.index();

        let actual = index.len() + token.data().depth();
        if actual != ledger.depth {
            return Err(TokenOrderViolation::DepthMismatch {
                port: port.to_string(),
                index: index.clone(),
                expected: ledger.depth,
                actual,
            });
        }
        if ledger.delivered(index) {
            return Err(TokenOrderViolation::DuplicateIndex {
                port: port.to_string(),
                index: index.clone(),
            });
        }
        if let Some(closed) = ledger.closed_above(index) {
            return Err(TokenOrderViolation::AfterCompletion {
                port: port.to_string(),
                index: index.clone(),
                closed,
            });
        }

        if token.is_completion() {
            if !ledger.has_data_under(index) {
                return Err(TokenOrderViolation::EmptyCompletion {
                    port: port.to_string(),
                    index: index.clone(),
                });
            }
            ledger.completions.insert(index.clone());
        } else {
            if let Some(previous) = ledger.last.as_ref().filter(|previous| index <= *previous) {
                return Err(TokenOrderViolation::OutOfOrder {
                    port: port.to_string(),
                    index: index.clone(),
                    previous: previous.clone(),
                });
            }
            ledger.data.insert(index.clone());
            ledger.last = Some(index.clone());
        }
        Ok(index.is_root())
    }
}
