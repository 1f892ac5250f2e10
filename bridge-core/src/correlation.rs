//! Correlation table: live request ids → per-request state owned by the host (waiter, timer).
//!
//! Not synchronized. The host wraps it in a lock when registration, delivery and timeout run on
//! different threads. Every terminal transition goes through `take` or `drain`, so an id leaves
//! the table exactly once.

use std::collections::HashMap;

use crate::protocol::CorrelationId;

pub struct CorrelationTable<P> {
    entries: HashMap<CorrelationId, P>,
}

impl<P> CorrelationTable<P> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Add a live entry. A live duplicate id is refused and the table is left unchanged.
    pub fn register(&mut self, id: CorrelationId, pending: P) -> Result<(), RegisterError> {
        if self.entries.contains_key(&id) {
            return Err(RegisterError::DuplicateId(id));
        }
        self.entries.insert(id, pending);
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&P> {
        self.entries.get(id)
    }

    /// Remove and return the entry. `None` if never registered or already terminal.
    pub fn take(&mut self, id: &str) -> Option<P> {
        self.entries.remove(id)
    }

    /// Remove every entry (disconnect flush).
    pub fn drain(&mut self) -> Vec<(CorrelationId, P)> {
        self.entries.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<P> Default for CorrelationTable<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("correlation id {0} is already pending")]
    DuplicateId(CorrelationId),
}
