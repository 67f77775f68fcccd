//! Property-based test generators using proptest.
//!
//! Provides strategies for keys, values and sequences of transactional
//! operations, plus a reference model to check them against.

use proptest::prelude::*;
use std::collections::BTreeMap;

/// Strategy for keys within the engine's size limit.
pub fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..32)
}

/// Strategy for small values.
pub fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..64)
}

/// Strategy for database names.
pub fn database_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("Invalid regex")
}

/// One step of a nested transaction workload.
#[derive(Debug, Clone)]
pub enum TxnOp {
    /// Store a record in the innermost transaction.
    Put(Vec<u8>, Vec<u8>),
    /// Delete a key in the innermost transaction.
    Delete(Vec<u8>),
    /// Begin a nested transaction.
    Begin,
    /// Commit the innermost transaction.
    Commit,
    /// Abort the innermost transaction.
    Abort,
}

/// Strategy for operation sequences over a small key space, so that
/// overwrites and deletes of existing keys are common.
pub fn txn_ops_strategy(max_len: usize) -> impl Strategy<Value = Vec<TxnOp>> {
    let key = prop::collection::vec(0u8..8, 1..2);
    let op = prop_oneof![
        4 => (key.clone(), value_strategy()).prop_map(|(k, v)| TxnOp::Put(k, v)),
        2 => key.prop_map(TxnOp::Delete),
        2 => Just(TxnOp::Begin),
        1 => Just(TxnOp::Commit),
        1 => Just(TxnOp::Abort),
    ];
    prop::collection::vec(op, 0..max_len)
}

/// Reference model of nested transactions over one table.
///
/// Each level holds a full copy of the data as seen by that transaction;
/// level 0 is the committed state.
#[derive(Debug, Clone, Default)]
pub struct NestedModel {
    levels: Vec<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl NestedModel {
    /// Creates a model with an empty committed state.
    pub fn new() -> Self {
        Self {
            levels: vec![BTreeMap::new()],
        }
    }

    /// Number of open transactions.
    pub fn depth(&self) -> usize {
        self.levels.len() - 1
    }

    fn top(&mut self) -> &mut BTreeMap<Vec<u8>, Vec<u8>> {
        let last = self.levels.len() - 1;
        &mut self.levels[last]
    }

    /// Opens a transaction.
    pub fn begin(&mut self) {
        let snapshot = self.levels[self.levels.len() - 1].clone();
        self.levels.push(snapshot);
    }

    /// Stores a record in the innermost transaction.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.top().insert(key.to_vec(), value.to_vec());
    }

    /// Deletes a key in the innermost transaction; returns whether it existed.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        self.top().remove(key).is_some()
    }

    /// Commits the innermost transaction into its parent.
    pub fn commit(&mut self) {
        if self.depth() > 0 {
            if let Some(top) = self.levels.pop() {
                *self.top() = top;
            }
        }
    }

    /// Discards the innermost transaction.
    pub fn abort(&mut self) {
        if self.depth() > 0 {
            self.levels.pop();
        }
    }

    /// Data visible to the innermost transaction.
    pub fn visible(&self) -> &BTreeMap<Vec<u8>, Vec<u8>> {
        &self.levels[self.levels.len() - 1]
    }

    /// Committed data.
    pub fn committed(&self) -> &BTreeMap<Vec<u8>, Vec<u8>> {
        &self.levels[0]
    }
}
