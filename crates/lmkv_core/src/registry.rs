//! Per-thread active transaction registry.

use crate::transaction::TxnNode;
use crate::types::TransactionId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

#[derive(Debug)]
struct Entry {
    id: TransactionId,
    node: Weak<TxnNode>,
}

/// Maps each thread to its innermost open transaction.
///
/// Entries are weak: the registry never keeps a transaction alive. Only
/// begin and finish (and the abort of a dropped transaction) write to it,
/// and each only touches the entry of the transaction's own thread.
#[derive(Debug, Default)]
pub(crate) struct ActiveRegistry {
    entries: Mutex<HashMap<ThreadId, Entry>>,
}

impl ActiveRegistry {
    pub(crate) fn get(&self, thread: ThreadId) -> Option<Arc<TxnNode>> {
        self.entries
            .lock()
            .get(&thread)
            .and_then(|entry| entry.node.upgrade())
    }

    pub(crate) fn activate(&self, thread: ThreadId, node: &Arc<TxnNode>) {
        self.entries.lock().insert(
            thread,
            Entry {
                id: node.id(),
                node: Arc::downgrade(node),
            },
        );
    }

    /// Replaces `finished` with `parent` as the thread's innermost
    /// transaction. Does nothing if `finished` is no longer registered.
    pub(crate) fn restore(
        &self,
        thread: ThreadId,
        finished: TransactionId,
        parent: Option<&Arc<TxnNode>>,
    ) {
        let mut entries = self.entries.lock();
        if entries.get(&thread).map(|entry| entry.id) != Some(finished) {
            return;
        }
        match parent {
            Some(parent) => {
                entries.insert(
                    thread,
                    Entry {
                        id: parent.id(),
                        node: Arc::downgrade(parent),
                    },
                );
            }
            None => {
                entries.remove(&thread);
            }
        }
    }

    /// Number of threads with a live registered transaction.
    pub(crate) fn len(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.node.strong_count() > 0)
            .count()
    }
}
