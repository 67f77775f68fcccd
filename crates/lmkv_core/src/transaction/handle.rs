//! Transaction handles and their lifecycle.

use super::state::TransactionState;
use crate::cursor::{Cursor, CursorShared};
use crate::database::Database;
use crate::environment::Environment;
use crate::error::{CoreError, CoreResult};
use crate::implicit::finish_with;
use crate::interrupt::InterruptSignal;
use crate::types::TransactionId;
use lmkv_engine::{TxnFlags, TxnHandle, WriteFlags};
use parking_lot::Mutex;
use std::fmt;
use std::mem;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use tracing::{debug, trace};

struct TxnInner {
    state: TransactionState,
    /// Present exactly while the state is `Open`.
    handle: Option<TxnHandle>,
    cursors: Vec<Weak<CursorShared>>,
}

impl TxnInner {
    /// Moves to `outcome`, handing back the engine handle and the cursors
    /// that still need closing. Returns `None` if already terminal.
    fn terminate(
        &mut self,
        outcome: TransactionState,
    ) -> Option<(TxnHandle, Vec<Weak<CursorShared>>)> {
        if self.state.is_terminal() {
            return None;
        }
        self.state = outcome;
        let handle = self.handle.take()?;
        Some((handle, mem::take(&mut self.cursors)))
    }
}

pub(crate) struct TxnNode {
    id: TransactionId,
    env: Environment,
    parent: Option<Transaction>,
    thread: ThreadId,
    read_only: bool,
    inner: Mutex<TxnInner>,
}

impl TxnNode {
    pub(crate) fn id(&self) -> TransactionId {
        self.id
    }

    fn parent_node(&self) -> Option<&Arc<TxnNode>> {
        self.parent.as_ref().map(|parent| &parent.node)
    }
}

impl fmt::Debug for TxnNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxnNode")
            .field("id", &self.id)
            .field("parent", &self.parent.as_ref().map(Transaction::id))
            .field("thread", &self.thread)
            .field("read_only", &self.read_only)
            .field("state", &self.inner.lock().state)
            .finish()
    }
}

impl Drop for TxnNode {
    fn drop(&mut self) {
        let Some((handle, _)) = self.inner.get_mut().terminate(TransactionState::Aborted) else {
            return;
        };
        // Cursors hold a handle to their transaction, so none are alive.
        self.env.engine().txn_abort(handle);
        // This may run on another thread than `self.thread`. The entry is
        // only touched if it still names this transaction, and an open
        // child would hold a handle to it, so nothing nested is lost.
        self.env
            .registry()
            .restore(self.thread, self.id, self.parent_node());
        self.env.track_finish();
        debug!(txn = %self.id, "dropped open transaction aborted");
    }
}

fn close_cursors(cursors: Vec<Weak<CursorShared>>) {
    for cursor in cursors.iter().filter_map(Weak::upgrade) {
        cursor.release();
    }
}

/// A transaction handle.
///
/// Cloning is cheap and yields another handle to the same transaction. A
/// transaction is bound to the thread that began it; using it from any
/// other thread fails with `WrongThread`. When the last handle to an open
/// transaction is dropped, the transaction is aborted.
///
/// Nested transactions form a chain per thread. Only the innermost open
/// transaction accepts data operations and new children; committing or
/// aborting an outer transaction finishes every open transaction nested
/// inside it first.
#[derive(Clone)]
pub struct Transaction {
    node: Arc<TxnNode>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.node, f)
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }
}

impl Eq for Transaction {}

impl Transaction {
    pub(crate) fn from_node(node: Arc<TxnNode>) -> Self {
        Self { node }
    }

    /// Begins a transaction on `env`, nested under `parent` if given, and
    /// makes it the calling thread's active transaction.
    pub(crate) fn begin(
        env: &Environment,
        parent: Option<&Transaction>,
        read_only: bool,
        signal: Option<&InterruptSignal>,
    ) -> CoreResult<Self> {
        env.ensure_open()?;
        let read_only = read_only || env.config().flags.read_only;
        let parent_handle = match parent {
            Some(parent) => {
                if !parent.node.env.same_as(env) {
                    return Err(CoreError::EnvironmentMismatch);
                }
                Some(parent.handle_for_op()?)
            }
            None => None,
        };
        let flags = if read_only {
            TxnFlags::READ_ONLY
        } else {
            TxnFlags::READ_WRITE
        };

        let handle = env.engine_begin(parent_handle, flags, signal)?;
        if let Err(err) = env.track_begin() {
            env.engine().txn_abort(handle);
            return Err(err);
        }

        let thread = thread::current().id();
        let node = Arc::new(TxnNode {
            id: env.next_transaction_id(),
            env: env.clone(),
            parent: parent.cloned(),
            thread,
            read_only,
            inner: Mutex::new(TxnInner {
                state: TransactionState::Open,
                handle: Some(handle),
                cursors: Vec::new(),
            }),
        });
        env.registry().activate(thread, &node);
        debug!(
            txn = %node.id,
            parent = ?parent.map(Transaction::id),
            read_only,
            "transaction started"
        );
        Ok(Self { node })
    }

    /// Begins a read-write transaction nested inside this one.
    ///
    /// # Errors
    ///
    /// Fails with `TransactionNotActive` unless this is the innermost
    /// active transaction of the calling thread. The engine rejects
    /// children of read-only transactions with `InvalidArgument`.
    pub fn begin_nested(&self) -> CoreResult<Transaction> {
        Self::begin(&self.node.env, Some(self), false, None)
    }

    /// Runs `f` in a nested transaction, committing it if `f` succeeds and
    /// aborting it otherwise.
    pub fn transaction<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&Transaction) -> CoreResult<T>,
    {
        finish_with(self.begin_nested()?, f)
    }

    /// Commits the transaction.
    ///
    /// Open transactions nested inside this one are committed into it
    /// first. All their cursors, and this transaction's, are closed.
    ///
    /// # Errors
    ///
    /// `TransactionTerminated`, `WrongThread` or `TransactionNotActive` if
    /// the transaction cannot be finished; nothing changes in that case.
    /// If the engine commit itself fails the transaction still ends (as
    /// `Aborted`) and the engine error is returned.
    pub fn commit(&self) -> CoreResult<()> {
        self.finish(TransactionState::Committed)
    }

    /// Aborts the transaction and every transaction nested inside it.
    ///
    /// # Errors
    ///
    /// Same preconditions as [`Transaction::commit`].
    pub fn abort(&self) -> CoreResult<()> {
        self.finish(TransactionState::Aborted)
    }

    fn finish(&self, outcome: TransactionState) -> CoreResult<()> {
        let node = &self.node;
        let env = &node.env;
        env.ensure_open()?;
        self.ensure_owned()?;
        let descendants = self.open_descendants()?;

        for child in &descendants {
            let terminated = child.inner.lock().terminate(outcome);
            if let Some((_, cursors)) = terminated {
                close_cursors(cursors);
                env.track_finish();
                trace!(txn = %child.id, state = %outcome, "nested transaction finished by ancestor");
            }
        }

        let Some((handle, cursors)) = node.inner.lock().terminate(outcome) else {
            return Err(CoreError::TransactionTerminated);
        };
        close_cursors(cursors);
        let innermost = descendants.first().map_or(node.id, |child| child.id);
        env.registry()
            .restore(node.thread, innermost, node.parent_node());

        let result = match outcome {
            TransactionState::Committed => env.engine().txn_commit(handle),
            _ => {
                env.engine().txn_abort(handle);
                Ok(())
            }
        };
        env.track_finish();

        match result {
            Ok(()) => {
                debug!(txn = %node.id, state = %outcome, "transaction finished");
                Ok(())
            }
            Err(err) => {
                // The engine threw away the whole chain.
                for child in descendants.iter().chain([node]) {
                    child.inner.lock().state = TransactionState::Aborted;
                }
                debug!(txn = %node.id, error = %err, "transaction commit failed");
                Err(err.into())
            }
        }
    }

    /// Returns the parent transaction, if nested.
    #[must_use]
    pub fn parent(&self) -> Option<&Transaction> {
        self.node.parent.as_ref()
    }

    /// Returns the environment this transaction belongs to.
    #[must_use]
    pub fn environment(&self) -> &Environment {
        &self.node.env
    }

    /// Returns the transaction id.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.node.id
    }

    /// Returns true for read-only transactions.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.node.read_only
    }

    /// Returns true until the transaction is committed or aborted.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.node.inner.lock().state
    }

    /// Reads `key` from `db` in this transaction.
    pub fn get(&self, db: &Database, key: &[u8]) -> CoreResult<Option<Vec<u8>>> {
        let table = db.table_in(self.environment())?;
        let handle = self.handle_for_op()?;
        Ok(self.environment().engine().get(handle, table, key)?)
    }

    /// Stores `value` under `key` in `db`.
    pub fn put(&self, db: &Database, key: &[u8], value: &[u8]) -> CoreResult<()> {
        self.put_with(db, key, value, WriteFlags::new())
    }

    /// Stores `value` under `key` in `db` with explicit write flags.
    pub fn put_with(
        &self,
        db: &Database,
        key: &[u8],
        value: &[u8],
        flags: WriteFlags,
    ) -> CoreResult<()> {
        let table = db.table_in(self.environment())?;
        let handle = self.handle_for_op()?;
        self.environment()
            .engine()
            .put(handle, table, key, value, flags)?;
        Ok(())
    }

    /// Deletes `key` (all its values) from `db`. Returns false if absent.
    pub fn delete(&self, db: &Database, key: &[u8]) -> CoreResult<bool> {
        let table = db.table_in(self.environment())?;
        let handle = self.handle_for_op()?;
        Ok(self.environment().engine().delete(handle, table, key, None)?)
    }

    /// Deletes one `value` of `key` from a duplicate-sorted `db`.
    pub fn delete_dup(&self, db: &Database, key: &[u8], value: &[u8]) -> CoreResult<bool> {
        let table = db.table_in(self.environment())?;
        let handle = self.handle_for_op()?;
        Ok(self
            .environment()
            .engine()
            .delete(handle, table, key, Some(value))?)
    }

    /// Opens a cursor over `db` in this transaction.
    pub fn cursor(&self, db: &Database) -> CoreResult<Cursor> {
        Cursor::open(self, db)
    }

    /// Returns the engine handle after checking that this transaction may
    /// be the target of an operation from the calling thread.
    pub(crate) fn handle_for_op(&self) -> CoreResult<TxnHandle> {
        self.node.env.ensure_open()?;
        let handle = self.ensure_owned()?;
        self.ensure_innermost()?;
        Ok(handle)
    }

    pub(crate) fn register_cursor(&self, cursor: &Arc<CursorShared>) -> CoreResult<()> {
        let mut inner = self.node.inner.lock();
        if inner.state.is_terminal() {
            return Err(CoreError::TransactionTerminated);
        }
        inner.cursors.retain(|cursor| cursor.strong_count() > 0);
        inner.cursors.push(Arc::downgrade(cursor));
        Ok(())
    }

    /// Checks state then thread, returning the engine handle.
    fn ensure_owned(&self) -> CoreResult<TxnHandle> {
        let handle = self
            .node
            .inner
            .lock()
            .handle
            .ok_or(CoreError::TransactionTerminated)?;
        if thread::current().id() != self.node.thread {
            return Err(CoreError::WrongThread);
        }
        Ok(handle)
    }

    fn ensure_innermost(&self) -> CoreResult<()> {
        match self.node.env.registry().get(self.node.thread) {
            Some(active) if Arc::ptr_eq(&active, &self.node) => Ok(()),
            _ => Err(CoreError::TransactionNotActive),
        }
    }

    /// Open transactions nested inside this one, innermost first.
    ///
    /// Fails with `TransactionNotActive` if this transaction is not on the
    /// thread's active chain.
    fn open_descendants(&self) -> CoreResult<Vec<Arc<TxnNode>>> {
        let mut chain = Vec::new();
        let mut current = self
            .node
            .env
            .registry()
            .get(self.node.thread)
            .ok_or(CoreError::TransactionNotActive)?;
        while !Arc::ptr_eq(&current, &self.node) {
            let parent = current
                .parent_node()
                .cloned()
                .ok_or(CoreError::TransactionNotActive)?;
            chain.push(current);
            current = parent;
        }
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvConfig;
    use lmkv_engine::{DatabaseFlags, ErrorCode};

    fn env() -> Environment {
        Environment::open_in_memory(EnvConfig::default())
    }

    #[test]
    fn commit_makes_writes_visible() {
        let env = env();
        let db = env.database(None, DatabaseFlags::new()).unwrap();
        let txn = env.begin().unwrap();
        txn.put(&db, b"a", b"1").unwrap();
        txn.commit().unwrap();

        assert_eq!(txn.state(), TransactionState::Committed);
        assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(env.open_transaction_count(), 0);
    }

    #[test]
    fn terminated_transaction_rejects_everything() {
        let env = env();
        let db = env.database(None, DatabaseFlags::new()).unwrap();
        let txn = env.begin().unwrap();
        txn.abort().unwrap();

        assert!(matches!(txn.commit(), Err(CoreError::TransactionTerminated)));
        assert!(matches!(txn.abort(), Err(CoreError::TransactionTerminated)));
        assert!(matches!(
            txn.put(&db, b"a", b"1"),
            Err(CoreError::TransactionTerminated)
        ));
        assert!(matches!(
            txn.begin_nested(),
            Err(CoreError::TransactionTerminated)
        ));
    }

    #[test]
    fn nested_transaction_becomes_active() {
        let env = env();
        let outer = env.begin().unwrap();
        let inner = env.begin().unwrap();

        assert_eq!(inner.parent(), Some(&outer));
        assert_eq!(env.active_transaction().unwrap(), Some(inner.clone()));

        inner.commit().unwrap();
        assert_eq!(env.active_transaction().unwrap(), Some(outer.clone()));
        outer.commit().unwrap();
        assert_eq!(env.active_transaction().unwrap(), None);
    }

    #[test]
    fn outer_transaction_is_not_active_while_child_open() {
        let env = env();
        let db = env.database(None, DatabaseFlags::new()).unwrap();
        let outer = env.begin().unwrap();
        let _inner = outer.begin_nested().unwrap();

        assert!(matches!(
            outer.put(&db, b"a", b"1"),
            Err(CoreError::TransactionNotActive)
        ));
        assert!(matches!(
            outer.begin_nested(),
            Err(CoreError::TransactionNotActive)
        ));
        outer.abort().unwrap();
    }

    #[test]
    fn outer_commit_finishes_children() {
        let env = env();
        let db = env.database(None, DatabaseFlags::new()).unwrap();
        let outer = env.begin().unwrap();
        let middle = outer.begin_nested().unwrap();
        let inner = middle.begin_nested().unwrap();
        inner.put(&db, b"deep", b"1").unwrap();

        outer.commit().unwrap();
        assert_eq!(inner.state(), TransactionState::Committed);
        assert_eq!(middle.state(), TransactionState::Committed);
        assert_eq!(env.open_transaction_count(), 0);
        assert_eq!(db.get(b"deep").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn outer_abort_discards_children() {
        let env = env();
        let db = env.database(None, DatabaseFlags::new()).unwrap();
        let outer = env.begin().unwrap();
        let inner = outer.begin_nested().unwrap();
        inner.put(&db, b"k", b"v").unwrap();

        outer.abort().unwrap();
        assert_eq!(inner.state(), TransactionState::Aborted);
        assert_eq!(db.get(b"k").unwrap(), None);
        assert!(matches!(inner.commit(), Err(CoreError::TransactionTerminated)));
    }

    #[test]
    fn other_thread_is_rejected() {
        let env = env();
        let txn = env.begin().unwrap();
        let remote = txn.clone();
        let result = std::thread::spawn(move || remote.commit()).join().unwrap();
        assert!(matches!(result, Err(CoreError::WrongThread)));
        assert!(txn.is_open());
        txn.commit().unwrap();
    }

    #[test]
    fn drop_aborts_and_restores_parent() {
        let env = env();
        let db = env.database(None, DatabaseFlags::new()).unwrap();
        let outer = env.begin().unwrap();
        {
            let inner = outer.begin_nested().unwrap();
            inner.put(&db, b"k", b"v").unwrap();
        }
        assert_eq!(env.active_transaction().unwrap(), Some(outer.clone()));
        assert_eq!(outer.get(&db, b"k").unwrap(), None);
        outer.commit().unwrap();
    }

    #[test]
    fn drop_on_another_thread_restores_owner_entry() {
        let env = env();
        let outer = env.begin().unwrap();
        let inner = outer.begin_nested().unwrap();
        std::thread::spawn(move || drop(inner)).join().unwrap();

        assert_eq!(env.active_transaction().unwrap(), Some(outer.clone()));
        assert_eq!(env.open_transaction_count(), 1);
        let next = outer.begin_nested().unwrap();
        next.commit().unwrap();
        outer.commit().unwrap();
        assert_eq!(env.active_thread_count(), 0);
    }

    #[test]
    fn read_only_transaction_rejects_writes() {
        let env = env();
        let db = env.database(None, DatabaseFlags::new()).unwrap();
        let txn = env.begin_read().unwrap();
        assert!(txn.is_read_only());
        let err = txn.put(&db, b"a", b"1").unwrap_err();
        assert_eq!(err.engine_code(), Some(ErrorCode::Access));
        txn.abort().unwrap();
    }

    #[test]
    fn nested_under_read_only_is_rejected() {
        let env = env();
        let txn = env.begin_read().unwrap();
        let err = txn.begin_nested().unwrap_err();
        assert_eq!(err.engine_code(), Some(ErrorCode::InvalidArgument));
        assert_eq!(env.active_transaction().unwrap(), Some(txn.clone()));
        txn.abort().unwrap();
    }

    #[test]
    fn closure_form_commits_and_aborts() {
        let env = env();
        let db = env.database(None, DatabaseFlags::new()).unwrap();
        let outer = env.begin().unwrap();
        outer
            .transaction(|child| child.put(&db, b"kept", b"1"))
            .unwrap();
        let err = outer
            .transaction(|child| {
                child.put(&db, b"lost", b"1")?;
                Err::<(), _>(CoreError::Interrupted)
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::Interrupted));
        outer.commit().unwrap();

        assert_eq!(db.get(b"kept").unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.get(b"lost").unwrap(), None);
    }
}
