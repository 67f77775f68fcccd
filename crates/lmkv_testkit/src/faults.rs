//! Fault injection around an engine.
//!
//! [`FaultyEngine`] forwards every call to a wrapped engine, counting the
//! calls that matter for lifecycle tests and failing selected ones on
//! demand.

use lmkv_core::{EngineError, ErrorCode};
use lmkv_engine::{
    CursorHandle, CursorOp, DatabaseFlags, Engine, EngineOptions, EngineResult, EnvFlags, Info,
    Record, SnapshotEngine, Stat, TableHandle, TxnFlags, TxnHandle, WriteFlags,
};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use tracing::debug;

/// Counts of forwarded engine calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// `txn_begin` calls, including injected failures.
    pub begins: usize,
    /// `txn_commit` calls, including injected failures.
    pub commits: usize,
    /// `txn_abort` calls.
    pub aborts: usize,
    /// `resize_map` calls.
    pub resizes: usize,
    /// `cursor_close` calls.
    pub cursor_closes: usize,
    /// `close` calls.
    pub closes: usize,
}

/// An engine wrapper that injects failures.
pub struct FaultyEngine {
    inner: Arc<dyn Engine>,
    pending_resizes: AtomicUsize,
    pending_commit_failures: AtomicUsize,
    counts: Mutex<CallCounts>,
}

impl FaultyEngine {
    /// Wraps `inner`.
    pub fn new(inner: Arc<dyn Engine>) -> Self {
        Self {
            inner,
            pending_resizes: AtomicUsize::new(0),
            pending_commit_failures: AtomicUsize::new(0),
            counts: Mutex::new(CallCounts::default()),
        }
    }

    /// Wraps a fresh in-memory [`SnapshotEngine`].
    pub fn in_memory(options: &EngineOptions) -> Self {
        Self::new(Arc::new(SnapshotEngine::in_memory(options)))
    }

    /// Makes the next `n` top-level `txn_begin` calls fail with
    /// `MapResized`, as if another process had grown the map.
    pub fn signal_resizes(&self, n: usize) {
        self.pending_resizes.store(n, AtomicOrdering::SeqCst);
    }

    /// Makes the next `n` `txn_commit` calls fail with `MapFull`.
    ///
    /// The transaction is aborted in the wrapped engine, as a failed
    /// commit frees the handle.
    pub fn fail_commits(&self, n: usize) {
        self.pending_commit_failures
            .store(n, AtomicOrdering::SeqCst);
    }

    /// Returns the calls counted so far.
    pub fn counts(&self) -> CallCounts {
        *self.counts.lock()
    }

    fn take(pending: &AtomicUsize) -> bool {
        pending
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| {
                n.checked_sub(1)
            })
            .is_ok()
    }
}

impl Engine for FaultyEngine {
    fn path(&self) -> Option<&Path> {
        self.inner.path()
    }

    fn flags(&self) -> EngineResult<EnvFlags> {
        self.inner.flags()
    }

    fn set_flags(&self, flags: EnvFlags) -> EngineResult<()> {
        self.inner.set_flags(flags)
    }

    fn txn_begin(
        &self,
        parent: Option<TxnHandle>,
        flags: TxnFlags,
        interrupted: &dyn Fn() -> bool,
    ) -> EngineResult<TxnHandle> {
        self.counts.lock().begins += 1;
        if parent.is_none() && Self::take(&self.pending_resizes) {
            debug!("injecting map resize");
            return Err(EngineError::new(
                ErrorCode::MapResized,
                "map grown by another process",
            ));
        }
        self.inner.txn_begin(parent, flags, interrupted)
    }

    fn txn_commit(&self, txn: TxnHandle) -> EngineResult<()> {
        self.counts.lock().commits += 1;
        if Self::take(&self.pending_commit_failures) {
            debug!(%txn, "injecting commit failure");
            self.inner.txn_abort(txn);
            return Err(EngineError::new(ErrorCode::MapFull, "injected commit failure"));
        }
        self.inner.txn_commit(txn)
    }

    fn txn_abort(&self, txn: TxnHandle) {
        self.counts.lock().aborts += 1;
        self.inner.txn_abort(txn);
    }

    fn table_open(
        &self,
        txn: TxnHandle,
        name: Option<&str>,
        flags: DatabaseFlags,
    ) -> EngineResult<TableHandle> {
        self.inner.table_open(txn, name, flags)
    }

    fn table_flags(&self, table: TableHandle) -> EngineResult<DatabaseFlags> {
        self.inner.table_flags(table)
    }

    fn table_drop(&self, txn: TxnHandle, table: TableHandle, delete: bool) -> EngineResult<()> {
        self.inner.table_drop(txn, table, delete)
    }

    fn get(&self, txn: TxnHandle, table: TableHandle, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        self.inner.get(txn, table, key)
    }

    fn put(
        &self,
        txn: TxnHandle,
        table: TableHandle,
        key: &[u8],
        value: &[u8],
        flags: WriteFlags,
    ) -> EngineResult<()> {
        self.inner.put(txn, table, key, value, flags)
    }

    fn delete(
        &self,
        txn: TxnHandle,
        table: TableHandle,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> EngineResult<bool> {
        self.inner.delete(txn, table, key, value)
    }

    fn cursor_open(&self, txn: TxnHandle, table: TableHandle) -> EngineResult<CursorHandle> {
        self.inner.cursor_open(txn, table)
    }

    fn cursor_close(&self, cursor: CursorHandle) {
        self.counts.lock().cursor_closes += 1;
        self.inner.cursor_close(cursor);
    }

    fn cursor_get(
        &self,
        cursor: CursorHandle,
        op: CursorOp,
        key: Option<&[u8]>,
    ) -> EngineResult<Option<Record>> {
        self.inner.cursor_get(cursor, op, key)
    }

    fn cursor_put(
        &self,
        cursor: CursorHandle,
        key: &[u8],
        value: &[u8],
        flags: WriteFlags,
    ) -> EngineResult<()> {
        self.inner.cursor_put(cursor, key, value, flags)
    }

    fn cursor_delete(&self, cursor: CursorHandle, all_dups: bool) -> EngineResult<()> {
        self.inner.cursor_delete(cursor, all_dups)
    }

    fn cursor_count(&self, cursor: CursorHandle) -> EngineResult<usize> {
        self.inner.cursor_count(cursor)
    }

    fn compare(&self, table: TableHandle, a: &[u8], b: &[u8]) -> EngineResult<Ordering> {
        self.inner.compare(table, a, b)
    }

    fn stat(&self) -> EngineResult<Stat> {
        self.inner.stat()
    }

    fn table_stat(&self, txn: TxnHandle, table: TableHandle) -> EngineResult<Stat> {
        self.inner.table_stat(txn, table)
    }

    fn info(&self) -> EngineResult<Info> {
        self.inner.info()
    }

    fn copy(&self, dest: &Path) -> EngineResult<()> {
        self.inner.copy(dest)
    }

    fn sync(&self, force: bool) -> EngineResult<()> {
        self.inner.sync(force)
    }

    fn resize_map(&self, new_size: u64) -> EngineResult<()> {
        self.counts.lock().resizes += 1;
        self.inner.resize_map(new_size)
    }

    fn close(&self) {
        self.counts.lock().closes += 1;
        self.inner.close();
    }
}
