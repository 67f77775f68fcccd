//! Cursors over a database inside one transaction.

use crate::database::Database;
use crate::error::{CoreError, CoreResult};
use crate::transaction::Transaction;
use crate::types::CursorId;
use lmkv_engine::{CursorHandle, CursorOp, Record, WriteFlags};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

pub(crate) struct CursorShared {
    id: CursorId,
    txn: Transaction,
    db: Database,
    handle: Mutex<Option<CursorHandle>>,
}

impl CursorShared {
    /// Closes the engine cursor. Safe to call repeatedly.
    pub(crate) fn release(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            self.txn.environment().engine().cursor_close(handle);
            trace!(cursor = %self.id, "cursor closed");
        }
    }
}

impl Drop for CursorShared {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            self.txn.environment().engine().cursor_close(handle);
        }
    }
}

/// A cursor positioned within one database of one transaction.
///
/// Positioning methods return `Ok(None)` when there is no matching record.
/// The cursor is closed automatically when its transaction ends; after
/// that, and after [`Cursor::close`], every operation fails with
/// `CursorClosed`.
pub struct Cursor {
    shared: Arc<CursorShared>,
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("id", &self.shared.id)
            .field("txn", &self.shared.txn.id())
            .field("database", &self.shared.db.name())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Cursor {
    pub(crate) fn open(txn: &Transaction, db: &Database) -> CoreResult<Self> {
        let env = txn.environment();
        let table = db.table_in(env)?;
        let txn_handle = txn.handle_for_op()?;
        let handle = env.engine().cursor_open(txn_handle, table)?;
        let shared = Arc::new(CursorShared {
            id: env.next_cursor_id(),
            txn: txn.clone(),
            db: db.clone(),
            handle: Mutex::new(Some(handle)),
        });
        txn.register_cursor(&shared)?;
        trace!(cursor = %shared.id, txn = %txn.id(), "cursor opened");
        Ok(Self { shared })
    }

    /// Returns the cursor id.
    #[must_use]
    pub fn id(&self) -> CursorId {
        self.shared.id
    }

    /// Returns the owning transaction.
    #[must_use]
    pub fn transaction(&self) -> &Transaction {
        &self.shared.txn
    }

    /// Returns the database the cursor iterates.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.shared.db
    }

    /// Returns true once closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.handle.lock().is_none()
    }

    /// Closes the cursor. Closing twice is harmless.
    pub fn close(&self) {
        self.shared.release();
    }

    /// Cursor handle, checked against the owning transaction.
    fn handle(&self) -> CoreResult<CursorHandle> {
        let handle = (*self.shared.handle.lock()).ok_or(CoreError::CursorClosed)?;
        self.shared.txn.handle_for_op()?;
        Ok(handle)
    }

    fn position(&self, op: CursorOp, key: Option<&[u8]>) -> CoreResult<Option<Record>> {
        let handle = self.handle()?;
        Ok(self
            .shared
            .txn
            .environment()
            .engine()
            .cursor_get(handle, op, key)?)
    }

    /// Moves to the first record.
    pub fn first(&self) -> CoreResult<Option<Record>> {
        self.position(CursorOp::First, None)
    }

    /// Moves to the last record.
    pub fn last(&self) -> CoreResult<Option<Record>> {
        self.position(CursorOp::Last, None)
    }

    /// Moves to the next record; from an unpositioned cursor, the first.
    pub fn next(&self) -> CoreResult<Option<Record>> {
        self.position(CursorOp::Next, None)
    }

    /// Moves to the previous record; from an unpositioned cursor, the last.
    pub fn prev(&self) -> CoreResult<Option<Record>> {
        self.position(CursorOp::Prev, None)
    }

    /// Moves to `key` exactly.
    pub fn set(&self, key: &[u8]) -> CoreResult<Option<Record>> {
        self.position(CursorOp::Set, Some(key))
    }

    /// Moves to the first key greater than or equal to `key`.
    pub fn set_range(&self, key: &[u8]) -> CoreResult<Option<Record>> {
        self.position(CursorOp::SetRange, Some(key))
    }

    /// Returns the record at the current position.
    pub fn get(&self) -> CoreResult<Option<Record>> {
        self.position(CursorOp::GetCurrent, None)
    }

    /// Moves like [`Cursor::next`], but yields the record only if its key
    /// is at most `upper` in the table's key order.
    ///
    /// The cursor moves even when `None` is returned.
    pub fn next_range(&self, upper: &[u8]) -> CoreResult<Option<Record>> {
        let Some((key, value)) = self.next()? else {
            return Ok(None);
        };
        let env = self.shared.txn.environment();
        let table = self.shared.db.table_in(env)?;
        match env.engine().compare(table, &key, upper)? {
            Ordering::Greater => Ok(None),
            _ => Ok(Some((key, value))),
        }
    }

    /// Moves to the next value of the current key.
    pub fn next_dup(&self) -> CoreResult<Option<Record>> {
        self.position(CursorOp::NextDup, None)
    }

    /// Moves to the previous value of the current key.
    pub fn prev_dup(&self) -> CoreResult<Option<Record>> {
        self.position(CursorOp::PrevDup, None)
    }

    /// Moves to the first value of the current key.
    pub fn first_dup(&self) -> CoreResult<Option<Record>> {
        self.position(CursorOp::FirstDup, None)
    }

    /// Moves to the last value of the current key.
    pub fn last_dup(&self) -> CoreResult<Option<Record>> {
        self.position(CursorOp::LastDup, None)
    }

    /// Moves to the first value of the next key.
    pub fn next_nodup(&self) -> CoreResult<Option<Record>> {
        self.position(CursorOp::NextNoDup, None)
    }

    /// Moves to the last value of the previous key.
    pub fn prev_nodup(&self) -> CoreResult<Option<Record>> {
        self.position(CursorOp::PrevNoDup, None)
    }

    /// Stores a record and positions the cursor on it.
    ///
    /// With `current` set the value at the current position is replaced.
    pub fn put(&self, key: &[u8], value: &[u8], flags: WriteFlags) -> CoreResult<()> {
        let handle = self.handle()?;
        self.shared
            .txn
            .environment()
            .engine()
            .cursor_put(handle, key, value, flags)?;
        Ok(())
    }

    /// Deletes the record at the current position, or every value of the
    /// current key with `all_dups`.
    pub fn delete(&self, all_dups: bool) -> CoreResult<()> {
        let handle = self.handle()?;
        self.shared
            .txn
            .environment()
            .engine()
            .cursor_delete(handle, all_dups)?;
        Ok(())
    }

    /// Returns the number of values stored under the current key.
    pub fn count(&self) -> CoreResult<usize> {
        let handle = self.handle()?;
        Ok(self.shared.txn.environment().engine().cursor_count(handle)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvConfig;
    use crate::environment::Environment;
    use lmkv_engine::{DatabaseFlags, ErrorCode};

    fn record(key: &[u8], value: &[u8]) -> Option<Record> {
        Some((key.to_vec(), value.to_vec()))
    }

    fn filled() -> (Environment, Database) {
        let env = Environment::open_in_memory(EnvConfig::default());
        let db = env.database(None, DatabaseFlags::new()).unwrap();
        for key in [b"a", b"b", b"c", b"d"] {
            db.put(key, key).unwrap();
        }
        (env, db)
    }

    #[test]
    fn navigation() {
        let (env, db) = filled();
        let txn = env.begin_read().unwrap();
        let cursor = db.cursor().unwrap();

        assert_eq!(cursor.first().unwrap(), record(b"a", b"a"));
        assert_eq!(cursor.next().unwrap(), record(b"b", b"b"));
        assert_eq!(cursor.get().unwrap(), record(b"b", b"b"));
        assert_eq!(cursor.last().unwrap(), record(b"d", b"d"));
        assert_eq!(cursor.next().unwrap(), None);
        assert_eq!(cursor.prev().unwrap(), record(b"c", b"c"));
        assert_eq!(cursor.set(b"b").unwrap(), record(b"b", b"b"));
        assert_eq!(cursor.set(b"bb").unwrap(), None);
        assert_eq!(cursor.set_range(b"bb").unwrap(), record(b"c", b"c"));
        txn.commit().unwrap();
    }

    #[test]
    fn next_range_stops_at_upper_bound() {
        let (env, db) = filled();
        let txn = env.begin_read().unwrap();
        let cursor = txn.cursor(&db).unwrap();

        assert_eq!(cursor.set_range(b"a").unwrap(), record(b"a", b"a"));
        assert_eq!(cursor.next_range(b"b").unwrap(), record(b"b", b"b"));
        assert_eq!(cursor.next_range(b"b").unwrap(), None);
        // The cursor moved past the bound anyway.
        assert_eq!(cursor.get().unwrap(), record(b"c", b"c"));
        txn.abort().unwrap();
    }

    #[test]
    fn closed_when_transaction_ends() {
        let (env, db) = filled();
        let txn = env.begin().unwrap();
        let cursor = db.cursor().unwrap();
        txn.commit().unwrap();

        assert!(cursor.is_closed());
        assert!(matches!(cursor.first(), Err(CoreError::CursorClosed)));
        cursor.close();
    }

    #[test]
    fn explicit_close() {
        let (env, db) = filled();
        let txn = env.begin().unwrap();
        let cursor = db.cursor().unwrap();
        cursor.close();
        cursor.close();
        assert!(matches!(cursor.next(), Err(CoreError::CursorClosed)));
        assert!(txn.is_open());
        txn.commit().unwrap();
    }

    #[test]
    fn write_through_cursor() {
        let (env, db) = filled();
        db.with_cursor(|cursor| {
            cursor.set(b"a")?;
            cursor.delete(false)?;
            cursor.put(b"e", b"e", WriteFlags::new())
        })
        .unwrap();
        assert_eq!(db.get(b"a").unwrap(), None);
        assert_eq!(db.get(b"e").unwrap(), Some(b"e".to_vec()));
        assert_eq!(env.open_transaction_count(), 0);
    }

    #[test]
    fn read_only_cursor_rejects_writes() {
        let (env, db) = filled();
        let txn = env.begin_read().unwrap();
        let cursor = db.cursor().unwrap();
        cursor.first().unwrap();
        let err = cursor.delete(false).unwrap_err();
        assert_eq!(err.engine_code(), Some(ErrorCode::Access));
        txn.abort().unwrap();
    }

    #[test]
    fn cursor_of_outer_transaction_is_not_active() {
        let (env, db) = filled();
        let outer = env.begin().unwrap();
        let cursor = db.cursor().unwrap();
        let inner = outer.begin_nested().unwrap();
        assert!(matches!(
            cursor.first(),
            Err(CoreError::TransactionNotActive)
        ));
        inner.commit().unwrap();
        assert_eq!(cursor.first().unwrap(), record(b"a", b"a"));
        outer.commit().unwrap();
    }

    #[test]
    fn duplicate_navigation() {
        let env = Environment::open_in_memory(EnvConfig::default());
        let db = env
            .database(Some("d"), DatabaseFlags::new().create(true).dup_sort(true))
            .unwrap();
        for value in [b"1", b"2", b"3"] {
            db.put(b"k", value).unwrap();
        }
        db.put(b"m", b"9").unwrap();

        let txn = env.begin_read().unwrap();
        let cursor = db.cursor().unwrap();
        assert_eq!(cursor.set(b"k").unwrap(), record(b"k", b"1"));
        assert_eq!(cursor.count().unwrap(), 3);
        assert_eq!(cursor.next_dup().unwrap(), record(b"k", b"2"));
        assert_eq!(cursor.last_dup().unwrap(), record(b"k", b"3"));
        assert_eq!(cursor.next_dup().unwrap(), None);
        assert_eq!(cursor.prev_dup().unwrap(), record(b"k", b"2"));
        assert_eq!(cursor.first_dup().unwrap(), record(b"k", b"1"));
        assert_eq!(cursor.next_nodup().unwrap(), record(b"m", b"9"));
        txn.abort().unwrap();
    }
}
