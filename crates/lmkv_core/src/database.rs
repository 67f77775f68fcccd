//! Database handles.

use crate::cursor::Cursor;
use crate::environment::Environment;
use crate::error::{CoreError, CoreResult};
use crate::implicit::{run_in_transaction, Access};
use lmkv_engine::{DatabaseFlags, Stat, TableHandle, WriteFlags};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

pub(crate) struct DbShared {
    env: Environment,
    name: Option<String>,
    table: TableHandle,
    flags: DatabaseFlags,
    closed: AtomicBool,
}

impl DbShared {
    pub(crate) fn new(
        env: Environment,
        name: Option<String>,
        table: TableHandle,
        flags: DatabaseFlags,
    ) -> Self {
        Self {
            env,
            name,
            table,
            flags,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A handle to one named table (or the unnamed main table).
///
/// Every data method runs in the calling thread's active transaction, or
/// wraps just that call in its own transaction if none is active: a
/// read-only one for [`Database::get`] and [`Database::stat`], a write
/// transaction otherwise.
#[derive(Clone)]
pub struct Database {
    shared: Arc<DbShared>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.shared.name)
            .field("table", &self.shared.table)
            .field("flags", &self.shared.flags)
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

impl Database {
    pub(crate) fn from_shared(shared: Arc<DbShared>) -> Self {
        Self { shared }
    }

    /// Returns the table handle, checking that this database is open and
    /// belongs to `env`.
    pub(crate) fn table_in(&self, env: &Environment) -> CoreResult<TableHandle> {
        if !self.shared.env.same_as(env) {
            return Err(CoreError::EnvironmentMismatch);
        }
        if self.shared.is_closed() {
            return Err(CoreError::DatabaseClosed);
        }
        Ok(self.shared.table)
    }

    pub(crate) fn table(&self) -> TableHandle {
        self.shared.table
    }

    /// Returns the database name; `None` for the main database.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.shared.name()
    }

    /// Returns the flags the table was created with.
    #[must_use]
    pub fn flags(&self) -> DatabaseFlags {
        self.shared.flags
    }

    /// Returns the owning environment.
    #[must_use]
    pub fn environment(&self) -> &Environment {
        &self.shared.env
    }

    /// Returns true after [`Database::drop`].
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Returns the value stored under `key`, or `None`.
    ///
    /// On a duplicate-sorted table this is the first value of the key.
    pub fn get(&self, key: &[u8]) -> CoreResult<Option<Vec<u8>>> {
        run_in_transaction(&self.shared.env, Access::Read, |txn| txn.get(self, key))
    }

    /// Stores `value` under `key`, replacing any existing value (or adding
    /// a duplicate on a duplicate-sorted table).
    pub fn put(&self, key: &[u8], value: &[u8]) -> CoreResult<()> {
        self.put_with(key, value, WriteFlags::new())
    }

    /// Stores `value` under `key` with explicit write flags.
    ///
    /// # Errors
    ///
    /// With `no_overwrite` an existing key fails with engine `KeyExist`;
    /// `append` out of order fails with `KeyExist` as well.
    pub fn put_with(&self, key: &[u8], value: &[u8], flags: WriteFlags) -> CoreResult<()> {
        run_in_transaction(&self.shared.env, Access::Write, |txn| {
            txn.put_with(self, key, value, flags)
        })
    }

    /// Deletes `key` with all its values. Returns false if it was absent.
    pub fn delete(&self, key: &[u8]) -> CoreResult<bool> {
        run_in_transaction(&self.shared.env, Access::Write, |txn| txn.delete(self, key))
    }

    /// Deletes a single `value` of `key`. Returns false if the pair was
    /// absent.
    pub fn delete_dup(&self, key: &[u8], value: &[u8]) -> CoreResult<bool> {
        run_in_transaction(&self.shared.env, Access::Write, |txn| {
            txn.delete_dup(self, key, value)
        })
    }

    /// Removes every record; the table itself stays.
    pub fn clear(&self) -> CoreResult<()> {
        let env = &self.shared.env;
        run_in_transaction(env, Access::Write, |txn| {
            let table = self.table_in(env)?;
            let handle = txn.handle_for_op()?;
            env.engine().table_drop(handle, table, false)?;
            Ok(())
        })
    }

    /// Deletes the table and closes this handle (and its clones).
    ///
    /// The main database cannot be deleted; dropping it only empties it
    /// and leaves the handle open.
    pub fn drop(&self) -> CoreResult<()> {
        let env = &self.shared.env;
        run_in_transaction(env, Access::Write, |txn| {
            let table = self.table_in(env)?;
            let handle = txn.handle_for_op()?;
            env.engine().table_drop(handle, table, true)?;
            Ok(())
        })?;
        if self.shared.table != TableHandle::MAIN {
            self.shared.closed.store(true, Ordering::SeqCst);
            env.forget_database(self.shared.table);
            debug!(name = ?self.shared.name, "database dropped");
        }
        Ok(())
    }

    /// Returns table statistics.
    pub fn stat(&self) -> CoreResult<Stat> {
        let env = &self.shared.env;
        run_in_transaction(env, Access::Read, |txn| {
            let table = self.table_in(env)?;
            let handle = txn.handle_for_op()?;
            Ok(env.engine().table_stat(handle, table)?)
        })
    }

    /// Opens a cursor in the calling thread's active transaction.
    ///
    /// # Errors
    ///
    /// Fails with `NoActiveTransaction` if there is none; use
    /// [`Database::with_cursor`] instead.
    pub fn cursor(&self) -> CoreResult<Cursor> {
        let txn = self
            .shared
            .env
            .active_transaction()?
            .ok_or(CoreError::NoActiveTransaction)?;
        Cursor::open(&txn, self)
    }

    /// Runs `f` with a cursor in the active transaction, or in a write
    /// transaction of its own. The cursor is closed when `f` returns.
    pub fn with_cursor<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&Cursor) -> CoreResult<T>,
    {
        run_in_transaction(&self.shared.env, Access::Write, |txn| {
            let cursor = Cursor::open(txn, self)?;
            let result = f(&cursor);
            cursor.close();
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvConfig;
    use lmkv_engine::ErrorCode;

    fn env() -> Environment {
        Environment::open_in_memory(EnvConfig::default())
    }

    #[test]
    fn basic_operations() {
        let env = env();
        let db = env.database(None, DatabaseFlags::new()).unwrap();
        assert_eq!(db.name(), None);

        db.put(b"a", b"1").unwrap();
        assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.get(b"missing").unwrap(), None);
        assert!(db.delete(b"a").unwrap());
        assert!(!db.delete(b"a").unwrap());
    }

    #[test]
    fn missing_database_without_create() {
        let env = env();
        let err = env.database(Some("nope"), DatabaseFlags::new()).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(env.open_transaction_count(), 0);
    }

    #[test]
    fn no_overwrite_reports_key_exist() {
        let env = env();
        let db = env.database(None, DatabaseFlags::new()).unwrap();
        db.put(b"a", b"1").unwrap();
        let err = db
            .put_with(b"a", b"2", WriteFlags::new().no_overwrite(true))
            .unwrap_err();
        assert_eq!(err.engine_code(), Some(ErrorCode::KeyExist));
        assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn duplicates() {
        let env = env();
        let db = env
            .database(Some("dups"), DatabaseFlags::new().create(true).dup_sort(true))
            .unwrap();
        assert!(db.flags().dup_sort);
        db.put(b"k", b"2").unwrap();
        db.put(b"k", b"1").unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"1".to_vec()));
        assert!(db.delete_dup(b"k", b"1").unwrap());
        assert!(!db.delete_dup(b"k", b"1").unwrap());
        assert_eq!(db.get(b"k").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn clear_and_drop() {
        let env = env();
        let db = env
            .database(Some("t"), DatabaseFlags::new().create(true))
            .unwrap();
        db.put(b"a", b"1").unwrap();
        db.clear().unwrap();
        assert_eq!(db.stat().unwrap().entries, 0);

        db.drop().unwrap();
        assert!(db.is_closed());
        assert!(matches!(db.get(b"a"), Err(CoreError::DatabaseClosed)));
        assert!(env
            .database(Some("t"), DatabaseFlags::new())
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn cursor_needs_active_transaction() {
        let env = env();
        let db = env.database(None, DatabaseFlags::new()).unwrap();
        assert!(matches!(db.cursor(), Err(CoreError::NoActiveTransaction)));

        db.put(b"a", b"1").unwrap();
        let first = db.with_cursor(|cursor| cursor.first()).unwrap();
        assert_eq!(first, Some((b"a".to_vec(), b"1".to_vec())));
        assert_eq!(env.open_transaction_count(), 0);
    }

    #[test]
    fn database_from_other_environment() {
        let a = env();
        let b = env();
        let db = a.database(None, DatabaseFlags::new()).unwrap();
        let txn = b.begin().unwrap();
        assert!(matches!(
            txn.get(&db, b"k"),
            Err(CoreError::EnvironmentMismatch)
        ));
        txn.abort().unwrap();
    }
}
