//! The environment handle.

use crate::config::EnvConfig;
use crate::database::{Database, DbShared};
use crate::error::{CoreError, CoreResult};
use crate::implicit::{finish_with, run_in_transaction, Access};
use crate::interrupt::InterruptSignal;
use crate::registry::ActiveRegistry;
use crate::transaction::Transaction;
use crate::types::{CursorId, TransactionId};
use lmkv_engine::{
    DatabaseFlags, Engine, EnvFlags, ErrorCode, Info, SnapshotEngine, Stat, TableHandle,
    TxnFlags, TxnHandle,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use tracing::{debug, warn};

pub(crate) struct EnvShared {
    engine: Arc<dyn Engine>,
    config: EnvConfig,
    registry: ActiveRegistry,
    /// Open transactions, nested ones included.
    open_transactions: AtomicUsize,
    next_txn_id: AtomicU64,
    next_cursor_id: AtomicU64,
    databases: Mutex<HashMap<TableHandle, Weak<DbShared>>>,
    /// Taken for writing by `close`; begin holds it for reading while it
    /// counts a new transaction, so close sees a stable count.
    is_open: RwLock<bool>,
}

impl Drop for EnvShared {
    fn drop(&mut self) {
        if *self.is_open.get_mut() {
            self.engine.close();
            debug!("environment released");
        }
    }
}

/// An open environment: one engine instance shared by every handle.
///
/// `Environment` is cheap to clone; clones share the same engine. The
/// engine is released by [`Environment::close`] or when the last clone
/// (including those held by transactions, databases and cursors) is
/// dropped.
///
/// # Example
///
/// ```rust,ignore
/// use lmkv_core::{DatabaseFlags, EnvConfig, Environment};
///
/// let env = Environment::open(Path::new("my_env"), EnvConfig::default())?;
/// let db = env.database(Some("users"), DatabaseFlags::new().create(true))?;
/// env.transaction(|_txn| db.put(b"alice", b"1"))?;
/// ```
#[derive(Clone)]
pub struct Environment {
    shared: Arc<EnvShared>,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("path", &self.shared.engine.path())
            .field("open", &*self.shared.is_open.read())
            .field(
                "open_transactions",
                &self.shared.open_transactions.load(Ordering::SeqCst),
            )
            .finish_non_exhaustive()
    }
}

impl Environment {
    /// Opens an environment stored at `path`.
    ///
    /// # Errors
    ///
    /// Returns an engine error if the path is missing, the data file is
    /// invalid or of another version, permissions are insufficient, or
    /// another handle holds the environment lock.
    pub fn open(path: &Path, config: EnvConfig) -> CoreResult<Self> {
        let engine = SnapshotEngine::open(path, &config.engine_options())?;
        debug!(path = %path.display(), "environment opened");
        Ok(Self::open_with_engine(Arc::new(engine), config))
    }

    /// Opens a non-persistent environment.
    #[must_use]
    pub fn open_in_memory(config: EnvConfig) -> Self {
        let engine = SnapshotEngine::in_memory(&config.engine_options());
        Self::open_with_engine(Arc::new(engine), config)
    }

    /// Wraps an already opened engine.
    ///
    /// `config` is kept for [`Environment::config`] and read-only checks;
    /// the engine is assumed to have been opened with the same options.
    #[must_use]
    pub fn open_with_engine(engine: Arc<dyn Engine>, config: EnvConfig) -> Self {
        Self {
            shared: Arc::new(EnvShared {
                engine,
                config,
                registry: ActiveRegistry::default(),
                open_transactions: AtomicUsize::new(0),
                next_txn_id: AtomicU64::new(1),
                next_cursor_id: AtomicU64::new(1),
                databases: Mutex::new(HashMap::new()),
                is_open: RwLock::new(true),
            }),
        }
    }

    /// Opens an environment, runs `f` with it, and closes it.
    ///
    /// The environment is closed even if `f` fails. The error of `f` takes
    /// precedence over a close error.
    pub fn with_open<F, T>(path: &Path, config: EnvConfig, f: F) -> CoreResult<T>
    where
        F: FnOnce(&Environment) -> CoreResult<T>,
    {
        let env = Self::open(path, config)?;
        let result = f(&env);
        let closed = env.close();
        let value = result?;
        closed?;
        Ok(value)
    }

    /// Closes the environment.
    ///
    /// Closing an already closed environment does nothing.
    ///
    /// # Errors
    ///
    /// Returns `EnvironmentBusy` while any transaction is open; the
    /// environment stays open in that case.
    pub fn close(&self) -> CoreResult<()> {
        let mut is_open = self.shared.is_open.write();
        if !*is_open {
            return Ok(());
        }
        let open_transactions = self.shared.open_transactions.load(Ordering::SeqCst);
        if open_transactions > 0 {
            warn!(
                open_transactions,
                "refusing to close environment with open transactions"
            );
            return Err(CoreError::EnvironmentBusy { open_transactions });
        }
        *is_open = false;
        self.shared.engine.close();
        self.shared.databases.lock().clear();
        debug!("environment closed");
        Ok(())
    }

    /// Returns true until the environment is closed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.shared.is_open.read()
    }

    /// Returns statistics for the main database.
    ///
    /// Uses the calling thread's active transaction, or a read-only one.
    pub fn stat(&self) -> CoreResult<Stat> {
        run_in_transaction(self, Access::Read, |txn| {
            let handle = txn.handle_for_op()?;
            Ok(self.engine().table_stat(handle, TableHandle::MAIN)?)
        })
    }

    /// Returns environment information.
    pub fn info(&self) -> CoreResult<Info> {
        self.ensure_open()?;
        Ok(self.engine().info()?)
    }

    /// Writes a consistent copy of the committed data into `dest`.
    pub fn copy(&self, dest: &Path) -> CoreResult<()> {
        self.ensure_open()?;
        self.engine().copy(dest)?;
        Ok(())
    }

    /// Flushes committed data to disk.
    ///
    /// With `no_sync` or `map_async` set, only a forced sync writes.
    pub fn sync(&self, force: bool) -> CoreResult<()> {
        self.ensure_open()?;
        self.engine().sync(force)?;
        Ok(())
    }

    /// Returns the path the environment was opened on.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.shared.engine.path()
    }

    /// Returns the current environment flags.
    pub fn flags(&self) -> CoreResult<EnvFlags> {
        self.ensure_open()?;
        Ok(self.engine().flags()?)
    }

    /// Changes the runtime flags (`no_sync`, `no_meta_sync`, `map_async`).
    ///
    /// # Errors
    ///
    /// Returns an engine `InvalidArgument` error if any other flag differs.
    pub fn set_flags(&self, flags: EnvFlags) -> CoreResult<()> {
        self.ensure_open()?;
        self.engine().set_flags(flags)?;
        Ok(())
    }

    /// Sets the map size in bytes. Zero adopts the size already recorded
    /// for the environment.
    ///
    /// # Errors
    ///
    /// Returns an engine `InvalidArgument` error while a write transaction
    /// is active or if `size` is smaller than the committed data.
    pub fn set_map_size(&self, size: u64) -> CoreResult<()> {
        self.ensure_open()?;
        self.engine().resize_map(size)?;
        debug!(map_size = size, "map size set");
        Ok(())
    }

    /// Returns the configuration the environment was opened with.
    #[must_use]
    pub fn config(&self) -> &EnvConfig {
        &self.shared.config
    }

    /// Returns the calling thread's innermost open transaction.
    pub fn active_transaction(&self) -> CoreResult<Option<Transaction>> {
        self.ensure_open()?;
        Ok(self
            .shared
            .registry
            .get(thread::current().id())
            .map(Transaction::from_node)
            .filter(Transaction::is_open))
    }

    /// Number of threads that currently have an active transaction.
    #[must_use]
    pub fn active_thread_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Number of open transactions across all threads.
    #[must_use]
    pub fn open_transaction_count(&self) -> usize {
        self.shared.open_transactions.load(Ordering::SeqCst)
    }

    /// Begins a read-write transaction.
    ///
    /// If the calling thread has an active transaction the new one is
    /// nested under it.
    pub fn begin(&self) -> CoreResult<Transaction> {
        self.begin_with(false, None)
    }

    /// Begins a read-only transaction (nested if one is active).
    pub fn begin_read(&self) -> CoreResult<Transaction> {
        self.begin_with(true, None)
    }

    /// Begins a transaction, giving up the wait for the writer slot when
    /// `signal` is raised.
    ///
    /// # Errors
    ///
    /// Returns `Interrupted` if the signal was raised before the
    /// transaction could start; no transaction is left behind.
    pub fn begin_interruptible(
        &self,
        read_only: bool,
        signal: &InterruptSignal,
    ) -> CoreResult<Transaction> {
        self.begin_with(read_only, Some(signal))
    }

    fn begin_with(
        &self,
        read_only: bool,
        signal: Option<&InterruptSignal>,
    ) -> CoreResult<Transaction> {
        let parent = self.active_transaction()?;
        Transaction::begin(self, parent.as_ref(), read_only, signal)
    }

    /// Runs `f` in a read-write transaction.
    ///
    /// The transaction nests under the thread's active transaction, if
    /// any. It is committed if `f` returns `Ok` and it is still open, and
    /// aborted if `f` fails or panics.
    pub fn transaction<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&Transaction) -> CoreResult<T>,
    {
        finish_with(self.begin()?, f)
    }

    /// Runs `f` in a read-only transaction.
    pub fn read_transaction<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&Transaction) -> CoreResult<T>,
    {
        finish_with(self.begin_read()?, f)
    }

    /// Opens a database; `None` is the unnamed main database.
    ///
    /// Without an active transaction the open runs in its own write
    /// transaction, committed on success.
    ///
    /// # Errors
    ///
    /// Returns engine errors: `NotFound` for a missing database without
    /// `create`, `DbsFull` beyond `max_dbs`, `Incompatible` if the
    /// database exists with other sort flags.
    pub fn database(&self, name: Option<&str>, flags: DatabaseFlags) -> CoreResult<Database> {
        let table = run_in_transaction(self, Access::Write, |txn| {
            let handle = txn.handle_for_op()?;
            Ok(self.engine().table_open(handle, name, flags)?)
        })?;

        let mut databases = self.shared.databases.lock();
        if let Some(existing) = databases.get(&table).and_then(Weak::upgrade) {
            if existing.name() == name && !existing.is_closed() {
                return Ok(Database::from_shared(existing));
            }
        }
        let stored = self.engine().table_flags(table)?;
        let shared = Arc::new(DbShared::new(
            self.clone(),
            name.map(str::to_string),
            table,
            stored,
        ));
        databases.insert(table, Arc::downgrade(&shared));
        debug!(name = ?name, %table, "database opened");
        Ok(Database::from_shared(shared))
    }

    pub(crate) fn engine(&self) -> &Arc<dyn Engine> {
        &self.shared.engine
    }

    pub(crate) fn registry(&self) -> &ActiveRegistry {
        &self.shared.registry
    }

    pub(crate) fn ensure_open(&self) -> CoreResult<()> {
        if !*self.shared.is_open.read() {
            return Err(CoreError::EnvironmentClosed);
        }
        Ok(())
    }

    pub(crate) fn same_as(&self, other: &Environment) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn next_transaction_id(&self) -> TransactionId {
        TransactionId::new(self.shared.next_txn_id.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn next_cursor_id(&self) -> CursorId {
        CursorId::new(self.shared.next_cursor_id.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn forget_database(&self, table: TableHandle) {
        self.shared.databases.lock().remove(&table);
    }

    /// Counts a transaction whose engine handle was just acquired.
    ///
    /// Fails if the environment was closed while the engine was blocked,
    /// in which case the caller must abort the engine handle.
    pub(crate) fn track_begin(&self) -> CoreResult<()> {
        let is_open = self.shared.is_open.read();
        if !*is_open {
            return Err(CoreError::EnvironmentClosed);
        }
        self.shared.open_transactions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn track_finish(&self) {
        self.shared.open_transactions.fetch_sub(1, Ordering::SeqCst);
    }

    /// Begins an engine transaction, adopting a new map size and retrying
    /// whenever the engine reports `MapResized`.
    ///
    /// No environment lock is held here; the engine may block waiting for
    /// the writer slot.
    pub(crate) fn engine_begin(
        &self,
        parent: Option<TxnHandle>,
        flags: TxnFlags,
        signal: Option<&InterruptSignal>,
    ) -> CoreResult<TxnHandle> {
        let engine = Arc::clone(self.engine());
        let interrupted = || signal.is_some_and(InterruptSignal::is_raised);
        loop {
            match engine.txn_begin(parent, flags, &interrupted) {
                Ok(handle) => {
                    if interrupted() {
                        engine.txn_abort(handle);
                        return Err(CoreError::Interrupted);
                    }
                    return Ok(handle);
                }
                Err(err) if err.code() == ErrorCode::MapResized => {
                    warn!("map resized by another process, adopting new size");
                    engine.resize_map(0)?;
                }
                Err(err) if err.code() == ErrorCode::Interrupted => {
                    return Err(CoreError::Interrupted);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}
