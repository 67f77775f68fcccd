//! Copy-on-write snapshot engine.
//!
//! Every table is an immutable `Arc<Table>`; a write transaction clones
//! the handful of tables it touches and a commit installs the new map
//! of tables as the committed snapshot. Readers keep whatever snapshot
//! was committed when they began.
//!
//! When opened on a path the committed snapshot is written to a data
//! file on every top-level commit.

mod file;
mod state;
mod table;

pub use table::{MAX_KEY_SIZE, PAGE_SIZE};

use crate::engine::Engine;
use crate::error::{EngineError, EngineResult, ErrorCode};
use crate::flags::{
    DatabaseFlags, EngineOptions, EnvFlags, TxnFlags, WriteFlags, DEFAULT_MAP_SIZE,
};
use crate::types::{CursorHandle, CursorOp, Info, Record, Stat, TableHandle, TxnHandle};
use file::DataFile;
use parking_lot::{Condvar, Mutex, MutexGuard};
use state::{dbi, data_size, CursorSlot, DbiSlot, EngineState, Snapshot, Tables, TxnSlot};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use table::{ByteOrder, Table};
use tracing::{debug, trace};

/// How often a blocked writer re-checks its interrupt predicate.
const WRITER_POLL: Duration = Duration::from_millis(10);

/// The reference [`Engine`]: in-memory tables with optional file persistence.
///
/// # Example
///
/// ```rust,ignore
/// use lmkv_engine::{Engine, EngineOptions, SnapshotEngine, TxnFlags};
///
/// let engine = SnapshotEngine::in_memory(&EngineOptions::default());
/// let txn = engine.txn_begin(None, TxnFlags::READ_WRITE, &|| false)?;
/// ```
#[derive(Debug)]
pub struct SnapshotEngine {
    path: Option<PathBuf>,
    options: EngineOptions,
    state: Mutex<EngineState>,
    /// The top-level write transaction holding the writer slot.
    writer: Mutex<Option<TxnHandle>>,
    writer_free: Condvar,
    file: Mutex<Option<DataFile>>,
    closed: AtomicBool,
}

/// Frees the writer slot when a top-level write transaction ends.
struct WriterRelease<'a> {
    engine: &'a SnapshotEngine,
    txn: TxnHandle,
}

impl Drop for WriterRelease<'_> {
    fn drop(&mut self) {
        self.engine.release_writer(self.txn);
    }
}

fn normalize(options: &EngineOptions) -> EngineOptions {
    EngineOptions {
        map_size: if options.map_size == 0 {
            DEFAULT_MAP_SIZE
        } else {
            options.map_size
        },
        max_readers: options.max_readers.max(1),
        ..*options
    }
}

fn unpositioned() -> EngineError {
    EngineError::invalid_argument("cursor is not positioned")
}

fn unchanged(a: &Tables, b: &Tables) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|((na, ta), (nb, tb))| na == nb && Arc::ptr_eq(ta, tb))
}

impl SnapshotEngine {
    /// Opens a persistent engine on `path`.
    ///
    /// Without `no_sub_dir` the path must be an existing directory; the
    /// data and lock files are created inside it.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the directory (or, read-only, the data file)
    /// is missing, `Busy` if another handle holds the lock, and
    /// `Invalid`/`Corrupted`/`VersionMismatch` for unreadable data files.
    pub fn open(path: impl AsRef<Path>, options: &EngineOptions) -> EngineResult<Self> {
        let path = path.as_ref();
        let options = normalize(options);
        let file = DataFile::open(path, &options)?;
        let (snapshot, stored_map_size) = file
            .load()?
            .unwrap_or_else(|| (Snapshot::empty(), 0));
        let map_size = options.map_size.max(stored_map_size);
        debug!(
            path = %file.data_path().display(),
            map_size,
            txn_id = snapshot.txn_id,
            "engine opened"
        );
        Ok(Self::build(
            Some(path.to_path_buf()),
            options,
            snapshot,
            map_size,
            Some(file),
        ))
    }

    /// Creates an engine that keeps everything in memory.
    #[must_use]
    pub fn in_memory(options: &EngineOptions) -> Self {
        let options = normalize(options);
        Self::build(None, options, Snapshot::empty(), options.map_size, None)
    }

    fn build(
        path: Option<PathBuf>,
        options: EngineOptions,
        snapshot: Snapshot,
        map_size: u64,
        file: Option<DataFile>,
    ) -> Self {
        Self {
            path,
            options,
            state: Mutex::new(EngineState::new(snapshot, options.flags, map_size)),
            writer: Mutex::new(None),
            writer_free: Condvar::new(),
            file: Mutex::new(file),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns true once [`Engine::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::Acquire)
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.is_closed() {
            return Err(EngineError::invalid_argument("environment is closed"));
        }
        Ok(())
    }

    fn lock_state(&self) -> EngineResult<MutexGuard<'_, EngineState>> {
        self.ensure_open()?;
        Ok(self.state.lock())
    }

    fn acquire_writer(&self, txn: TxnHandle, interrupted: &dyn Fn() -> bool) -> EngineResult<()> {
        let mut writer = self.writer.lock();
        while writer.is_some() {
            if interrupted() {
                return Err(EngineError::new(
                    ErrorCode::Interrupted,
                    "interrupted while waiting for the writer slot",
                ));
            }
            self.ensure_open()?;
            self.writer_free.wait_for(&mut writer, WRITER_POLL);
        }
        self.ensure_open()?;
        *writer = Some(txn);
        Ok(())
    }

    fn release_writer(&self, txn: TxnHandle) {
        let mut writer = self.writer.lock();
        if *writer == Some(txn) {
            *writer = None;
            self.writer_free.notify_all();
        }
    }

    fn begin_write(&self, interrupted: &dyn Fn() -> bool) -> EngineResult<TxnHandle> {
        if self.options.flags.read_only {
            return Err(EngineError::access("environment is read-only"));
        }
        let txn = TxnHandle::new(self.lock_state()?.next_id());
        self.acquire_writer(txn, interrupted)?;

        let mut state = self.state.lock();
        if self.is_closed() {
            drop(state);
            self.release_writer(txn);
            return Err(EngineError::invalid_argument("environment is closed"));
        }
        let tables = state.committed.tables.clone();
        state.txns.insert(
            txn,
            TxnSlot {
                parent: None,
                child: None,
                read_only: false,
                tables,
                created: Vec::new(),
            },
        );
        trace!(%txn, "write transaction started");
        Ok(txn)
    }

    fn begin_read(&self) -> EngineResult<TxnHandle> {
        let mut state = self.lock_state()?;
        if state.readers >= self.options.max_readers {
            return Err(EngineError::new(
                ErrorCode::ReadersFull,
                format!("all {} reader slots are in use", self.options.max_readers),
            ));
        }
        let txn = TxnHandle::new(state.next_id());
        let tables = state.committed.tables.clone();
        state.readers += 1;
        state.txns.insert(
            txn,
            TxnSlot {
                parent: None,
                child: None,
                read_only: true,
                tables,
                created: Vec::new(),
            },
        );
        trace!(%txn, "read transaction started");
        Ok(txn)
    }

    fn begin_nested(&self, parent: TxnHandle, flags: TxnFlags) -> EngineResult<TxnHandle> {
        let mut state = self.lock_state()?;
        if state.flags.write_map {
            return Err(EngineError::invalid_argument(
                "nested transactions are not supported with write-map",
            ));
        }
        let parent_slot = state.txn(parent)?;
        if parent_slot.read_only || flags.read_only {
            return Err(EngineError::invalid_argument(
                "nested transactions must be read-write",
            ));
        }
        parent_slot.ensure_usable()?;

        let tables = parent_slot.tables.clone();
        let txn = TxnHandle::new(state.next_id());
        state.txn_mut(parent)?.child = Some(txn);
        state.txns.insert(
            txn,
            TxnSlot {
                parent: Some(parent),
                child: None,
                read_only: false,
                tables,
                created: Vec::new(),
            },
        );
        trace!(%txn, %parent, "nested transaction started");
        Ok(txn)
    }
}

impl Engine for SnapshotEngine {
    fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn flags(&self) -> EngineResult<EnvFlags> {
        Ok(self.lock_state()?.flags)
    }

    fn set_flags(&self, flags: EnvFlags) -> EngineResult<()> {
        let mut state = self.lock_state()?;
        if let Some(flag) = state.flags.fixed_difference(&flags) {
            return Err(EngineError::invalid_argument(format!(
                "flag {flag} can only be set when opening"
            )));
        }
        state.flags = flags;
        Ok(())
    }

    fn txn_begin(
        &self,
        parent: Option<TxnHandle>,
        flags: TxnFlags,
        interrupted: &dyn Fn() -> bool,
    ) -> EngineResult<TxnHandle> {
        match parent {
            Some(parent) => self.begin_nested(parent, flags),
            None if flags.read_only => self.begin_read(),
            None => self.begin_write(interrupted),
        }
    }

    fn txn_commit(&self, txn: TxnHandle) -> EngineResult<()> {
        let mut state = self.lock_state()?;
        state.txn(txn)?;
        state.merge_descendants(txn);
        let slot = state
            .finish(txn)
            .ok_or_else(|| EngineError::bad_txn(format!("{txn} is not live")))?;
        if slot.read_only {
            return Ok(());
        }
        if let Some(parent) = slot.parent {
            state.txn(parent)?;
            state.fold_into_parent(slot);
            trace!(%txn, %parent, "nested transaction merged");
            return Ok(());
        }

        let _writer = WriterRelease { engine: self, txn };
        if unchanged(&slot.tables, &state.committed.tables) {
            return Ok(());
        }
        let size = data_size(&slot.tables);
        if size > state.map_size {
            let map_size = state.map_size;
            drop(state);
            return Err(EngineError::new(
                ErrorCode::MapFull,
                format!("{size} bytes exceed map size {map_size}"),
            ));
        }
        let snapshot = Snapshot {
            txn_id: state.committed.txn_id + 1,
            tables: slot.tables,
        };
        let map_size = state.map_size;
        let durable = !state.flags.no_sync;
        drop(state);

        if let Some(file) = self.file.lock().as_ref() {
            file.store(&snapshot, map_size, durable)?;
        }
        let txn_id = snapshot.txn_id;
        self.state.lock().committed = Arc::new(snapshot);
        debug!(%txn, txn_id, size, "transaction committed");
        Ok(())
    }

    fn txn_abort(&self, txn: TxnHandle) {
        let mut state = self.state.lock();
        if let Some(slot) = state.abort_chain(txn) {
            drop(state);
            if slot.parent.is_none() && !slot.read_only {
                self.release_writer(txn);
            }
            trace!(%txn, "transaction aborted");
        }
    }

    fn table_open(
        &self,
        txn: TxnHandle,
        name: Option<&str>,
        flags: DatabaseFlags,
    ) -> EngineResult<TableHandle> {
        let mut state = self.lock_state()?;
        let slot = state.txn(txn)?;
        slot.ensure_usable()?;
        let Some(name) = name else {
            return Ok(TableHandle::MAIN);
        };

        let key = Some(name.to_string());
        let wanted = flags.persistent();
        let stored = slot.tables.get(&key).map(|table| table.flags());
        let read_only = slot.read_only;
        let existing = state
            .dbis
            .iter()
            .position(|d| d.as_ref().is_some_and(|d| d.name.as_deref() == Some(name)));

        if existing.is_none() && state.named_tables() >= self.options.max_dbs as usize {
            return Err(EngineError::new(
                ErrorCode::DbsFull,
                format!("opening table '{name}'"),
            ));
        }

        let table_flags = match stored {
            Some(stored) => {
                if wanted != DatabaseFlags::new() && wanted != stored {
                    return Err(EngineError::new(
                        ErrorCode::Incompatible,
                        format!("table '{name}' was created with different flags"),
                    ));
                }
                stored
            }
            None => {
                if !flags.create {
                    return Err(EngineError::not_found(format!(
                        "table '{name}' does not exist"
                    )));
                }
                if read_only {
                    return Err(EngineError::access(format!(
                        "cannot create table '{name}' in a read-only transaction"
                    )));
                }
                state
                    .txn_mut(txn)?
                    .tables
                    .insert(key.clone(), Arc::new(Table::new(wanted)));
                wanted
            }
        };

        let dbi_slot = Some(DbiSlot {
            name: key,
            flags: table_flags,
        });
        let index = match existing {
            Some(index) => {
                state.dbis[index] = dbi_slot;
                index
            }
            None => {
                state.dbis.push(dbi_slot);
                let index = state.dbis.len() - 1;
                if stored.is_none() {
                    state.txn_mut(txn)?.created.push(index);
                }
                index
            }
        };
        let index = u32::try_from(index)
            .map_err(|_| EngineError::new(ErrorCode::DbsFull, "table handle overflow"))?;
        Ok(TableHandle::new(index))
    }

    fn table_flags(&self, table: TableHandle) -> EngineResult<DatabaseFlags> {
        Ok(self.lock_state()?.dbi(table)?.flags)
    }

    fn table_drop(&self, txn: TxnHandle, table: TableHandle, delete: bool) -> EngineResult<()> {
        let mut state = self.lock_state()?;
        let name = state.dbi(table)?.name.clone();
        let slot = state.txn_mut(txn)?;
        slot.ensure_writable()?;
        let flags = slot.table(&name)?.flags();
        if delete && name.is_some() {
            slot.tables.remove(&name);
            state.dbis[table.as_u32() as usize] = None;
        } else {
            slot.tables.insert(name, Arc::new(Table::new(flags)));
        }
        Ok(())
    }

    fn get(&self, txn: TxnHandle, table: TableHandle, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        let state = self.lock_state()?;
        let name = &state.dbi(table)?.name;
        let slot = state.txn(txn)?;
        slot.ensure_usable()?;
        slot.table(name)?.get(key)
    }

    fn put(
        &self,
        txn: TxnHandle,
        table: TableHandle,
        key: &[u8],
        value: &[u8],
        flags: WriteFlags,
    ) -> EngineResult<()> {
        let mut state = self.lock_state()?;
        let name = state.dbi(table)?.name.clone();
        let slot = state.txn_mut(txn)?;
        slot.ensure_writable()?;
        slot.table_mut(&name)?.put(key, value, flags)?;
        Ok(())
    }

    fn delete(
        &self,
        txn: TxnHandle,
        table: TableHandle,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> EngineResult<bool> {
        let mut state = self.lock_state()?;
        let name = state.dbi(table)?.name.clone();
        let slot = state.txn_mut(txn)?;
        slot.ensure_writable()?;
        slot.table_mut(&name)?.delete(key, value)
    }

    fn cursor_open(&self, txn: TxnHandle, table: TableHandle) -> EngineResult<CursorHandle> {
        let mut state = self.lock_state()?;
        let name = &state.dbi(table)?.name;
        let slot = state.txn(txn)?;
        slot.ensure_usable()?;
        slot.table(name)?;
        let cursor = CursorHandle::new(state.next_id());
        state.cursors.insert(
            cursor,
            CursorSlot {
                txn,
                table,
                position: None,
            },
        );
        Ok(cursor)
    }

    fn cursor_close(&self, cursor: CursorHandle) {
        self.state.lock().cursors.remove(&cursor);
    }

    fn cursor_get(
        &self,
        cursor: CursorHandle,
        op: CursorOp,
        key: Option<&[u8]>,
    ) -> EngineResult<Option<Record>> {
        let mut guard = self.lock_state()?;
        let state = &mut *guard;
        let cursor = state
            .cursors
            .get_mut(&cursor)
            .ok_or_else(|| EngineError::invalid_argument(format!("{cursor} is not open")))?;
        let name = &dbi(&state.dbis, cursor.table)?.name;
        let slot = state
            .txns
            .get(&cursor.txn)
            .ok_or_else(|| EngineError::bad_txn("cursor transaction is not live"))?;
        slot.ensure_usable()?;
        let table = slot.table(name)?;

        let current = cursor.position.as_ref();
        let key = || {
            key.ok_or_else(|| EngineError::invalid_argument(format!("{op:?} requires a key")))
        };
        let found = match op {
            CursorOp::First => table.first(),
            CursorOp::Last => table.last(),
            CursorOp::Next => match current {
                Some(pos) => table.next(pos),
                None => table.first(),
            },
            CursorOp::Prev => match current {
                Some(pos) => table.prev(pos),
                None => table.last(),
            },
            CursorOp::GetCurrent => current.filter(|pos| table.contains(pos)).cloned(),
            CursorOp::Set => table.seek(key()?)?,
            CursorOp::SetRange => table.seek_range(key()?)?,
            CursorOp::FirstDup => table.first_dup(&current.ok_or_else(unpositioned)?.0),
            CursorOp::LastDup => table.last_dup(&current.ok_or_else(unpositioned)?.0),
            CursorOp::NextDup => table.next_dup(current.ok_or_else(unpositioned)?),
            CursorOp::PrevDup => table.prev_dup(current.ok_or_else(unpositioned)?),
            CursorOp::NextNoDup => match current {
                Some(pos) => table.next_key(&pos.0),
                None => table.first(),
            },
            CursorOp::PrevNoDup => match current {
                Some(pos) => table.prev_key(&pos.0),
                None => table.last(),
            },
        };

        let Some(pos) = found else {
            return Ok(None);
        };
        let record = table.decode(&pos);
        cursor.position = Some(pos);
        Ok(Some(record))
    }

    fn cursor_put(
        &self,
        cursor: CursorHandle,
        key: &[u8],
        value: &[u8],
        flags: WriteFlags,
    ) -> EngineResult<()> {
        let mut guard = self.lock_state()?;
        let state = &mut *guard;
        let cursor = state
            .cursors
            .get_mut(&cursor)
            .ok_or_else(|| EngineError::invalid_argument(format!("{cursor} is not open")))?;
        let name = dbi(&state.dbis, cursor.table)?.name.clone();
        let slot = state
            .txns
            .get_mut(&cursor.txn)
            .ok_or_else(|| EngineError::bad_txn("cursor transaction is not live"))?;
        slot.ensure_writable()?;
        let table = slot.table_mut(&name)?;

        let pos = if flags.current {
            let current = cursor
                .position
                .clone()
                .filter(|pos| table.contains(pos))
                .ok_or_else(unpositioned)?;
            table.replace(&current, key, value)?
        } else {
            table.put(key, value, flags)?
        };
        cursor.position = Some(pos);
        Ok(())
    }

    fn cursor_delete(&self, cursor: CursorHandle, all_dups: bool) -> EngineResult<()> {
        let mut guard = self.lock_state()?;
        let state = &mut *guard;
        let cursor = state
            .cursors
            .get_mut(&cursor)
            .ok_or_else(|| EngineError::invalid_argument(format!("{cursor} is not open")))?;
        let name = dbi(&state.dbis, cursor.table)?.name.clone();
        let slot = state
            .txns
            .get_mut(&cursor.txn)
            .ok_or_else(|| EngineError::bad_txn("cursor transaction is not live"))?;
        slot.ensure_writable()?;
        let table = slot.table_mut(&name)?;

        // The cursor keeps pointing at the removed item so that Next and
        // Prev continue from where it was.
        let current = cursor
            .position
            .clone()
            .filter(|pos| table.contains(pos))
            .ok_or_else(unpositioned)?;
        if all_dups {
            table.remove_key(&current.0);
        } else {
            table.remove_item(&current);
        }
        Ok(())
    }

    fn cursor_count(&self, cursor: CursorHandle) -> EngineResult<usize> {
        let state = self.lock_state()?;
        let cursor = state
            .cursors
            .get(&cursor)
            .ok_or_else(|| EngineError::invalid_argument(format!("{cursor} is not open")))?;
        let name = &state.dbi(cursor.table)?.name;
        let table = state.txn(cursor.txn)?.table(name)?;
        let current = cursor
            .position
            .as_ref()
            .filter(|pos| table.contains(pos))
            .ok_or_else(unpositioned)?;
        Ok(table.dup_count(&current.0))
    }

    fn compare(&self, table: TableHandle, a: &[u8], b: &[u8]) -> EngineResult<Ordering> {
        let flags = self.lock_state()?.dbi(table)?.flags;
        ByteOrder::for_keys(flags).compare(a, b)
    }

    fn stat(&self) -> EngineResult<Stat> {
        let state = self.lock_state()?;
        Ok(state
            .committed
            .tables
            .get(&None)
            .map(|table| table.stat())
            .unwrap_or_default())
    }

    fn table_stat(&self, txn: TxnHandle, table: TableHandle) -> EngineResult<Stat> {
        let state = self.lock_state()?;
        let name = &state.dbi(table)?.name;
        let slot = state.txn(txn)?;
        slot.ensure_usable()?;
        Ok(slot.table(name)?.stat())
    }

    fn info(&self) -> EngineResult<Info> {
        let state = self.lock_state()?;
        Ok(Info {
            map_addr: 0,
            map_size: state.map_size,
            last_page: state.committed.data_size() / u64::from(PAGE_SIZE),
            last_txn_id: state.committed.txn_id,
            max_readers: self.options.max_readers,
            num_readers: state.readers,
        })
    }

    fn copy(&self, dest: &Path) -> EngineResult<()> {
        let (snapshot, map_size) = {
            let state = self.lock_state()?;
            (Arc::clone(&state.committed), state.map_size)
        };
        file::write_copy(
            dest,
            self.options.flags.no_sub_dir,
            &snapshot,
            map_size,
            self.options.mode,
        )?;
        debug!(dest = %dest.display(), txn_id = snapshot.txn_id, "environment copied");
        Ok(())
    }

    fn sync(&self, force: bool) -> EngineResult<()> {
        let flags = self.lock_state()?.flags;
        if !force && (flags.no_sync || flags.map_async) {
            return Ok(());
        }
        match self.file.lock().as_ref() {
            Some(file) => file.sync(),
            None => Ok(()),
        }
    }

    fn resize_map(&self, new_size: u64) -> EngineResult<()> {
        self.ensure_open()?;
        // Zero adopts the size recorded in the data file, which this engine
        // always has in memory already.
        if new_size == 0 {
            return Ok(());
        }
        // Held until the new size is in place so no writer can begin meanwhile.
        let writer = self.writer.lock();
        if writer.is_some() {
            return Err(EngineError::invalid_argument(
                "cannot resize while a write transaction is active",
            ));
        }
        let mut state = self.state.lock();
        let used = state.committed.data_size();
        if new_size < used {
            return Err(EngineError::invalid_argument(format!(
                "map size {new_size} is smaller than the {used} bytes in use"
            )));
        }
        state.map_size = new_size;
        debug!(map_size = new_size, "map resized");
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, AtomicOrdering::AcqRel) {
            return;
        }
        {
            let mut state = self.state.lock();
            state.txns.clear();
            state.cursors.clear();
            state.readers = 0;
        }
        {
            let mut writer = self.writer.lock();
            *writer = None;
            self.writer_free.notify_all();
        }
        self.file.lock().take();
        debug!("engine closed");
    }
}
