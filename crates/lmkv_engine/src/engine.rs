//! Engine trait definition.

use crate::error::EngineResult;
use crate::flags::{DatabaseFlags, EnvFlags, TxnFlags, WriteFlags};
use crate::types::{CursorHandle, CursorOp, Info, Record, Stat, TableHandle, TxnHandle};
use std::cmp::Ordering;
use std::path::Path;

/// The primitive interface of a transactional key-value engine.
///
/// Engines hand out opaque handles and know nothing about threads or
/// handle lifetimes above them; the caller is responsible for never
/// using a handle after it has been finished. Engines must still fail
/// cleanly (not corrupt state) when given a stale handle.
///
/// # Invariants
///
/// - At most one top-level read-write transaction exists at a time;
///   `txn_begin` blocks until the writer slot is free
/// - Read-only transactions see the snapshot committed when they began
/// - A nested transaction sees its parent's uncommitted writes and is
///   merged into the parent on commit
/// - Finishing a transaction finishes its open children and frees its
///   cursors
/// - A missing key is `Ok(None)`, never an error
///
/// # Implementors
///
/// - [`crate::SnapshotEngine`] - copy-on-write snapshots, optionally
///   persisted to a data file
pub trait Engine: Send + Sync {
    /// Returns the path the engine was opened on, if any.
    fn path(&self) -> Option<&Path>;

    /// Returns the current environment flags.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine is closed.
    fn flags(&self) -> EngineResult<EnvFlags>;

    /// Replaces the runtime-changeable environment flags.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if a flag that can only be set at open
    /// time would change.
    fn set_flags(&self, flags: EnvFlags) -> EngineResult<()>;

    /// Begins a transaction, nested under `parent` if given.
    ///
    /// For a top-level write transaction this may block waiting for the
    /// writer slot. `interrupted` is polled while waiting; when it returns
    /// true the wait is abandoned with `Interrupted`.
    ///
    /// # Errors
    ///
    /// Returns `MapResized` when the caller must adopt a new map size with
    /// [`Engine::resize_map`] and retry.
    fn txn_begin(
        &self,
        parent: Option<TxnHandle>,
        flags: TxnFlags,
        interrupted: &dyn Fn() -> bool,
    ) -> EngineResult<TxnHandle>;

    /// Commits a transaction. The handle is freed even when this fails.
    ///
    /// # Errors
    ///
    /// Returns `MapFull` if the committed data would exceed the map size,
    /// or an I/O error if persisting failed.
    fn txn_commit(&self, txn: TxnHandle) -> EngineResult<()>;

    /// Aborts a transaction, discarding its writes and its children.
    fn txn_abort(&self, txn: TxnHandle);

    /// Opens a table by name (`None` is the main table).
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing table without `create`, `DbsFull`
    /// when the table limit is reached, `Incompatible` when the stored
    /// flags differ.
    fn table_open(
        &self,
        txn: TxnHandle,
        name: Option<&str>,
        flags: DatabaseFlags,
    ) -> EngineResult<TableHandle>;

    /// Returns the stored flags of an open table.
    ///
    /// # Errors
    ///
    /// Returns `BadDbi` for an unknown handle.
    fn table_flags(&self, table: TableHandle) -> EngineResult<DatabaseFlags>;

    /// Empties a table, or deletes it and closes its handle if `delete`.
    ///
    /// # Errors
    ///
    /// Returns `Access` for read-only transactions.
    fn table_drop(&self, txn: TxnHandle, table: TableHandle, delete: bool) -> EngineResult<()>;

    /// Reads the value of a key (the first duplicate for dupsort tables).
    ///
    /// # Errors
    ///
    /// Returns an error for invalid handles.
    fn get(&self, txn: TxnHandle, table: TableHandle, key: &[u8]) -> EngineResult<Option<Vec<u8>>>;

    /// Stores a key/value pair.
    ///
    /// # Errors
    ///
    /// Returns `KeyExist` when a write flag forbids the write, `Access` for
    /// read-only transactions, `BadValSize` for unsupported sizes.
    fn put(
        &self,
        txn: TxnHandle,
        table: TableHandle,
        key: &[u8],
        value: &[u8],
        flags: WriteFlags,
    ) -> EngineResult<()>;

    /// Deletes a key, or one duplicate if `value` is given.
    ///
    /// Returns false when nothing matched.
    ///
    /// # Errors
    ///
    /// Returns `Access` for read-only transactions.
    fn delete(
        &self,
        txn: TxnHandle,
        table: TableHandle,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> EngineResult<bool>;

    /// Opens a cursor over a table.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid handles.
    fn cursor_open(&self, txn: TxnHandle, table: TableHandle) -> EngineResult<CursorHandle>;

    /// Closes a cursor. Unknown handles are ignored.
    fn cursor_close(&self, cursor: CursorHandle);

    /// Moves the cursor and returns the record at the new position.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `op` needs a key and none was given.
    fn cursor_get(
        &self,
        cursor: CursorHandle,
        op: CursorOp,
        key: Option<&[u8]>,
    ) -> EngineResult<Option<Record>>;

    /// Stores a key/value pair through the cursor and positions on it.
    ///
    /// # Errors
    ///
    /// As [`Engine::put`]; `current` needs a positioned cursor.
    fn cursor_put(
        &self,
        cursor: CursorHandle,
        key: &[u8],
        value: &[u8],
        flags: WriteFlags,
    ) -> EngineResult<()>;

    /// Deletes the record at the cursor (all duplicates if `all_dups`).
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an unpositioned cursor.
    fn cursor_delete(&self, cursor: CursorHandle, all_dups: bool) -> EngineResult<()>;

    /// Counts the duplicates of the key at the cursor.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an unpositioned cursor.
    fn cursor_count(&self, cursor: CursorHandle) -> EngineResult<usize>;

    /// Compares two keys using the table's key ordering.
    ///
    /// # Errors
    ///
    /// Returns `BadDbi` for an unknown handle.
    fn compare(&self, table: TableHandle, a: &[u8], b: &[u8]) -> EngineResult<Ordering>;

    /// Statistics of the main table in the last committed snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine is closed.
    fn stat(&self) -> EngineResult<Stat>;

    /// Statistics of a table as seen by a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid handles.
    fn table_stat(&self, txn: TxnHandle, table: TableHandle) -> EngineResult<Stat>;

    /// Environment information.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine is closed.
    fn info(&self) -> EngineResult<Info>;

    /// Writes a consistent copy of the committed data to `dest`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the copy cannot be written.
    fn copy(&self, dest: &Path) -> EngineResult<()>;

    /// Flushes committed data to disk. Without `force`, a no-sync
    /// environment skips the flush.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the flush fails.
    fn sync(&self, force: bool) -> EngineResult<()>;

    /// Sets a new map size. Zero adopts the size currently in use.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` while a write transaction is active or if
    /// the size is smaller than the committed data.
    fn resize_map(&self, new_size: u64) -> EngineResult<()>;

    /// Releases the engine. Every handle becomes invalid.
    fn close(&self);
}
