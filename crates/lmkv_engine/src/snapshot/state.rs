//! Bookkeeping for live transactions, cursors and table handles.

use super::table::{Position, Table};
use crate::error::{EngineError, EngineResult};
use crate::flags::{DatabaseFlags, EnvFlags};
use crate::types::{CursorHandle, TableHandle, TxnHandle};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Tables by name; `None` is the main table.
pub(crate) type Tables = BTreeMap<Option<String>, Arc<Table>>;

/// A committed, immutable view of every table.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    pub txn_id: u64,
    pub tables: Tables,
}

impl Snapshot {
    pub(crate) fn empty() -> Self {
        let mut tables = Tables::new();
        tables.insert(None, Arc::new(Table::default()));
        Self { txn_id: 0, tables }
    }

    pub(crate) fn data_size(&self) -> u64 {
        data_size(&self.tables)
    }
}

/// Bookkeeping counted per table against the map size.
const TABLE_OVERHEAD: u64 = 64;

pub(crate) fn data_size(tables: &Tables) -> u64 {
    tables
        .values()
        .map(|table| table.byte_size() + TABLE_OVERHEAD)
        .sum()
}

#[derive(Debug)]
pub(crate) struct TxnSlot {
    pub parent: Option<TxnHandle>,
    pub child: Option<TxnHandle>,
    pub read_only: bool,
    pub tables: Tables,
    /// Table handles created by this transaction or its committed
    /// children. Freed again if the transaction aborts.
    pub created: Vec<usize>,
}

impl TxnSlot {
    pub(crate) fn table(&self, name: &Option<String>) -> EngineResult<&Table> {
        self.tables
            .get(name)
            .map(AsRef::as_ref)
            .ok_or_else(|| EngineError::bad_dbi("table does not exist in this transaction"))
    }

    pub(crate) fn table_mut(&mut self, name: &Option<String>) -> EngineResult<&mut Table> {
        self.tables
            .get_mut(name)
            .map(Arc::make_mut)
            .ok_or_else(|| EngineError::bad_dbi("table does not exist in this transaction"))
    }

    pub(crate) fn ensure_usable(&self) -> EngineResult<()> {
        if self.child.is_some() {
            return Err(EngineError::bad_txn("transaction has an active child"));
        }
        Ok(())
    }

    pub(crate) fn ensure_writable(&self) -> EngineResult<()> {
        self.ensure_usable()?;
        if self.read_only {
            return Err(EngineError::access("transaction is read-only"));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct CursorSlot {
    pub txn: TxnHandle,
    pub table: TableHandle,
    pub position: Option<Position>,
}

#[derive(Debug, Clone)]
pub(crate) struct DbiSlot {
    pub name: Option<String>,
    pub flags: DatabaseFlags,
}

/// Everything guarded by the engine's state lock.
#[derive(Debug)]
pub(crate) struct EngineState {
    pub committed: Arc<Snapshot>,
    pub txns: HashMap<TxnHandle, TxnSlot>,
    pub cursors: HashMap<CursorHandle, CursorSlot>,
    /// Index 0 is the main table. Deleted tables leave a `None` hole so
    /// stale handles never alias a newer table.
    pub dbis: Vec<Option<DbiSlot>>,
    pub flags: EnvFlags,
    pub map_size: u64,
    pub readers: u32,
    pub next_id: u64,
}

impl EngineState {
    pub(crate) fn new(committed: Snapshot, flags: EnvFlags, map_size: u64) -> Self {
        let main_flags = committed
            .tables
            .get(&None)
            .map(|table| table.flags())
            .unwrap_or_default();
        Self {
            committed: Arc::new(committed),
            txns: HashMap::new(),
            cursors: HashMap::new(),
            dbis: vec![Some(DbiSlot {
                name: None,
                flags: main_flags,
            })],
            flags,
            map_size,
            readers: 0,
            next_id: 1,
        }
    }

    pub(crate) fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub(crate) fn txn(&self, txn: TxnHandle) -> EngineResult<&TxnSlot> {
        self.txns
            .get(&txn)
            .ok_or_else(|| EngineError::bad_txn(format!("{txn} is not live")))
    }

    pub(crate) fn txn_mut(&mut self, txn: TxnHandle) -> EngineResult<&mut TxnSlot> {
        self.txns
            .get_mut(&txn)
            .ok_or_else(|| EngineError::bad_txn(format!("{txn} is not live")))
    }

    pub(crate) fn dbi(&self, table: TableHandle) -> EngineResult<&DbiSlot> {
        dbi(&self.dbis, table)
    }

    pub(crate) fn named_tables(&self) -> usize {
        self.dbis
            .iter()
            .flatten()
            .filter(|slot| slot.name.is_some())
            .count()
    }

    /// Handles from `txn` down to its innermost open descendant.
    pub(crate) fn chain(&self, txn: TxnHandle) -> Vec<TxnHandle> {
        let mut chain = vec![txn];
        let mut current = txn;
        while let Some(child) = self.txns.get(&current).and_then(|slot| slot.child) {
            chain.push(child);
            current = child;
        }
        chain
    }

    /// Removes a transaction slot together with its cursors.
    pub(crate) fn finish(&mut self, txn: TxnHandle) -> Option<TxnSlot> {
        let slot = self.txns.remove(&txn)?;
        self.cursors.retain(|_, cursor| cursor.txn != txn);
        match slot.parent {
            Some(parent) => {
                if let Some(parent) = self.txns.get_mut(&parent) {
                    parent.child = None;
                }
            }
            None if slot.read_only => self.readers = self.readers.saturating_sub(1),
            None => {}
        }
        Some(slot)
    }

    /// Commits every open descendant of `txn` into its parent, innermost first.
    pub(crate) fn merge_descendants(&mut self, txn: TxnHandle) {
        let chain = self.chain(txn);
        for child in chain.into_iter().skip(1).rev() {
            if let Some(slot) = self.finish(child) {
                self.fold_into_parent(slot);
            }
        }
    }

    /// Hands a finished nested transaction's tables and created handles to
    /// its parent.
    pub(crate) fn fold_into_parent(&mut self, slot: TxnSlot) {
        if let Some(parent) = slot.parent.and_then(|p| self.txns.get_mut(&p)) {
            parent.tables = slot.tables;
            parent.created.extend(slot.created);
        }
    }

    /// Aborts `txn` and every open descendant, innermost first.
    pub(crate) fn abort_chain(&mut self, txn: TxnHandle) -> Option<TxnSlot> {
        let chain = self.chain(txn);
        let mut last = None;
        for handle in chain.into_iter().rev() {
            last = self.finish(handle);
            if let Some(slot) = &last {
                for &index in &slot.created {
                    if let Some(dbi) = self.dbis.get_mut(index) {
                        *dbi = None;
                    }
                }
            }
        }
        last
    }
}

pub(crate) fn dbi(dbis: &[Option<DbiSlot>], table: TableHandle) -> EngineResult<&DbiSlot> {
    dbis.get(table.as_u32() as usize)
        .and_then(Option::as_ref)
        .ok_or_else(|| EngineError::bad_dbi(format!("{table} is not open")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::WriteFlags;

    fn state() -> EngineState {
        EngineState::new(Snapshot::empty(), EnvFlags::new(), 1 << 20)
    }

    fn open(state: &mut EngineState, parent: Option<TxnHandle>, read_only: bool) -> TxnHandle {
        let handle = TxnHandle::new(state.next_id());
        let tables = match parent {
            Some(p) => state.txns[&p].tables.clone(),
            None => state.committed.tables.clone(),
        };
        if let Some(p) = parent {
            state.txns.get_mut(&p).unwrap().child = Some(handle);
        } else if read_only {
            state.readers += 1;
        }
        state.txns.insert(
            handle,
            TxnSlot {
                parent,
                child: None,
                read_only,
                tables,
                created: Vec::new(),
            },
        );
        handle
    }

    #[test]
    fn merge_descendants_folds_writes_upwards() {
        let mut state = state();
        let top = open(&mut state, None, false);
        let mid = open(&mut state, Some(top), false);
        let inner = open(&mut state, Some(mid), false);

        state
            .txn_mut(inner)
            .unwrap()
            .table_mut(&None)
            .unwrap()
            .put(b"k", b"v", WriteFlags::new())
            .unwrap();

        state.merge_descendants(top);
        assert!(state.txns.get(&mid).is_none());
        assert!(state.txns.get(&inner).is_none());
        let top_slot = state.txn(top).unwrap();
        assert!(top_slot.child.is_none());
        assert_eq!(top_slot.table(&None).unwrap().get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn abort_chain_discards_everything() {
        let mut state = state();
        let top = open(&mut state, None, false);
        let child = open(&mut state, Some(top), false);
        state.cursors.insert(
            CursorHandle::new(9),
            CursorSlot {
                txn: child,
                table: TableHandle::MAIN,
                position: None,
            },
        );

        let slot = state.abort_chain(top).unwrap();
        assert!(slot.parent.is_none());
        assert!(state.txns.is_empty());
        assert!(state.cursors.is_empty());
    }

    #[test]
    fn finishing_reader_frees_slot() {
        let mut state = state();
        let reader = open(&mut state, None, true);
        assert_eq!(state.readers, 1);
        state.finish(reader);
        assert_eq!(state.readers, 0);
    }

    #[test]
    fn writes_through_parent_with_child_rejected() {
        let mut state = state();
        let top = open(&mut state, None, false);
        let _child = open(&mut state, Some(top), false);
        let err = state.txn(top).unwrap().ensure_writable().unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::BadTxn);
    }
}
