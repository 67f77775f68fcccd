//! Sorted tables and key orderings.

use crate::error::{EngineError, EngineResult, ErrorCode};
use crate::flags::{DatabaseFlags, WriteFlags};
use crate::types::{Record, Stat};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound::{Excluded, Included, Unbounded};

/// Largest key (and dupsort value) accepted.
pub const MAX_KEY_SIZE: usize = 511;

/// Page size reported in statistics.
pub const PAGE_SIZE: u32 = 4096;

/// Per-item bookkeeping counted against the map size.
const ITEM_OVERHEAD: u64 = 16;

/// An encoded `(key, value)` position inside a table.
pub(crate) type Position = (Vec<u8>, Vec<u8>);

/// How raw bytes are turned into their sortable form.
///
/// Every ordering is an involution, so the same transform decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ByteOrder {
    /// Plain lexicographic bytes.
    Lexical,
    /// Compare from the last byte to the first.
    Reverse,
    /// Native-endian unsigned integers of 4 or 8 bytes.
    Integer,
}

impl ByteOrder {
    pub(crate) fn for_keys(flags: DatabaseFlags) -> Self {
        if flags.integer_key {
            Self::Integer
        } else if flags.reverse_key {
            Self::Reverse
        } else {
            Self::Lexical
        }
    }

    pub(crate) fn for_dups(flags: DatabaseFlags) -> Self {
        if flags.integer_dup {
            Self::Integer
        } else if flags.reverse_dup {
            Self::Reverse
        } else {
            Self::Lexical
        }
    }

    pub(crate) fn encode(self, bytes: &[u8]) -> EngineResult<Vec<u8>> {
        match self {
            Self::Lexical => Ok(bytes.to_vec()),
            Self::Reverse => Ok(bytes.iter().rev().copied().collect()),
            Self::Integer => {
                if bytes.len() != 4 && bytes.len() != 8 {
                    return Err(EngineError::new(
                        ErrorCode::BadValSize,
                        format!("integer keys must be 4 or 8 bytes, got {}", bytes.len()),
                    ));
                }
                Ok(Self::native_to_big(bytes))
            }
        }
    }

    pub(crate) fn decode(self, bytes: &[u8]) -> Vec<u8> {
        match self {
            Self::Lexical => bytes.to_vec(),
            Self::Reverse => bytes.iter().rev().copied().collect(),
            Self::Integer => Self::native_to_big(bytes),
        }
    }

    pub(crate) fn compare(self, a: &[u8], b: &[u8]) -> EngineResult<Ordering> {
        Ok(self.encode(a)?.cmp(&self.encode(b)?))
    }

    #[cfg(target_endian = "little")]
    fn native_to_big(bytes: &[u8]) -> Vec<u8> {
        bytes.iter().rev().copied().collect()
    }

    #[cfg(target_endian = "big")]
    fn native_to_big(bytes: &[u8]) -> Vec<u8> {
        bytes.to_vec()
    }
}

/// A sorted table. Keys and values are stored in their encoded form.
///
/// Every key maps to a non-empty set of values; tables without
/// `dup_sort` hold exactly one value per key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Table {
    flags: DatabaseFlags,
    entries: BTreeMap<Vec<u8>, BTreeSet<Vec<u8>>>,
}

impl Table {
    pub(crate) fn new(flags: DatabaseFlags) -> Self {
        Self {
            flags: flags.persistent(),
            entries: BTreeMap::new(),
        }
    }

    pub(crate) fn from_entries(
        flags: DatabaseFlags,
        entries: BTreeMap<Vec<u8>, BTreeSet<Vec<u8>>>,
    ) -> Self {
        Self {
            flags: flags.persistent(),
            entries,
        }
    }

    pub(crate) fn flags(&self) -> DatabaseFlags {
        self.flags
    }

    pub(crate) fn entries(&self) -> &BTreeMap<Vec<u8>, BTreeSet<Vec<u8>>> {
        &self.entries
    }

    fn key_order(&self) -> ByteOrder {
        ByteOrder::for_keys(self.flags)
    }

    fn dup_order(&self) -> ByteOrder {
        if self.flags.dup_sort {
            ByteOrder::for_dups(self.flags)
        } else {
            ByteOrder::Lexical
        }
    }

    fn encode_key(&self, key: &[u8]) -> EngineResult<Vec<u8>> {
        if key.is_empty() || key.len() > MAX_KEY_SIZE {
            return Err(EngineError::new(
                ErrorCode::BadValSize,
                format!("key size {} outside 1..={MAX_KEY_SIZE}", key.len()),
            ));
        }
        self.key_order().encode(key)
    }

    fn encode_value(&self, value: &[u8]) -> EngineResult<Vec<u8>> {
        if self.flags.dup_sort && value.len() > MAX_KEY_SIZE {
            return Err(EngineError::new(
                ErrorCode::BadValSize,
                format!("duplicate size {} exceeds {MAX_KEY_SIZE}", value.len()),
            ));
        }
        self.dup_order().encode(value)
    }

    pub(crate) fn decode(&self, pos: &Position) -> Record {
        (self.key_order().decode(&pos.0), self.dup_order().decode(&pos.1))
    }

    pub(crate) fn get(&self, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        let key = self.encode_key(key)?;
        Ok(self
            .entries
            .get(&key)
            .and_then(|dups| dups.iter().next())
            .map(|value| self.dup_order().decode(value)))
    }

    /// Inserts a pair and returns its encoded position.
    pub(crate) fn put(
        &mut self,
        key: &[u8],
        value: &[u8],
        flags: WriteFlags,
    ) -> EngineResult<Position> {
        let key = self.encode_key(key)?;
        let value = self.encode_value(value)?;
        let dup_sort = self.flags.dup_sort;

        if flags.append {
            if let Some(last) = self.entries.keys().next_back() {
                if key < *last || (key == *last && !dup_sort) {
                    return Err(EngineError::key_exist("append out of key order"));
                }
            }
        }

        match self.entries.get_mut(&key) {
            Some(dups) => {
                if flags.no_overwrite {
                    return Err(EngineError::key_exist("key already present"));
                }
                if !dup_sort {
                    dups.clear();
                    dups.insert(value.clone());
                    return Ok((key, value));
                }
                if dups.contains(&value) {
                    if flags.no_dup_data {
                        return Err(EngineError::key_exist("duplicate already present"));
                    }
                    return Ok((key, value));
                }
                if flags.append_dup && dups.iter().next_back().is_some_and(|last| value < *last) {
                    return Err(EngineError::key_exist("append out of duplicate order"));
                }
                if self.flags.dup_fixed && dups.iter().next().is_some_and(|d| d.len() != value.len()) {
                    return Err(EngineError::new(
                        ErrorCode::BadValSize,
                        "fixed-size duplicates must share one size",
                    ));
                }
                dups.insert(value.clone());
            }
            None => {
                self.entries
                    .insert(key.clone(), BTreeSet::from([value.clone()]));
            }
        }
        Ok((key, value))
    }

    /// Replaces the item at `pos` with `value`; the key must match.
    pub(crate) fn replace(
        &mut self,
        pos: &Position,
        key: &[u8],
        value: &[u8],
    ) -> EngineResult<Position> {
        let key = self.encode_key(key)?;
        if key != pos.0 {
            return Err(EngineError::invalid_argument(
                "key does not match the cursor position",
            ));
        }
        let value = self.encode_value(value)?;
        if let Some(dups) = self.entries.get_mut(&key) {
            dups.remove(&pos.1);
            dups.insert(value.clone());
        }
        Ok((key, value))
    }

    pub(crate) fn delete(&mut self, key: &[u8], value: Option<&[u8]>) -> EngineResult<bool> {
        let key = self.encode_key(key)?;
        match value {
            Some(value) if self.flags.dup_sort => {
                let value = self.encode_value(value)?;
                let Some(dups) = self.entries.get_mut(&key) else {
                    return Ok(false);
                };
                let removed = dups.remove(&value);
                if dups.is_empty() {
                    self.entries.remove(&key);
                }
                Ok(removed)
            }
            _ => Ok(self.entries.remove(&key).is_some()),
        }
    }

    pub(crate) fn remove_item(&mut self, pos: &Position) {
        if let Some(dups) = self.entries.get_mut(&pos.0) {
            dups.remove(&pos.1);
            if dups.is_empty() {
                self.entries.remove(&pos.0);
            }
        }
    }

    pub(crate) fn remove_key(&mut self, key: &[u8]) {
        self.entries.remove(key);
    }

    pub(crate) fn contains(&self, pos: &Position) -> bool {
        self.entries
            .get(&pos.0)
            .is_some_and(|dups| dups.contains(&pos.1))
    }

    pub(crate) fn dup_count(&self, key: &[u8]) -> usize {
        self.entries.get(key).map_or(0, BTreeSet::len)
    }

    pub(crate) fn compare_keys(&self, a: &[u8], b: &[u8]) -> EngineResult<Ordering> {
        self.key_order().compare(a, b)
    }

    pub(crate) fn first(&self) -> Option<Position> {
        let (key, dups) = self.entries.iter().next()?;
        Some((key.clone(), dups.iter().next()?.clone()))
    }

    pub(crate) fn last(&self) -> Option<Position> {
        let (key, dups) = self.entries.iter().next_back()?;
        Some((key.clone(), dups.iter().next_back()?.clone()))
    }

    pub(crate) fn next(&self, pos: &Position) -> Option<Position> {
        self.next_dup(pos).or_else(|| self.next_key(&pos.0))
    }

    pub(crate) fn prev(&self, pos: &Position) -> Option<Position> {
        self.prev_dup(pos).or_else(|| self.prev_key(&pos.0))
    }

    pub(crate) fn next_dup(&self, pos: &Position) -> Option<Position> {
        let dups = self.entries.get(&pos.0)?;
        dups.range::<[u8], _>((Excluded(pos.1.as_slice()), Unbounded))
            .next()
            .map(|value| (pos.0.clone(), value.clone()))
    }

    pub(crate) fn prev_dup(&self, pos: &Position) -> Option<Position> {
        let dups = self.entries.get(&pos.0)?;
        dups.range::<[u8], _>((Unbounded, Excluded(pos.1.as_slice())))
            .next_back()
            .map(|value| (pos.0.clone(), value.clone()))
    }

    /// First duplicate of the key after `key`.
    pub(crate) fn next_key(&self, key: &[u8]) -> Option<Position> {
        let (key, dups) = self
            .entries
            .range::<[u8], _>((Excluded(key), Unbounded))
            .next()?;
        Some((key.clone(), dups.iter().next()?.clone()))
    }

    /// Last duplicate of the key before `key`.
    pub(crate) fn prev_key(&self, key: &[u8]) -> Option<Position> {
        let (key, dups) = self
            .entries
            .range::<[u8], _>((Unbounded, Excluded(key)))
            .next_back()?;
        Some((key.clone(), dups.iter().next_back()?.clone()))
    }

    pub(crate) fn first_dup(&self, key: &[u8]) -> Option<Position> {
        let dups = self.entries.get(key)?;
        Some((key.to_vec(), dups.iter().next()?.clone()))
    }

    pub(crate) fn last_dup(&self, key: &[u8]) -> Option<Position> {
        let dups = self.entries.get(key)?;
        Some((key.to_vec(), dups.iter().next_back()?.clone()))
    }

    /// Exact match on a raw key.
    pub(crate) fn seek(&self, key: &[u8]) -> EngineResult<Option<Position>> {
        let key = self.encode_key(key)?;
        Ok(self.first_dup(&key))
    }

    /// First key greater than or equal to a raw key.
    pub(crate) fn seek_range(&self, key: &[u8]) -> EngineResult<Option<Position>> {
        let key = self.encode_key(key)?;
        Ok(self
            .entries
            .range::<[u8], _>((Included(key.as_slice()), Unbounded))
            .next()
            .and_then(|(key, dups)| Some((key.clone(), dups.iter().next()?.clone()))))
    }

    pub(crate) fn item_count(&self) -> u64 {
        self.entries.values().map(|dups| dups.len() as u64).sum()
    }

    /// Bytes this table occupies against the map size.
    pub(crate) fn byte_size(&self) -> u64 {
        self.entries
            .iter()
            .map(|(key, dups)| {
                dups.iter()
                    .map(|value| key.len() as u64 + value.len() as u64 + ITEM_OVERHEAD)
                    .sum::<u64>()
            })
            .sum()
    }

    pub(crate) fn stat(&self) -> Stat {
        let page = u64::from(PAGE_SIZE);
        let entries = self.item_count();
        if entries == 0 {
            return Stat {
                page_size: PAGE_SIZE,
                ..Stat::default()
            };
        }
        let leaf_pages = self.byte_size().div_ceil(page);
        let branch_pages = if leaf_pages > 1 {
            leaf_pages.div_ceil(page / ITEM_OVERHEAD)
        } else {
            0
        };
        let overflow_pages = self
            .entries
            .values()
            .flatten()
            .filter(|value| value.len() as u64 > page / 2)
            .map(|value| (value.len() as u64).div_ceil(page))
            .sum();
        Stat {
            page_size: PAGE_SIZE,
            depth: if branch_pages == 0 { 1 } else { 2 },
            branch_pages,
            leaf_pages,
            overflow_pages,
            entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn dup_table() -> Table {
        Table::new(DatabaseFlags::new().dup_sort(true))
    }

    fn keys(table: &Table) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut pos = table.first();
        while let Some(p) = pos {
            out.push(table.decode(&p).0);
            pos = table.next(&p);
        }
        out
    }

    #[test]
    fn put_replaces_without_dupsort() {
        let mut table = Table::new(DatabaseFlags::new());
        table.put(b"k", b"1", WriteFlags::new()).unwrap();
        table.put(b"k", b"2", WriteFlags::new()).unwrap();
        assert_eq!(table.get(b"k").unwrap(), Some(b"2".to_vec()));
        assert_eq!(table.item_count(), 1);
    }

    #[test]
    fn no_overwrite_rejects_existing_key() {
        let mut table = Table::new(DatabaseFlags::new());
        table.put(b"k", b"1", WriteFlags::new()).unwrap();
        let err = table
            .put(b"k", b"2", WriteFlags::new().no_overwrite(true))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::KeyExist);
    }

    #[test]
    fn dupsort_keeps_sorted_values() {
        let mut table = dup_table();
        table.put(b"k", b"b", WriteFlags::new()).unwrap();
        table.put(b"k", b"a", WriteFlags::new()).unwrap();
        table.put(b"k", b"c", WriteFlags::new()).unwrap();

        assert_eq!(table.dup_count(b"k"), 3);
        assert_eq!(table.get(b"k").unwrap(), Some(b"a".to_vec()));

        let first = table.first().unwrap();
        let second = table.next_dup(&first).unwrap();
        assert_eq!(table.decode(&second).1, b"b".to_vec());
    }

    #[test]
    fn no_dup_data_rejects_existing_pair() {
        let mut table = dup_table();
        table.put(b"k", b"a", WriteFlags::new()).unwrap();
        let err = table
            .put(b"k", b"a", WriteFlags::new().no_dup_data(true))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::KeyExist);
    }

    #[test]
    fn delete_single_duplicate() {
        let mut table = dup_table();
        table.put(b"k", b"a", WriteFlags::new()).unwrap();
        table.put(b"k", b"b", WriteFlags::new()).unwrap();

        assert!(table.delete(b"k", Some(b"a")).unwrap());
        assert!(!table.delete(b"k", Some(b"a")).unwrap());
        assert_eq!(table.dup_count(b"k"), 1);
        assert!(table.delete(b"k", Some(b"b")).unwrap());
        assert!(table.entries().is_empty());
    }

    #[test]
    fn append_requires_key_order() {
        let mut table = Table::new(DatabaseFlags::new());
        table.put(b"b", b"1", WriteFlags::new().append(true)).unwrap();
        let err = table
            .put(b"a", b"1", WriteFlags::new().append(true))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::KeyExist);
    }

    #[test]
    fn empty_and_oversized_keys_rejected() {
        let mut table = Table::new(DatabaseFlags::new());
        let err = table.put(b"", b"v", WriteFlags::new()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadValSize);

        let big = vec![1u8; MAX_KEY_SIZE + 1];
        let err = table.put(&big, b"v", WriteFlags::new()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadValSize);
    }

    #[test]
    fn reverse_key_order() {
        let mut table = Table::new(DatabaseFlags::new().reverse_key(true));
        for key in [b"ab".as_slice(), b"ba", b"ca"] {
            table.put(key, b"v", WriteFlags::new()).unwrap();
        }
        assert_eq!(keys(&table), vec![b"ba".to_vec(), b"ca".to_vec(), b"ab".to_vec()]);
    }

    #[test]
    fn integer_key_requires_fixed_width() {
        let mut table = Table::new(DatabaseFlags::new().integer_key(true));
        let err = table.put(b"abc", b"v", WriteFlags::new()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadValSize);
    }

    #[test]
    fn seek_range_finds_next_key() {
        let mut table = Table::new(DatabaseFlags::new());
        table.put(b"key1", b"v1", WriteFlags::new()).unwrap();
        table.put(b"key2", b"v2", WriteFlags::new()).unwrap();

        let pos = table.seek_range(b"key0").unwrap().unwrap();
        assert_eq!(table.decode(&pos), (b"key1".to_vec(), b"v1".to_vec()));
        assert!(table.seek(b"key0").unwrap().is_none());
        assert!(table.seek_range(b"key3").unwrap().is_none());
    }

    #[test]
    fn navigation_after_removed_position() {
        let mut table = Table::new(DatabaseFlags::new());
        for key in [b"a".as_slice(), b"b", b"c"] {
            table.put(key, b"v", WriteFlags::new()).unwrap();
        }
        let pos = table.seek(b"b").unwrap().unwrap();
        table.remove_item(&pos);
        assert!(!table.contains(&pos));
        let next = table.next(&pos).unwrap();
        assert_eq!(table.decode(&next).0, b"c".to_vec());
        let prev = table.prev(&pos).unwrap();
        assert_eq!(table.decode(&prev).0, b"a".to_vec());
    }

    #[test]
    fn stat_of_empty_and_filled_table() {
        let mut table = Table::new(DatabaseFlags::new());
        assert_eq!(table.stat().entries, 0);
        assert_eq!(table.stat().depth, 0);

        table.put(b"k", b"v", WriteFlags::new()).unwrap();
        let stat = table.stat();
        assert_eq!(stat.entries, 1);
        assert_eq!(stat.depth, 1);
        assert_eq!(stat.leaf_pages, 1);
        assert_eq!(stat.page_size, PAGE_SIZE);
    }

    proptest! {
        #[test]
        fn integer_keys_sort_numerically(values in prop::collection::btree_set(any::<u32>(), 1..64)) {
            let mut table = Table::new(DatabaseFlags::new().integer_key(true));
            for v in &values {
                table.put(&v.to_ne_bytes(), b"v", WriteFlags::new()).unwrap();
            }
            let sorted: Vec<Vec<u8>> = values.iter().map(|v| v.to_ne_bytes().to_vec()).collect();
            prop_assert_eq!(keys(&table), sorted);
        }

        #[test]
        fn matches_btreemap_model(
            ops in prop::collection::vec(
                (prop::collection::vec(any::<u8>(), 1..8), prop::option::of(prop::collection::vec(any::<u8>(), 0..8))),
                1..64,
            )
        ) {
            let mut table = Table::new(DatabaseFlags::new());
            let mut model = BTreeMap::new();
            for (key, value) in ops {
                match value {
                    Some(value) => {
                        table.put(&key, &value, WriteFlags::new()).unwrap();
                        model.insert(key, value);
                    }
                    None => {
                        let removed = table.delete(&key, None).unwrap();
                        prop_assert_eq!(removed, model.remove(&key).is_some());
                    }
                }
            }
            for (key, value) in &model {
                prop_assert_eq!(table.get(key).unwrap(), Some(value.clone()));
            }
            let expected: Vec<Vec<u8>> = model.keys().cloned().collect();
            prop_assert_eq!(keys(&table), expected);
        }
    }
}
