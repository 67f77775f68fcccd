//! Handle and record types shared across the engine boundary.

use std::fmt;

/// A key/value pair returned by lookups and cursor moves.
pub type Record = (Vec<u8>, Vec<u8>);

/// Opaque engine transaction handle.
///
/// Handles are never reused within one engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnHandle(pub u64);

impl TxnHandle {
    /// Creates a handle from its raw value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw handle value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn#{}", self.0)
    }
}

/// Opaque engine table handle (a DBI in LMDB terms).
///
/// Handle `0` is always the unnamed main table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableHandle(pub u32);

impl TableHandle {
    /// The unnamed main table.
    pub const MAIN: Self = Self(0);

    /// Creates a handle from its raw value.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw handle value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dbi#{}", self.0)
    }
}

/// Opaque engine cursor handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CursorHandle(pub u64);

impl CursorHandle {
    /// Creates a handle from its raw value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw handle value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CursorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cursor#{}", self.0)
    }
}

/// Cursor positioning operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOp {
    /// First record of the table.
    First,
    /// Last record of the table.
    Last,
    /// Next record (next duplicate, then next key).
    Next,
    /// Previous record.
    Prev,
    /// Record at the current position.
    GetCurrent,
    /// Exact key match. Requires a key.
    Set,
    /// First key greater than or equal to the given key. Requires a key.
    SetRange,
    /// First duplicate of the current key.
    FirstDup,
    /// Last duplicate of the current key.
    LastDup,
    /// Next duplicate of the current key only.
    NextDup,
    /// Previous duplicate of the current key only.
    PrevDup,
    /// First duplicate of the next key.
    NextNoDup,
    /// Last duplicate of the previous key.
    PrevNoDup,
}

impl CursorOp {
    /// Returns true if the operation needs a key argument.
    #[must_use]
    pub const fn needs_key(self) -> bool {
        matches!(self, Self::Set | Self::SetRange)
    }
}

/// Table statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    /// Size of a page in bytes.
    pub page_size: u32,
    /// Depth of the tree.
    pub depth: u32,
    /// Number of internal pages.
    pub branch_pages: u64,
    /// Number of leaf pages.
    pub leaf_pages: u64,
    /// Number of overflow pages.
    pub overflow_pages: u64,
    /// Number of data items.
    pub entries: u64,
}

/// Environment information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Info {
    /// Address of the map, if fixed.
    pub map_addr: usize,
    /// Size of the data map in bytes.
    pub map_size: u64,
    /// Id of the last used page.
    pub last_page: u64,
    /// Id of the last committed transaction.
    pub last_txn_id: u64,
    /// Maximum number of reader slots.
    pub max_readers: u32,
    /// Number of reader slots in use.
    pub num_readers: u32,
}
