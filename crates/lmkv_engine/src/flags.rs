//! Typed option and flag sets.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default map size when none is configured (10 MiB).
pub const DEFAULT_MAP_SIZE: u64 = 10 * 1024 * 1024;

/// Default number of reader slots.
pub const DEFAULT_MAX_READERS: u32 = 126;

/// Default number of named tables.
pub const DEFAULT_MAX_DBS: u32 = 16;

/// Default permission bits for created files.
pub const DEFAULT_MODE: u32 = 0o755;

/// A flag name that does not name any known flag.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown flag: {name}")]
pub struct ParseFlagError {
    /// The rejected name.
    pub name: String,
}

/// A single environment flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvFlag {
    /// Don't fsync after commit.
    NoSync,
    /// Write through the map instead of copying pages.
    WriteMap,
    /// The path names the data file itself, not a directory.
    NoSubDir,
    /// Open the environment read-only.
    ReadOnly,
    /// Don't fsync metadata after commit.
    NoMetaSync,
    /// Flush asynchronously when writing through the map.
    MapAsync,
    /// Request a fixed map address.
    FixedMap,
}

impl EnvFlag {
    /// All flags, in canonical order.
    pub const ALL: [Self; 7] = [
        Self::NoSync,
        Self::WriteMap,
        Self::NoSubDir,
        Self::ReadOnly,
        Self::NoMetaSync,
        Self::MapAsync,
        Self::FixedMap,
    ];

    /// Returns the canonical kebab-case name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::NoSync => "no-sync",
            Self::WriteMap => "write-map",
            Self::NoSubDir => "no-subdir",
            Self::ReadOnly => "read-only",
            Self::NoMetaSync => "no-meta-sync",
            Self::MapAsync => "map-async",
            Self::FixedMap => "fixed-map",
        }
    }

    /// Returns true if the flag may be toggled on an open environment.
    #[must_use]
    pub const fn is_changeable(self) -> bool {
        matches!(self, Self::NoSync | Self::NoMetaSync | Self::MapAsync)
    }
}

impl fmt::Display for EnvFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EnvFlag {
    type Err = ParseFlagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "no-sync" | "nosync" => Ok(Self::NoSync),
            "write-map" | "write-mapped" | "writemap" => Ok(Self::WriteMap),
            "no-subdir" | "no-sub-dir" | "nosubdir" => Ok(Self::NoSubDir),
            "read-only" | "readonly" | "rdonly" => Ok(Self::ReadOnly),
            "no-meta-sync" | "nometasync" => Ok(Self::NoMetaSync),
            "map-async" | "async-map" | "mapasync" => Ok(Self::MapAsync),
            "fixed-map" | "fixed-map-address" | "fixedmap" => Ok(Self::FixedMap),
            _ => Err(ParseFlagError { name: s.to_string() }),
        }
    }
}

/// Environment flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvFlags {
    /// Don't fsync after commit.
    pub no_sync: bool,
    /// Write through the map. Incompatible with nested transactions.
    pub write_map: bool,
    /// The path names the data file itself.
    pub no_sub_dir: bool,
    /// Read-only environment.
    pub read_only: bool,
    /// Don't fsync metadata after commit.
    pub no_meta_sync: bool,
    /// Asynchronous map flushes.
    pub map_async: bool,
    /// Fixed map address.
    pub fixed_map: bool,
}

impl EnvFlags {
    /// Creates an empty flag set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            no_sync: false,
            write_map: false,
            no_sub_dir: false,
            read_only: false,
            no_meta_sync: false,
            map_async: false,
            fixed_map: false,
        }
    }

    /// Returns whether `flag` is set.
    #[must_use]
    pub const fn contains(&self, flag: EnvFlag) -> bool {
        match flag {
            EnvFlag::NoSync => self.no_sync,
            EnvFlag::WriteMap => self.write_map,
            EnvFlag::NoSubDir => self.no_sub_dir,
            EnvFlag::ReadOnly => self.read_only,
            EnvFlag::NoMetaSync => self.no_meta_sync,
            EnvFlag::MapAsync => self.map_async,
            EnvFlag::FixedMap => self.fixed_map,
        }
    }

    /// Sets or clears `flag`.
    pub fn set(&mut self, flag: EnvFlag, on: bool) {
        match flag {
            EnvFlag::NoSync => self.no_sync = on,
            EnvFlag::WriteMap => self.write_map = on,
            EnvFlag::NoSubDir => self.no_sub_dir = on,
            EnvFlag::ReadOnly => self.read_only = on,
            EnvFlag::NoMetaSync => self.no_meta_sync = on,
            EnvFlag::MapAsync => self.map_async = on,
            EnvFlag::FixedMap => self.fixed_map = on,
        }
    }

    /// Returns a copy with `flag` set.
    #[must_use]
    pub fn with(mut self, flag: EnvFlag) -> Self {
        self.set(flag, true);
        self
    }

    /// Parses a list of flag names.
    ///
    /// # Errors
    ///
    /// Returns the first name that is not a known flag.
    pub fn from_names<'a, I>(names: I) -> Result<Self, ParseFlagError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut flags = Self::new();
        for name in names {
            flags.set(name.parse()?, true);
        }
        Ok(flags)
    }

    /// Iterates over the flags that are set.
    pub fn iter(&self) -> impl Iterator<Item = EnvFlag> + '_ {
        EnvFlag::ALL.into_iter().filter(|flag| self.contains(*flag))
    }

    /// Returns the names of the flags that are set.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.iter().map(EnvFlag::name).collect()
    }

    /// Returns true if no flag is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Returns the first non-changeable flag that differs from `other`.
    #[must_use]
    pub fn fixed_difference(&self, other: &Self) -> Option<EnvFlag> {
        EnvFlag::ALL
            .into_iter()
            .filter(|flag| !flag.is_changeable())
            .find(|flag| self.contains(*flag) != other.contains(*flag))
    }
}

/// Table flags, fixed when the table is created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseFlags {
    /// Create the table if it does not exist. Not persisted.
    #[serde(skip)]
    pub create: bool,
    /// Compare keys from the last byte to the first.
    pub reverse_key: bool,
    /// Allow sorted duplicate values per key.
    pub dup_sort: bool,
    /// Keys are native-endian unsigned integers of 4 or 8 bytes.
    pub integer_key: bool,
    /// Duplicates all have the same size.
    pub dup_fixed: bool,
    /// Duplicates are native-endian unsigned integers.
    pub integer_dup: bool,
    /// Compare duplicates from the last byte to the first.
    pub reverse_dup: bool,
}

impl DatabaseFlags {
    /// Creates an empty flag set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            create: false,
            reverse_key: false,
            dup_sort: false,
            integer_key: false,
            dup_fixed: false,
            integer_dup: false,
            reverse_dup: false,
        }
    }

    /// Sets `create`.
    #[must_use]
    pub const fn create(mut self, value: bool) -> Self {
        self.create = value;
        self
    }

    /// Sets `reverse_key`.
    #[must_use]
    pub const fn reverse_key(mut self, value: bool) -> Self {
        self.reverse_key = value;
        self
    }

    /// Sets `dup_sort`.
    #[must_use]
    pub const fn dup_sort(mut self, value: bool) -> Self {
        self.dup_sort = value;
        self
    }

    /// Sets `integer_key`.
    #[must_use]
    pub const fn integer_key(mut self, value: bool) -> Self {
        self.integer_key = value;
        self
    }

    /// Sets `dup_fixed`.
    #[must_use]
    pub const fn dup_fixed(mut self, value: bool) -> Self {
        self.dup_fixed = value;
        self
    }

    /// Sets `integer_dup`.
    #[must_use]
    pub const fn integer_dup(mut self, value: bool) -> Self {
        self.integer_dup = value;
        self
    }

    /// Sets `reverse_dup`.
    #[must_use]
    pub const fn reverse_dup(mut self, value: bool) -> Self {
        self.reverse_dup = value;
        self
    }

    /// Returns the flags that are stored with the table (everything but `create`).
    #[must_use]
    pub const fn persistent(self) -> Self {
        self.create(false)
    }
}

/// Flags for put operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteFlags {
    /// Fail with `KeyExist` if the key is present.
    pub no_overwrite: bool,
    /// Fail with `KeyExist` if the key/value pair is present (dupsort only).
    pub no_dup_data: bool,
    /// Replace the item at the cursor position (cursor puts only).
    pub current: bool,
    /// Key must sort after every existing key.
    pub append: bool,
    /// Value must sort after every existing duplicate of the key.
    pub append_dup: bool,
}

impl WriteFlags {
    /// Creates an empty flag set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            no_overwrite: false,
            no_dup_data: false,
            current: false,
            append: false,
            append_dup: false,
        }
    }

    /// Sets `no_overwrite`.
    #[must_use]
    pub const fn no_overwrite(mut self, value: bool) -> Self {
        self.no_overwrite = value;
        self
    }

    /// Sets `no_dup_data`.
    #[must_use]
    pub const fn no_dup_data(mut self, value: bool) -> Self {
        self.no_dup_data = value;
        self
    }

    /// Sets `current`.
    #[must_use]
    pub const fn current(mut self, value: bool) -> Self {
        self.current = value;
        self
    }

    /// Sets `append`.
    #[must_use]
    pub const fn append(mut self, value: bool) -> Self {
        self.append = value;
        self
    }

    /// Sets `append_dup`.
    #[must_use]
    pub const fn append_dup(mut self, value: bool) -> Self {
        self.append_dup = value;
        self
    }
}

/// Flags for beginning a transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxnFlags {
    /// Read-only snapshot transaction.
    pub read_only: bool,
}

impl TxnFlags {
    /// Flags for a read-write transaction.
    pub const READ_WRITE: Self = Self { read_only: false };
    /// Flags for a read-only transaction.
    pub const READ_ONLY: Self = Self { read_only: true };
}

/// Options used when opening an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Environment flags.
    pub flags: EnvFlags,
    /// Permission bits for created files.
    pub mode: u32,
    /// Maximum simultaneous read transactions.
    pub max_readers: u32,
    /// Maximum named tables.
    pub max_dbs: u32,
    /// Maximum data size in bytes.
    pub map_size: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            flags: EnvFlags::new(),
            mode: DEFAULT_MODE,
            max_readers: DEFAULT_MAX_READERS,
            max_dbs: DEFAULT_MAX_DBS,
            map_size: DEFAULT_MAP_SIZE,
        }
    }
}
