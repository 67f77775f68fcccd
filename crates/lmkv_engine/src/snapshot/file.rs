//! On-disk layout of a snapshot environment.
//!
//! ```text
//! <path>/
//! ├─ data.mdb    # Last committed snapshot
//! └─ lock.mdb    # Advisory lock held while the environment is open
//! ```
//!
//! With `no_sub_dir` the path names the data file itself and the lock
//! file sits next to it as `<path>-lock`.
//!
//! The data file is a fixed header, a CBOR body and a SHA-256 digest of
//! the body:
//!
//! ```text
//! | magic (8) | version u32 | map_size u64 | txn_id u64 | body_len u64 | body | sha256 (32) |
//! ```

use super::state::Snapshot;
use super::table::Table;
use crate::error::{EngineError, EngineResult, ErrorCode};
use crate::flags::{DatabaseFlags, EngineOptions};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DATA_FILE: &str = "data.mdb";
const LOCK_FILE: &str = "lock.mdb";
const LOCK_SUFFIX: &str = "-lock";
const TEMP_SUFFIX: &str = ".tmp";

const MAGIC: &[u8; 8] = b"LMKVSNAP";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 8 + 4 + 8 + 8 + 8;
const DIGEST_LEN: usize = 32;

#[derive(Serialize, Deserialize)]
struct TableImage {
    name: Option<String>,
    flags: DatabaseFlags,
    entries: Vec<(Vec<u8>, Vec<Vec<u8>>)>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotImage {
    tables: Vec<TableImage>,
}

/// Serializes a snapshot into the data file format.
pub(crate) fn encode(snapshot: &Snapshot, map_size: u64) -> EngineResult<Vec<u8>> {
    let image = SnapshotImage {
        tables: snapshot
            .tables
            .iter()
            .map(|(name, table)| TableImage {
                name: name.clone(),
                flags: table.flags(),
                entries: table
                    .entries()
                    .iter()
                    .map(|(key, dups)| (key.clone(), dups.iter().cloned().collect()))
                    .collect(),
            })
            .collect(),
    };

    let mut body = Vec::new();
    ciborium::ser::into_writer(&image, &mut body)
        .map_err(|e| EngineError::new(ErrorCode::Io, format!("encoding snapshot: {e}")))?;

    let mut out = Vec::with_capacity(HEADER_LEN + body.len() + DIGEST_LEN);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&map_size.to_le_bytes());
    out.extend_from_slice(&snapshot.txn_id.to_le_bytes());
    out.extend_from_slice(&(body.len() as u64).to_le_bytes());
    out.extend_from_slice(&body);
    out.extend_from_slice(&Sha256::digest(&body));
    Ok(out)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

/// Parses a data file. Returns the snapshot and the stored map size.
pub(crate) fn decode(bytes: &[u8]) -> EngineResult<(Snapshot, u64)> {
    if bytes.len() < HEADER_LEN + DIGEST_LEN || &bytes[..8] != MAGIC {
        return Err(EngineError::new(ErrorCode::Invalid, "missing data file header"));
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&bytes[8..12]);
    let version = u32::from_le_bytes(version);
    if version != FORMAT_VERSION {
        return Err(EngineError::new(
            ErrorCode::VersionMismatch,
            format!("format version {version}, expected {FORMAT_VERSION}"),
        ));
    }
    let map_size = read_u64(bytes, 12);
    let txn_id = read_u64(bytes, 20);
    let body_len = usize::try_from(read_u64(bytes, 28))
        .map_err(|_| EngineError::corrupted("body length overflows"))?;
    if bytes.len() != HEADER_LEN + body_len + DIGEST_LEN {
        return Err(EngineError::corrupted("data file length does not match header"));
    }
    let body = &bytes[HEADER_LEN..HEADER_LEN + body_len];
    if Sha256::digest(body).as_slice() != &bytes[HEADER_LEN + body_len..] {
        return Err(EngineError::corrupted("data file checksum mismatch"));
    }

    let image: SnapshotImage = ciborium::de::from_reader(body)
        .map_err(|e| EngineError::corrupted(format!("decoding snapshot: {e}")))?;
    let mut tables = BTreeMap::new();
    for table in image.tables {
        let entries = table
            .entries
            .into_iter()
            .map(|(key, dups)| (key, dups.into_iter().collect::<BTreeSet<_>>()))
            .collect();
        tables.insert(table.name, Arc::new(Table::from_entries(table.flags, entries)));
    }
    tables
        .entry(None)
        .or_insert_with(|| Arc::new(Table::default()));
    Ok((Snapshot { txn_id, tables }, map_size))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Resolves where the data file for `path` lives.
pub(crate) fn data_path(path: &Path, no_sub_dir: bool) -> PathBuf {
    if no_sub_dir {
        path.to_path_buf()
    } else {
        path.join(DATA_FILE)
    }
}

/// Writes `bytes` to `dest` through a temporary file and a rename.
fn write_atomic(dest: &Path, bytes: &[u8], mode: u32, durable: bool) -> EngineResult<()> {
    let temp = with_suffix(dest, TEMP_SUFFIX);
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(&temp)?;
    file.write_all(bytes)?;
    if durable {
        file.sync_all()?;
    }
    drop(file);

    fs::rename(&temp, dest)?;
    if durable {
        if let Some(dir) = dest.parent() {
            sync_directory(dir)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn sync_directory(dir: &Path) -> EngineResult<()> {
    let dir = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_dir: &Path) -> EngineResult<()> {
    Ok(())
}

/// An open environment's files. Holds the lock until dropped.
#[derive(Debug)]
pub(crate) struct DataFile {
    data_path: PathBuf,
    mode: u32,
    _lock_file: File,
}

impl DataFile {
    /// Opens the files of an environment at `path` and takes the lock.
    pub(crate) fn open(path: &Path, options: &EngineOptions) -> EngineResult<Self> {
        let flags = options.flags;
        let lock_path = if flags.no_sub_dir {
            with_suffix(path, LOCK_SUFFIX)
        } else {
            if !path.is_dir() {
                return Err(EngineError::not_found(format!(
                    "environment directory does not exist: {}",
                    path.display()
                )));
            }
            path.join(LOCK_FILE)
        };
        let data_path = data_path(path, flags.no_sub_dir);
        if flags.read_only && !data_path.exists() {
            return Err(EngineError::not_found(format!(
                "no data file at {}",
                data_path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        let locked = if flags.read_only {
            FileExt::try_lock_shared(&lock_file)
        } else {
            FileExt::try_lock_exclusive(&lock_file)
        };
        if locked.is_err() {
            return Err(EngineError::new(
                ErrorCode::Busy,
                format!("environment is locked: {}", lock_path.display()),
            ));
        }

        Ok(Self {
            data_path,
            mode: options.mode,
            _lock_file: lock_file,
        })
    }

    pub(crate) fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Loads the last committed snapshot. `None` for a fresh environment.
    pub(crate) fn load(&self) -> EngineResult<Option<(Snapshot, u64)>> {
        if !self.data_path.exists() {
            return Ok(None);
        }
        let mut bytes = Vec::new();
        File::open(&self.data_path)?.read_to_end(&mut bytes)?;
        if bytes.is_empty() {
            return Ok(None);
        }
        decode(&bytes).map(Some)
    }

    pub(crate) fn store(&self, snapshot: &Snapshot, map_size: u64, durable: bool) -> EngineResult<()> {
        write_atomic(&self.data_path, &encode(snapshot, map_size)?, self.mode, durable)
    }

    /// Flushes the data file and its directory.
    pub(crate) fn sync(&self) -> EngineResult<()> {
        if self.data_path.exists() {
            File::open(&self.data_path)?.sync_all()?;
        }
        if let Some(dir) = self.data_path.parent() {
            sync_directory(dir)?;
        }
        Ok(())
    }
}

/// Writes a snapshot to a fresh location, for environment copies.
pub(crate) fn write_copy(
    dest: &Path,
    no_sub_dir: bool,
    snapshot: &Snapshot,
    map_size: u64,
    mode: u32,
) -> EngineResult<()> {
    if !no_sub_dir && !dest.is_dir() {
        return Err(EngineError::not_found(format!(
            "copy destination is not a directory: {}",
            dest.display()
        )));
    }
    write_atomic(&data_path(dest, no_sub_dir), &encode(snapshot, map_size)?, mode, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{EnvFlags, WriteFlags};
    use tempfile::tempdir;

    fn sample() -> Snapshot {
        let mut snapshot = Snapshot::empty();
        let mut table = Table::new(DatabaseFlags::new().dup_sort(true));
        table.put(b"k", b"a", WriteFlags::new()).unwrap();
        table.put(b"k", b"b", WriteFlags::new()).unwrap();
        snapshot.tables.insert(Some("dups".into()), Arc::new(table));
        snapshot.txn_id = 4;
        snapshot
    }

    #[test]
    fn encoded_snapshot_survives_decode() {
        let bytes = encode(&sample(), 1 << 20).unwrap();
        let (snapshot, map_size) = decode(&bytes).unwrap();
        assert_eq!(map_size, 1 << 20);
        assert_eq!(snapshot.txn_id, 4);
        let table = &snapshot.tables[&Some("dups".to_string())];
        assert!(table.flags().dup_sort);
        assert_eq!(table.dup_count(b"k"), 2);
    }

    #[test]
    fn detects_bad_magic_and_checksum() {
        let mut bytes = encode(&sample(), 1 << 20).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert_eq!(decode(&bytes).unwrap_err().code(), ErrorCode::Corrupted);

        bytes[0] = b'X';
        assert_eq!(decode(&bytes).unwrap_err().code(), ErrorCode::Invalid);
    }

    #[test]
    fn detects_version_mismatch() {
        let mut bytes = encode(&sample(), 1 << 20).unwrap();
        bytes[8..12].copy_from_slice(&99u32.to_le_bytes());
        assert_eq!(decode(&bytes).unwrap_err().code(), ErrorCode::VersionMismatch);
    }

    #[test]
    fn missing_directory_is_not_found() {
        let dir = tempdir().unwrap();
        let err = DataFile::open(&dir.path().join("absent"), &EngineOptions::default()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[test]
    fn second_open_is_busy() {
        let dir = tempdir().unwrap();
        let _first = DataFile::open(dir.path(), &EngineOptions::default()).unwrap();
        let err = DataFile::open(dir.path(), &EngineOptions::default()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Busy);
    }

    #[test]
    fn store_then_load() {
        let dir = tempdir().unwrap();
        let file = DataFile::open(dir.path(), &EngineOptions::default()).unwrap();
        assert!(file.load().unwrap().is_none());

        file.store(&sample(), 4096 * 16, true).unwrap();
        let (snapshot, map_size) = file.load().unwrap().unwrap();
        assert_eq!(map_size, 4096 * 16);
        assert_eq!(snapshot.txn_id, 4);
        assert!(dir.path().join("data.mdb").exists());
    }

    #[test]
    fn no_sub_dir_uses_file_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("env.db");
        let options = EngineOptions {
            flags: EnvFlags {
                no_sub_dir: true,
                ..EnvFlags::new()
            },
            ..EngineOptions::default()
        };
        let file = DataFile::open(&path, &options).unwrap();
        file.store(&Snapshot::empty(), 1 << 20, false).unwrap();
        assert!(path.is_file());
        assert!(dir.path().join("env.db-lock").exists());
    }
}
