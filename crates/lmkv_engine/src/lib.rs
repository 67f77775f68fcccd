//! # lmkv engine
//!
//! The primitive engine boundary for lmkv, plus a reference engine.
//!
//! An engine knows about transactions, tables and cursors only as opaque
//! handles. It does not track which thread owns a transaction, nor does
//! it stop callers from using a handle after it was finished; that is the
//! job of `lmkv_core`, which wraps an engine in safe handle objects.
//!
//! ## Design Principles
//!
//! - One trait, [`Engine`], with plain handle-based operations
//! - A missing key is `Ok(None)`, never an error
//! - Errors carry an [`ErrorCode`] so callers can branch on the cause
//! - Must be `Send + Sync`; engines are shared across threads
//!
//! ## Available Engines
//!
//! - [`SnapshotEngine`] - copy-on-write snapshots, in memory or persisted
//!   to a data file
//!
//! ## Example
//!
//! ```rust
//! use lmkv_engine::{Engine, EngineOptions, SnapshotEngine, TableHandle, TxnFlags, WriteFlags};
//!
//! let engine = SnapshotEngine::in_memory(&EngineOptions::default());
//! let txn = engine.txn_begin(None, TxnFlags::READ_WRITE, &|| false).unwrap();
//! engine.put(txn, TableHandle::MAIN, b"key", b"value", WriteFlags::new()).unwrap();
//! engine.txn_commit(txn).unwrap();
//!
//! let txn = engine.txn_begin(None, TxnFlags::READ_ONLY, &|| false).unwrap();
//! assert_eq!(engine.get(txn, TableHandle::MAIN, b"key").unwrap(), Some(b"value".to_vec()));
//! engine.txn_abort(txn);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod engine;
mod error;
mod flags;
mod snapshot;
mod types;

pub use engine::Engine;
pub use error::{EngineError, EngineResult, ErrorCode};
pub use flags::{
    DatabaseFlags, EngineOptions, EnvFlag, EnvFlags, ParseFlagError, TxnFlags, WriteFlags,
    DEFAULT_MAP_SIZE, DEFAULT_MAX_DBS, DEFAULT_MAX_READERS, DEFAULT_MODE,
};
pub use snapshot::{SnapshotEngine, MAX_KEY_SIZE, PAGE_SIZE};
pub use types::{CursorHandle, CursorOp, Info, Record, Stat, TableHandle, TxnHandle};
