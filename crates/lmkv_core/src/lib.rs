//! # lmkv core
//!
//! Safe handles over an lmkv engine.
//!
//! This crate provides:
//! - [`Environment`]: one shared engine instance and the per-thread
//!   registry of active transactions
//! - [`Transaction`]: nested, thread-bound transactions with a terminal
//!   state machine
//! - [`Database`]: named tables whose operations join the active
//!   transaction or run in an implicit one
//! - [`Cursor`]: positioned iteration, closed automatically with its
//!   transaction
//!
//! ## Design Principles
//!
//! - Every handle is cheap to clone and keeps its environment alive
//! - A finished transaction, a closed cursor or a closed environment
//!   fails fast with a typed [`CoreError`] and changes nothing
//! - Only the innermost active transaction of a thread accepts work
//! - The engine never blocks while a core lock is held
//!
//! ## Example
//!
//! ```rust
//! use lmkv_core::{DatabaseFlags, EnvConfig, Environment};
//!
//! let env = Environment::open_in_memory(EnvConfig::default());
//! let db = env.database(Some("users"), DatabaseFlags::new().create(true)).unwrap();
//!
//! env.transaction(|txn| {
//!     db.put(b"alice", b"1")?;
//!     // A nested transaction that is rolled back on its own.
//!     let inner = txn.begin_nested()?;
//!     db.put(b"bob", b"2")?;
//!     inner.abort()
//! })
//! .unwrap();
//!
//! assert_eq!(db.get(b"alice").unwrap(), Some(b"1".to_vec()));
//! assert_eq!(db.get(b"bob").unwrap(), None);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod cursor;
mod database;
mod environment;
mod error;
mod implicit;
mod interrupt;
mod registry;
mod transaction;
mod types;

pub use config::EnvConfig;
pub use cursor::Cursor;
pub use database::Database;
pub use environment::Environment;
pub use error::{CoreError, CoreResult};
pub use interrupt::InterruptSignal;
pub use transaction::{Transaction, TransactionState};
pub use types::{CursorId, TransactionId};

// Engine types that appear in this crate's API.
pub use lmkv_engine::{
    DatabaseFlags, Engine, EngineError, EnvFlag, EnvFlags, ErrorCode, Info, Record,
    SnapshotEngine, Stat, WriteFlags,
};
