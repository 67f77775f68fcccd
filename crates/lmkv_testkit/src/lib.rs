//! # lmkv testkit
//!
//! Test utilities for lmkv.
//!
//! This crate provides:
//! - Test fixtures and environment helpers
//! - A fault-injecting engine wrapper
//! - Property-based test generators and a reference model
//! - Concurrent workload drivers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use lmkv_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_env() {
//!     with_temp_env(|env| {
//!         let db = env.database(None, DatabaseFlags::new()).unwrap();
//!         // ... test operations
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod faults;
pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::faults::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use faults::*;
pub use fixtures::*;
pub use generators::*;
pub use stress::*;
