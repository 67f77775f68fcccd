//! Test fixtures and environment helpers.
//!
//! Provides convenience functions for setting up test environments
//! and common test scenarios.

use lmkv_core::{Database, DatabaseFlags, EnvConfig, Environment};
use std::path::Path;
use std::sync::Once;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Installs a test tracing subscriber once per process.
///
/// The filter comes from `RUST_LOG` and defaults to `warn`. Output goes
/// through the test writer so it is captured per test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// A test environment with automatic cleanup.
pub struct TestEnv {
    /// The environment instance.
    pub env: Environment,
    /// The temporary directory (kept alive to prevent cleanup).
    temp_dir: Option<TempDir>,
}

impl TestEnv {
    /// Creates a new in-memory test environment.
    pub fn memory() -> Self {
        Self::memory_with(EnvConfig::default())
    }

    /// Creates an in-memory test environment with `config`.
    pub fn memory_with(config: EnvConfig) -> Self {
        init_tracing();
        Self {
            env: Environment::open_in_memory(config),
            temp_dir: None,
        }
    }

    /// Creates a new file-backed test environment in a temporary directory.
    pub fn file() -> Self {
        Self::file_with(EnvConfig::default())
    }

    /// Creates a file-backed test environment with `config`.
    pub fn file_with(config: EnvConfig) -> Self {
        init_tracing();
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let env = Environment::open(temp_dir.path(), config).expect("Failed to open environment");
        Self {
            env,
            temp_dir: Some(temp_dir),
        }
    }

    /// Returns the environment directory if file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.temp_dir.as_ref().map(TempDir::path)
    }

    /// Opens the main database.
    pub fn main_db(&self) -> Database {
        self.env
            .database(None, DatabaseFlags::new())
            .expect("Failed to open main database")
    }

    /// Opens (creating if needed) a named database.
    pub fn named_db(&self, name: &str, flags: DatabaseFlags) -> Database {
        self.env
            .database(Some(name), flags.create(true))
            .expect("Failed to open named database")
    }

    /// Closes the environment and reopens it from the same directory.
    ///
    /// Panics for in-memory environments.
    pub fn reopen(&mut self, config: EnvConfig) {
        let path = self
            .temp_dir
            .as_ref()
            .expect("Only file environments can be reopened")
            .path()
            .to_path_buf();
        self.env.close().expect("Failed to close environment");
        self.env = Environment::open(&path, config).expect("Failed to reopen environment");
    }
}

impl std::ops::Deref for TestEnv {
    type Target = Environment;

    fn deref(&self) -> &Self::Target {
        &self.env
    }
}

/// Runs a test with a temporary in-memory environment.
///
/// # Example
///
/// ```rust,ignore
/// use lmkv_testkit::with_temp_env;
///
/// #[test]
/// fn my_test() {
///     with_temp_env(|env| {
///         let db = env.database(None, DatabaseFlags::new()).unwrap();
///         // ... test operations
///     });
/// }
/// ```
pub fn with_temp_env<F, R>(f: F) -> R
where
    F: FnOnce(&Environment) -> R,
{
    let test_env = TestEnv::memory();
    f(&test_env.env)
}

/// Runs a test with a temporary file-backed environment.
pub fn with_file_env<F, R>(f: F) -> R
where
    F: FnOnce(&Environment, &Path) -> R,
{
    let test_env = TestEnv::file();
    let path = test_env.path().expect("File environment should have a path");
    f(&test_env.env, path)
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Creates an environment whose main database holds `count` records
    /// keyed `key-00000`, `key-00001`, ... with values `value-N`.
    pub fn populated_env(count: usize) -> TestEnv {
        let test_env = TestEnv::memory();
        let db = test_env.main_db();
        test_env
            .transaction(|_| {
                for i in 0..count {
                    db.put(key(i).as_bytes(), value(i).as_bytes())?;
                }
                Ok(())
            })
            .expect("Failed to populate environment");
        test_env
    }

    /// Key of record `i` in [`populated_env`].
    pub fn key(i: usize) -> String {
        format!("key-{i:05}")
    }

    /// Value of record `i` in [`populated_env`].
    pub fn value(i: usize) -> String {
        format!("value-{i}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_env_works() {
        let test_env = TestEnv::memory();
        assert!(test_env.path().is_none());
        let db = test_env.main_db();
        db.put(b"k", b"v").unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn file_env_survives_reopen() {
        let mut test_env = TestEnv::file();
        test_env.main_db().put(b"k", b"v").unwrap();
        test_env.reopen(EnvConfig::default());
        assert_eq!(test_env.main_db().get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn populated_env_has_records() {
        let test_env = scenarios::populated_env(10);
        assert_eq!(test_env.stat().unwrap().entries, 10);
        assert_eq!(
            test_env.main_db().get(scenarios::key(3).as_bytes()).unwrap(),
            Some(scenarios::value(3).into_bytes())
        );
    }

    #[test]
    fn closures_get_environment() {
        let count = with_temp_env(|env| env.open_transaction_count());
        assert_eq!(count, 0);
        with_file_env(|env, path| {
            assert_eq!(env.path(), Some(path));
        });
    }
}
