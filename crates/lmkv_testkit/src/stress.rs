//! Concurrent workloads.
//!
//! These helpers drive one environment from several threads at once, the
//! way an application with a thread pool would.

use lmkv_core::{CoreResult, Database, Environment};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        Self {
            total_ops: successful + failed,
            successful_ops: successful,
            failed_ops: failed,
            duration,
        }
    }

    /// Operations per second.
    pub fn ops_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.total_ops as f64 / secs
        } else {
            0.0
        }
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of concurrent threads.
    pub threads: usize,
    /// Transactions per thread.
    pub transactions: usize,
    /// Records written per transaction.
    pub writes_per_transaction: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            transactions: 50,
            writes_per_transaction: 4,
        }
    }
}

/// Key written by `thread` in transaction `txn`, write `n`.
pub fn writer_key(thread: usize, txn: usize, n: usize) -> Vec<u8> {
    format!("t{thread:02}-x{txn:04}-n{n:02}").into_bytes()
}

/// Runs `config.threads` writer threads against `db`.
///
/// Each thread runs `config.transactions` closure transactions, each
/// writing `config.writes_per_transaction` records keyed by
/// [`writer_key`], and then checks that the thread never observed another
/// thread's active transaction.
pub fn concurrent_writers(
    env: &Environment,
    db: &Database,
    config: &StressConfig,
) -> StressTestResult {
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|thread_no| {
            let env = env.clone();
            let db = db.clone();
            let config = config.clone();
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            thread::spawn(move || {
                for txn_no in 0..config.transactions {
                    let result = env.transaction(|txn| {
                        for n in 0..config.writes_per_transaction {
                            let key = writer_key(thread_no, txn_no, n);
                            db.put(&key, &key)?;
                        }
                        let active = env.active_transaction()?;
                        assert_eq!(active.as_ref(), Some(txn), "foreign active transaction");
                        Ok(())
                    });
                    match result {
                        Ok(()) => successful.fetch_add(1, Ordering::Relaxed),
                        Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
                assert!(
                    env.active_transaction().map_or(true, |active| active.is_none()),
                    "thread left an active transaction behind"
                );
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Writer thread panicked");
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Runs `readers` threads that repeatedly read every key in `keys` inside
/// read transactions, while the caller keeps writing. Returns the number
/// of read transactions completed.
pub fn concurrent_readers(
    env: &Environment,
    db: &Database,
    readers: usize,
    rounds: usize,
    keys: Arc<Vec<Vec<u8>>>,
) -> CoreResult<usize> {
    let handles: Vec<_> = (0..readers)
        .map(|_| {
            let env = env.clone();
            let db = db.clone();
            let keys = Arc::clone(&keys);
            thread::spawn(move || -> CoreResult<usize> {
                for _ in 0..rounds {
                    env.read_transaction(|_| {
                        for key in keys.iter() {
                            db.get(key)?;
                        }
                        Ok(())
                    })?;
                }
                Ok(rounds)
            })
        })
        .collect();

    let mut completed = 0;
    for handle in handles {
        completed += handle.join().expect("Reader thread panicked")?;
    }
    Ok(completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestEnv;

    #[test]
    fn small_writer_run() {
        let test_env = TestEnv::memory();
        let db = test_env.main_db();
        let config = StressConfig {
            threads: 2,
            transactions: 5,
            writes_per_transaction: 2,
        };
        let result = concurrent_writers(&test_env, &db, &config);
        assert_eq!(result.successful_ops, 10);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(test_env.stat().unwrap().entries, 20);
    }
}
