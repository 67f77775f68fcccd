//! Implicit transactions.
//!
//! Database operations run in the calling thread's active transaction when
//! there is one. Otherwise each call is wrapped in its own short-lived
//! top-level transaction that commits on success and aborts on failure.

use crate::environment::Environment;
use crate::error::CoreResult;
use crate::transaction::Transaction;
use tracing::trace;

/// Kind of transaction an implicit wrapper begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    Read,
    Write,
}

/// Runs `f` in the active transaction, or in a new one of kind `access`.
pub(crate) fn run_in_transaction<F, T>(env: &Environment, access: Access, f: F) -> CoreResult<T>
where
    F: FnOnce(&Transaction) -> CoreResult<T>,
{
    if let Some(active) = env.active_transaction()? {
        return f(&active);
    }
    let txn = Transaction::begin(env, None, access == Access::Read, None)?;
    trace!(txn = %txn.id(), ?access, "implicit transaction started");
    finish_with(txn, f)
}

/// Aborts the transaction if dropped while still armed, e.g. on unwind.
struct FinishGuard<'a> {
    txn: &'a Transaction,
    armed: bool,
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.txn.is_open() {
            let _ = self.txn.abort();
        }
    }
}

/// Runs `f` with `txn`, then commits `txn` if `f` succeeded and left it
/// open, or aborts it if `f` failed.
pub(crate) fn finish_with<F, T>(txn: Transaction, f: F) -> CoreResult<T>
where
    F: FnOnce(&Transaction) -> CoreResult<T>,
{
    let mut guard = FinishGuard {
        txn: &txn,
        armed: true,
    };
    let result = f(&txn);
    guard.armed = false;
    drop(guard);

    match result {
        Ok(value) => {
            if txn.is_open() {
                txn.commit()?;
            }
            Ok(value)
        }
        Err(err) => {
            if txn.is_open() {
                let _ = txn.abort();
            }
            trace!(txn = %txn.id(), error = %err, "transaction aborted after error");
            Err(err)
        }
    }
}
