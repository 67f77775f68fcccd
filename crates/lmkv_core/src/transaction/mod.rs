//! Transactions: nesting, per-thread activity, and finalisation.

mod handle;
mod state;

pub(crate) use handle::TxnNode;
pub use handle::Transaction;
pub use state::TransactionState;
