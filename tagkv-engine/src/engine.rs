//! # Engine Contract
//!
//! Purpose: Keep callers decoupled from the concrete keyspace.
//!
//! ## Design Principles
//! 1. **Strategy Pattern**: Backends implement `KVEngine`; callers hold the
//!    concrete type to keep dispatch static.
//! 2. **Atomic Units**: `transaction` either applies every command or none.

use tagkv_common::{Command, Reply, TagKvResult, Transaction};

/// Storage backend able to run single commands and guarded transactions.
pub trait KVEngine: Send + Sync {
    /// Runs one command.
    fn execute(&self, command: &Command) -> TagKvResult<Reply>;

    /// Checks every condition and, when all hold, runs every command.
    ///
    /// Returns `Ok(None)` when a condition rejected the transaction; nothing
    /// was written in that case. Per-command failures after the conditions
    /// passed are reported as `Reply::Error` in their slot.
    fn transaction(&self, transaction: &Transaction) -> TagKvResult<Option<Vec<Reply>>>;
}
