//! # Store Errors
//!
//! Error codes raised by the store when a command cannot be applied.

use thiserror::Error;

/// Result alias for store operations.
pub type TagKvResult<T> = Result<T, TagKvError>;

/// Errors produced while applying a command to a keyspace.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TagKvError {
    /// The key holds a value of a different kind (string vs set vs hash).
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,
    /// The command carried an argument the store cannot accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
