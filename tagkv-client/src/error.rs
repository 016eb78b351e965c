//! # Client Errors

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;

/// Result type for the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the client.
///
/// A guard rejecting a conditional write is not an error; those operations
/// return `Ok(false)`.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network or IO failure while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// RESP2 framing or parse error.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Server returned an error reply.
    #[error("server error: {0}")]
    Server(String),
    /// Reply shape did not match the command.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    /// The connection is down or has been closed.
    #[error("connection to {0} is not available")]
    Disconnected(String),
    /// The connection dropped while the request was in flight.
    #[error("connection closed before a reply arrived")]
    ConnectionClosed,
    /// No reply within the connection's response timeout.
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    /// Caller input rejected before any remote call.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
