//! # Raw Connections
//!
//! Purpose: Define the contract the pool expects from one self-healing,
//! multiplexed connection, and provide the two implementations.
//!
//! ## Design Principles
//! 1. **Opaque Transport**: The pool never looks inside a connection; it only
//!    reads liveness and the outstanding-request counter.
//! 2. **Live State**: `is_connected` and `outstanding_requests` read atomics
//!    maintained by the transport and are never cached by callers.
//! 3. **Observable, Not Controllable**: Lifecycle changes are published
//!    through `ConnectionSignals`; subscribers cannot alter the connection.
//!
//! ## Implementations
//! - `tcp::RespConnection`: RESP2 over TCP with request pipelining.
//! - `memory::MemoryConnection`: in-process `MemoryStore`, for embedding
//!   and tests.

use std::future::Future;

use tagkv_common::{Command, Reply, Transaction};

use crate::error::ClientResult;

pub mod memory;
pub mod signals;
pub mod tcp;

use signals::ConnectionSignals;

/// One persistent connection to the store.
///
/// Many logical requests may be in flight on one connection at once.
pub trait RawConnection: Send + Sync + 'static {
    /// Runs one command against logical database `db`.
    ///
    /// Error replies from the server come back as `Ok(Reply::Error(_))`;
    /// `Err` is reserved for transport failures.
    fn execute(&self, db: u32, command: Command) -> impl Future<Output = ClientResult<Reply>> + Send;

    /// Runs a guarded transaction against logical database `db`.
    ///
    /// `Ok(None)` means a condition rejected it and nothing was written.
    fn transaction(
        &self,
        db: u32,
        transaction: Transaction,
    ) -> impl Future<Output = ClientResult<Option<Vec<Reply>>>> + Send;

    /// Live connected flag.
    fn is_connected(&self) -> bool;

    /// Requests written but not yet answered.
    fn outstanding_requests(&self) -> usize;

    fn signals(&self) -> &ConnectionSignals;

    /// Human-readable endpoint, used in logs.
    fn endpoint(&self) -> &str;

    /// Releases the underlying transport. Idempotent.
    fn close(&self);
}

/// Opens raw connections for pool slots.
pub trait Connector: Send + Sync {
    type Connection: RawConnection;

    /// Establishes the connection for slot `slot`.
    fn connect(&self, slot: usize) -> impl Future<Output = ClientResult<Self::Connection>> + Send;
}
