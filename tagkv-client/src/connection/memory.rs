//! In-process connection backed by a shared `MemoryStore`.
//!
//! Behaves like a remote connection from the pool's point of view: it has a
//! connected flag, an outstanding counter, and raises the same signals. The
//! `simulate_*` hooks let callers drive failure and recovery without a socket.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tagkv_common::{Command, Reply, Transaction};
use tagkv_engine::{KVEngine, MemoryStore};

use crate::connection::signals::{ConnectionEvent, ConnectionSignals, FailureKind};
use crate::connection::{Connector, RawConnection};
use crate::error::{ClientError, ClientResult};

/// Connection to an in-process store.
#[derive(Debug)]
pub struct MemoryConnection {
    endpoint: String,
    store: Arc<MemoryStore>,
    connected: AtomicBool,
    closed: AtomicBool,
    outstanding: AtomicUsize,
    signals: ConnectionSignals,
}

impl MemoryConnection {
    pub fn new(store: Arc<MemoryStore>, endpoint: impl Into<String>) -> Self {
        MemoryConnection {
            endpoint: endpoint.into(),
            store,
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            outstanding: AtomicUsize::new(0),
            signals: ConnectionSignals::new(),
        }
    }

    /// Marks the connection down and raises `ConnectionFailed`.
    pub fn simulate_failure(&self, failure: FailureKind) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.signals.emit(&ConnectionEvent::ConnectionFailed {
                endpoint: self.endpoint.clone(),
                failure,
                message: "simulated failure".to_string(),
            });
        }
    }

    /// Marks the connection up again and raises `ConnectionRestored`.
    pub fn simulate_restore(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if !self.connected.swap(true, Ordering::AcqRel) {
            self.signals.emit(&ConnectionEvent::ConnectionRestored {
                endpoint: self.endpoint.clone(),
            });
        }
    }

    fn ensure_usable(&self) -> ClientResult<()> {
        if self.closed.load(Ordering::Acquire) || !self.connected.load(Ordering::Acquire) {
            return Err(ClientError::Disconnected(self.endpoint.clone()));
        }
        Ok(())
    }

    fn report_error(&self, message: &str) {
        self.signals.emit(&ConnectionEvent::ErrorMessage {
            endpoint: self.endpoint.clone(),
            message: message.to_string(),
        });
    }
}

/// Counts a request as outstanding for as long as the guard lives.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn start(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        InFlight(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl RawConnection for MemoryConnection {
    async fn execute(&self, db: u32, command: Command) -> ClientResult<Reply> {
        self.ensure_usable()?;
        let _in_flight = InFlight::start(&self.outstanding);
        match self.store.database(db).execute(&command) {
            Ok(reply) => Ok(reply),
            Err(err) => {
                let message = err.to_string();
                self.report_error(&message);
                Ok(Reply::Error(message))
            }
        }
    }

    async fn transaction(&self, db: u32, transaction: Transaction) -> ClientResult<Option<Vec<Reply>>> {
        self.ensure_usable()?;
        let _in_flight = InFlight::start(&self.outstanding);
        self.store
            .database(db)
            .transaction(&transaction)
            .map_err(|err| {
                let message = err.to_string();
                self.report_error(&message);
                ClientError::Server(message)
            })
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.connected.load(Ordering::Acquire)
    }

    fn outstanding_requests(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    fn signals(&self) -> &ConnectionSignals {
        &self.signals
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.connected.store(false, Ordering::Release);
    }
}

/// Hands every slot a connection to the same store.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
    endpoint: String,
}

impl MemoryConnector {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        MemoryConnector {
            store,
            endpoint: "memory".to_string(),
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }
}

impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    async fn connect(&self, slot: usize) -> ClientResult<MemoryConnection> {
        Ok(MemoryConnection::new(
            Arc::clone(&self.store),
            format!("{}#{slot}", self.endpoint),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn failed_connection_rejects_requests() {
        let conn = MemoryConnection::new(Arc::new(MemoryStore::with_shard_count(2)), "memory");
        assert!(conn.is_connected());

        conn.simulate_failure(FailureKind::SocketClosed);
        assert!(!conn.is_connected());
        let err = conn.execute(0, Command::Ping).await.unwrap_err();
        assert!(matches!(err, ClientError::Disconnected(_)));

        conn.simulate_restore();
        assert_eq!(
            conn.execute(0, Command::Ping).await.unwrap(),
            Reply::Status("PONG".to_string())
        );
    }

    #[tokio::test]
    async fn store_errors_become_error_replies() {
        let conn = MemoryConnection::new(Arc::new(MemoryStore::with_shard_count(2)), "memory");
        conn.execute(
            0,
            Command::Set {
                key: Bytes::from_static(b"k"),
                value: Bytes::from_static(b"v"),
                ttl: None,
                when: tagkv_common::When::Always,
            },
        )
        .await
        .unwrap();

        let reply = conn
            .execute(
                0,
                Command::SMembers {
                    key: Bytes::from_static(b"k"),
                },
            )
            .await
            .unwrap();
        assert!(matches!(reply, Reply::Error(message) if message.starts_with("WRONGTYPE")));
        assert_eq!(conn.outstanding_requests(), 0);
    }

    #[tokio::test]
    async fn closed_connection_does_not_restore() {
        let conn = MemoryConnection::new(Arc::new(MemoryStore::with_shard_count(2)), "memory");
        conn.close();
        conn.simulate_restore();
        assert!(!conn.is_connected());
    }
}
