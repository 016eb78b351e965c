//! # Health-Tracked Connection
//!
//! Purpose: Own one raw connection together with the signal hooks that log
//! its lifecycle, so the hooks are released exactly when the slot is.
//!
//! ## Design Principles
//! 1. **Observation Only**: Hooks log; they never reconnect or swap the
//!    connection.
//! 2. **Scoped Hooks**: Subscriptions are RAII guards held by the wrapper.
//! 3. **Idempotent Disposal**: `dispose` runs once, from the pool or from Drop.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{error, info};

use crate::connection::signals::{ConnectionEvent, SignalKind, Subscription};
use crate::connection::RawConnection;

const WATCHED: [SignalKind; 4] = [
    SignalKind::ConnectionFailed,
    SignalKind::ConnectionRestored,
    SignalKind::InternalError,
    SignalKind::ErrorMessage,
];

/// A pool slot: a raw connection plus its logging hooks.
pub struct HealthTrackedConnection<C: RawConnection> {
    slot: usize,
    connection: C,
    hooks: Mutex<Vec<Subscription>>,
    disposed: AtomicBool,
}

impl<C: RawConnection> std::fmt::Debug for HealthTrackedConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthTrackedConnection")
            .field("slot", &self.slot)
            .field("endpoint", &self.connection.endpoint())
            .field("connected", &self.is_connected())
            .field("outstanding", &self.outstanding_requests())
            .finish()
    }
}

impl<C: RawConnection> HealthTrackedConnection<C> {
    /// Wraps `connection` and subscribes logging hooks for all signal kinds.
    pub fn new(slot: usize, connection: C) -> Self {
        let hooks = WATCHED
            .iter()
            .map(|kind| {
                connection
                    .signals()
                    .subscribe(*kind, move |event| log_event(slot, event))
            })
            .collect();
        HealthTrackedConnection {
            slot,
            connection,
            hooks: Mutex::new(hooks),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// The wrapped connection, for issuing commands.
    pub fn connection(&self) -> &C {
        &self.connection
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    #[inline]
    pub fn outstanding_requests(&self) -> usize {
        self.connection.outstanding_requests()
    }

    /// Unsubscribes every hook, then closes the connection.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let hooks: Vec<Subscription> = std::mem::take(&mut *self.hooks.lock());
        drop(hooks);
        self.connection.close();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl<C: RawConnection> Drop for HealthTrackedConnection<C> {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn log_event(slot: usize, event: &ConnectionEvent) {
    match event {
        ConnectionEvent::ConnectionFailed {
            endpoint,
            failure,
            message,
        } => {
            error!(slot, %endpoint, failure_type = %failure, %message, "connection failed");
        }
        ConnectionEvent::ConnectionRestored { endpoint } => {
            info!(slot, %endpoint, "connection restored");
        }
        ConnectionEvent::InternalError { origin, message } => {
            error!(slot, origin, %message, "internal connection error");
        }
        ConnectionEvent::ErrorMessage { endpoint, message } => {
            error!(slot, %endpoint, %message, "server error reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tagkv_engine::MemoryStore;

    use crate::connection::memory::MemoryConnection;
    use crate::connection::signals::FailureKind;

    #[test]
    fn subscribes_and_releases_hooks() {
        let conn = MemoryConnection::new(Arc::new(MemoryStore::with_shard_count(2)), "memory");
        let signals = conn.signals().clone();
        let tracked = HealthTrackedConnection::new(3, conn);
        assert_eq!(signals.hook_count(), 4);
        assert_eq!(tracked.slot(), 3);

        tracked.dispose();
        assert_eq!(signals.hook_count(), 0);
        assert!(tracked.is_disposed());
        assert!(!tracked.is_connected());

        tracked.dispose();
        assert_eq!(signals.hook_count(), 0);
    }

    #[test]
    fn drop_releases_hooks() {
        let conn = MemoryConnection::new(Arc::new(MemoryStore::with_shard_count(2)), "memory");
        let signals = conn.signals().clone();
        let tracked = HealthTrackedConnection::new(0, conn);
        tracked.connection().simulate_failure(FailureKind::SocketClosed);
        assert!(!tracked.is_connected());

        drop(tracked);
        assert_eq!(signals.hook_count(), 0);
    }
}
