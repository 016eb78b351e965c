//! # Connection Signals
//!
//! Purpose: Publish connection lifecycle events to any number of observers.
//!
//! ## Design Principles
//! 1. **Scoped Subscriptions**: `subscribe` returns a `Subscription` guard;
//!    dropping it removes the hook, so no handler outlives its owner on any
//!    exit path.
//! 2. **Weak Back-Reference**: A guard does not keep the hub alive.
//! 3. **Lock-Free Dispatch**: Handlers are cloned out of the registry before
//!    they run, so a handler may subscribe or drop guards without deadlocking.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

/// The four observable signal kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    ConnectionFailed,
    ConnectionRestored,
    InternalError,
    ErrorMessage,
}

/// Why a connection was lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    UnableToConnect,
    SocketClosed,
    SocketFailure,
    ProtocolFailure,
    AuthenticationFailure,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::UnableToConnect => "unable-to-connect",
            FailureKind::SocketClosed => "socket-closed",
            FailureKind::SocketFailure => "socket-failure",
            FailureKind::ProtocolFailure => "protocol-failure",
            FailureKind::AuthenticationFailure => "authentication-failure",
        };
        f.write_str(name)
    }
}

/// Lifecycle event raised by a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    ConnectionFailed {
        endpoint: String,
        failure: FailureKind,
        message: String,
    },
    ConnectionRestored {
        endpoint: String,
    },
    /// Unexpected condition inside the transport itself.
    InternalError {
        origin: &'static str,
        message: String,
    },
    /// The server answered a request with an error reply.
    ErrorMessage {
        endpoint: String,
        message: String,
    },
}

impl ConnectionEvent {
    pub fn kind(&self) -> SignalKind {
        match self {
            ConnectionEvent::ConnectionFailed { .. } => SignalKind::ConnectionFailed,
            ConnectionEvent::ConnectionRestored { .. } => SignalKind::ConnectionRestored,
            ConnectionEvent::InternalError { .. } => SignalKind::InternalError,
            ConnectionEvent::ErrorMessage { .. } => SignalKind::ErrorMessage,
        }
    }
}

type Handler = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

struct Hook {
    id: u64,
    kind: SignalKind,
    handler: Handler,
}

#[derive(Default)]
struct SignalsInner {
    next_id: AtomicU64,
    hooks: RwLock<Vec<Hook>>,
}

/// Registry of event hooks owned by one connection.
#[derive(Clone, Default)]
pub struct ConnectionSignals {
    inner: Arc<SignalsInner>,
}

impl fmt::Debug for ConnectionSignals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSignals")
            .field("hooks", &self.hook_count())
            .finish()
    }
}

impl ConnectionSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for events of `kind` until the guard is dropped.
    #[must_use = "dropping the subscription removes the hook immediately"]
    pub fn subscribe<F>(&self, kind: SignalKind, handler: F) -> Subscription
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.hooks.write().push(Hook {
            id,
            kind,
            handler: Arc::new(handler),
        });
        Subscription {
            id,
            kind,
            signals: Arc::downgrade(&self.inner),
        }
    }

    /// Delivers `event` to every hook registered for its kind.
    pub fn emit(&self, event: &ConnectionEvent) {
        let kind = event.kind();
        let handlers: Vec<Handler> = self
            .inner
            .hooks
            .read()
            .iter()
            .filter(|hook| hook.kind == kind)
            .map(|hook| Arc::clone(&hook.handler))
            .collect();
        for handler in handlers {
            handler(event);
        }
    }

    /// Number of live hooks across all kinds.
    pub fn hook_count(&self) -> usize {
        self.inner.hooks.read().len()
    }
}

/// RAII registration of one hook. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    kind: SignalKind,
    signals: Weak<SignalsInner>,
}

impl Subscription {
    pub fn kind(&self) -> SignalKind {
        self.kind
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.signals.upgrade() {
            inner.hooks.write().retain(|hook| hook.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn delivers_only_matching_kind() {
        let signals = ConnectionSignals::new();
        let failed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&failed);
        let _guard = signals.subscribe(SignalKind::ConnectionFailed, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        signals.emit(&ConnectionEvent::ConnectionRestored {
            endpoint: "a".to_string(),
        });
        signals.emit(&ConnectionEvent::ConnectionFailed {
            endpoint: "a".to_string(),
            failure: FailureKind::SocketClosed,
            message: "eof".to_string(),
        });

        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_subscription_removes_hook() {
        let signals = ConnectionSignals::new();
        let guard = signals.subscribe(SignalKind::ErrorMessage, |_| {});
        let other = signals.subscribe(SignalKind::InternalError, |_| {});
        assert_eq!(signals.hook_count(), 2);

        drop(guard);
        assert_eq!(signals.hook_count(), 1);
        drop(other);
        assert_eq!(signals.hook_count(), 0);
    }

    #[test]
    fn subscription_outliving_hub_is_harmless() {
        let signals = ConnectionSignals::new();
        let guard = signals.subscribe(SignalKind::ErrorMessage, |_| {});
        drop(signals);
        drop(guard);
    }
}
