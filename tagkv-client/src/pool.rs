//! # Connection Pool
//!
//! Purpose: Hold a fixed set of multiplexed connections and route each
//! request to one of them without locking or I/O.
//!
//! ## Design Principles
//! 1. **Fixed Slots**: Every slot is created up front; the set never grows,
//!    shrinks, or replaces a member. Connections heal themselves.
//! 2. **Lock-Free Acquire**: `acquire` reads an immutable `Vec` and atomic
//!    counters only.
//! 3. **All or Nothing**: A pool either opens every slot or none.
//! 4. **Explicit Ownership**: No process-wide state; `SharedPool` serializes
//!    lazy construction for callers that want one shared instance.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info};

use crate::config::PoolConfig;
use crate::connection::{Connector, RawConnection};
use crate::error::{ClientError, ClientResult};
use crate::health::HealthTrackedConnection;
use crate::strategy::SelectionStrategy;

/// Snapshot of slot liveness, computed on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub required_pool_size: usize,
    pub active_connections: usize,
    pub invalid_connections: usize,
}

/// Fixed-size pool of health-tracked connections.
pub struct ConnectionPool<C: RawConnection> {
    slots: Vec<HealthTrackedConnection<C>>,
    strategy: SelectionStrategy,
    disposed: AtomicBool,
}

impl<C: RawConnection> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("size", &self.slots.len())
            .field("strategy", &self.strategy)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl<C: RawConnection> ConnectionPool<C> {
    /// Validates `config` and opens `pool_size` connections through `connector`.
    ///
    /// If any connection fails, the ones already opened are disposed and the
    /// error is returned.
    pub async fn connect<K>(config: &PoolConfig, connector: &K) -> ClientResult<Self>
    where
        K: Connector<Connection = C>,
    {
        config.validate()?;
        let mut connections = Vec::with_capacity(config.pool_size);
        for slot in 0..config.pool_size {
            match connector.connect(slot).await {
                Ok(connection) => connections.push(connection),
                Err(err) => {
                    error!(slot, pool_size = config.pool_size, error = %err, "pool construction failed");
                    for connection in &connections {
                        connection.close();
                    }
                    return Err(err);
                }
            }
        }
        let pool = Self::with_connections(config.strategy, connections)?;
        info!(
            pool_size = pool.size(),
            strategy = ?pool.strategy,
            "connection pool ready"
        );
        Ok(pool)
    }

    /// Builds a pool over already-established connections, one per slot.
    pub fn with_connections(strategy: SelectionStrategy, connections: Vec<C>) -> ClientResult<Self> {
        if connections.is_empty() {
            return Err(ClientError::InvalidArgument(
                "pool needs at least one connection".to_string(),
            ));
        }
        let slots = connections
            .into_iter()
            .enumerate()
            .map(|(slot, connection)| HealthTrackedConnection::new(slot, connection))
            .collect();
        Ok(ConnectionPool {
            slots,
            strategy,
            disposed: AtomicBool::new(false),
        })
    }

    /// Picks a slot with the configured strategy. Never blocks or connects,
    /// and does not check liveness.
    #[inline]
    pub fn acquire(&self) -> &HealthTrackedConnection<C> {
        let idx = self.strategy.select(&self.slots);
        &self.slots[idx]
    }

    /// Counts connected slots right now.
    pub fn health_report(&self) -> HealthReport {
        let active = self.slots.iter().filter(|slot| slot.is_connected()).count();
        HealthReport {
            required_pool_size: self.slots.len(),
            active_connections: active,
            invalid_connections: self.slots.len() - active,
        }
    }

    pub fn slots(&self) -> &[HealthTrackedConnection<C>] {
        &self.slots
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// Releases every slot's hooks and connection. Safe to call repeatedly.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        for slot in &self.slots {
            slot.dispose();
        }
        debug!(pool_size = self.slots.len(), "connection pool disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl<C: RawConnection> Drop for ConnectionPool<C> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Lazily built pool shared by many callers.
///
/// The first `get` opens the pool; concurrent callers wait on the same lock
/// and receive the same instance. After `dispose`, the next `get` rebuilds.
pub struct SharedPool<K: Connector> {
    config: PoolConfig,
    connector: K,
    current: tokio::sync::Mutex<Option<Arc<ConnectionPool<K::Connection>>>>,
}

impl<K: Connector> SharedPool<K> {
    pub fn new(config: PoolConfig, connector: K) -> Self {
        SharedPool {
            config,
            connector,
            current: tokio::sync::Mutex::new(None),
        }
    }

    /// Returns the live pool, building it on first use.
    pub async fn get(&self) -> ClientResult<Arc<ConnectionPool<K::Connection>>> {
        let mut current = self.current.lock().await;
        if let Some(pool) = current.as_ref() {
            if !pool.is_disposed() {
                return Ok(Arc::clone(pool));
            }
        }
        let pool = Arc::new(ConnectionPool::connect(&self.config, &self.connector).await?);
        *current = Some(Arc::clone(&pool));
        Ok(pool)
    }

    /// Disposes the current pool, if any. Handles already given out keep
    /// their slots but every connection is closed.
    pub async fn dispose(&self) {
        if let Some(pool) = self.current.lock().await.take() {
            pool.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tagkv_engine::MemoryStore;

    use crate::connection::memory::{MemoryConnection, MemoryConnector};

    fn config(pool_size: usize) -> PoolConfig {
        PoolConfig {
            pool_size,
            ..PoolConfig::default()
        }
    }

    #[tokio::test]
    async fn rejects_zero_pool_size() {
        let connector = MemoryConnector::new(Arc::new(MemoryStore::with_shard_count(2)));
        let err = ConnectionPool::connect(&config(0), &connector).await.unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[tokio::test]
    async fn report_counts_live_slots() {
        let connector = MemoryConnector::new(Arc::new(MemoryStore::with_shard_count(2)));
        let pool: ConnectionPool<MemoryConnection> =
            ConnectionPool::connect(&config(3), &connector).await.unwrap();
        assert_eq!(
            pool.health_report(),
            HealthReport {
                required_pool_size: 3,
                active_connections: 3,
                invalid_connections: 0,
            }
        );

        pool.dispose();
        assert_eq!(pool.health_report().active_connections, 0);
    }
}
