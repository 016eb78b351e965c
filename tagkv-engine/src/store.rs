//! # Logical Databases
//!
//! A `MemoryStore` holds numbered keyspaces, mirroring `SELECT n` on a Redis
//! server. Databases are created on first use and live as long as the store.

use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::memory::MemoryEngine;

/// Shared store of numbered `MemoryEngine` keyspaces.
#[derive(Debug)]
pub struct MemoryStore {
    shard_count: usize,
    databases: RwLock<HashMap<u32, Arc<MemoryEngine>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates a store whose databases use the default shard count.
    pub fn new() -> Self {
        Self::with_shard_count(MemoryEngine::new().shard_count())
    }

    /// Creates a store whose databases use `shard_count` shards each.
    pub fn with_shard_count(shard_count: usize) -> Self {
        MemoryStore {
            shard_count,
            databases: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the keyspace for `db`, creating it on first access.
    pub fn database(&self, db: u32) -> Arc<MemoryEngine> {
        if let Some(engine) = self.databases.read().get(&db) {
            return Arc::clone(engine);
        }
        let mut databases = self.databases.write();
        let engine = databases
            .entry(db)
            .or_insert_with(|| Arc::new(MemoryEngine::with_shard_count(self.shard_count)));
        Arc::clone(engine)
    }

    /// Purges expired entries in every database.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let databases: Vec<Arc<MemoryEngine>> = self.databases.read().values().cloned().collect();
        databases
            .iter()
            .map(|engine| engine.purge_expired(now))
            .sum()
    }
}
