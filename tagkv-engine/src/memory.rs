//! # In-Memory Engine
//!
//! Provide the in-memory keyspace with sharded locking, TTL-aware lookups,
//! typed values (strings, sets, hashes), and atomic guarded transactions.
//!
//! ## Usage
//!
//! - Use `MemoryEngine::new()` for a default sharded engine.
//! - Use `MemoryEngine::with_shard_count` to pin the shard count (tests use
//!   small counts to force multi-shard transactions).
//! - Use `start_expirer` to enable active TTL cleanup in the background.
//!
//! ## Design Principles
//!
//! 1. **Sharded Locks**: Per-shard locks reduce contention under concurrency.
//! 2. **Ordered Multi-Locking**: A command or transaction write-locks every
//!    shard it touches in ascending index order, so multi-key units are atomic
//!    and two units can never deadlock.
//! 3. **TTL Fast Path**: Expiration is checked on access; expired entries are
//!    dropped the moment they are observed.
//! 4. **Strategy Pattern**: Implements `KVEngine` to keep callers decoupled.
//!
//! ## Structure Overview
//!
//! ```text
//! MemoryEngine
//!   └── shards: Vec<Shard>
//!         └── Shard
//!               └── inner: RwLock<ShardInner>
//!                     └── map: HashMap<Bytes, Entry>
//!                           └── Entry { data: Str | Set | Hash, expires_at }
//! ```

use std::hash::{BuildHasher, Hasher};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ahash::RandomState;
use bytes::Bytes;
use hashbrown::{HashMap, HashSet};
use parking_lot::{RwLock, RwLockWriteGuard};
use tracing::trace;

use tagkv_common::{Command, Condition, Reply, TagKvError, TagKvResult, Transaction, When};

use crate::engine::KVEngine;

/// Default shards = CPU count * multiplier to reduce lock contention.
const DEFAULT_SHARD_MULTIPLIER: usize = 4;

/// Typed payload stored under a key.
#[derive(Debug)]
enum Data {
    Str(Bytes),
    Set(HashSet<Bytes>),
    Hash(HashMap<Bytes, Bytes>),
}

#[derive(Debug)]
struct Entry {
    data: Data,
    // Absolute expiration timestamp.
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(data: Data) -> Self {
        Entry {
            data,
            expires_at: None,
        }
    }

    /// Returns true when the entry has expired at `now`.
    fn is_expired(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}

/// Per-shard storage container.
#[derive(Debug)]
struct ShardInner {
    map: HashMap<Bytes, Entry, RandomState>,
}

impl ShardInner {
    /// Sharing the `RandomState` seed across shards keeps hash distribution
    /// consistent without introducing shared mutability.
    fn new(hash_state: RandomState) -> Self {
        ShardInner {
            map: HashMap::with_hasher(hash_state),
        }
    }

    /// Drops `key` if it has expired at `now`.
    fn drop_if_expired(&mut self, key: &[u8], now: Instant) {
        let expired = self
            .map
            .get(key)
            .map(|entry| entry.is_expired(now))
            .unwrap_or(false);
        if expired {
            self.map.remove(key);
        }
    }

    /// Returns the live entry for `key`, treating expired entries as missing.
    fn live(&mut self, key: &[u8], now: Instant) -> Option<&mut Entry> {
        self.drop_if_expired(key, now);
        self.map.get_mut(key)
    }

    /// Removes a live entry. Returns false for missing or expired keys.
    fn remove(&mut self, key: &[u8], now: Instant) -> bool {
        if self.live(key, now).is_some() {
            self.map.remove(key);
            true
        } else {
            false
        }
    }

    /// Returns the set at `key`, creating an empty one when missing.
    fn set_for_write(&mut self, key: &Bytes, now: Instant) -> TagKvResult<&mut HashSet<Bytes>> {
        self.drop_if_expired(key, now);
        let entry = self
            .map
            .entry(key.clone())
            .or_insert_with(|| Entry::new(Data::Set(HashSet::new())));
        match &mut entry.data {
            Data::Set(set) => Ok(set),
            _ => Err(TagKvError::WrongType),
        }
    }

    /// Returns the hash at `key`, creating an empty one when missing.
    fn hash_for_write(
        &mut self,
        key: &Bytes,
        now: Instant,
    ) -> TagKvResult<&mut HashMap<Bytes, Bytes>> {
        self.drop_if_expired(key, now);
        let entry = self
            .map
            .entry(key.clone())
            .or_insert_with(|| Entry::new(Data::Hash(HashMap::new())));
        match &mut entry.data {
            Data::Hash(hash) => Ok(hash),
            _ => Err(TagKvError::WrongType),
        }
    }

    /// Removes every expired entry and returns how many were dropped.
    fn purge(&mut self, now: Instant) -> usize {
        let before = self.map.len();
        self.map.retain(|_, entry| !entry.is_expired(now));
        before - self.map.len()
    }
}

/// Per-shard lock wrapper.
#[derive(Debug)]
struct Shard {
    inner: RwLock<ShardInner>,
}

/// Write guards over a sorted, deduplicated set of shards.
struct LockedShards<'a> {
    indices: Vec<usize>,
    guards: Vec<RwLockWriteGuard<'a, ShardInner>>,
}

impl LockedShards<'_> {
    fn get(&mut self, shard_index: usize) -> &mut ShardInner {
        let pos = self
            .indices
            .binary_search(&shard_index)
            .expect("shard locked before access");
        &mut self.guards[pos]
    }
}

/// Sharded in-memory implementation of `KVEngine`.
#[derive(Debug)]
pub struct MemoryEngine {
    shards: Vec<Shard>,
    /// Bitmask for fast shard selection (power-of-two shard count).
    shard_mask: usize,
    hash_state: RandomState,
}

/// Handle for the background expiration sweeper.
///
/// Call `stop` to signal shutdown and join the thread.
pub struct ExpirationHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ExpirationHandle {
    /// Stops the sweeper and waits for the thread to finish.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    /// Creates a new engine with a default shard count based on CPU parallelism.
    pub fn new() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        Self::with_shard_count(threads.saturating_mul(DEFAULT_SHARD_MULTIPLIER))
    }

    /// Creates a new engine with a caller-provided shard count.
    ///
    /// The count is normalized to the next power of two to enable fast masking.
    pub fn with_shard_count(shards: usize) -> Self {
        let shard_count = normalize_shard_count(shards);
        let hash_state = RandomState::new();
        let mut shard_vec = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            shard_vec.push(Shard {
                inner: RwLock::new(ShardInner::new(hash_state.clone())),
            });
        }

        MemoryEngine {
            shards: shard_vec,
            shard_mask: shard_count - 1,
            hash_state,
        }
    }

    /// Number of shards after normalization.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Counts live (non-expired) keys across all shards.
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        self.shards
            .iter()
            .map(|shard| {
                let inner = shard.inner.read();
                inner.map.values().filter(|entry| !entry.is_expired(now)).count()
            })
            .sum()
    }

    /// Removes expired entries across all shards.
    ///
    /// This is an O(n) scan and is intended for a periodic background sweep.
    pub fn purge_expired(&self, now: Instant) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.inner.write().purge(now))
            .sum()
    }

    /// Starts a background thread that periodically removes expired entries.
    ///
    /// The returned handle must be stopped to avoid leaking the thread.
    pub fn start_expirer(self: &Arc<Self>, interval: Duration) -> ExpirationHandle {
        let interval = if interval.is_zero() {
            Duration::from_millis(1)
        } else {
            interval
        };

        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);
        let engine = Arc::clone(self);

        let join = std::thread::spawn(move || {
            while !stop_thread.load(Ordering::Acquire) {
                std::thread::sleep(interval);
                let removed = engine.purge_expired(Instant::now());
                if removed > 0 {
                    trace!(removed, "expirer purged entries");
                }
            }
        });

        ExpirationHandle {
            stop,
            join: Some(join),
        }
    }

    /// Hashes a key to its owning shard index.
    fn shard_index(&self, key: &[u8]) -> usize {
        let mut hasher = self.hash_state.build_hasher();
        hasher.write(key);
        (hasher.finish() as usize) & self.shard_mask
    }

    /// Write-locks every shard owning one of `keys`, in ascending order.
    fn lock(&self, keys: &[&Bytes]) -> LockedShards<'_> {
        let mut indices: Vec<usize> = keys.iter().map(|key| self.shard_index(key)).collect();
        indices.sort_unstable();
        indices.dedup();
        let guards = indices
            .iter()
            .map(|&idx| self.shards[idx].inner.write())
            .collect();
        LockedShards { indices, guards }
    }

    fn shard<'l>(&self, locked: &'l mut LockedShards<'_>, key: &[u8]) -> &'l mut ShardInner {
        locked.get(self.shard_index(key))
    }

    /// Evaluates one transaction precondition under the held locks.
    fn holds(
        &self,
        locked: &mut LockedShards<'_>,
        condition: &Condition,
        now: Instant,
    ) -> TagKvResult<bool> {
        let present = match condition {
            Condition::KeyExists(key) | Condition::KeyNotExists(key) => {
                self.shard(locked, key).live(key, now).is_some()
            }
            Condition::HashFieldExists { key, field }
            | Condition::HashFieldNotExists { key, field } => {
                match self.shard(locked, key).live(key, now) {
                    None => false,
                    Some(Entry {
                        data: Data::Hash(hash),
                        ..
                    }) => hash.contains_key(field.as_ref()),
                    Some(_) => return Err(TagKvError::WrongType),
                }
            }
        };
        Ok(present == condition.expects_present())
    }

    /// Applies one command under the held locks.
    fn apply(
        &self,
        locked: &mut LockedShards<'_>,
        command: &Command,
        now: Instant,
    ) -> TagKvResult<Reply> {
        match command {
            Command::Ping => Ok(Reply::Status("PONG".to_string())),
            Command::Get { key } => match self.shard(locked, key).live(key, now) {
                None => Ok(Reply::Nil),
                Some(Entry {
                    data: Data::Str(value),
                    ..
                }) => Ok(Reply::Bulk(value.clone())),
                Some(_) => Err(TagKvError::WrongType),
            },
            Command::MGet { keys } => {
                require_some("MGET", keys)?;
                let mut replies = Vec::with_capacity(keys.len());
                for key in keys {
                    // Non-string values read as nil, like Redis.
                    let reply = match self.shard(locked, key).live(key, now) {
                        Some(Entry {
                            data: Data::Str(value),
                            ..
                        }) => Reply::Bulk(value.clone()),
                        _ => Reply::Nil,
                    };
                    replies.push(reply);
                }
                Ok(Reply::Array(replies))
            }
            Command::Set {
                key,
                value,
                ttl,
                when,
            } => {
                let shard = self.shard(locked, key);
                let exists = shard.live(key, now).is_some();
                let allowed = match when {
                    When::Always => true,
                    When::Exists => exists,
                    When::NotExists => !exists,
                };
                if !allowed {
                    return Ok(Reply::Nil);
                }
                let mut entry = Entry::new(Data::Str(value.clone()));
                entry.expires_at = ttl.map(|ttl| now + ttl);
                shard.map.insert(key.clone(), entry);
                Ok(Reply::Status("OK".to_string()))
            }
            Command::Del { keys } => {
                require_some("DEL", keys)?;
                let mut removed = 0i64;
                for key in keys {
                    if self.shard(locked, key).remove(key, now) {
                        removed += 1;
                    }
                }
                Ok(Reply::Integer(removed))
            }
            Command::Exists { keys } => {
                require_some("EXISTS", keys)?;
                let mut present = 0i64;
                for key in keys {
                    if self.shard(locked, key).live(key, now).is_some() {
                        present += 1;
                    }
                }
                Ok(Reply::Integer(present))
            }
            Command::Expire { key, ttl } => match self.shard(locked, key).live(key, now) {
                Some(entry) => {
                    entry.expires_at = Some(now + *ttl);
                    Ok(Reply::Integer(1))
                }
                None => Ok(Reply::Integer(0)),
            },
            Command::Ttl { key } => match self.shard(locked, key).live(key, now) {
                None => Ok(Reply::Integer(-2)),
                Some(entry) => match entry.expires_at {
                    None => Ok(Reply::Integer(-1)),
                    Some(deadline) => Ok(Reply::Integer(
                        deadline.saturating_duration_since(now).as_millis() as i64,
                    )),
                },
            },
            Command::SAdd { key, members } => {
                require_some("SADD", members)?;
                let set = self.shard(locked, key).set_for_write(key, now)?;
                let mut added = 0i64;
                for member in members {
                    if set.insert(member.clone()) {
                        added += 1;
                    }
                }
                Ok(Reply::Integer(added))
            }
            Command::SMembers { key } => match self.shard(locked, key).live(key, now) {
                None => Ok(Reply::Array(Vec::new())),
                Some(Entry {
                    data: Data::Set(set),
                    ..
                }) => Ok(Reply::Array(set.iter().cloned().map(Reply::Bulk).collect())),
                Some(_) => Err(TagKvError::WrongType),
            },
            Command::HGet { key, field } => match self.shard(locked, key).live(key, now) {
                None => Ok(Reply::Nil),
                Some(Entry {
                    data: Data::Hash(hash),
                    ..
                }) => Ok(hash
                    .get(field.as_ref())
                    .cloned()
                    .map(Reply::Bulk)
                    .unwrap_or(Reply::Nil)),
                Some(_) => Err(TagKvError::WrongType),
            },
            Command::HMGet { key, fields } => {
                require_some("HMGET", fields)?;
                match self.shard(locked, key).live(key, now) {
                    None => Ok(Reply::Array(vec![Reply::Nil; fields.len()])),
                    Some(Entry {
                        data: Data::Hash(hash),
                        ..
                    }) => Ok(Reply::Array(
                        fields
                            .iter()
                            .map(|field| {
                                hash.get(field.as_ref())
                                    .cloned()
                                    .map(Reply::Bulk)
                                    .unwrap_or(Reply::Nil)
                            })
                            .collect(),
                    )),
                    Some(_) => Err(TagKvError::WrongType),
                }
            }
            Command::HSet { key, field, value } => {
                let hash = self.shard(locked, key).hash_for_write(key, now)?;
                let previous = hash.insert(field.clone(), value.clone());
                Ok(Reply::Integer(if previous.is_none() { 1 } else { 0 }))
            }
            Command::HSetNx { key, field, value } => {
                let hash = self.shard(locked, key).hash_for_write(key, now)?;
                if hash.contains_key(field.as_ref()) {
                    return Ok(Reply::Integer(0));
                }
                hash.insert(field.clone(), value.clone());
                Ok(Reply::Integer(1))
            }
            Command::HDel { key, fields } => {
                require_some("HDEL", fields)?;
                let shard = self.shard(locked, key);
                let (removed, emptied) = match shard.live(key, now) {
                    None => (0i64, false),
                    Some(Entry {
                        data: Data::Hash(hash),
                        ..
                    }) => {
                        let mut removed = 0i64;
                        for field in fields {
                            if hash.remove(field.as_ref()).is_some() {
                                removed += 1;
                            }
                        }
                        (removed, hash.is_empty())
                    }
                    Some(_) => return Err(TagKvError::WrongType),
                };
                if emptied {
                    shard.map.remove(key.as_ref());
                }
                Ok(Reply::Integer(removed))
            }
            Command::HExists { key, field } => match self.shard(locked, key).live(key, now) {
                None => Ok(Reply::Integer(0)),
                Some(Entry {
                    data: Data::Hash(hash),
                    ..
                }) => Ok(Reply::Integer(hash.contains_key(field.as_ref()) as i64)),
                Some(_) => Err(TagKvError::WrongType),
            },
        }
    }
}

impl KVEngine for MemoryEngine {
    fn execute(&self, command: &Command) -> TagKvResult<Reply> {
        let keys = command.keys();
        let mut locked = self.lock(&keys);
        self.apply(&mut locked, command, Instant::now())
    }

    /// Runs a guarded transaction with every touched shard locked up front.
    ///
    /// Conditions are evaluated before any command, so a rejected guard leaves
    /// the keyspace untouched.
    fn transaction(&self, transaction: &Transaction) -> TagKvResult<Option<Vec<Reply>>> {
        let keys = transaction.keys();
        let mut locked = self.lock(&keys);
        let now = Instant::now();

        for condition in &transaction.conditions {
            if !self.holds(&mut locked, condition, now)? {
                trace!(?condition, "transaction guard rejected");
                return Ok(None);
            }
        }

        let mut replies = Vec::with_capacity(transaction.commands.len());
        for command in &transaction.commands {
            let reply = self
                .apply(&mut locked, command, now)
                .unwrap_or_else(|err| Reply::Error(err.to_string()));
            replies.push(reply);
        }
        Ok(Some(replies))
    }
}

fn require_some<T>(command: &str, items: &[T]) -> TagKvResult<()> {
    if items.is_empty() {
        return Err(TagKvError::InvalidArgument(format!(
            "wrong number of arguments for {command}"
        )));
    }
    Ok(())
}

/// Normalizes shard counts to a power of two for fast masking.
fn normalize_shard_count(count: usize) -> usize {
    let count = count.max(1);
    count.next_power_of_two()
}
