//! # Cache Database
//!
//! Purpose: Expose a typed, async cache API over a connection pool, bound to
//! one logical database and key prefix.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `CacheDatabase` hides slot selection, key naming,
//!    serialization, and reply decoding.
//! 2. **One Slot Per Call**: Every operation acquires a slot and issues its
//!    commands there; transport errors are returned unchanged.
//! 3. **Tags Only When Asked**: Writes with an empty tag list use the plain
//!    command path; any tag routes the write through `TagIndex`.
//! 4. **Fail Fast**: Empty keys, fields, and tags are rejected before any
//!    remote call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use tagkv_common::{Command, Condition, Reply, Transaction, When};

use crate::config::CacheConfig;
use crate::connection::tcp::{RespConnection, RespConnector};
use crate::connection::RawConnection;
use crate::error::{ClientError, ClientResult};
use crate::keyspace::KeySpace;
use crate::pool::{ConnectionPool, HealthReport};
use crate::reply::{ensure_no_errors, into_array, into_bulk, into_integer, into_ok};
use crate::serializer::{JsonSerializer, Serializer};
use crate::tags::{require_field, require_key, TagIndex};

/// TTL state returned by the store, mirroring Redis semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientTtl {
    /// Key is missing or already expired.
    Missing,
    /// Key exists without expiration.
    NoExpiry,
    /// Key expires after the provided duration.
    ExpiresIn(Duration),
}

/// Typed cache handle over a shared pool.
pub struct CacheDatabase<C: RawConnection, S = JsonSerializer> {
    pool: Arc<ConnectionPool<C>>,
    keyspace: KeySpace,
    serializer: S,
}

impl<C: RawConnection, S> std::fmt::Debug for CacheDatabase<C, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheDatabase")
            .field("db", &self.keyspace.db())
            .field("prefix", &self.keyspace.prefix())
            .field("pool", &self.pool)
            .finish()
    }
}

impl CacheDatabase<RespConnection> {
    /// Opens a RESP pool from `config` and binds a JSON handle to it.
    pub async fn connect(config: &CacheConfig) -> ClientResult<Self> {
        config.validate()?;
        let connector = RespConnector::new(config.pool.endpoint.clone());
        let pool = ConnectionPool::connect(&config.pool, &connector).await?;
        Ok(CacheDatabase::new(
            Arc::new(pool),
            config.database,
            config.key_prefix.clone(),
        ))
    }
}

impl<C: RawConnection> CacheDatabase<C> {
    pub fn new(pool: Arc<ConnectionPool<C>>, db: u32, prefix: impl Into<String>) -> Self {
        Self::with_serializer(pool, db, prefix, JsonSerializer)
    }
}

impl<C: RawConnection, S: Serializer> CacheDatabase<C, S> {
    pub fn with_serializer(
        pool: Arc<ConnectionPool<C>>,
        db: u32,
        prefix: impl Into<String>,
        serializer: S,
    ) -> Self {
        CacheDatabase {
            pool,
            keyspace: KeySpace::new(db, prefix),
            serializer,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<C>> {
        &self.pool
    }

    pub fn keyspace(&self) -> &KeySpace {
        &self.keyspace
    }

    pub fn health_report(&self) -> HealthReport {
        self.pool.health_report()
    }

    /// Round-trip time of a `PING`.
    pub async fn ping(&self) -> ClientResult<Duration> {
        let started = Instant::now();
        pong(self.run(Command::Ping).await?)?;
        Ok(started.elapsed())
    }

    /// Pings each pool slot in index order, bypassing the selection strategy.
    pub async fn ping_slots(&self) -> ClientResult<Vec<Duration>> {
        let mut samples = Vec::with_capacity(self.pool.size());
        for slot in self.pool.slots() {
            let started = Instant::now();
            pong(slot.connection().execute(self.keyspace.db(), Command::Ping).await?)?;
            samples.push(started.elapsed());
        }
        Ok(samples)
    }

    pub async fn exists(&self, key: &str) -> ClientResult<bool> {
        require_key(key)?;
        let reply = self
            .run(Command::Exists {
                keys: vec![self.keyspace.key(key)],
            })
            .await?;
        Ok(into_integer(reply)? > 0)
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> ClientResult<Option<T>> {
        require_key(key)?;
        let reply = self
            .run(Command::Get {
                key: self.keyspace.key(key),
            })
            .await?;
        self.decode(into_bulk(reply)?)
    }

    /// Values for `keys` in the same order; missing keys read as `None`.
    pub async fn get_all<T: DeserializeOwned>(&self, keys: &[&str]) -> ClientResult<Vec<Option<T>>> {
        let keys = self.prefixed_keys(keys)?;
        let reply = self.run(Command::MGet { keys }).await?;
        into_array(reply)?
            .into_iter()
            .map(|item| self.decode(into_bulk(item)?))
            .collect()
    }

    /// Writes unconditionally. With tags, the value and its tag memberships
    /// are written together.
    pub async fn add<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        tags: &[&str],
    ) -> ClientResult<bool> {
        self.write(key, value, When::Always, None, tags).await
    }

    /// Writes only if `key` does not exist; `false` if it already did.
    pub async fn add_if_absent<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        tags: &[&str],
    ) -> ClientResult<bool> {
        self.write(key, value, When::NotExists, None, tags).await
    }

    /// Writes only if `key` already exists; `false` if it did not.
    pub async fn replace<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        tags: &[&str],
    ) -> ClientResult<bool> {
        self.write(key, value, When::Exists, None, tags).await
    }

    /// Writes under `when` with an expiry.
    pub async fn add_with_ttl<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
        when: When,
        tags: &[&str],
    ) -> ClientResult<bool> {
        if ttl.is_zero() {
            return Err(ClientError::InvalidArgument("ttl must be positive".to_string()));
        }
        self.write(key, value, when, Some(ttl), tags).await
    }

    pub async fn remove(&self, key: &str) -> ClientResult<bool> {
        require_key(key)?;
        let reply = self
            .run(Command::Del {
                keys: vec![self.keyspace.key(key)],
            })
            .await?;
        Ok(into_integer(reply)? > 0)
    }

    /// Deletes `keys`; returns how many existed.
    pub async fn remove_all(&self, keys: &[&str]) -> ClientResult<u64> {
        let keys = self.prefixed_keys(keys)?;
        let reply = self.run(Command::Del { keys }).await?;
        Ok(into_integer(reply)?.max(0) as u64)
    }

    /// Sets a new expiry; `false` if the key does not exist.
    pub async fn expire(&self, key: &str, ttl: Duration) -> ClientResult<bool> {
        require_key(key)?;
        let reply = self
            .run(Command::Expire {
                key: self.keyspace.key(key),
                ttl,
            })
            .await?;
        Ok(into_integer(reply)? == 1)
    }

    pub async fn ttl(&self, key: &str) -> ClientResult<ClientTtl> {
        require_key(key)?;
        let reply = self
            .run(Command::Ttl {
                key: self.keyspace.key(key),
            })
            .await?;
        match into_integer(reply)? {
            -2 => Ok(ClientTtl::Missing),
            -1 => Ok(ClientTtl::NoExpiry),
            millis if millis >= 0 => Ok(ClientTtl::ExpiresIn(Duration::from_millis(millis as u64))),
            other => Err(ClientError::UnexpectedResponse(format!("ttl {other}"))),
        }
    }

    pub async fn hash_get<T: DeserializeOwned>(
        &self,
        hash_key: &str,
        field: &str,
    ) -> ClientResult<Option<T>> {
        require_key(hash_key)?;
        require_field(field)?;
        let reply = self
            .run(Command::HGet {
                key: self.keyspace.key(hash_key),
                field: Bytes::copy_from_slice(field.as_bytes()),
            })
            .await?;
        self.decode(into_bulk(reply)?)
    }

    /// Values of `fields` in the same order; missing fields read as `None`.
    pub async fn hash_get_all_fields<T: DeserializeOwned>(
        &self,
        hash_key: &str,
        fields: &[&str],
    ) -> ClientResult<Vec<Option<T>>> {
        require_key(hash_key)?;
        if fields.is_empty() {
            return Err(ClientError::InvalidArgument("fields must not be empty".to_string()));
        }
        let mut names = Vec::with_capacity(fields.len());
        for field in fields {
            require_field(field)?;
            names.push(Bytes::copy_from_slice(field.as_bytes()));
        }
        let reply = self
            .run(Command::HMGet {
                key: self.keyspace.key(hash_key),
                fields: names,
            })
            .await?;
        into_array(reply)?
            .into_iter()
            .map(|item| self.decode(into_bulk(item)?))
            .collect()
    }

    /// Sets one hash field under `when`; `false` if the guard rejected it.
    pub async fn hash_set<T: Serialize + ?Sized>(
        &self,
        hash_key: &str,
        field: &str,
        value: &T,
        when: When,
        tags: &[&str],
    ) -> ClientResult<bool> {
        require_key(hash_key)?;
        require_field(field)?;
        let slot = self.pool.acquire();
        if !tags.is_empty() {
            return TagIndex::new(slot.connection(), &self.keyspace, &self.serializer)
                .hash_set_with_tags(hash_key, field, value, tags, when)
                .await;
        }

        let key = self.keyspace.key(hash_key);
        let field = Bytes::copy_from_slice(field.as_bytes());
        let value = self.serializer.serialize(value)?;
        let db = self.keyspace.db();
        match when {
            When::Always => {
                let reply = slot
                    .connection()
                    .execute(db, Command::HSet { key, field, value })
                    .await?;
                into_integer(reply)?;
                Ok(true)
            }
            When::NotExists => {
                let reply = slot
                    .connection()
                    .execute(db, Command::HSetNx { key, field, value })
                    .await?;
                Ok(into_integer(reply)? == 1)
            }
            When::Exists => {
                let transaction = Transaction::new()
                    .guard(Condition::for_hash_field(key.clone(), field.clone(), when))
                    .then(Command::HSet { key, field, value });
                match slot.connection().transaction(db, transaction).await? {
                    Some(replies) => {
                        ensure_no_errors(&replies)?;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
        }
    }

    pub async fn hash_delete(&self, hash_key: &str, field: &str) -> ClientResult<bool> {
        require_key(hash_key)?;
        require_field(field)?;
        let reply = self
            .run(Command::HDel {
                key: self.keyspace.key(hash_key),
                fields: vec![Bytes::copy_from_slice(field.as_bytes())],
            })
            .await?;
        Ok(into_integer(reply)? > 0)
    }

    pub async fn hash_exists(&self, hash_key: &str, field: &str) -> ClientResult<bool> {
        require_key(hash_key)?;
        require_field(field)?;
        let reply = self
            .run(Command::HExists {
                key: self.keyspace.key(hash_key),
                field: Bytes::copy_from_slice(field.as_bytes()),
            })
            .await?;
        Ok(into_integer(reply)? == 1)
    }

    pub async fn get_by_tag<T: DeserializeOwned>(&self, tag: &str) -> ClientResult<Vec<T>> {
        self.tag_index(self.pool.acquire().connection())
            .get_by_tag(tag)
            .await
    }

    pub async fn remove_by_tag(&self, tag: &str) -> ClientResult<u64> {
        self.tag_index(self.pool.acquire().connection())
            .remove_by_tag(tag)
            .await
    }

    pub async fn get_hash_by_tag<T: DeserializeOwned>(
        &self,
        hash_key: &str,
        tag: &str,
    ) -> ClientResult<Vec<T>> {
        self.tag_index(self.pool.acquire().connection())
            .get_hash_by_tag(hash_key, tag)
            .await
    }

    pub async fn remove_hash_by_tag(&self, hash_key: &str, tag: &str) -> ClientResult<u64> {
        self.tag_index(self.pool.acquire().connection())
            .remove_hash_by_tag(hash_key, tag)
            .await
    }

    async fn write<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        when: When,
        ttl: Option<Duration>,
        tags: &[&str],
    ) -> ClientResult<bool> {
        require_key(key)?;
        let connection = self.pool.acquire().connection();
        if !tags.is_empty() {
            return self
                .tag_index(connection)
                .add_with_tags(key, value, tags, when, ttl)
                .await;
        }
        let command = Command::Set {
            key: self.keyspace.key(key),
            value: self.serializer.serialize(value)?,
            ttl,
            when,
        };
        into_ok(connection.execute(self.keyspace.db(), command).await?)
    }

    fn tag_index<'a>(&'a self, connection: &'a C) -> TagIndex<'a, C, S> {
        TagIndex::new(connection, &self.keyspace, &self.serializer)
    }

    async fn run(&self, command: Command) -> ClientResult<Reply> {
        self.pool
            .acquire()
            .connection()
            .execute(self.keyspace.db(), command)
            .await
    }

    fn prefixed_keys(&self, keys: &[&str]) -> ClientResult<Vec<Bytes>> {
        if keys.is_empty() {
            return Err(ClientError::InvalidArgument("keys must not be empty".to_string()));
        }
        keys.iter()
            .map(|key| {
                require_key(key)?;
                Ok(self.keyspace.key(key))
            })
            .collect()
    }

    fn decode<T: DeserializeOwned>(&self, bytes: Option<Bytes>) -> ClientResult<Option<T>> {
        bytes
            .map(|bytes| self.serializer.deserialize(&bytes))
            .transpose()
    }
}

fn pong(reply: Reply) -> ClientResult<()> {
    match reply {
        Reply::Status(_) | Reply::Bulk(_) => Ok(()),
        Reply::Error(message) => Err(ClientError::Server(message)),
        other => Err(ClientError::UnexpectedResponse(format!("{other:?}"))),
    }
}
