//! # TagKV Client
//!
//! Purpose: Provide an async, Redis-compatible cache client built on a fixed
//! pool of multiplexed connections, with tag-based secondary indexing for
//! bulk lookup and bulk invalidation.
//!
//! ## Design Principles
//! 1. **Fixed Slots**: The pool opens every connection up front and never
//!    grows, shrinks, or replaces a slot; connections heal themselves.
//! 2. **Routing, Not Masking**: `acquire` only picks a slot. Transport
//!    failures surface to the caller unchanged.
//! 3. **Atomic Tagging**: A value and its tag memberships are written in one
//!    guarded transaction, or not at all.
//! 4. **Static Dispatch**: Connections, connectors, and serializers are
//!    generic parameters, so the hot path stays monomorphic.
//!
//! ## Layout
//!
//! ```text
//! CacheDatabase ──acquire──> ConnectionPool ──strategy──> HealthTrackedConnection
//!      │                                                        │
//!      └── TagIndex (guard + SADD tag:* + SET) ──transaction──> RawConnection
//!                                                   (RespConnection | MemoryConnection)
//! ```

mod config;
mod connection;
mod database;
mod error;
mod health;
mod keyspace;
mod pool;
mod reply;
mod resp;
mod serializer;
mod strategy;
mod tags;

pub use config::{CacheConfig, ConfigError, EndpointConfig, PoolConfig};
pub use connection::memory::{MemoryConnection, MemoryConnector};
pub use connection::signals::{
    ConnectionEvent, ConnectionSignals, FailureKind, SignalKind, Subscription,
};
pub use connection::tcp::{RespConnection, RespConnector};
pub use connection::{Connector, RawConnection};
pub use database::{CacheDatabase, ClientTtl};
pub use error::{ClientError, ClientResult};
pub use health::HealthTrackedConnection;
pub use keyspace::KeySpace;
pub use pool::{ConnectionPool, HealthReport, SharedPool};
pub use serializer::{JsonSerializer, Serializer};
pub use strategy::SelectionStrategy;
pub use tags::TagIndex;

pub use tagkv_common::{Command, Condition, Reply, TagScope, Transaction, When};
