//! # TagKV Engine
//!
//! In-process keyspace used as an embedded store and as the backend of the
//! client's memory connection.

mod engine;
mod memory;
mod store;

pub use engine::KVEngine;
pub use memory::{ExpirationHandle, MemoryEngine};
pub use store::MemoryStore;
