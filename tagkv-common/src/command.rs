//! # Command Model
//!
//! Purpose: Describe store commands, replies, and conditional transactions
//! once, so the in-memory engine and the network client speak the same types.
//!
//! ## Design Principles
//! 1. **Closed Set**: Commands are an enum; adding one forces every executor
//!    to handle it.
//! 2. **Binary-Safe**: Keys, fields, and values are `Bytes`, cheap to clone
//!    into multi-step transactions.
//! 3. **Redis Semantics**: Reply shapes mirror what a Redis server returns
//!    (`Nil` for a rejected `SET NX`, integers for counts, arrays for bulk reads).
//!
//! ## Transaction Shape
//!
//! ```text
//! Transaction
//!   ├── conditions: [KeyNotExists("k1")]        checked first, atomically
//!   └── commands:   [SADD tag:a k1, SADD tag:b k1, SET k1 v1]
//!
//! all conditions hold  -> every command runs, Some(replies)
//! any condition fails  -> nothing runs, None
//! ```

use std::time::Duration;

use bytes::Bytes;

/// Guard attached to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum When {
    /// Write unconditionally.
    #[default]
    Always,
    /// Write only if the target already exists.
    Exists,
    /// Write only if the target does not exist yet.
    NotExists,
}

/// A single store command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    Get {
        key: Bytes,
    },
    MGet {
        keys: Vec<Bytes>,
    },
    /// `SET key value [PX ms] [NX|XX]`. Replies `Nil` when the guard rejects.
    Set {
        key: Bytes,
        value: Bytes,
        ttl: Option<Duration>,
        when: When,
    },
    Del {
        keys: Vec<Bytes>,
    },
    Exists {
        keys: Vec<Bytes>,
    },
    /// Replies `1` when the TTL was applied, `0` when the key is missing.
    Expire {
        key: Bytes,
        ttl: Duration,
    },
    /// Millisecond TTL: `-2` missing, `-1` no expiry.
    Ttl {
        key: Bytes,
    },
    SAdd {
        key: Bytes,
        members: Vec<Bytes>,
    },
    SMembers {
        key: Bytes,
    },
    HGet {
        key: Bytes,
        field: Bytes,
    },
    HMGet {
        key: Bytes,
        fields: Vec<Bytes>,
    },
    /// Replies `1` when the field is new, `0` when it was overwritten.
    HSet {
        key: Bytes,
        field: Bytes,
        value: Bytes,
    },
    /// Replies `1` when the field was written, `0` when it already existed.
    HSetNx {
        key: Bytes,
        field: Bytes,
        value: Bytes,
    },
    HDel {
        key: Bytes,
        fields: Vec<Bytes>,
    },
    HExists {
        key: Bytes,
        field: Bytes,
    },
}

impl Command {
    /// Returns the command verb as sent on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Ping => "PING",
            Command::Get { .. } => "GET",
            Command::MGet { .. } => "MGET",
            Command::Set { .. } => "SET",
            Command::Del { .. } => "DEL",
            Command::Exists { .. } => "EXISTS",
            Command::Expire { .. } => "PEXPIRE",
            Command::Ttl { .. } => "PTTL",
            Command::SAdd { .. } => "SADD",
            Command::SMembers { .. } => "SMEMBERS",
            Command::HGet { .. } => "HGET",
            Command::HMGet { .. } => "HMGET",
            Command::HSet { .. } => "HSET",
            Command::HSetNx { .. } => "HSETNX",
            Command::HDel { .. } => "HDEL",
            Command::HExists { .. } => "HEXISTS",
        }
    }

    /// Returns every key the command touches.
    pub fn keys(&self) -> Vec<&Bytes> {
        match self {
            Command::Ping => Vec::new(),
            Command::MGet { keys } | Command::Del { keys } | Command::Exists { keys } => {
                keys.iter().collect()
            }
            Command::Get { key }
            | Command::Set { key, .. }
            | Command::Expire { key, .. }
            | Command::Ttl { key }
            | Command::SAdd { key, .. }
            | Command::SMembers { key }
            | Command::HGet { key, .. }
            | Command::HMGet { key, .. }
            | Command::HSet { key, .. }
            | Command::HSetNx { key, .. }
            | Command::HDel { key, .. }
            | Command::HExists { key, .. } => vec![key],
        }
    }
}

/// Reply to a single command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Null bulk: missing key or rejected conditional write.
    Nil,
    /// Status line such as `OK` or `PONG`.
    Status(String),
    Integer(i64),
    Bulk(Bytes),
    Array(Vec<Reply>),
    /// Per-command error, e.g. inside an executed transaction.
    Error(String),
}

/// Precondition checked atomically before a transaction runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    KeyExists(Bytes),
    KeyNotExists(Bytes),
    HashFieldExists { key: Bytes, field: Bytes },
    HashFieldNotExists { key: Bytes, field: Bytes },
}

impl Condition {
    /// Maps a key-level guard to a condition. `Always` has none.
    pub fn for_key(key: Bytes, when: When) -> Option<Condition> {
        match when {
            When::Always => None,
            When::Exists => Some(Condition::KeyExists(key)),
            When::NotExists => Some(Condition::KeyNotExists(key)),
        }
    }

    /// Maps a hash-field guard to a condition. `Always` has none.
    pub fn for_hash_field(key: Bytes, field: Bytes, when: When) -> Option<Condition> {
        match when {
            When::Always => None,
            When::Exists => Some(Condition::HashFieldExists { key, field }),
            When::NotExists => Some(Condition::HashFieldNotExists { key, field }),
        }
    }

    /// Returns the key the condition observes.
    pub fn key(&self) -> &Bytes {
        match self {
            Condition::KeyExists(key) | Condition::KeyNotExists(key) => key,
            Condition::HashFieldExists { key, .. } | Condition::HashFieldNotExists { key, .. } => {
                key
            }
        }
    }

    /// Returns the existence check that satisfies the condition.
    pub fn expects_present(&self) -> bool {
        matches!(
            self,
            Condition::KeyExists(_) | Condition::HashFieldExists { .. }
        )
    }

    /// Returns the read that evaluates the condition on a remote server.
    pub fn probe(&self) -> Command {
        match self {
            Condition::KeyExists(key) | Condition::KeyNotExists(key) => Command::Exists {
                keys: vec![key.clone()],
            },
            Condition::HashFieldExists { key, field }
            | Condition::HashFieldNotExists { key, field } => Command::HExists {
                key: key.clone(),
                field: field.clone(),
            },
        }
    }
}

/// Conditions plus commands executed as one atomic unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    pub conditions: Vec<Condition>,
    pub commands: Vec<Command>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a precondition; `None` is ignored so guards map directly.
    pub fn guard(mut self, condition: Option<Condition>) -> Self {
        if let Some(condition) = condition {
            self.conditions.push(condition);
        }
        self
    }

    /// Appends a command to the body.
    pub fn then(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    /// Returns every key read or written, conditions first.
    pub fn keys(&self) -> Vec<&Bytes> {
        let mut keys: Vec<&Bytes> = self.conditions.iter().map(Condition::key).collect();
        for command in &self.commands {
            keys.extend(command.keys());
        }
        keys
    }
}
