//! # Tag Index
//!
//! Purpose: Maintain tag sets alongside primary values so that everything
//! carrying a tag can be read or invalidated in one round of commands.
//!
//! ## Design Principles
//! 1. **One Atomic Unit**: Guard, tag-set adds, and the primary write travel
//!    in one transaction. A rejected guard writes nothing.
//! 2. **Unprefixed Members**: Tag sets store keys as the caller named them;
//!    the key prefix is applied when members are read back.
//! 3. **Lazy Pruning**: Members whose keys expired stay in the set; reads
//!    skip them and deletes count only keys that still existed.
//!
//! ## Key Layout
//!
//! ```text
//! {prefix}tag:{label}      set of primary keys        -> {prefix}{key}
//! {prefix}taghash:{label}  set of hash field names    -> HGET {prefix}{hash} {field}
//! ```

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use tagkv_common::{Command, Condition, Reply, TagScope, Transaction, When};

use crate::connection::RawConnection;
use crate::error::{ClientError, ClientResult};
use crate::keyspace::KeySpace;
use crate::reply::{ensure_no_errors, into_array, into_bulk, into_integer};
use crate::serializer::Serializer;

/// Tag operations over one connection, key space, and serializer.
pub struct TagIndex<'a, C, S> {
    connection: &'a C,
    keyspace: &'a KeySpace,
    serializer: &'a S,
}

impl<'a, C: RawConnection, S: Serializer> TagIndex<'a, C, S> {
    pub fn new(connection: &'a C, keyspace: &'a KeySpace, serializer: &'a S) -> Self {
        TagIndex {
            connection,
            keyspace,
            serializer,
        }
    }

    /// Writes `key` and adds it to every tag's set, atomically under `when`.
    ///
    /// Returns `false` when the guard rejected the write; nothing changed.
    pub async fn add_with_tags<T, L>(
        &self,
        key: &str,
        value: &T,
        tags: &[L],
        when: When,
        ttl: Option<Duration>,
    ) -> ClientResult<bool>
    where
        T: Serialize + ?Sized,
        L: AsRef<str>,
    {
        require_key(key)?;
        let labels = distinct_tags(tags)?;
        let payload = self.serializer.serialize(value)?;
        let primary = self.keyspace.key(key);
        let member = Bytes::copy_from_slice(key.as_bytes());

        let mut transaction =
            Transaction::new().guard(Condition::for_key(primary.clone(), when));
        for label in &labels {
            transaction = transaction.then(Command::SAdd {
                key: self.keyspace.tag_key(TagScope::Key, label),
                members: vec![member.clone()],
            });
        }
        transaction = transaction.then(Command::Set {
            key: primary,
            value: payload,
            ttl,
            when: When::Always,
        });

        self.commit(transaction, key, labels.len()).await
    }

    /// Values of every live key carrying `tag`. Missing keys are skipped.
    pub async fn get_by_tag<T: DeserializeOwned>(&self, tag: &str) -> ClientResult<Vec<T>> {
        let members = self.members(TagScope::Key, tag).await?;
        if members.is_empty() {
            return Ok(Vec::new());
        }
        let keys = members
            .iter()
            .map(|member| self.keyspace.key_bytes(member))
            .collect();
        let reply = self.run(Command::MGet { keys }).await?;
        self.decode_present(into_array(reply)?)
    }

    /// Deletes every key carrying `tag`; returns how many existed.
    ///
    /// The tag set itself is left in place.
    pub async fn remove_by_tag(&self, tag: &str) -> ClientResult<u64> {
        let members = self.members(TagScope::Key, tag).await?;
        if members.is_empty() {
            return Ok(0);
        }
        let keys = members
            .iter()
            .map(|member| self.keyspace.key_bytes(member))
            .collect();
        let removed = into_integer(self.run(Command::Del { keys }).await?)?;
        debug!(tag, removed, "removed keys by tag");
        Ok(removed.max(0) as u64)
    }

    /// Sets `field` of `hash_key` and tags the field, atomically under `when`.
    ///
    /// The guard is evaluated against the field, not the hash key.
    pub async fn hash_set_with_tags<T, L>(
        &self,
        hash_key: &str,
        field: &str,
        value: &T,
        tags: &[L],
        when: When,
    ) -> ClientResult<bool>
    where
        T: Serialize + ?Sized,
        L: AsRef<str>,
    {
        require_key(hash_key)?;
        require_field(field)?;
        let labels = distinct_tags(tags)?;
        let payload = self.serializer.serialize(value)?;
        let primary = self.keyspace.key(hash_key);
        let field = Bytes::copy_from_slice(field.as_bytes());

        let mut transaction = Transaction::new().guard(Condition::for_hash_field(
            primary.clone(),
            field.clone(),
            when,
        ));
        for label in &labels {
            transaction = transaction.then(Command::SAdd {
                key: self.keyspace.tag_key(TagScope::HashField, label),
                members: vec![field.clone()],
            });
        }
        transaction = transaction.then(Command::HSet {
            key: primary,
            field,
            value: payload,
        });

        self.commit(transaction, hash_key, labels.len()).await
    }

    /// Values of the fields of `hash_key` carrying `tag`.
    pub async fn get_hash_by_tag<T: DeserializeOwned>(
        &self,
        hash_key: &str,
        tag: &str,
    ) -> ClientResult<Vec<T>> {
        require_key(hash_key)?;
        let fields = self.members(TagScope::HashField, tag).await?;
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let reply = self
            .run(Command::HMGet {
                key: self.keyspace.key(hash_key),
                fields,
            })
            .await?;
        self.decode_present(into_array(reply)?)
    }

    /// Deletes the fields of `hash_key` carrying `tag`; returns how many existed.
    pub async fn remove_hash_by_tag(&self, hash_key: &str, tag: &str) -> ClientResult<u64> {
        require_key(hash_key)?;
        let fields = self.members(TagScope::HashField, tag).await?;
        if fields.is_empty() {
            return Ok(0);
        }
        let reply = self
            .run(Command::HDel {
                key: self.keyspace.key(hash_key),
                fields,
            })
            .await?;
        Ok(into_integer(reply)?.max(0) as u64)
    }

    async fn members(&self, scope: TagScope, tag: &str) -> ClientResult<Vec<Bytes>> {
        require_tag(tag)?;
        let reply = self
            .run(Command::SMembers {
                key: self.keyspace.tag_key(scope, tag),
            })
            .await?;
        into_array(reply)?
            .into_iter()
            .map(|member| match member {
                Reply::Bulk(bytes) => Ok(bytes),
                other => Err(ClientError::UnexpectedResponse(format!("{other:?}"))),
            })
            .collect()
    }

    async fn run(&self, command: Command) -> ClientResult<Reply> {
        self.connection.execute(self.keyspace.db(), command).await
    }

    async fn commit(&self, transaction: Transaction, key: &str, tags: usize) -> ClientResult<bool> {
        match self
            .connection
            .transaction(self.keyspace.db(), transaction)
            .await?
        {
            Some(replies) => {
                ensure_no_errors(&replies)?;
                debug!(key, tags, "tagged write applied");
                Ok(true)
            }
            None => {
                debug!(key, tags, "tagged write rejected by guard");
                Ok(false)
            }
        }
    }

    fn decode_present<T: DeserializeOwned>(&self, replies: Vec<Reply>) -> ClientResult<Vec<T>> {
        let mut values = Vec::with_capacity(replies.len());
        for reply in replies {
            if let Some(bytes) = into_bulk(reply)? {
                values.push(self.serializer.deserialize(&bytes)?);
            }
        }
        Ok(values)
    }
}

pub(crate) fn require_key(key: &str) -> ClientResult<()> {
    if key.is_empty() {
        return Err(ClientError::InvalidArgument("key must not be empty".to_string()));
    }
    Ok(())
}

pub(crate) fn require_field(field: &str) -> ClientResult<()> {
    if field.is_empty() {
        return Err(ClientError::InvalidArgument("hash field must not be empty".to_string()));
    }
    Ok(())
}

fn require_tag(tag: &str) -> ClientResult<()> {
    if tag.trim().is_empty() {
        return Err(ClientError::InvalidArgument("tag must not be blank".to_string()));
    }
    Ok(())
}

/// Validated tags in first-seen order, duplicates removed.
fn distinct_tags<L: AsRef<str>>(tags: &[L]) -> ClientResult<Vec<&str>> {
    if tags.is_empty() {
        return Err(ClientError::InvalidArgument("tags must not be empty".to_string()));
    }
    let mut labels: Vec<&str> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.as_ref();
        require_tag(tag)?;
        if !labels.contains(&tag) {
            labels.push(tag);
        }
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_tags_keeps_first_seen_order() {
        let labels = distinct_tags(&["B", "A", "B"]).unwrap();
        assert_eq!(labels, vec!["B", "A"]);
    }

    #[test]
    fn blank_tags_are_rejected() {
        assert!(matches!(
            distinct_tags::<&str>(&[]),
            Err(ClientError::InvalidArgument(_))
        ));
        assert!(matches!(
            distinct_tags(&["A", "  "]),
            Err(ClientError::InvalidArgument(_))
        ));
    }
}
