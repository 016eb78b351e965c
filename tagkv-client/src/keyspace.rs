//! Key naming for one cache handle: logical database plus key prefix.

use bytes::{BufMut, Bytes, BytesMut};

use tagkv_common::TagScope;

/// Logical database and prefix applied to every primary key and tag set name.
///
/// Tag set members are stored unprefixed; the prefix is applied again when
/// members are read back as keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    db: u32,
    prefix: String,
}

impl KeySpace {
    pub fn new(db: u32, prefix: impl Into<String>) -> Self {
        KeySpace {
            db,
            prefix: prefix.into(),
        }
    }

    pub fn db(&self) -> u32 {
        self.db
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Prefixed primary key.
    pub fn key(&self, key: &str) -> Bytes {
        self.key_bytes(key.as_bytes())
    }

    /// Prefixed primary key from raw bytes, e.g. a tag set member.
    pub fn key_bytes(&self, key: &[u8]) -> Bytes {
        if self.prefix.is_empty() {
            return Bytes::copy_from_slice(key);
        }
        let mut buf = BytesMut::with_capacity(self.prefix.len() + key.len());
        buf.put_slice(self.prefix.as_bytes());
        buf.put_slice(key);
        buf.freeze()
    }

    /// Prefixed tag set name, e.g. `app:tag:users`.
    pub fn tag_key(&self, scope: TagScope, label: &str) -> Bytes {
        self.key(&scope.tag_key(label))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_keys_and_tag_sets() {
        let space = KeySpace::new(2, "app:");
        assert_eq!(space.key("k1"), Bytes::from_static(b"app:k1"));
        assert_eq!(space.tag_key(TagScope::Key, "A"), Bytes::from_static(b"app:tag:A"));
        assert_eq!(
            space.tag_key(TagScope::HashField, "A"),
            Bytes::from_static(b"app:taghash:A")
        );
        assert_eq!(space.db(), 2);
    }

    #[test]
    fn empty_prefix_is_identity() {
        let space = KeySpace::new(0, "");
        assert_eq!(space.key_bytes(b"raw"), Bytes::from_static(b"raw"));
    }
}
