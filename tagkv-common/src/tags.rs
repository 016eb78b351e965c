//! # Tag Key Naming
//!
//! Tags are free-form labels. Each label owns a remote set whose name is
//! derived deterministically from the label:
//!
//! ```text
//! key-level tag   "users"  ->  "tag:users"      members: primary keys
//! hash-level tag  "users"  ->  "taghash:users"  members: hash field names
//! ```

/// Prefix of sets indexing whole primary keys.
pub const TAG_PREFIX: &str = "tag:";

/// Prefix of sets indexing fields inside a hash.
pub const TAG_HASH_PREFIX: &str = "taghash:";

/// Granularity a tag set indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagScope {
    /// Members are primary keys.
    Key,
    /// Members are fields of a hash.
    HashField,
}

impl TagScope {
    /// Returns the set name prefix for this scope.
    #[inline]
    pub const fn prefix(self) -> &'static str {
        match self {
            TagScope::Key => TAG_PREFIX,
            TagScope::HashField => TAG_HASH_PREFIX,
        }
    }

    /// Builds the name of the set backing `label` in this scope.
    pub fn tag_key(self, label: &str) -> String {
        let prefix = self.prefix();
        let mut key = String::with_capacity(prefix.len() + label.len());
        key.push_str(prefix);
        key.push_str(label);
        key
    }
}
