//! Value encoding for cached objects.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ClientResult;

/// Turns values into stored bytes and back.
pub trait Serializer: Send + Sync {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> ClientResult<Bytes>;

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> ClientResult<T>;
}

/// JSON via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> ClientResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> ClientResult<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
