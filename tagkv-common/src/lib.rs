// tagkv-common - Shared types for the TagKV store and client
//
// This crate defines the command model shared by the in-memory engine and the
// client, plus tag key naming and the common error type.

pub mod command;
pub mod error;
pub mod tags;

// Re-export for convenience
pub use command::*;
pub use error::*;
pub use tags::*;
