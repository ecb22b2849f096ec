//! Read-cache and stream access for the projection engine.
//!
//! Two backends implement the same traits: Redis for deployments and an
//! in-process store for tests and single-node development.

pub mod cache;
pub mod keys;
pub mod memory;
mod redis_backend;
pub mod stream;

use std::error::Error;
use std::fmt::{Display, Formatter};

pub use cache::{CacheStore, RangeOrder, RangeQuery, ScoreBound};
pub use memory::{CacheSnapshot, MemoryStore};
pub use redis_backend::{RedisBackend, RedisStreams, connect};
pub use stream::{
    PresenceBus, PresenceSubscription, ReadCursor, ReadRequest, StreamEntry, StreamTransport,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    Redis(String),
    Serialization,
    MissingGroup(String),
    Invalid(String),
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Redis(reason) => write!(f, "redis failure: {}", reason),
            Self::Serialization => write!(f, "serialization failure"),
            Self::MissingGroup(group) => write!(f, "consumer group {} does not exist", group),
            Self::Invalid(reason) => write!(f, "invalid request: {}", reason),
        }
    }
}

impl Error for StorageError {}

impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        if err.code() == Some("NOGROUP") {
            return StorageError::MissingGroup(err.to_string());
        }
        StorageError::Redis(err.to_string())
    }
}
