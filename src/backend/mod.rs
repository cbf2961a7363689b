//! Backing-store primitives.
//!
//! The store layer needs only a handful of operations from its backend:
//! hash records with atomic multi-field writes, key expiry, FIFO lists and
//! plain string keys. [`Backend`] captures exactly those. Backends carry no
//! task semantics; key layout and serialization belong to
//! [`Store`](crate::store::Store).

pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::InMemoryBackend;
pub use self::redis::RedisBackend;

/// Errors raised by a backend command.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend could not be reached.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The backend rejected or failed a command.
    #[error("command failed: {0}")]
    Command(String),

    /// A key holds a value of a different kind than the command expects.
    #[error("wrong value type for key {0}")]
    WrongType(String),

    /// The handle was disposed and can no longer issue commands.
    #[error("backend handle is disposed")]
    Disposed,
}

/// Raw storage operations used by the store layer.
///
/// Every method is a single round trip. Methods documented as atomic must be
/// observed all-or-nothing by concurrent readers.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Set several fields of a hash record in one atomic batch. When
    /// `expire` is given and the record has no TTL yet (it was just created,
    /// or had expired), the TTL is set in the same batch. A running TTL is
    /// never refreshed.
    async fn hset_all(
        &self,
        key: &str,
        fields: &[(&str, String)],
        expire: Option<Duration>,
    ) -> Result<(), BackendError>;

    /// Read one field of a hash record.
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, BackendError>;

    /// Read every field of a hash record. Empty when the record is absent.
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, BackendError>;

    /// Append a value to the tail of a list.
    async fn rpush(&self, key: &str, value: &str) -> Result<(), BackendError>;

    /// Atomically remove and return the head of a list.
    async fn lpop(&self, key: &str) -> Result<Option<String>, BackendError>;

    /// Length of a list. Zero when absent.
    async fn llen(&self, key: &str) -> Result<usize, BackendError>;

    /// Read a string key.
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    /// Set a string key and its TTL in one atomic batch.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BackendError>;

    /// Release the underlying connection. Later commands fail with
    /// [`BackendError::Disposed`].
    async fn dispose(&self) -> Result<(), BackendError>;
}
