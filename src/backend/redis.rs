//! Redis backend.
//!
//! Task records are Redis hashes, priority lanes are lists, cache pointers
//! are plain strings. Batched writes go through `MULTI`/`EXEC` pipelines so a
//! reader never observes a half-written record.

use std::collections::HashMap;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, RedisError};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use super::{Backend, BackendError};

impl From<RedisError> for BackendError {
    fn from(err: RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() {
            BackendError::Connection(err.to_string())
        } else {
            BackendError::Command(err.to_string())
        }
    }
}

/// Backend over one multiplexed Redis connection.
///
/// The connection is owned for the lifetime of the handle and released by
/// [`Backend::dispose`].
pub struct RedisBackend {
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisBackend {
    /// Connect to Redis at `url` (`redis://[:<password>@]<host>:<port>[/<db>]`).
    ///
    /// Fails fast if the server cannot be reached.
    pub async fn connect(url: &str) -> Result<Self, BackendError> {
        let client = ::redis::Client::open(url)
            .map_err(|e| BackendError::Connection(format!("invalid Redis URL: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BackendError::Connection(format!("failed to connect to Redis: {e}")))?;
        Ok(Self::with_connection(conn))
    }

    /// Wrap an already established connection.
    pub fn with_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn: Mutex::new(Some(conn)),
        }
    }

    /// A clone of the shared connection; clones multiplex onto one socket.
    fn conn(&self) -> Result<MultiplexedConnection, BackendError> {
        self.conn.lock().clone().ok_or(BackendError::Disposed)
    }
}

/// Longest TTL sent to Redis. EXPIRE rejects a TTL whose deadline overflows
/// its millisecond clock.
const MAX_TTL_SECS: i64 = i64::MAX / 2000;

fn ttl_secs(ttl: Duration) -> i64 {
    // EXPIRE rejects zero; round sub-second TTLs up.
    i64::try_from(ttl.as_secs())
        .unwrap_or(MAX_TTL_SECS)
        .clamp(1, MAX_TTL_SECS)
}

#[async_trait]
impl Backend for RedisBackend {
    async fn hset_all(
        &self,
        key: &str,
        fields: &[(&str, String)],
        expire: Option<Duration>,
    ) -> Result<(), BackendError> {
        let mut conn = self.conn()?;
        let mut pipe = ::redis::pipe();
        pipe.atomic().hset_multiple(key, fields).ignore();
        if let Some(ttl) = expire {
            // NX (Redis 7+) keeps a running TTL; only a fresh record gets one.
            pipe.cmd("EXPIRE")
                .arg(key)
                .arg(ttl_secs(ttl))
                .arg("NX")
                .ignore();
        }
        let () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, BackendError> {
        let mut conn = self.conn()?;
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, BackendError> {
        let mut conn = self.conn()?;
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(fields)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<(), BackendError> {
        let mut conn = self.conn()?;
        let _len: usize = conn.rpush(key, value).await?;
        Ok(())
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, BackendError> {
        let mut conn = self.conn()?;
        let value: Option<String> = conn.lpop(key, None).await?;
        Ok(value)
    }

    async fn llen(&self, key: &str) -> Result<usize, BackendError> {
        let mut conn = self.conn()?;
        let len: usize = conn.llen(key).await?;
        Ok(len)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let mut conn = self.conn()?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BackendError> {
        let mut conn = self.conn()?;
        let () = ::redis::pipe()
            .atomic()
            .set(key, value)
            .ignore()
            .expire(key, ttl_secs(ttl))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn dispose(&self) -> Result<(), BackendError> {
        // The socket closes once the last clone of the connection drops;
        // in-flight commands hold their own clones and finish first.
        let conn = self.conn.lock().take().ok_or(BackendError::Disposed)?;
        drop(conn);
        info!("redis connection released");
        Ok(())
    }
}
