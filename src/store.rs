//! Task store: per-task records, priority lanes and the result cache.
//!
//! Key layout for a queue named `q`:
//!
//! | Key | Kind | Content |
//! |-----|------|---------|
//! | `q:data:{id}` | hash | `input`, `output`, `metadata` (JSON) |
//! | `q:queue:{priority}` | list | task ids, FIFO |
//! | `q:cache:{sha256}` | string | id of a task that finished with that input |
//!
//! Inputs are canonicalized through `serde_json::Value` (object keys sorted)
//! before they are hashed, stored or compared. A struct input and the same
//! payload held as a JSON value therefore hash and compare identically.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info};

use crate::backend::{Backend, RedisBackend};
use crate::config::{ExposeSecret, QueueConfig};
use crate::error::{Error, Result};
use crate::model::{Priority, Task, TaskId, TaskMetadata, TaskOutput};
use crate::telemetry::metrics;
use crate::validate::ValidationErrors;
use opentelemetry::KeyValue;

const FIELD_INPUT: &str = "input";
const FIELD_OUTPUT: &str = "output";
const FIELD_METADATA: &str = "metadata";

/// Access layer over one logical queue. Owns its backend connection.
pub struct Store<B> {
    backend: B,
    name: String,
    ttl: Duration,
}

impl Store<RedisBackend> {
    /// Connect to the Redis instance named in `config`.
    pub async fn connect(config: &QueueConfig) -> Result<Self> {
        let backend = RedisBackend::connect(config.url.expose_secret()).await?;
        Ok(Self::new(backend, config))
    }
}

impl<B: Backend> Store<B> {
    pub fn new(backend: B, config: &QueueConfig) -> Self {
        Self {
            backend,
            name: config.name.clone(),
            ttl: config.ttl,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn data_key(&self, id: &TaskId) -> String {
        format!("{}:data:{}", self.name, id)
    }

    pub fn queue_key(&self, priority: Priority) -> String {
        format!("{}:queue:{}", self.name, priority)
    }

    pub fn cache_key(&self, input_hash: &str) -> String {
        format!("{}:cache:{}", self.name, input_hash)
    }

    // -----------------------------------------------------------------------
    // Records
    // -----------------------------------------------------------------------

    /// Upsert the full record of `task` in one atomic write.
    ///
    /// Bumps the task's timestamps first. The record TTL starts when the
    /// record is created and is never refreshed, so a task that runs longer
    /// than the TTL loses its record. A save after that recreates the record
    /// with a fresh TTL.
    pub async fn save<I, O>(&self, task: &mut Task<I, O>) -> Result<()>
    where
        I: Serialize,
        O: Serialize,
    {
        let is_new = task.is_new();
        task.update_timestamps();

        let fields = [
            (FIELD_INPUT, canonical_json(task.input())?),
            (FIELD_OUTPUT, serde_json::to_string(&task.output())?),
            (FIELD_METADATA, serde_json::to_string(&task.metadata())?),
        ];
        self.backend
            .hset_all(&self.data_key(task.id()), &fields, Some(self.ttl))
            .await?;

        debug!(id = %task.id(), status = %task.status(), is_new, "task saved");
        Ok(())
    }

    /// Load a task. `Ok(None)` when the record does not exist (never saved
    /// or expired).
    ///
    /// # Errors
    ///
    /// [`Error::InvalidMetadata`] when the stored metadata does not parse or
    /// fails its schema checks.
    pub async fn get<I, O>(&self, id: &TaskId) -> Result<Option<Task<I, O>>>
    where
        I: DeserializeOwned,
        O: DeserializeOwned,
    {
        let mut fields = self.backend.hget_all(&self.data_key(id)).await?;
        let Some(raw_metadata) = fields.remove(FIELD_METADATA) else {
            return Ok(None);
        };

        let metadata: TaskMetadata =
            serde_json::from_str(&raw_metadata).map_err(|e| Error::InvalidMetadata {
                id: id.clone(),
                errors: ValidationErrors::from(e),
            })?;
        metadata.check(id).map_err(|errors| Error::InvalidMetadata {
            id: id.clone(),
            errors,
        })?;

        let Some(raw_input) = fields.remove(FIELD_INPUT) else {
            return Ok(None);
        };
        let input: I = serde_json::from_str(&raw_input)?;
        let output: Option<TaskOutput<O>> = match fields.remove(FIELD_OUTPUT) {
            Some(raw) => serde_json::from_str(&raw)?,
            None => None,
        };

        Ok(Some(Task::from_parts(metadata, input, output)))
    }

    // -----------------------------------------------------------------------
    // Queues
    // -----------------------------------------------------------------------

    /// Append the task's id to the tail of its priority lane.
    pub async fn push<I, O>(&self, task: &Task<I, O>, priority: Priority) -> Result<()> {
        let queue = self.queue_key(priority);
        self.backend.rpush(&queue, task.id().as_str()).await?;
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", self.name.clone()),
                KeyValue::new("priority", priority.as_str()),
                KeyValue::new("operation", "push"),
            ],
        );
        debug!(id = %task.id(), %priority, "task pushed to queue");
        Ok(())
    }

    /// Pop the oldest id of the highest non-empty lane.
    pub async fn pop(&self) -> Result<Option<TaskId>> {
        for priority in Priority::ALL {
            let queue = self.queue_key(priority);
            debug!(%queue, "checking queue");
            if let Some(id) = self.backend.lpop(&queue).await? {
                metrics::queue_operations().add(
                    1,
                    &[
                        KeyValue::new("queue", self.name.clone()),
                        KeyValue::new("priority", priority.as_str()),
                        KeyValue::new("operation", "pop"),
                    ],
                );
                debug!(%id, %priority, "popped task");
                return Ok(Some(TaskId::from(id)));
            }
        }
        Ok(None)
    }

    /// Number of ids waiting in one lane.
    pub async fn pending(&self, priority: Priority) -> Result<usize> {
        Ok(self.backend.llen(&self.queue_key(priority)).await?)
    }

    // -----------------------------------------------------------------------
    // Cache
    // -----------------------------------------------------------------------

    /// Find a finished task whose result can stand in for new work on `input`.
    ///
    /// A pointer is only a hint: the target must still exist, must have been
    /// updated within `max_age`, and its stored input must equal `input`
    /// exactly. Any failed check is a miss, not an error.
    pub async fn check_cache<I: Serialize>(
        &self,
        input: &I,
        max_age: Duration,
    ) -> Result<Option<TaskId>> {
        let canonical = canonical_json(input)?;
        let input_hash = hash_input(&canonical);
        let Some(id) = self.backend.get(&self.cache_key(&input_hash)).await? else {
            debug!(%input_hash, "no cache reference");
            return Ok(cache_outcome(None, "miss"));
        };
        let id = TaskId::from(id);
        debug!(%input_hash, %id, "cache reference found");

        let data_key = self.data_key(&id);
        let Some(raw_metadata) = self.backend.hget(&data_key, FIELD_METADATA).await? else {
            debug!(%id, "cached task not found in storage, probably expired");
            return Ok(cache_outcome(None, "expired"));
        };
        let metadata: TaskMetadata = match serde_json::from_str(&raw_metadata) {
            Ok(metadata) => metadata,
            Err(e) => {
                error!(%id, "cannot parse cached task metadata: {e}");
                return Ok(cache_outcome(None, "corrupted"));
            }
        };
        let Some(updated_at) = metadata.updated_at.or(metadata.created_at) else {
            return Ok(cache_outcome(None, "stale"));
        };
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let oldest_accepted = Utc::now()
            .checked_sub_signed(max_age)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        if updated_at < oldest_accepted {
            debug!(%input_hash, %id, "cached result older than accepted max age");
            return Ok(cache_outcome(None, "stale"));
        }

        // Hash equality is not input equality; compare the stored input.
        let Some(cached_input) = self.backend.hget(&data_key, FIELD_INPUT).await? else {
            debug!(%id, "cached task not found in storage, probably expired");
            return Ok(cache_outcome(None, "expired"));
        };
        if cached_input != canonical {
            debug!(%input_hash, %id, "cached input differs, hash collision");
            return Ok(cache_outcome(None, "collision"));
        }

        info!(%input_hash, %id, "cache hit");
        Ok(cache_outcome(Some(id), "hit"))
    }

    /// Point `hash(task.input)` at `task` for `ttl`.
    ///
    /// Best effort: failures are logged and swallowed so they never fail the
    /// task whose result is being cached.
    pub async fn create_cache_reference<I, O>(&self, task: &Task<I, O>, ttl: Duration)
    where
        I: Serialize,
    {
        let canonical = match canonical_json(task.input()) {
            Ok(canonical) => canonical,
            Err(e) => {
                error!(id = %task.id(), "unable to serialize input for cache reference: {e}");
                return;
            }
        };
        let input_hash = hash_input(&canonical);
        let cache_key = self.cache_key(&input_hash);
        match self
            .backend
            .set_ex(&cache_key, task.id().as_str(), ttl)
            .await
        {
            Ok(()) => {
                debug!(%input_hash, id = %task.id(), ttl_secs = ttl.as_secs(), "cache reference created")
            }
            Err(e) => error!(%input_hash, id = %task.id(), "unable to create cache reference: {e}"),
        }
    }

    /// Release the backend connection.
    pub async fn dispose(&self) -> Result<()> {
        self.backend.dispose().await?;
        info!(queue = %self.name, "store disposed");
        Ok(())
    }
}

fn cache_outcome(id: Option<TaskId>, result: &'static str) -> Option<TaskId> {
    metrics::cache_lookups().add(1, &[KeyValue::new("result", result)]);
    id
}

/// Serialize through `serde_json::Value` so object keys come out sorted.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&value)?)
}

/// Hex SHA-256 of a canonical input.
pub fn hash_input(canonical: &str) -> String {
    hex::encode(Sha256::digest(canonical.as_bytes()))
}
