//! Client: the producer side of a queue.
//!
//! Submits tasks (reusing a cached result when allowed), reads task state and
//! polls until a task settles.

use std::marker::PhantomData;

use opentelemetry::KeyValue;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{Backend, RedisBackend};
use crate::config::{ClientConfig, Timeout};
use crate::error::{Error, Result};
use crate::model::{Priority, Status, Task, TaskId, TaskOutput};
use crate::store::Store;
use crate::telemetry::metrics;
use crate::validate::{self, Validate, ValidationErrors};

/// Snapshot of a task as seen by a client.
///
/// [`Client::get_task`] returns the output as stored; [`TaskResult::decode`]
/// types and validates it.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult<O = Value> {
    pub status: Status,
    /// Present once the task is `done` or `failed`.
    pub output: Option<TaskOutput<O>>,
}

impl TaskResult<Value> {
    /// Decode and validate the output data. Error outputs pass through.
    pub fn decode<O>(self) -> std::result::Result<TaskResult<O>, ValidationErrors>
    where
        O: DeserializeOwned + Validate,
    {
        let output = match self.output {
            Some(TaskOutput::Data(raw)) => Some(TaskOutput::Data(validate::decode(raw)?)),
            Some(TaskOutput::Error(error)) => Some(TaskOutput::Error(error)),
            None => None,
        };
        Ok(TaskResult {
            status: self.status,
            output,
        })
    }
}

pub struct Client<I, O, B = RedisBackend> {
    store: Store<B>,
    config: ClientConfig,
    _payload: PhantomData<fn(I) -> O>,
}

impl<I, O> Client<I, O, RedisBackend>
where
    I: Serialize + Send + Sync,
    O: DeserializeOwned + Validate,
{
    /// Connect to the queue's Redis instance.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let store = Store::connect(&config.queue).await?;
        Ok(Self::from_store(store, config))
    }
}

impl<I, O, B> Client<I, O, B>
where
    I: Serialize + Send + Sync,
    O: DeserializeOwned + Validate,
    B: Backend,
{
    pub fn with_backend(backend: B, config: ClientConfig) -> Self {
        let store = Store::new(backend, &config.queue);
        Self::from_store(store, config)
    }

    fn from_store(store: Store<B>, config: ClientConfig) -> Self {
        Self {
            store,
            config,
            _payload: PhantomData,
        }
    }

    pub fn store(&self) -> &Store<B> {
        &self.store
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Submit `input` and return the id to poll.
    ///
    /// With caching enabled, a recent finished task with the same input is
    /// returned instead and nothing is enqueued.
    pub async fn create_task(&self, input: I, priority: Option<Priority>) -> Result<TaskId> {
        let queue = KeyValue::new("queue", self.store.name().to_string());

        if self.config.caching.enabled
            && let Some(id) = self
                .store
                .check_cache(&input, self.config.caching.max_age)
                .await?
        {
            info!(%id, "reusing cached task");
            metrics::tasks_submitted().add(1, &[queue, KeyValue::new("result", "cached")]);
            return Ok(id);
        }

        let priority = priority.unwrap_or_default();
        let mut task: Task<I, Value> = Task::create(input);
        self.store.save(&mut task).await?;
        self.store.push(&task, priority).await?;

        info!(id = %task.id(), %priority, "task created");
        metrics::tasks_submitted().add(1, &[queue, KeyValue::new("result", "created")]);
        Ok(task.id().clone())
    }

    /// Read the current status and output of a task.
    ///
    /// A snapshot never fails on the output's shape: the output comes back
    /// undecoded, and only [`Client::wait`] validates it.
    pub async fn get_task(&self, id: &TaskId) -> Result<TaskResult> {
        let task = self.load(id).await?;
        Ok(TaskResult {
            status: task.status(),
            output: task.into_output(),
        })
    }

    /// Submit `input` and wait for its output.
    pub async fn await_task(&self, input: I, priority: Option<Priority>) -> Result<O> {
        let id = self.create_task(input, priority).await?;
        self.wait(&id).await
    }

    /// Poll `id` until it settles or the configured timeout passes.
    ///
    /// A timeout leaves the task as it is; a processor may still pick it up.
    pub async fn wait(&self, id: &TaskId) -> Result<O> {
        let deadline = match self.config.timeout {
            // A deadline past the end of the clock never passes.
            Timeout::Limited(timeout) => Instant::now()
                .checked_add(timeout)
                .map(|at| (at, timeout)),
            Timeout::Unlimited => None,
        };

        loop {
            tokio::time::sleep(self.config.polling_interval).await;

            if let Some((at, timeout)) = deadline
                && Instant::now() >= at
            {
                warn!(%id, timeout_ms = timeout.as_millis() as u64, "polling timed out");
                return Err(Error::PollingTimeout {
                    id: id.clone(),
                    timeout,
                });
            }

            let task = self.load(id).await?;
            let status = task.status();
            debug!(%id, %status, "polled task");

            match status {
                Status::Waiting | Status::InProgress => continue,
                Status::Canceled => return Err(Error::Cancelled(id.clone())),
                Status::Done | Status::Failed => {}
            }

            return match task.into_output() {
                Some(TaskOutput::Data(raw)) => self.decode_output(id, raw),
                Some(TaskOutput::Error(error)) => Err(Error::TaskFailed {
                    id: id.clone(),
                    error,
                }),
                // A finished record without output; treat like corruption.
                None => Err(Error::TaskFailed {
                    id: id.clone(),
                    error: format!("task finished as {status} without output").into(),
                }),
            };
        }
    }

    /// Cancel a task that no processor has taken yet.
    ///
    /// The id stays in its lane; processors drop it when they see the
    /// terminal status.
    pub async fn cancel_task(&self, id: &TaskId) -> Result<()> {
        let mut task = self.load(id).await?;
        let from = task.status();
        if from != Status::Waiting {
            return Err(Error::InvalidTransition {
                from,
                to: Status::Canceled,
            });
        }
        task.set_canceled()?;
        self.store.save(&mut task).await?;
        metrics::task_transitions().add(
            1,
            &[
                KeyValue::new("from", from.as_str()),
                KeyValue::new("to", Status::Canceled.as_str()),
            ],
        );
        info!(%id, "task canceled");
        Ok(())
    }

    /// Release the backend connection.
    pub async fn dispose(&self) -> Result<()> {
        self.store.dispose().await
    }

    async fn load(&self, id: &TaskId) -> Result<Task<Value, Value>> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.clone()))
    }

    fn decode_output(&self, id: &TaskId, raw: Value) -> Result<O> {
        validate::decode(raw).map_err(|errors| Error::OutputValidation {
            id: id.clone(),
            errors,
        })
    }
}
