//! Processor: pulls tasks off the queue and runs the work function on them.
//!
//! The loop wakes once per polling interval. Each execution holds one slot of
//! a semaphore sized to the prefetch count, so at most `prefetch` tasks run at
//! once. Executions are tracked in a `JoinSet` and never awaited by the loop;
//! whatever happens inside one (validation failure, work error, panic, store
//! error) stays inside it and the loop keeps polling.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::backend::{Backend, RedisBackend};
use crate::config::{ProcessorCaching, ProcessorConfig};
use crate::error::{Error, Result};
use crate::model::{Priority, Status, Task, TaskError};
use crate::store::Store;
use crate::telemetry::metrics;
use crate::telemetry::task::{record_state_transition, start_task_span};
use crate::validate::{self, Validate};

/// The user work function.
///
/// Implemented for any `Fn(I) -> impl Future<Output = Result<O, TaskError>>`,
/// so a plain async closure can be passed to a processor.
#[async_trait]
pub trait Work<I, O>: Send + Sync + 'static {
    async fn process(&self, input: I) -> std::result::Result<O, TaskError>;
}

#[async_trait]
impl<I, O, F, Fut> Work<I, O> for F
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<O, TaskError>> + Send + 'static,
{
    async fn process(&self, input: I) -> std::result::Result<O, TaskError> {
        (self)(input).await
    }
}

/// A worker bound to one queue.
pub struct Processor<I, O, W, B = RedisBackend> {
    store: Arc<Store<B>>,
    worker: Arc<W>,
    config: ProcessorConfig,
    slots: Arc<Semaphore>,
    shutdown: Arc<Notify>,
    _payload: PhantomData<fn(I) -> O>,
}

impl<I, O, W> Processor<I, O, W, RedisBackend>
where
    I: DeserializeOwned + Validate + Send + 'static,
    O: Serialize + Send + 'static,
    W: Work<I, O>,
{
    /// Connect to the queue's Redis instance. Fails if it is unreachable.
    pub async fn connect(config: ProcessorConfig, worker: W) -> Result<Self> {
        let store = Store::connect(&config.queue).await?;
        Ok(Self::from_store(store, config, worker))
    }
}

impl<I, O, W, B> Processor<I, O, W, B>
where
    I: DeserializeOwned + Validate + Send + 'static,
    O: Serialize + Send + 'static,
    W: Work<I, O>,
    B: Backend,
{
    pub fn with_backend(backend: B, config: ProcessorConfig, worker: W) -> Self {
        let store = Store::new(backend, &config.queue);
        Self::from_store(store, config, worker)
    }

    fn from_store(store: Store<B>, mut config: ProcessorConfig, worker: W) -> Self {
        config.prefetch = config.prefetch.max(1);
        Self {
            store: Arc::new(store),
            worker: Arc::new(worker),
            slots: Arc::new(Semaphore::new(config.prefetch)),
            config,
            shutdown: Arc::new(Notify::new()),
            _payload: PhantomData,
        }
    }

    pub fn store(&self) -> &Store<B> {
        &self.store
    }

    /// Number of tasks taken and still executing. A poll that has not
    /// taken a task yet does not count.
    pub fn in_flight(&self) -> usize {
        self.config.prefetch - self.slots.available_permits()
    }

    /// Ask [`run`](Self::run) to stop. In-flight executions finish first.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run the polling loop until [`shutdown`](Self::shutdown) is called.
    ///
    /// # Errors
    ///
    /// Only if the queue cannot be read at startup. Failures after that are
    /// logged and the loop carries on.
    pub async fn run(&self) -> Result<()> {
        let mut pending = 0;
        for priority in Priority::ALL {
            pending += self.store.pending(priority).await?;
        }
        info!(
            queue = %self.store.name(),
            pid = std::process::id(),
            prefetch = self.config.prefetch,
            pending,
            "processor started"
        );

        let mut executions = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("processor shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.polling_interval) => {}
            }

            while let Some(joined) = executions.try_join_next() {
                log_join_error(joined);
            }

            if let Err(e) = self.poll_once(&mut executions).await {
                metrics::poll_errors().add(1, &[]);
                error!("poll iteration failed: {e}");
            }
        }

        debug!(in_flight = executions.len(), "waiting for in-flight executions");
        while let Some(joined) = executions.join_next().await {
            log_join_error(joined);
        }
        info!("processor stopped");
        Ok(())
    }

    /// Release the backend connection. Call after [`run`](Self::run) returned.
    pub async fn dispose(&self) -> Result<()> {
        self.store.dispose().await
    }

    /// One loop iteration: check for a free slot, pop, load, take, spawn.
    ///
    /// Only this loop acquires slots, so a slot free at the top is still free
    /// once the task is taken.
    async fn poll_once(&self, executions: &mut JoinSet<()>) -> Result<()> {
        if self.slots.available_permits() == 0 {
            debug!(prefetch = self.config.prefetch, "processor busy");
            return Ok(());
        }

        let Some(id) = self.store.pop().await? else {
            debug!("no task");
            return Ok(());
        };

        let mut task = match self.store.get::<Value, Value>(&id).await? {
            Some(task) if !task.is_finished() => task,
            Some(task) => {
                info!(%id, status = %task.status(), "task already finished, skipping");
                return Ok(());
            }
            None => {
                warn!(%id, "task not found in storage, probably expired; skipping");
                return Ok(());
            }
        };

        let span = start_task_span(self.store.name(), &id);
        let from = task.status();
        task.set_in_progress()?;
        self.store.save(&mut task).await?;
        record_state_transition(&span, from, Status::InProgress);

        let permit = Arc::clone(&self.slots)
            .try_acquire_owned()
            .map_err(|e| Error::Other(format!("no free slot for task {id}: {e}")))?;
        let slot = Slot::new(permit);
        let store = Arc::clone(&self.store);
        let worker = Arc::clone(&self.worker);
        let caching = self.config.caching;
        let exec_span = span.clone();
        executions.spawn(
            async move {
                let _slot = slot;
                if let Err(e) = execute::<I, O, W, B>(&store, worker, caching, &exec_span, task).await
                {
                    error!("task execution failed: {e}");
                }
            }
            .instrument(span),
        );
        Ok(())
    }
}

/// A processor slot held by one execution. Dropping it frees the slot, on
/// every way out of the execution including panics and aborts.
struct Slot {
    _permit: OwnedSemaphorePermit,
}

impl Slot {
    fn new(permit: OwnedSemaphorePermit) -> Self {
        metrics::executions_in_flight().add(1, &[]);
        Self { _permit: permit }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        metrics::executions_in_flight().add(-1, &[]);
    }
}

/// Validate, run the work function and persist the terminal state.
async fn execute<I, O, W, B>(
    store: &Store<B>,
    worker: Arc<W>,
    caching: ProcessorCaching,
    span: &Span,
    mut task: Task<Value, Value>,
) -> Result<()>
where
    I: DeserializeOwned + Validate + Send + 'static,
    O: Serialize + Send + 'static,
    W: Work<I, O>,
    B: Backend,
{
    let id = task.id().clone();

    let result = match validate::decode::<I>(task.input().clone()) {
        Ok(input) => {
            let started = Instant::now();
            let result = invoke(worker, input).await.and_then(|output| {
                serde_json::to_value(output)
                    .map_err(|e| TaskError::new(format!("cannot serialize output: {e}")))
            });
            let outcome = if result.is_ok() { "done" } else { "failed" };
            metrics::execution_duration_ms().record(
                started.elapsed().as_secs_f64() * 1000.0,
                &[KeyValue::new("outcome", outcome)],
            );
            result
        }
        Err(errors) => {
            warn!(%id, %errors, "input validation failed, work function not invoked");
            Err(TaskError::input_validation(&id, errors))
        }
    };

    match result {
        Ok(data) => {
            task.set_done(data)?;
            store.save(&mut task).await?;
            record_state_transition(span, Status::InProgress, Status::Done);
            if caching.enabled {
                store.create_cache_reference(&task, caching.ttl).await;
            }
        }
        Err(err) => {
            info!(%id, error = %err, "work failed");
            task.set_failed(err)?;
            store.save(&mut task).await?;
            record_state_transition(span, Status::InProgress, Status::Failed);
        }
    }
    Ok(())
}

/// Call the work function on its own tokio task so a panic comes back as a
/// `TaskError` instead of unwinding through the execution.
async fn invoke<I, O, W>(worker: Arc<W>, input: I) -> std::result::Result<O, TaskError>
where
    I: Send + 'static,
    O: Send + 'static,
    W: Work<I, O>,
{
    match tokio::spawn(async move { worker.process(input).await }).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(TaskError::new(format!(
            "work function panicked: {}",
            panic_message(e.into_panic().as_ref())
        ))),
        Err(e) => Err(TaskError::new(format!("work function did not complete: {e}"))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn log_join_error(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        error!("execution terminated abnormally: {e}");
    }
}
