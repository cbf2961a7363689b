//! Error types for taskq.

use std::time::Duration;

use thiserror::Error;

use crate::backend::BackendError;
use crate::model::{Status, TaskError, TaskId};
use crate::validate::ValidationErrors;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: Status, to: Status },

    #[error("metadata for task {id} is corrupted: {errors}")]
    InvalidMetadata { id: TaskId, errors: ValidationErrors },

    #[error("task {0} not found in storage, probably expired")]
    NotFound(TaskId),

    #[error("output validation for task {id} failed: {errors}")]
    OutputValidation { id: TaskId, errors: ValidationErrors },

    #[error("awaiting task {id} timed out after {} ms", timeout.as_millis())]
    PollingTimeout { id: TaskId, timeout: Duration },

    #[error("task {0} was cancelled")]
    Cancelled(TaskId),

    #[error("task {id} failed: {error}")]
    TaskFailed { id: TaskId, error: TaskError },

    #[error("storage error: {0}")]
    Storage(#[from] BackendError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
