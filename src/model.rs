//! Core data model.
//!
//! A task is one unit of submitted work. It has identity (an opaque id), an
//! immutable input payload, a lifecycle status and, once finished, an output.
//! The store is the source of truth; a `Task` value is a snapshot loaded from
//! it and mutated only through the transition methods below.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::validate::{FieldError, ValidationErrors};

// ---------------------------------------------------------------------------
// Task Id
// ---------------------------------------------------------------------------

/// Opaque task identifier. Generated as a UUIDv4 string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Status {
    /// Queued, not yet taken by a processor.
    Waiting,
    /// A processor is executing the work function.
    InProgress,
    /// Finished successfully. Terminal.
    Done,
    /// Finished with an error. Terminal.
    Failed,
    /// Withdrawn by the producer. Terminal.
    Canceled,
}

impl Status {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Waiting, InProgress)
                | (Waiting, Canceled)
                | (InProgress, Done)
                | (InProgress, Failed)
                | (InProgress, Canceled)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Done | Status::Failed | Status::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Waiting => "waiting",
            Status::InProgress => "inProgress",
            Status::Done => "done",
            Status::Failed => "failed",
            Status::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Queue lane. Every id in a higher lane is dequeued before any lower lane
/// is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    #[default]
    Low,
}

impl Priority {
    /// All lanes in dequeue order.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Error description stored as the output of a failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub message: String,
    /// Offending fields, when the failure came from payload validation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldError>,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fields: Vec::new(),
        }
    }

    /// Failure caused by an input that did not pass validation.
    pub fn input_validation(id: &TaskId, errors: ValidationErrors) -> Self {
        Self {
            message: format!("input validation for task {id} failed"),
            fields: errors.into_fields(),
        }
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)?;
        if !self.fields.is_empty() {
            let fields = ValidationErrors::from(self.fields.clone());
            write!(f, " ({fields})")?;
        }
        Ok(())
    }
}

impl std::error::Error for TaskError {}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Result of a finished task: either the work function's data or an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TaskOutput<O> {
    Data(O),
    Error(TaskError),
}

impl<O> TaskOutput<O> {
    pub fn is_error(&self) -> bool {
        matches!(self, TaskOutput::Error(_))
    }

    pub fn data(&self) -> Option<&O> {
        match self {
            TaskOutput::Data(data) => Some(data),
            TaskOutput::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&TaskError> {
        match self {
            TaskOutput::Data(_) => None,
            TaskOutput::Error(err) => Some(err),
        }
    }
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// The `metadata` field of a persisted task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetadata {
    pub id: TaskId,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub taken_at: Option<DateTime<Utc>>,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

impl TaskMetadata {
    /// Schema checks applied to metadata read back from storage.
    ///
    /// `expected_id` is the id the record was addressed by.
    pub fn check(&self, expected_id: &TaskId) -> std::result::Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.id.as_str().is_empty() {
            errors.add("id", "must not be empty");
        } else if &self.id != expected_id {
            errors.add("id", format!("does not match record key {expected_id}"));
        }

        match self.created_at {
            None => errors.add("createdAt", "must be set"),
            Some(ts) if ts.timestamp_millis() <= 0 => {
                errors.add("createdAt", "must be a positive timestamp")
            }
            Some(_) => {}
        }
        for (field, ts) in [("updatedAt", self.updated_at), ("takenAt", self.taken_at)] {
            if ts.is_some_and(|ts| ts.timestamp_millis() <= 0) {
                errors.add(field, "must be a positive timestamp");
            }
        }

        errors.into_result()
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A unit of work and its lifecycle record.
#[derive(Debug, Clone, PartialEq)]
pub struct Task<I, O> {
    id: TaskId,
    status: Status,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    taken_at: Option<DateTime<Utc>>,
    input: I,
    output: Option<TaskOutput<O>>,
}

impl<I, O> Task<I, O> {
    /// A fresh, unsaved task in `waiting`.
    pub fn create(input: I) -> Self {
        Self {
            id: TaskId::generate(),
            status: Status::Waiting,
            created_at: None,
            updated_at: None,
            taken_at: None,
            input,
            output: None,
        }
    }

    /// Rebuild a task from a persisted record.
    pub(crate) fn from_parts(metadata: TaskMetadata, input: I, output: Option<TaskOutput<O>>) -> Self {
        Self {
            id: metadata.id,
            status: metadata.status,
            created_at: metadata.created_at,
            updated_at: metadata.updated_at,
            taken_at: metadata.taken_at,
            input,
            output,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn input(&self) -> &I {
        &self.input
    }

    pub fn output(&self) -> Option<&TaskOutput<O>> {
        self.output.as_ref()
    }

    pub fn into_output(self) -> Option<TaskOutput<O>> {
        self.output
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn taken_at(&self) -> Option<DateTime<Utc>> {
        self.taken_at
    }

    /// Never saved: no `created_at` yet.
    pub fn is_new(&self) -> bool {
        self.created_at.is_none()
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn metadata(&self) -> TaskMetadata {
        TaskMetadata {
            id: self.id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            taken_at: self.taken_at,
            status: self.status,
            error: self.output.as_ref().and_then(|o| o.error().cloned()),
        }
    }

    fn set_status(&mut self, to: Status) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Waiting → InProgress. Stamps `taken_at`.
    pub fn set_in_progress(&mut self) -> Result<()> {
        self.set_status(Status::InProgress)?;
        self.taken_at = Some(Utc::now());
        Ok(())
    }

    /// InProgress → Done with the work function's data.
    pub fn set_done(&mut self, data: O) -> Result<()> {
        self.set_status(Status::Done)?;
        self.output = Some(TaskOutput::Data(data));
        Ok(())
    }

    /// InProgress → Failed with an error description.
    pub fn set_failed(&mut self, error: TaskError) -> Result<()> {
        self.set_status(Status::Failed)?;
        self.output = Some(TaskOutput::Error(error));
        Ok(())
    }

    pub fn set_canceled(&mut self) -> Result<()> {
        self.set_status(Status::Canceled)
    }

    /// Called on every save: the first stamps `created_at`, later ones
    /// `updated_at`.
    pub fn update_timestamps(&mut self) {
        let now = Utc::now();
        if self.is_new() {
            self.created_at = Some(now);
        } else {
            self.updated_at = Some(now);
        }
    }
}
