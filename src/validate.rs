//! Payload validation contract.
//!
//! Task inputs and outputs are opaque to the queue. The queue only decides
//! *when* they are checked: inputs by the processor before the work function
//! runs, outputs by the client before a result is handed back. Payload types
//! opt in by implementing [`Validate`]; the default accepts everything.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A single failed check on one field of a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Dotted path of the offending field. `$` names the payload itself.
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Non-empty collection of field errors produced by one validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidationErrors(Vec<FieldError>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Record a failed check.
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.push(FieldError::new(field, message));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn fields(&self) -> &[FieldError] {
        &self.0
    }

    pub fn into_fields(self) -> Vec<FieldError> {
        self.0
    }

    /// `Ok(())` when nothing was recorded, otherwise `Err(self)`.
    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.0.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl From<Vec<FieldError>> for ValidationErrors {
    fn from(errors: Vec<FieldError>) -> Self {
        Self(errors)
    }
}

impl From<serde_json::Error> for ValidationErrors {
    fn from(err: serde_json::Error) -> Self {
        Self(vec![FieldError::new("$", err.to_string())])
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

/// Field-level checks for a task payload.
pub trait Validate {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Ok(())
    }
}

impl Validate for serde_json::Value {}
impl Validate for String {}
impl Validate for () {}

/// Decode a raw JSON payload into `T` and run its checks.
///
/// A payload that does not even deserialize is reported as a single error on
/// the `$` field.
pub fn decode<T>(raw: serde_json::Value) -> Result<T, ValidationErrors>
where
    T: DeserializeOwned + Validate,
{
    let value: T = serde_json::from_value(raw)?;
    value.validate()?;
    Ok(value)
}
