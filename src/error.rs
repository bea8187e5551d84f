//! Error types for clinic-records

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClinicError {
    #[error("Patient not found: {0}")]
    PatientNotFound(i64),

    #[error("Author not found: {0}")]
    AuthorNotFound(i64),

    /// The patient exists but has no clinical history yet
    #[error("No clinical record for patient {0}")]
    RecordNotFound(i64),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid or already used access token")]
    InvalidToken,

    #[error("Validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClinicError {
    /// Not-found and validation failures are handled at the boundary;
    /// everything else aborts the request.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ClinicError::PatientNotFound(_)
                | ClinicError::AuthorNotFound(_)
                | ClinicError::RecordNotFound(_)
                | ClinicError::NotFound(_)
                | ClinicError::InvalidToken
                | ClinicError::Validation(_)
        )
    }
}

/// Field-level validation failures.
///
/// Carries the values the user submitted so a form can be re-rendered
/// with the original (invalid) input for correction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationErrors {
    pub fields: BTreeMap<String, String>,
    pub submitted: BTreeMap<String, String>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.fields.insert(field.into(), message.into());
    }

    pub fn keep_value(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.submitted.insert(field.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn has(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Ok when no field failed, otherwise a `ClinicError::Validation`
    pub fn into_result(self) -> Result<(), ClinicError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(ClinicError::Validation(self))
        }
    }

    pub fn single(field: &str, message: &str) -> ClinicError {
        let mut errors = Self::new();
        errors.add(field, message);
        ClinicError::Validation(errors)
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .fields
            .iter()
            .map(|(field, message)| format!("{}: {}", field, message))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}
