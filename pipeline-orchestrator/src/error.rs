//! Structured error type for the orchestration core.
//!
//! Every public operation returns either success or a single `OrchestratorError`
//! carrying a closed-set `StatusCode` plus a message: unexpected lower-layer
//! errors are re-packaged as `Unknown` with their message preserved; errors
//! that are already structured propagate unchanged.

use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Closed set of outcome codes used throughout the orchestration core.
///
/// `Ok` has no variant here: success is represented by `Result::Ok`, not by
/// a code value, so the enum only carries the non-success members of the
/// taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Unknown,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    Internal,
    DeadlineExceeded,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Unknown => "unknown",
            StatusCode::NotFound => "not_found",
            StatusCode::AlreadyExists => "already_exists",
            StatusCode::FailedPrecondition => "failed_precondition",
            StatusCode::Internal => "internal",
            StatusCode::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured `{code, message}` error returned by every public operation.
#[derive(Debug, Error)]
#[error("[{code}] {message}")]
pub struct OrchestratorError {
    pub code: StatusCode,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl OrchestratorError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unknown, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(StatusCode::AlreadyExists, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FailedPrecondition, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(StatusCode::DeadlineExceeded, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.code == StatusCode::NotFound
    }
}

/// Lower-layer store errors are unexpected by contract; re-package as
/// `Unknown` and keep the original message and cause.
impl From<sqlx::Error> for OrchestratorError {
    fn from(e: sqlx::Error) -> Self {
        OrchestratorError::unknown(e.to_string()).with_source(e)
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        OrchestratorError::unknown(format!("serialization error: {e}")).with_source(e)
    }
}

impl From<Box<bincode::ErrorKind>> for OrchestratorError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        OrchestratorError::unknown(format!("bincode error: {e}"))
    }
}
