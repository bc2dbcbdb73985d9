//! Typed error taxonomy for the stack service.
//!
//! Every caller-visible failure is one of five kinds: validation, conflict,
//! not-found, upstream, or internal. Each variant carries a stable
//! machine-readable code alongside the human message, so HTTP-facing layers
//! can map them without string matching.

use thiserror::Error;
use uuid::Uuid;

/// Domain errors raised by the engine, the batch processor, and the
/// override protocol.
#[derive(Error, Debug)]
pub enum StackError {
    /// Bad request: malformed or contradictory input, policy violations
    /// such as dimension bounds or unsupported formats.
    #[error("validation failed ({code}): {message}")]
    Validation { code: &'static str, message: String },

    /// Duplicate name in the target scope, or a lost optimistic write.
    #[error("conflict ({code}): {message}")]
    Conflict { code: &'static str, message: String },

    /// Missing parent, stack, viewport, or entity.
    #[error("not found ({code}): {message}")]
    NotFound { code: &'static str, message: String },

    /// Object-storage or resize-worker failure.
    #[error("upstream failure ({code}): {message}")]
    Upstream { code: &'static str, message: String },

    /// Unexpected or unmeasurable state.
    #[error("internal error ({code}): {message}")]
    Internal { code: &'static str, message: String },
}

impl StackError {
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::Conflict {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::NotFound {
            code,
            message: message.into(),
        }
    }

    pub fn upstream(code: &'static str, message: impl Into<String>) -> Self {
        Self::Upstream {
            code,
            message: message.into(),
        }
    }

    pub fn internal(code: &'static str, message: impl Into<String>) -> Self {
        Self::Internal {
            code,
            message: message.into(),
        }
    }

    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { code, .. }
            | Self::Conflict { code, .. }
            | Self::NotFound { code, .. }
            | Self::Upstream { code, .. }
            | Self::Internal { code, .. } => code,
        }
    }
}

pub type Result<T, E = StackError> = std::result::Result<T, E>;

/// One entry of a batch error list.
///
/// Per-item failures inside a batch are collected and returned alongside the
/// successfully processed items; they are never thrown, so one bad file
/// cannot fail an otherwise-good batch.
#[derive(Debug)]
pub struct BatchError {
    /// Entity uuid the error refers to, when one exists.
    pub uuid: Option<Uuid>,
    /// File or entity name the error refers to.
    pub name: String,
    /// The underlying error.
    pub error: StackError,
}

impl BatchError {
    pub fn for_name(name: impl Into<String>, error: StackError) -> Self {
        Self {
            uuid: None,
            name: name.into(),
            error,
        }
    }

    pub fn for_entity(uuid: Uuid, name: impl Into<String>, error: StackError) -> Self {
        Self {
            uuid: Some(uuid),
            name: name.into(),
            error,
        }
    }
}
