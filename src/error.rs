//! Uniform error taxonomy shared by every component.
//!
//! Nothing below the engine boundary throws; adapters convert their
//! concrete failures (I/O errors, subprocess exit codes, framing
//! mismatches) into an [`Error`] with one of the [`ErrorKind`] tags, and
//! everything above the boundary matches on the tag rather than on the
//! underlying cause.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

/// The taxonomy every fallible engine operation reports through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Unauthorized,
    Timeout,
    Transport,
    Protocol,
    ResourceBusy,
    Cancelled,
    External,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Transport => "transport",
            ErrorKind::Protocol => "protocol",
            ErrorKind::ResourceBusy => "resource_busy",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::External => "external",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Field-level validation failures, keyed by property name, for UI binding.
pub type PropertyErrors = HashMap<String, String>;

/// The engine's single error type. One variant per [`ErrorKind`] keeps
/// `thiserror`'s derive doing the `Display`/`source` wiring instead of a
/// free-form struct with a kind field, which would let kind and message
/// drift out of sync.
#[derive(Debug, Error)]
pub enum Error {
    #[error("validation failed: {message}")]
    Validation {
        message: String,
        property: Option<String>,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("not found: {message}")]
    NotFound {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("conflict: {message}")]
    Conflict {
        message: String,
        property: Option<String>,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("unauthorized: {message}")]
    Unauthorized {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("timed out: {message}")]
    Timeout {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("protocol error: {message}")]
    Protocol {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("resource busy: {message}")]
    ResourceBusy { message: String },

    #[error("cancelled: {message}")]
    Cancelled { message: String },

    #[error("external command failed: {message}")]
    External {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation { .. } => ErrorKind::Validation,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::Unauthorized { .. } => ErrorKind::Unauthorized,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Transport { .. } => ErrorKind::Transport,
            Error::Protocol { .. } => ErrorKind::Protocol,
            Error::ResourceBusy { .. } => ErrorKind::ResourceBusy,
            Error::Cancelled { .. } => ErrorKind::Cancelled,
            Error::External { .. } => ErrorKind::External,
            Error::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn property(&self) -> Option<&str> {
        match self {
            Error::Validation { property, .. } | Error::Conflict { property, .. } => {
                property.as_deref()
            }
            _ => None,
        }
    }

    /// Returns true when the orchestrator's retry loop is allowed to
    /// consider this kind; the per-operation-class retry budget still has
    /// to agree separately.
    pub fn is_retryable_kind(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout | ErrorKind::Transport | ErrorKind::Protocol | ErrorKind::External
        )
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
            property: None,
            source: None,
        }
    }

    pub fn validation_field(property: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
            property: Some(property.into()),
            source: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound {
            message: message.into(),
            source: None,
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Error::Conflict {
            message: message.into(),
            property: None,
            source: None,
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Error::Unauthorized {
            message: message.into(),
            source: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Error::Timeout {
            message: message.into(),
            source: None,
        }
    }

    pub fn transport(message: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Error::Transport {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
            source: None,
        }
    }

    pub fn resource_busy(message: impl Into<String>) -> Self {
        Error::ResourceBusy {
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Error::Cancelled {
            message: message.into(),
        }
    }

    pub fn external(message: impl Into<String>) -> Self {
        Error::External {
            message: message.into(),
            source: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        let source = Some(source.into());
        match &mut self {
            Error::Validation { source: s, .. }
            | Error::NotFound { source: s, .. }
            | Error::Conflict { source: s, .. }
            | Error::Unauthorized { source: s, .. }
            | Error::Timeout { source: s, .. }
            | Error::Transport { source: s, .. }
            | Error::Protocol { source: s, .. }
            | Error::External { source: s, .. }
            | Error::Internal { source: s, .. } => *s = source,
            Error::ResourceBusy { .. } | Error::Cancelled { .. } => {}
        }
        self
    }
}

/// Result of a failed validation pass: a primary error plus a
/// property→message map so a UI can light up individual fields without
/// re-deriving which property failed from the message text.
#[derive(Debug, Default, Clone)]
pub struct ValidationReport {
    pub errors: PropertyErrors,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, property: impl Into<String>, message: impl Into<String>) {
        self.errors.insert(property.into(), message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Collapses the report into a single [`Error::Validation`], carrying
    /// the first property alphabetically so error output is stable.
    pub fn into_result<T>(self, ok: T) -> Result<T> {
        if self.errors.is_empty() {
            return Ok(ok);
        }
        let mut keys: Vec<_> = self.errors.keys().cloned().collect();
        keys.sort();
        let first = keys.first().cloned().unwrap_or_default();
        let message = self
            .errors
            .get(&first)
            .cloned()
            .unwrap_or_else(|| "validation failed".to_string());
        Err(Error::validation_field(first, message))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
