//! Backend error types.

use std::io;
use thiserror::Error;

use crate::config::BackendKind;

/// Errors returned by the factory and by store clients.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The configured backend identifier is not one of the supported kinds
    #[error("Invalid backend: {0}")]
    InvalidBackend(String),

    /// A field the selected backend needs is absent
    #[error("Missing configuration for {backend}: {field}")]
    MissingField {
        backend: BackendKind,
        field: &'static str,
    },

    /// A configuration value is present but unusable
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    /// The adapter could not be constructed
    #[error("Failed to construct {backend} client: {message}")]
    Construction {
        backend: BackendKind,
        message: String,
    },

    /// The store could not be reached or the transport failed mid-call
    #[error("{backend} unreachable: {message}")]
    Unreachable {
        backend: BackendKind,
        message: String,
    },

    /// Malformed key or prefix
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The store answered with something we could not interpret
    #[error("Failed to decode {backend} response: {message}")]
    Decode {
        backend: BackendKind,
        message: String,
    },

    /// I/O error reading local sources
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

impl BackendError {
    pub(crate) fn construction(backend: BackendKind, message: impl Into<String>) -> Self {
        BackendError::Construction {
            backend,
            message: message.into(),
        }
    }

    pub(crate) fn unreachable(backend: BackendKind, message: impl ToString) -> Self {
        BackendError::Unreachable {
            backend,
            message: message.to_string(),
        }
    }

    pub(crate) fn decode(backend: BackendKind, message: impl ToString) -> Self {
        BackendError::Decode {
            backend,
            message: message.to_string(),
        }
    }

    /// Transport failures may succeed on a later attempt; everything else will not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Unreachable { .. })
    }

    /// Check if this error was raised while validating configuration.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            BackendError::InvalidBackend(_)
                | BackendError::MissingField { .. }
                | BackendError::InvalidConfig(_)
        )
    }

    /// Check if this error was raised while constructing an adapter.
    pub fn is_construction_error(&self) -> bool {
        matches!(self, BackendError::Construction { .. })
    }

    /// Get the error type as a string for metrics labeling
    pub fn error_type(&self) -> &'static str {
        match self {
            BackendError::InvalidBackend(_) => "invalid_backend",
            BackendError::MissingField { .. } => "missing_field",
            BackendError::InvalidConfig(_) => "config",
            BackendError::Construction { .. } => "construction",
            BackendError::Unreachable { .. } => "unreachable",
            BackendError::InvalidRequest(_) => "invalid_request",
            BackendError::Decode { .. } => "decode",
            BackendError::Io(_) => "io",
        }
    }
}
