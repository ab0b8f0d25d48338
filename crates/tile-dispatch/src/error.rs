//! Error types for kernel selection and launch.

use thiserror::Error;

/// Errors that can occur while resolving, selecting or launching a kernel.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DispatchError {
    /// The requested trait combination has no registered specialization family.
    ///
    /// Detected while building a [`TraitDescriptor`](crate::TraitDescriptor);
    /// the caller can recover by choosing different parameters.
    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// The registry has no entry for a key that passed validation.
    ///
    /// This is a registry integrity defect, never a user error.
    #[error("No matching specialization: {0}")]
    NoMatchingSpecialization(String),

    /// Malformed shapes or buffers.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Error reported by the compute backend.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl DispatchError {
    /// Whether the caller can retry with different parameters.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, DispatchError::NoMatchingSpecialization(_))
    }
}

/// Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;
