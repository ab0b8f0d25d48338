//! Error types for CUDA operations.

use cudarc::driver::DriverError;
use thiserror::Error;
use tile_dispatch::DispatchError;

/// Errors that can occur during CUDA operations.
#[derive(Debug, Error)]
pub enum CudaError {
    /// CUDA driver error.
    #[error("CUDA driver error: {0}")]
    Driver(#[from] DriverError),

    /// The kernel module could not be located or read.
    #[error("Module load error: {0}")]
    ModuleLoad(String),

    /// Kernel function not found in the loaded module.
    #[error("Kernel not found: {0}")]
    KernelNotFound(String),

    /// A dimension does not fit the kernel argument layout.
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Error raised by the dispatch layer.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl From<CudaError> for DispatchError {
    fn from(err: CudaError) -> Self {
        match err {
            CudaError::Dispatch(inner) => inner,
            other => DispatchError::Backend(other.to_string()),
        }
    }
}

/// Result type for CUDA operations.
pub type Result<T> = std::result::Result<T, CudaError>;
