//! CUDA backend for tile-dispatch.
//!
//! This crate launches the specializations selected by `tile-dispatch` from a
//! compiled PTX module. The module must export every registry symbol; loading
//! fails otherwise.
//!
//! # Quick Start
//!
//! ```ignore
//! use tile_dispatch::prelude::*;
//! use tile_dispatch_cuda::{CudaBackend, CudaContext, DeviceTensor};
//!
//! let ctx = CudaContext::from_ptx_file(0, "kernels/tile_dispatch.ptx")?;
//! let backend = CudaBackend::new(&ctx);
//! let stream = StreamConfig::timed(ctx.new_stream()?);
//!
//! let q = DeviceTensor::from_f32(&ctx, DataType::Bf16, &q_host)?;
//! // ... k, v, out uploaded the same way
//! let mask = MaskInfo::causal();
//! let ms = mha_fwd(&backend, &mut args, &stream, "bf16", false, &mask, BiasKind::None, false)?;
//! ```
//!
//! # Global Context
//!
//! [`get_global_context`] loads the module named by `TILE_DISPATCH_PTX` on
//! device 0 once and keeps it for the lifetime of the process.

mod context;
mod error;
mod kernels;
mod memory;

use once_cell::sync::OnceCell;

/// Environment variable naming the PTX module for the global context.
pub const ENV_PTX: &str = "TILE_DISPATCH_PTX";

/// Global CUDA context for convenience functions.
/// Lazily initialized on first use, persists for process lifetime.
static GLOBAL_CONTEXT: OnceCell<CudaContext> = OnceCell::new();

/// Get or initialize the global CUDA context.
///
/// Thread-safe: concurrent first calls load the module once.
///
/// # Errors
///
/// Returns an error if `TILE_DISPATCH_PTX` is unset, no device is present, or
/// the module lacks a registry symbol.
pub fn get_global_context() -> Result<&'static CudaContext> {
    GLOBAL_CONTEXT.get_or_try_init(|| {
        let path = std::env::var(ENV_PTX)
            .map_err(|_| CudaError::ModuleLoad(format!("{} is not set", ENV_PTX)))?;
        CudaContext::from_ptx_file(0, path)
    })
}

pub use context::{CudaContext, BLOCK_THREADS, MODULE_NAME};
pub use error::{CudaError, Result};
pub use kernels::{fmha_grid, gemm_grid, CudaBackend, FmhaKargs, FmhaPhase, MoeGemmKargs};
pub use memory::DeviceTensor;
