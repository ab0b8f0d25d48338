//! CUDA context and kernel module management.

use crate::error::{CudaError, Result};
use cudarc::driver::{result, CudaDevice, CudaFunction, CudaStream};
use cudarc::nvrtc::Ptx;
use std::path::Path;
use std::sync::Arc;
use tile_dispatch::registry;

/// Module name under which the registry symbols are loaded.
pub const MODULE_NAME: &str = "tile_dispatch";

/// Threads per block for every registered kernel.
pub const BLOCK_THREADS: u32 = 256;

/// CUDA context holding the compiled specialization module.
///
/// Loading fails unless the module exports every symbol in the registry, so a
/// context that exists can launch anything the dispatcher selects.
pub struct CudaContext {
    device: Arc<CudaDevice>,
    num_symbols: usize,
}

impl CudaContext {
    /// Load `ptx` on device `ordinal`.
    pub fn from_ptx(ordinal: usize, ptx: Ptx) -> Result<Self> {
        let device = CudaDevice::new(ordinal)?;
        let symbols: Vec<&'static str> = registry::all_symbols().collect();
        device.load_ptx(ptx, MODULE_NAME, &symbols)?;

        tracing::info!(
            device = ordinal,
            symbols = symbols.len(),
            module = MODULE_NAME,
            "loaded specialization module"
        );
        Ok(Self {
            device,
            num_symbols: symbols.len(),
        })
    }

    /// Load a PTX file from disk on device `ordinal`.
    pub fn from_ptx_file(ordinal: usize, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(CudaError::ModuleLoad(format!(
                "{} is not a readable PTX file",
                path.display()
            )));
        }
        Self::from_ptx(ordinal, Ptx::from_file(path))
    }

    /// Get the underlying device.
    pub fn device(&self) -> &Arc<CudaDevice> {
        &self.device
    }

    pub fn device_name(&self) -> Result<String> {
        Ok(self.device.name()?)
    }

    /// Number of kernel symbols loaded from the module.
    pub fn num_symbols(&self) -> usize {
        self.num_symbols
    }

    /// Create a stream that is ordered after the device's default stream.
    pub fn new_stream(&self) -> Result<CudaStream> {
        Ok(self.device.fork_default_stream()?)
    }

    /// Look up a loaded kernel by symbol.
    pub fn get_kernel(&self, symbol: &str) -> Result<CudaFunction> {
        self.device
            .get_func(MODULE_NAME, symbol)
            .ok_or_else(|| CudaError::KernelNotFound(symbol.to_string()))
    }

    /// Block until all work on this device has completed.
    pub fn synchronize(&self) -> Result<()> {
        Ok(self.device.synchronize()?)
    }

    /// Block until the work queued on `stream` has completed.
    ///
    /// Other streams on the device keep running.
    pub fn synchronize_stream(&self, stream: &CudaStream) -> Result<()> {
        self.device.bind_to_thread()?;
        unsafe { result::stream::synchronize(stream.stream) }?;
        Ok(())
    }
}
