//! Launch adapter: the seam between dispatch and a compute primitive.
//!
//! A [`ComputeBackend`] owns device buffers and streams and knows how to run a
//! selected registry entry. The dispatcher never inspects buffer contents; it
//! checks shapes and element types through [`DeviceBuffer`], picks the kernel,
//! and hands both to the backend.
//!
//! Two backends exist in this workspace:
//!
//! | Backend | Crate | Buffer |
//! |---------|-------|--------|
//! | [`HostBackend`](crate::host::HostBackend) | `tile-dispatch` | `HostBuffer` |
//! | `CudaBackend` | `tile-dispatch-cuda` | `DeviceTensor` |
//!
//! # Timing
//!
//! [`StreamConfig`] decides whether a call is timed. Untimed calls launch once
//! and report `0.0`. Timed calls run `cold_niters` warmups, then `nrepeat`
//! launches between two synchronizations, and report the mean in milliseconds.

mod args;

use crate::config::global_config;
use crate::error::{DispatchError, Result};
use crate::registry::{FmhaKernel, GemmKernel};
use crate::types::{DataType, MaskInfo, TraitDescriptor};
use std::time::Instant;

pub use args::{
    AttentionParams, AttentionShape, BatchPrefillArgs, FmhaFwdArgs, FmhaSplitKvArgs, MoeGemmArgs,
    PagedKv, QUANT_BLOCK,
};
pub(crate) use args::{validate_batch_prefill, validate_fwd, validate_moe, validate_splitkv};

/// A typed buffer owned by a backend.
pub trait DeviceBuffer {
    /// Element type of the buffer contents.
    fn dtype(&self) -> DataType;

    /// Number of elements.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A compute primitive able to run registry entries.
///
/// Implementations may assume arguments were validated against the descriptor
/// and that `kernel` matches it; they must not keep any borrowed argument past
/// the call.
pub trait ComputeBackend {
    type Buffer: DeviceBuffer;
    type Stream;

    /// Short backend name for logs.
    fn name(&self) -> &str;

    fn launch_moe_gemm(
        &self,
        kernel: &GemmKernel,
        traits: &TraitDescriptor,
        args: &mut MoeGemmArgs<'_, Self::Buffer>,
        stream: &Self::Stream,
    ) -> Result<()>;

    fn launch_fmha_fwd(
        &self,
        kernel: &FmhaKernel,
        traits: &TraitDescriptor,
        mask: &MaskInfo,
        args: &mut FmhaFwdArgs<'_, Self::Buffer>,
        stream: &Self::Stream,
    ) -> Result<()>;

    fn launch_fmha_splitkv(
        &self,
        kernel: &FmhaKernel,
        traits: &TraitDescriptor,
        mask: &MaskInfo,
        args: &mut FmhaSplitKvArgs<'_, Self::Buffer>,
        stream: &Self::Stream,
    ) -> Result<()>;

    fn launch_batch_prefill(
        &self,
        kernel: &FmhaKernel,
        traits: &TraitDescriptor,
        mask: &MaskInfo,
        args: &mut BatchPrefillArgs<'_, Self::Buffer>,
        stream: &Self::Stream,
    ) -> Result<()>;

    /// Block until all work submitted to `stream` has completed.
    fn synchronize(&self, stream: &Self::Stream) -> Result<()>;
}

/// Stream handle plus timing policy for one dispatch call.
#[derive(Debug, Clone)]
pub struct StreamConfig<S> {
    pub stream: S,
    pub time_kernel: bool,
    /// Warmup launches before the timed section.
    pub cold_niters: u32,
    /// Timed launches averaged into the result.
    pub nrepeat: u32,
}

impl<S> StreamConfig<S> {
    /// Untimed submission; repetition counts come from the global config.
    pub fn new(stream: S) -> Self {
        let config = global_config();
        Self {
            stream,
            time_kernel: false,
            cold_niters: config.cold_niters,
            nrepeat: config.nrepeat,
        }
    }

    /// Timed submission with the global repetition counts.
    pub fn timed(stream: S) -> Self {
        Self {
            time_kernel: true,
            ..Self::new(stream)
        }
    }

    pub fn with_repeats(mut self, cold_niters: u32, nrepeat: u32) -> Self {
        self.cold_niters = cold_niters;
        self.nrepeat = nrepeat;
        self
    }
}

impl Default for StreamConfig<()> {
    fn default() -> Self {
        Self::new(())
    }
}

/// Run `launch` under the stream's timing policy.
pub(crate) fn run_timed<B, F>(
    backend: &B,
    stream: &StreamConfig<B::Stream>,
    mut launch: F,
) -> Result<f32>
where
    B: ComputeBackend + ?Sized,
    F: FnMut() -> Result<()>,
{
    if !stream.time_kernel {
        launch()?;
        return Ok(0.0);
    }
    if stream.nrepeat == 0 {
        return Err(DispatchError::InvalidArgument(
            "timed launch needs nrepeat > 0".into(),
        ));
    }

    for _ in 0..stream.cold_niters {
        launch()?;
    }
    backend.synchronize(&stream.stream)?;

    let start = Instant::now();
    for _ in 0..stream.nrepeat {
        launch()?;
    }
    backend.synchronize(&stream.stream)?;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1e3;

    let mean = (elapsed_ms / stream.nrepeat as f64) as f32;
    tracing::trace!(backend = backend.name(), mean_ms = mean, "timed launch");
    Ok(mean)
}

/// Check one buffer's element type and length.
pub(crate) fn check_buffer<B: DeviceBuffer>(
    name: &str,
    buf: &B,
    dtype: DataType,
    len: usize,
) -> Result<()> {
    if buf.dtype() != dtype {
        return Err(DispatchError::InvalidArgument(format!(
            "{}: expected element type {}, got {}",
            name,
            dtype,
            buf.dtype()
        )));
    }
    if buf.len() != len {
        return Err(DispatchError::InvalidArgument(format!(
            "{}: expected {} elements, got {}",
            name,
            len,
            buf.len()
        )));
    }
    Ok(())
}
