use super::select_gemm_kernel;
use crate::error::{DispatchError, Result};
use crate::launch::{run_timed, validate_moe, ComputeBackend, MoeGemmArgs, StreamConfig};
use crate::types::{MoeStage, TraitDescriptor};

/// Grouped MoE gate/up projection with fused activation.
///
/// Returns the elapsed milliseconds per launch, or `0.0` when the stream does
/// not request timing.
pub fn moe_gemm_stage1<B: ComputeBackend + ?Sized>(
    backend: &B,
    traits: &TraitDescriptor,
    args: &mut MoeGemmArgs<'_, B::Buffer>,
    stream: &StreamConfig<B::Stream>,
) -> Result<f32> {
    moe_gemm(backend, MoeStage::Stage1, traits, args, stream)
}

/// Grouped MoE down projection with routing-weight reduction.
///
/// The output is overwritten, not accumulated into, so repeated launches with
/// the same arguments produce the same buffer.
pub fn moe_gemm_stage2<B: ComputeBackend + ?Sized>(
    backend: &B,
    traits: &TraitDescriptor,
    args: &mut MoeGemmArgs<'_, B::Buffer>,
    stream: &StreamConfig<B::Stream>,
) -> Result<f32> {
    moe_gemm(backend, MoeStage::Stage2, traits, args, stream)
}

fn moe_gemm<B: ComputeBackend + ?Sized>(
    backend: &B,
    stage: MoeStage,
    traits: &TraitDescriptor,
    args: &mut MoeGemmArgs<'_, B::Buffer>,
    stream: &StreamConfig<B::Stream>,
) -> Result<f32> {
    validate_moe(traits, stage, args)?;
    let tile_rows = u32::try_from(args.block_m)
        .map_err(|_| {
            DispatchError::InvalidArgument(format!("block_m {} out of range", args.block_m))
        })?;
    let kernel = select_gemm_kernel(traits, tile_rows)?;

    run_timed(backend, stream, || {
        backend.launch_moe_gemm(kernel, traits, args, &stream.stream)
    })
}
