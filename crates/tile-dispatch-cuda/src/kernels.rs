//! CUDA launch adapter for registry specializations.
//!
//! Every registered kernel takes a single `repr(C)` argument block. Grouped
//! GEMM kernels take [`MoeGemmKargs`]; all attention kernels take
//! [`FmhaKargs`], with unused pointers left null.

use crate::context::{CudaContext, BLOCK_THREADS};
use crate::error::{CudaError, Result};
use crate::memory::{ptr_or_null, DeviceTensor};
use cudarc::driver::sys::CUdeviceptr;
use cudarc::driver::{CudaStream, DeviceRepr, LaunchAsync, LaunchConfig};
use tile_dispatch::launch::{
    AttentionParams, AttentionShape, BatchPrefillArgs, FmhaFwdArgs, FmhaSplitKvArgs, MoeGemmArgs,
};
use tile_dispatch::registry::{FmhaKernel, FmhaTile, GemmKernel, TileShape};
use tile_dispatch::{
    BiasKind, ComputeBackend, DeviceBuffer, MaskInfo, MaskKind, MoeStage, TraitDescriptor,
};

/// Kernel arguments for one grouped-GEMM stage.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MoeGemmKargs {
    pub input: CUdeviceptr,
    pub weight: CUdeviceptr,
    pub sorted_token_ids: CUdeviceptr,
    pub sorted_expert_ids: CUdeviceptr,
    pub sorted_weights: CUdeviceptr,
    pub num_valid_ids: CUdeviceptr,
    pub a_scale: CUdeviceptr,
    pub w_scale: CUdeviceptr,
    pub out: CUdeviceptr,
    pub tokens: i32,
    pub topk: i32,
    pub num_experts: i32,
    pub n: i32,
    pub k: i32,
    pub block_m: i32,
    pub activation: i32,
    pub is_gated: i32,
}

unsafe impl DeviceRepr for MoeGemmKargs {}

/// Split-KV attention runs its kernel twice: partials, then the merge.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FmhaPhase {
    Single = 0,
    SplitPartials = 1,
    SplitCombine = 2,
}

/// Kernel arguments shared by every attention variant.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FmhaKargs {
    pub q: CUdeviceptr,
    pub k: CUdeviceptr,
    pub v: CUdeviceptr,
    pub bias: CUdeviceptr,
    pub seqstart_q: CUdeviceptr,
    pub seqstart_k: CUdeviceptr,
    pub out: CUdeviceptr,
    pub lse: CUdeviceptr,
    pub lse_acc: CUdeviceptr,
    pub o_acc: CUdeviceptr,
    pub kv_indptr: CUdeviceptr,
    pub kv_page_indices: CUdeviceptr,
    pub kv_last_page_lens: CUdeviceptr,
    pub drop_seed: u64,
    pub drop_offset: u64,
    pub batch: i32,
    pub nhead_q: i32,
    pub nhead_k: i32,
    pub seqlen_q: i32,
    pub seqlen_k: i32,
    pub max_seqlen_q: i32,
    pub max_seqlen_k: i32,
    pub hdim_q: i32,
    pub hdim_v: i32,
    pub num_splits: i32,
    pub num_pages: i32,
    pub page_block_size: i32,
    pub mask_kind: i32,
    pub mask_left: i32,
    pub mask_right: i32,
    pub bias_kind: i32,
    pub is_group_mode: i32,
    pub has_lse: i32,
    pub phase: i32,
    pub scale_s: f32,
    pub logits_soft_cap: f32,
    pub p_drop: f32,
}

unsafe impl DeviceRepr for FmhaKargs {}

fn dim(name: &str, value: usize) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| CudaError::DimensionMismatch(format!("{} = {} exceeds i32", name, value)))
}

fn grid_dim(name: &str, value: usize) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| CudaError::DimensionMismatch(format!("grid {} = {} exceeds u32", name, value)))
}

/// Grid for a grouped-GEMM stage: output column tiles by sorted row blocks.
///
/// Gated stage 1 writes one column per gate/up pair.
pub fn gemm_grid(
    tile: TileShape,
    stage: MoeStage,
    gated: bool,
    n: usize,
    num_blocks: usize,
) -> Result<(u32, u32, u32)> {
    let cols = match stage {
        MoeStage::Stage1 if gated => n / 2,
        MoeStage::Stage1 | MoeStage::Stage2 => n,
    };
    Ok((
        grid_dim("x", cols.div_ceil(tile.n as usize))?,
        grid_dim("y", num_blocks)?,
        1,
    ))
}

/// Grid for attention: query tiles by heads by `batch * splits`.
pub fn fmha_grid(tile: FmhaTile, shape: &AttentionShape, splits: usize) -> Result<(u32, u32, u32)> {
    Ok((
        grid_dim("x", shape.max_seqlen_q.div_ceil(tile.m0 as usize))?,
        grid_dim("y", shape.nhead_q)?,
        grid_dim("z", shape.batch * splits)?,
    ))
}

fn launch_config(grid: (u32, u32, u32)) -> LaunchConfig {
    LaunchConfig {
        grid_dim: grid,
        block_dim: (BLOCK_THREADS, 1, 1),
        shared_mem_bytes: 0,
    }
}

/// Attention kargs with every buffer null.
fn fmha_kargs(
    traits: &TraitDescriptor,
    mask: &MaskInfo,
    shape: &AttentionShape,
    params: &AttentionParams,
) -> Result<FmhaKargs> {
    Ok(FmhaKargs {
        q: 0,
        k: 0,
        v: 0,
        bias: 0,
        seqstart_q: 0,
        seqstart_k: 0,
        out: 0,
        lse: 0,
        lse_acc: 0,
        o_acc: 0,
        kv_indptr: 0,
        kv_page_indices: 0,
        kv_last_page_lens: 0,
        drop_seed: params.drop_seed,
        drop_offset: params.drop_offset,
        batch: dim("batch", shape.batch)?,
        nhead_q: dim("nhead_q", shape.nhead_q)?,
        nhead_k: dim("nhead_k", shape.nhead_k)?,
        seqlen_q: dim("seqlen_q", shape.seqlen_q)?,
        seqlen_k: dim("seqlen_k", shape.seqlen_k)?,
        max_seqlen_q: dim("max_seqlen_q", shape.max_seqlen_q)?,
        max_seqlen_k: dim("max_seqlen_k", shape.max_seqlen_k)?,
        hdim_q: dim("hdim_q", shape.hdim_q)?,
        hdim_v: dim("hdim_v", shape.hdim_v)?,
        num_splits: 1,
        num_pages: 0,
        page_block_size: 0,
        mask_kind: match traits.mask_kind {
            MaskKind::None => 0,
            MaskKind::CausalTopLeft => 1,
            MaskKind::CausalBottomRight => 2,
            MaskKind::Window => 3,
        },
        mask_left: mask.left,
        mask_right: mask.right,
        bias_kind: match traits.bias_kind {
            BiasKind::None => 0,
            BiasKind::Elementwise => 1,
            BiasKind::Alibi => 2,
        },
        is_group_mode: traits.is_group_mode as i32,
        has_lse: traits.has_lse as i32,
        phase: FmhaPhase::Single as i32,
        scale_s: params.scale_s,
        logits_soft_cap: params.logits_soft_cap,
        p_drop: params.p_drop,
    })
}

/// [`ComputeBackend`] that launches registry symbols from a loaded module.
pub struct CudaBackend<'c> {
    ctx: &'c CudaContext,
}

impl<'c> CudaBackend<'c> {
    pub fn new(ctx: &'c CudaContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &CudaContext {
        self.ctx
    }

    fn launch<P: DeviceRepr>(
        &self,
        symbol: &str,
        grid: (u32, u32, u32),
        kargs: P,
        stream: &CudaStream,
    ) -> Result<()> {
        let kernel = self.ctx.get_kernel(symbol)?;
        tracing::trace!(symbol, ?grid, "launching");
        unsafe {
            kernel.launch_on_stream(stream, launch_config(grid), (kargs,))?;
        }
        Ok(())
    }
}

impl ComputeBackend for CudaBackend<'_> {
    type Buffer = DeviceTensor;
    type Stream = CudaStream;

    fn name(&self) -> &str {
        "cuda"
    }

    fn launch_moe_gemm(
        &self,
        kernel: &GemmKernel,
        traits: &TraitDescriptor,
        args: &mut MoeGemmArgs<'_, DeviceTensor>,
        stream: &CudaStream,
    ) -> tile_dispatch::Result<()> {
        let grid = gemm_grid(
            kernel.tile,
            kernel.stage,
            traits.is_gated,
            args.n,
            args.sorted_expert_ids.len(),
        )?;
        let kargs = MoeGemmKargs {
            input: args.input.ptr(),
            weight: args.weight.ptr(),
            sorted_token_ids: args.sorted_token_ids.ptr(),
            sorted_expert_ids: args.sorted_expert_ids.ptr(),
            sorted_weights: ptr_or_null(args.sorted_weights),
            num_valid_ids: args.num_valid_ids.ptr(),
            a_scale: ptr_or_null(args.a_scale),
            w_scale: ptr_or_null(args.w_scale),
            out: args.out.ptr_mut(),
            tokens: dim("tokens", args.tokens)?,
            topk: dim("topk", args.topk)?,
            num_experts: dim("num_experts", args.num_experts)?,
            n: dim("n", args.n)?,
            k: dim("k", args.k)?,
            block_m: dim("block_m", args.block_m)?,
            activation: args.activation as i32,
            is_gated: traits.is_gated as i32,
        };
        Ok(self.launch(kernel.symbol, grid, kargs, stream)?)
    }

    fn launch_fmha_fwd(
        &self,
        kernel: &FmhaKernel,
        traits: &TraitDescriptor,
        mask: &MaskInfo,
        args: &mut FmhaFwdArgs<'_, DeviceTensor>,
        stream: &CudaStream,
    ) -> tile_dispatch::Result<()> {
        let mut kargs = fmha_kargs(traits, mask, &args.shape, &args.params)?;
        kargs.q = args.q.ptr();
        kargs.k = args.k.ptr();
        kargs.v = args.v.ptr();
        kargs.bias = ptr_or_null(args.bias);
        kargs.seqstart_q = ptr_or_null(args.seqstart_q);
        kargs.seqstart_k = ptr_or_null(args.seqstart_k);
        kargs.out = args.out.ptr_mut();
        kargs.lse = args.lse.as_deref_mut().map_or(0, DeviceTensor::ptr_mut);

        let grid = fmha_grid(kernel.tile, &args.shape, 1)?;
        Ok(self.launch(kernel.symbol, grid, kargs, stream)?)
    }

    fn launch_fmha_splitkv(
        &self,
        kernel: &FmhaKernel,
        traits: &TraitDescriptor,
        mask: &MaskInfo,
        args: &mut FmhaSplitKvArgs<'_, DeviceTensor>,
        stream: &CudaStream,
    ) -> tile_dispatch::Result<()> {
        let mut kargs = fmha_kargs(traits, mask, &args.shape, &args.params)?;
        kargs.q = args.q.ptr();
        kargs.k = args.k.ptr();
        kargs.v = args.v.ptr();
        kargs.bias = ptr_or_null(args.bias);
        kargs.seqstart_q = ptr_or_null(args.seqstart_q);
        kargs.seqstart_k = ptr_or_null(args.seqstart_k);
        kargs.out = args.out.ptr_mut();
        kargs.lse = args.lse.as_deref_mut().map_or(0, DeviceTensor::ptr_mut);
        kargs.lse_acc = args.lse_acc.ptr_mut();
        kargs.o_acc = args.o_acc.ptr_mut();
        kargs.num_splits = dim("num_splits", args.num_splits)?;

        // Both phases go to the same stream, so the merge sees every partial.
        kargs.phase = FmhaPhase::SplitPartials as i32;
        let grid = fmha_grid(kernel.tile, &args.shape, args.num_splits)?;
        self.launch(kernel.symbol, grid, kargs, stream)?;

        kargs.phase = FmhaPhase::SplitCombine as i32;
        let grid = fmha_grid(kernel.tile, &args.shape, 1)?;
        Ok(self.launch(kernel.symbol, grid, kargs, stream)?)
    }

    fn launch_batch_prefill(
        &self,
        kernel: &FmhaKernel,
        traits: &TraitDescriptor,
        mask: &MaskInfo,
        args: &mut BatchPrefillArgs<'_, DeviceTensor>,
        stream: &CudaStream,
    ) -> tile_dispatch::Result<()> {
        let mut kargs = fmha_kargs(traits, mask, &args.shape, &args.params)?;
        kargs.q = args.q.ptr();
        kargs.k = args.kv.k_pages.ptr();
        kargs.v = args.kv.v_pages.ptr();
        kargs.kv_indptr = args.kv.kv_indptr.ptr();
        kargs.kv_page_indices = args.kv.kv_page_indices.ptr();
        kargs.kv_last_page_lens = args.kv.kv_last_page_lens.ptr();
        kargs.num_pages = dim("num_pages", args.kv.num_pages)?;
        kargs.page_block_size = dim("page_block_size", args.kv.page_block_size)?;
        kargs.bias = ptr_or_null(args.bias);
        kargs.seqstart_q = args.seqstart_q.ptr();
        kargs.out = args.out.ptr_mut();
        kargs.lse = args.lse.as_deref_mut().map_or(0, DeviceTensor::ptr_mut);

        let grid = fmha_grid(kernel.tile, &args.shape, 1)?;
        Ok(self.launch(kernel.symbol, grid, kargs, stream)?)
    }

    fn synchronize(&self, stream: &CudaStream) -> tile_dispatch::Result<()> {
        Ok(self.ctx.synchronize_stream(stream)?)
    }
}
