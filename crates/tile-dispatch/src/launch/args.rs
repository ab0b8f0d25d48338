use super::{check_buffer, DeviceBuffer};
use crate::error::{DispatchError, Result};
use crate::moe::{shuffle_col_tile, SHUFFLE_ROWS};
use crate::types::{ActivationType, BiasKind, DataType, MoeStage, QuantKind, TraitDescriptor};

/// Edge of a per-block quantization block along N and K.
pub const QUANT_BLOCK: usize = 128;

// ============================================================================
// Grouped MoE GEMM
// ============================================================================

/// Arguments for one grouped-GEMM stage.
///
/// Rows are addressed through the sorted routing produced by
/// [`moe_sorting`](crate::moe::moe_sorting): each `block_m` run of
/// `sorted_token_ids` belongs to the expert at the same position of
/// `sorted_expert_ids`.
///
/// | Buffer | Stage 1 | Stage 2 |
/// |--------|---------|---------|
/// | `input` | `[tokens, k]` | `[tokens * topk, k]` |
/// | `weight` | `[experts, n, k]`, `n = 2 * inter` | `[experts, n, k]` |
/// | `out` | `[tokens, topk, n / 2]` | `[tokens, n]` |
///
/// Ungated stage 1 descriptors read `n = inter` and write `[tokens, topk, n]`.
#[derive(Debug)]
pub struct MoeGemmArgs<'a, B> {
    pub input: &'a B,
    /// Row-major or pre-shuffled, matching the descriptor's swizzle flag.
    pub weight: &'a B,
    /// Int32, packed `slot << 24 | token`.
    pub sorted_token_ids: &'a B,
    /// Int32, one expert per `block_m` rows.
    pub sorted_expert_ids: &'a B,
    /// Fp32 routing weights aligned with `sorted_token_ids`; stage 2 only.
    pub sorted_weights: Option<&'a B>,
    /// Int32 `[1]`: number of meaningful entries in `sorted_token_ids`.
    pub num_valid_ids: &'a B,
    /// Fp32 activation scales: `[1]` per tensor, `[rows, k / 128]` per block.
    pub a_scale: Option<&'a B>,
    /// Fp32 weight scales: `[experts]` per tensor, `[experts, n / 128, k / 128]` per block.
    pub w_scale: Option<&'a B>,
    pub out: &'a mut B,
    pub tokens: usize,
    pub topk: usize,
    pub num_experts: usize,
    pub n: usize,
    pub k: usize,
    /// Expert tile rows; the dispatcher buckets this value.
    pub block_m: usize,
    /// Fused stage-1 activation.
    pub activation: ActivationType,
}

impl<B> MoeGemmArgs<'_, B> {
    pub fn input_rows(&self, stage: MoeStage) -> usize {
        match stage {
            MoeStage::Stage1 => self.tokens,
            MoeStage::Stage2 => self.tokens * self.topk,
        }
    }

    /// Columns stage 1 writes per routed row, or stage 2 per token.
    pub fn output_cols(&self, stage: MoeStage, gated: bool) -> usize {
        match stage {
            MoeStage::Stage1 if gated => self.n / 2,
            MoeStage::Stage1 => self.n,
            MoeStage::Stage2 => self.n,
        }
    }

    pub fn output_len(&self, stage: MoeStage, gated: bool) -> usize {
        let rows = match stage {
            MoeStage::Stage1 => self.tokens * self.topk,
            MoeStage::Stage2 => self.tokens,
        };
        rows * self.output_cols(stage, gated)
    }
}

pub(crate) fn validate_moe<B: DeviceBuffer>(
    traits: &TraitDescriptor,
    stage: MoeStage,
    args: &MoeGemmArgs<'_, B>,
) -> Result<()> {
    if traits.moe_stage() != Some(stage) {
        return Err(DispatchError::InvalidArgument(format!(
            "descriptor {} used for {:?}",
            traits, stage
        )));
    }
    if args.tokens == 0 || args.topk == 0 || args.num_experts == 0 || args.n == 0 || args.k == 0 {
        return Err(DispatchError::InvalidArgument(format!(
            "empty grouped GEMM problem: tokens={} topk={} experts={} n={} k={}",
            args.tokens, args.topk, args.num_experts, args.n, args.k
        )));
    }
    if args.topk > args.num_experts {
        return Err(DispatchError::InvalidArgument(format!(
            "topk {} exceeds expert count {}",
            args.topk, args.num_experts
        )));
    }
    if stage == MoeStage::Stage1 && traits.is_gated && args.n % 2 != 0 {
        return Err(DispatchError::InvalidArgument(format!(
            "stage 1 needs gate and up halves, n={} is odd",
            args.n
        )));
    }

    if traits.tile_swizzle
        && (args.n % SHUFFLE_ROWS != 0 || args.k % shuffle_col_tile(traits.weight) != 0)
    {
        return Err(DispatchError::InvalidArgument(format!(
            "pre-shuffled weights need n % {} == 0 and k % {} == 0, got n={} k={}",
            SHUFFLE_ROWS,
            shuffle_col_tile(traits.weight),
            args.n,
            args.k
        )));
    }

    let rows = args.input_rows(stage);
    check_buffer("input", args.input, traits.activation, rows * args.k)?;
    check_buffer(
        "weight",
        args.weight,
        traits.weight,
        args.num_experts * args.n * args.k,
    )?;
    check_buffer("out", &*args.out, traits.output, args.output_len(stage, traits.is_gated))?;

    let blocks = args.sorted_expert_ids.len();
    check_buffer("sorted_expert_ids", args.sorted_expert_ids, DataType::Int32, blocks)?;
    check_buffer(
        "sorted_token_ids",
        args.sorted_token_ids,
        DataType::Int32,
        blocks * args.block_m,
    )?;
    check_buffer("num_valid_ids", args.num_valid_ids, DataType::Int32, 1)?;
    match (stage, args.sorted_weights) {
        (MoeStage::Stage2, Some(w)) => {
            check_buffer("sorted_weights", w, DataType::Fp32, blocks * args.block_m)?
        }
        (MoeStage::Stage2, None) => {
            return Err(DispatchError::InvalidArgument(
                "stage 2 needs sorted_weights".into(),
            ))
        }
        (MoeStage::Stage1, _) => {}
    }

    let k_blocks = args.k.div_ceil(QUANT_BLOCK);
    let n_blocks = args.n.div_ceil(QUANT_BLOCK);
    let (a_len, w_len) = match traits.quantization {
        QuantKind::None => {
            if args.a_scale.is_some() || args.w_scale.is_some() {
                return Err(DispatchError::InvalidArgument(
                    "unquantized GEMM takes no scales".into(),
                ));
            }
            return Ok(());
        }
        QuantKind::PerTensor => (1, args.num_experts),
        QuantKind::PerBlock => (rows * k_blocks, args.num_experts * n_blocks * k_blocks),
    };
    let a_scale = args
        .a_scale
        .ok_or_else(|| DispatchError::InvalidArgument("a_scale required".into()))?;
    let w_scale = args
        .w_scale
        .ok_or_else(|| DispatchError::InvalidArgument("w_scale required".into()))?;
    check_buffer("a_scale", a_scale, DataType::Fp32, a_len)?;
    check_buffer("w_scale", w_scale, DataType::Fp32, w_len)
}

// ============================================================================
// Attention
// ============================================================================

/// Problem dimensions shared by the attention entry points.
///
/// In batch mode `seqlen_q`/`seqlen_k` are per-sequence lengths and tensors
/// are `[batch, seqlen, nhead, hdim]`. In group mode they are the total row
/// counts of the packed `[total, nhead, hdim]` tensors and per-sequence
/// boundaries come from the seqstart buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionShape {
    pub batch: usize,
    pub nhead_q: usize,
    pub nhead_k: usize,
    pub seqlen_q: usize,
    pub seqlen_k: usize,
    pub max_seqlen_q: usize,
    pub max_seqlen_k: usize,
    pub hdim_q: usize,
    pub hdim_v: usize,
}

impl AttentionShape {
    /// Dense batch-mode shape with equal-length sequences.
    pub fn batch(
        batch: usize,
        nhead: usize,
        seqlen_q: usize,
        seqlen_k: usize,
        hdim_q: usize,
        hdim_v: usize,
    ) -> Self {
        Self {
            batch,
            nhead_q: nhead,
            nhead_k: nhead,
            seqlen_q,
            seqlen_k,
            max_seqlen_q: seqlen_q,
            max_seqlen_k: seqlen_k,
            hdim_q,
            hdim_v,
        }
    }

    /// Group-mode shape over packed sequences.
    ///
    /// `total_q`/`total_k` are the packed row counts; `max_seqlen_*` bound the
    /// longest single sequence and size the elementwise bias.
    #[allow(clippy::too_many_arguments)]
    pub fn group(
        batch: usize,
        nhead: usize,
        total_q: usize,
        total_k: usize,
        max_seqlen_q: usize,
        max_seqlen_k: usize,
        hdim_q: usize,
        hdim_v: usize,
    ) -> Self {
        Self {
            batch,
            nhead_q: nhead,
            nhead_k: nhead,
            seqlen_q: total_q,
            seqlen_k: total_k,
            max_seqlen_q,
            max_seqlen_k,
            hdim_q,
            hdim_v,
        }
    }

    /// Grouped-query attention: `nhead_q` query heads share `nhead_k` KV heads.
    pub fn with_kv_heads(mut self, nhead_k: usize) -> Self {
        self.nhead_k = nhead_k;
        self
    }

    pub fn rows_q(&self, group_mode: bool) -> usize {
        if group_mode {
            self.seqlen_q
        } else {
            self.batch * self.seqlen_q
        }
    }

    pub fn rows_k(&self, group_mode: bool) -> usize {
        if group_mode {
            self.seqlen_k
        } else {
            self.batch * self.seqlen_k
        }
    }

    /// LSE elements: `[batch, nhead, seqlen_q]` or `[nhead, total_q]`.
    pub fn lse_len(&self, group_mode: bool) -> usize {
        self.nhead_q * self.rows_q(group_mode)
    }
}

/// Scalar attention parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttentionParams {
    /// Score scale, usually `1 / sqrt(hdim_q)`.
    pub scale_s: f32,
    /// `cap * tanh(s / cap)` when positive.
    pub logits_soft_cap: f32,
    pub p_drop: f32,
    pub drop_seed: u64,
    pub drop_offset: u64,
}

impl AttentionParams {
    pub fn new(hdim_q: usize) -> Self {
        Self {
            scale_s: 1.0 / (hdim_q.max(1) as f32).sqrt(),
            logits_soft_cap: 0.0,
            p_drop: 0.0,
            drop_seed: 0,
            drop_offset: 0,
        }
    }

    pub fn with_soft_cap(mut self, cap: f32) -> Self {
        self.logits_soft_cap = cap;
        self
    }

    pub fn with_dropout(mut self, p_drop: f32, seed: u64, offset: u64) -> Self {
        self.p_drop = p_drop;
        self.drop_seed = seed;
        self.drop_offset = offset;
        self
    }

    pub fn has_logits_soft_cap(&self) -> bool {
        self.logits_soft_cap > 0.0
    }

    pub fn has_dropout(&self) -> bool {
        self.p_drop > 0.0
    }
}

/// Dense attention forward.
#[derive(Debug)]
pub struct FmhaFwdArgs<'a, B> {
    pub q: &'a B,
    pub k: &'a B,
    pub v: &'a B,
    /// Elementwise bias `[nhead, max_seqlen_q, max_seqlen_k]` or ALiBi slopes `[nhead]` Fp32.
    pub bias: Option<&'a B>,
    /// Int32 `[batch + 1]`, group mode only.
    pub seqstart_q: Option<&'a B>,
    pub seqstart_k: Option<&'a B>,
    pub out: &'a mut B,
    pub lse: Option<&'a mut B>,
    pub shape: AttentionShape,
    pub params: AttentionParams,
}

/// Split key/value attention forward.
///
/// Each split writes an unnormalized partial into the caller's workspace;
/// the partials are then combined into `out`.
#[derive(Debug)]
pub struct FmhaSplitKvArgs<'a, B> {
    pub q: &'a B,
    pub k: &'a B,
    pub v: &'a B,
    pub bias: Option<&'a B>,
    pub seqstart_q: Option<&'a B>,
    pub seqstart_k: Option<&'a B>,
    pub out: &'a mut B,
    pub lse: Option<&'a mut B>,
    /// Fp32 `[num_splits, lse_len]`.
    pub lse_acc: &'a mut B,
    /// Fp32 `[num_splits, lse_len, hdim_v]`.
    pub o_acc: &'a mut B,
    pub num_splits: usize,
    pub shape: AttentionShape,
    pub params: AttentionParams,
}

/// Paged key/value cache for batch prefill.
#[derive(Debug)]
pub struct PagedKv<'a, B> {
    /// `[num_pages, page_block_size, nhead_k, hdim_q]`.
    pub k_pages: &'a B,
    /// `[num_pages, page_block_size, nhead_k, hdim_v]`.
    pub v_pages: &'a B,
    /// Int32 `[batch + 1]`: page range of each sequence in `kv_page_indices`.
    pub kv_indptr: &'a B,
    /// Int32 page ids.
    pub kv_page_indices: &'a B,
    /// Int32 `[batch]`: used slots in each sequence's last page.
    pub kv_last_page_lens: &'a B,
    pub num_pages: usize,
    pub page_block_size: usize,
}

/// Batched variable-length prefill over a paged KV cache. Always group mode.
#[derive(Debug)]
pub struct BatchPrefillArgs<'a, B> {
    /// Packed `[total_q, nhead_q, hdim_q]`.
    pub q: &'a B,
    pub kv: PagedKv<'a, B>,
    /// ALiBi slopes `[nhead]` Fp32.
    pub bias: Option<&'a B>,
    /// Int32 `[batch + 1]`.
    pub seqstart_q: &'a B,
    pub out: &'a mut B,
    pub lse: Option<&'a mut B>,
    pub shape: AttentionShape,
    pub params: AttentionParams,
}

fn validate_heads(traits: &TraitDescriptor, shape: &AttentionShape) -> Result<()> {
    if shape.batch == 0 || shape.nhead_q == 0 || shape.nhead_k == 0 {
        return Err(DispatchError::InvalidArgument(format!(
            "empty attention problem: batch={} nhead_q={} nhead_k={}",
            shape.batch, shape.nhead_q, shape.nhead_k
        )));
    }
    if shape.nhead_q % shape.nhead_k != 0 {
        return Err(DispatchError::InvalidArgument(format!(
            "nhead_q {} is not a multiple of nhead_k {}",
            shape.nhead_q, shape.nhead_k
        )));
    }
    if shape.hdim_q != traits.head_size_q as usize || shape.hdim_v != traits.head_size_v as usize {
        return Err(DispatchError::InvalidArgument(format!(
            "head dims {}x{} do not match descriptor {}x{}",
            shape.hdim_q, shape.hdim_v, traits.head_size_q, traits.head_size_v
        )));
    }
    if shape.seqlen_q == 0 || shape.max_seqlen_q == 0 {
        return Err(DispatchError::InvalidArgument("empty query".into()));
    }
    Ok(())
}

fn validate_bias<B: DeviceBuffer>(
    traits: &TraitDescriptor,
    shape: &AttentionShape,
    bias: Option<&B>,
) -> Result<()> {
    match (traits.bias_kind, bias) {
        (BiasKind::None, None) => Ok(()),
        (BiasKind::None, Some(_)) => Err(DispatchError::InvalidArgument(
            "bias buffer given but no bias requested".into(),
        )),
        (_, None) => Err(DispatchError::InvalidArgument(format!(
            "{} requested without a bias buffer",
            traits.bias_kind
        ))),
        (BiasKind::Elementwise, Some(b)) => check_buffer(
            "bias",
            b,
            traits.activation,
            shape.nhead_q * shape.max_seqlen_q * shape.max_seqlen_k,
        ),
        (BiasKind::Alibi, Some(b)) => check_buffer(
            "alibi_slopes",
            b,
            DataType::Fp32,
            shape.nhead_q,
        ),
    }
}

fn validate_lse<B: DeviceBuffer>(
    traits: &TraitDescriptor,
    shape: &AttentionShape,
    lse: Option<&B>,
) -> Result<()> {
    match (traits.has_lse, lse) {
        (true, Some(l)) => check_buffer(
            "lse",
            l,
            DataType::Fp32,
            shape.lse_len(traits.is_group_mode),
        ),
        (true, None) => Err(DispatchError::InvalidArgument(
            "lse requested without an lse buffer".into(),
        )),
        (false, Some(_)) => Err(DispatchError::InvalidArgument(
            "lse buffer given but lse not requested".into(),
        )),
        (false, None) => Ok(()),
    }
}

fn validate_seqstart<B: DeviceBuffer>(
    name: &str,
    shape: &AttentionShape,
    group_mode: bool,
    buf: Option<&B>,
) -> Result<()> {
    match (group_mode, buf) {
        (true, Some(b)) => check_buffer(name, b, DataType::Int32, shape.batch + 1),
        (true, None) => Err(DispatchError::InvalidArgument(format!(
            "group mode requires {}",
            name
        ))),
        (false, Some(_)) => Err(DispatchError::InvalidArgument(format!(
            "{} is only used in group mode",
            name
        ))),
        (false, None) => Ok(()),
    }
}

fn validate_qkvo<B: DeviceBuffer>(
    traits: &TraitDescriptor,
    shape: &AttentionShape,
    q: &B,
    k: &B,
    v: &B,
    out: &B,
) -> Result<()> {
    let g = traits.is_group_mode;
    let dtype = traits.activation;
    check_buffer("q", q, dtype, shape.rows_q(g) * shape.nhead_q * shape.hdim_q)?;
    check_buffer("k", k, dtype, shape.rows_k(g) * shape.nhead_k * shape.hdim_q)?;
    check_buffer("v", v, dtype, shape.rows_k(g) * shape.nhead_k * shape.hdim_v)?;
    check_buffer("out", out, traits.output, shape.rows_q(g) * shape.nhead_q * shape.hdim_v)
}

pub(crate) fn validate_fwd<B: DeviceBuffer>(
    traits: &TraitDescriptor,
    args: &FmhaFwdArgs<'_, B>,
) -> Result<()> {
    let shape = &args.shape;
    validate_heads(traits, shape)?;
    validate_qkvo(traits, shape, args.q, args.k, args.v, &*args.out)?;
    validate_seqstart("seqstart_q", shape, traits.is_group_mode, args.seqstart_q)?;
    validate_seqstart("seqstart_k", shape, traits.is_group_mode, args.seqstart_k)?;
    validate_bias(traits, shape, args.bias)?;
    validate_lse(traits, shape, args.lse.as_deref())?;
    if args.params.p_drop < 0.0 || args.params.p_drop >= 1.0 {
        return Err(DispatchError::InvalidArgument(format!(
            "dropout probability {} outside [0, 1)",
            args.params.p_drop
        )));
    }
    Ok(())
}

pub(crate) fn validate_splitkv<B: DeviceBuffer>(
    traits: &TraitDescriptor,
    args: &FmhaSplitKvArgs<'_, B>,
) -> Result<()> {
    let shape = &args.shape;
    validate_heads(traits, shape)?;
    validate_qkvo(traits, shape, args.q, args.k, args.v, &*args.out)?;
    validate_seqstart("seqstart_q", shape, traits.is_group_mode, args.seqstart_q)?;
    validate_seqstart("seqstart_k", shape, traits.is_group_mode, args.seqstart_k)?;
    validate_bias(traits, shape, args.bias)?;
    validate_lse(traits, shape, args.lse.as_deref())?;
    if args.params.has_dropout() {
        return Err(DispatchError::InvalidArgument(
            "split-KV attention does not apply dropout".into(),
        ));
    }
    if args.num_splits == 0 {
        return Err(DispatchError::InvalidArgument("num_splits must be positive".into()));
    }
    let rows = shape.lse_len(traits.is_group_mode);
    check_buffer("lse_acc", &*args.lse_acc, DataType::Fp32, args.num_splits * rows)?;
    check_buffer(
        "o_acc",
        &*args.o_acc,
        DataType::Fp32,
        args.num_splits * rows * shape.hdim_v,
    )
}

pub(crate) fn validate_batch_prefill<B: DeviceBuffer>(
    traits: &TraitDescriptor,
    args: &BatchPrefillArgs<'_, B>,
) -> Result<()> {
    let shape = &args.shape;
    validate_heads(traits, shape)?;
    let dtype = traits.activation;
    let kv = &args.kv;
    if kv.page_block_size == 0 || kv.num_pages == 0 {
        return Err(DispatchError::InvalidArgument("empty paged KV cache".into()));
    }
    check_buffer("q", args.q, dtype, shape.seqlen_q * shape.nhead_q * shape.hdim_q)?;
    check_buffer(
        "out",
        &*args.out,
        traits.output,
        shape.seqlen_q * shape.nhead_q * shape.hdim_v,
    )?;
    let slots = kv.num_pages * kv.page_block_size * shape.nhead_k;
    check_buffer("k_pages", kv.k_pages, dtype, slots * shape.hdim_q)?;
    check_buffer("v_pages", kv.v_pages, dtype, slots * shape.hdim_v)?;
    check_buffer("kv_indptr", kv.kv_indptr, DataType::Int32, shape.batch + 1)?;
    check_buffer("kv_last_page_lens", kv.kv_last_page_lens, DataType::Int32, shape.batch)?;
    if kv.kv_page_indices.dtype() != DataType::Int32 || kv.kv_page_indices.is_empty() {
        return Err(DispatchError::InvalidArgument(
            "kv_page_indices must be a non-empty Int32 buffer".into(),
        ));
    }
    validate_seqstart("seqstart_q", shape, true, Some(args.seqstart_q))?;
    validate_bias(traits, shape, args.bias)?;
    validate_lse(traits, shape, args.lse.as_deref())?;
    if args.params.p_drop < 0.0 || args.params.p_drop >= 1.0 {
        return Err(DispatchError::InvalidArgument(format!(
            "dropout probability {} outside [0, 1)",
            args.params.p_drop
        )));
    }
    Ok(())
}
