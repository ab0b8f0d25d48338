use crate::error::{DispatchError, Result};
use crate::registry::{self, SUPPORTED_HEAD_SIZES};
use crate::types::{
    AttentionVariant, BiasKind, DataType, MaskInfo, MaskKind, MoeStage, Operation, QuantKind,
    TraitDescriptor,
};

/// V is always laid out row-major.
pub const V_ROWMAJOR: bool = true;

/// Static (compile-time) fp8 quantization is not exposed by these builders.
///
/// Callers that need it must construct a richer descriptor themselves; with
/// this policy fp8 attention has no registered family.
pub const FP8_STATIC_QUANT: bool = false;

/// Traits for the dense attention forward pass.
#[allow(clippy::too_many_arguments)]
pub fn mha_fwd_traits(
    head_size_q: u32,
    head_size_v: u32,
    dtype: &str,
    is_group_mode: bool,
    has_logits_soft_cap: bool,
    mask: &MaskInfo,
    bias_type: BiasKind,
    has_lse: bool,
    has_dropout: bool,
) -> Result<TraitDescriptor> {
    attention_traits(
        AttentionVariant::Forward,
        head_size_q,
        head_size_v,
        dtype,
        is_group_mode,
        has_logits_soft_cap,
        mask,
        bias_type,
        has_lse,
        has_dropout,
    )
}

/// Traits for split key/value attention. Split-KV never applies dropout.
#[allow(clippy::too_many_arguments)]
pub fn mha_fwd_splitkv_traits(
    head_size_q: u32,
    head_size_v: u32,
    dtype: &str,
    is_group_mode: bool,
    has_logits_soft_cap: bool,
    mask: &MaskInfo,
    bias_type: BiasKind,
    has_lse: bool,
) -> Result<TraitDescriptor> {
    attention_traits(
        AttentionVariant::SplitKv,
        head_size_q,
        head_size_v,
        dtype,
        is_group_mode,
        has_logits_soft_cap,
        mask,
        bias_type,
        has_lse,
        false,
    )
}

/// Traits for batched variable-length prefill over a paged KV cache.
#[allow(clippy::too_many_arguments)]
pub fn mha_batch_prefill_traits(
    head_size_q: u32,
    head_size_v: u32,
    dtype: &str,
    is_group_mode: bool,
    has_logits_soft_cap: bool,
    mask: &MaskInfo,
    bias_type: BiasKind,
    has_lse: bool,
    has_dropout: bool,
) -> Result<TraitDescriptor> {
    if !is_group_mode {
        return Err(DispatchError::UnsupportedConfiguration(
            "batch prefill requires group mode".into(),
        ));
    }
    if bias_type == BiasKind::Elementwise {
        return Err(DispatchError::UnsupportedConfiguration(
            "batch prefill does not support elementwise bias".into(),
        ));
    }
    attention_traits(
        AttentionVariant::BatchPrefill,
        head_size_q,
        head_size_v,
        dtype,
        is_group_mode,
        has_logits_soft_cap,
        mask,
        bias_type,
        has_lse,
        has_dropout,
    )
}

#[allow(clippy::too_many_arguments)]
fn attention_traits(
    variant: AttentionVariant,
    head_size_q: u32,
    head_size_v: u32,
    dtype: &str,
    is_group_mode: bool,
    has_logits_soft_cap: bool,
    mask: &MaskInfo,
    bias_type: BiasKind,
    has_lse: bool,
    has_dropout: bool,
) -> Result<TraitDescriptor> {
    if !SUPPORTED_HEAD_SIZES.contains(&(head_size_q, head_size_v)) {
        return Err(DispatchError::UnsupportedConfiguration(format!(
            "head sizes q={} v={} are not supported",
            head_size_q, head_size_v
        )));
    }

    let dtype: DataType = dtype.parse()?;
    if dtype == DataType::Fp8 && !FP8_STATIC_QUANT {
        return Err(DispatchError::UnsupportedConfiguration(
            "fp8 attention requires static quantization".into(),
        ));
    }
    if !registry::fmha_family_exists(variant, dtype) {
        return Err(DispatchError::UnsupportedConfiguration(format!(
            "no {} attention family for {}",
            variant.name(),
            dtype
        )));
    }

    if bias_type == BiasKind::Alibi && mask.kind == MaskKind::Window {
        return Err(DispatchError::UnsupportedConfiguration(
            "alibi bias cannot be combined with a sliding window mask".into(),
        ));
    }

    Ok(TraitDescriptor {
        operation: Operation::Attention(variant),
        activation: dtype,
        weight: dtype,
        accumulator: DataType::Fp32,
        output: dtype,
        head_size_q,
        head_size_v,
        is_group_mode,
        is_v_rowmajor: V_ROWMAJOR,
        has_logits_soft_cap,
        mask_kind: mask.kind,
        bias_kind: bias_type,
        has_lse,
        has_dropout,
        do_fp8_static_quant: FP8_STATIC_QUANT,
        quantization: QuantKind::None,
        tile_swizzle: false,
        is_gated: false,
    })
}

/// Traits for one stage of the grouped MoE GEMM.
///
/// The accumulator is derived: `Int32` for integer inputs, `Fp32` otherwise.
pub fn moe_gemm_traits(
    stage: MoeStage,
    activation: DataType,
    weight: DataType,
    output: DataType,
    quantization: QuantKind,
    tile_swizzle: bool,
) -> Result<TraitDescriptor> {
    let accumulator = if activation.is_integer() {
        DataType::Int32
    } else {
        DataType::Fp32
    };

    if !registry::gemm_family_exists(stage, activation, weight, accumulator, output, quantization)
    {
        return Err(DispatchError::UnsupportedConfiguration(format!(
            "no {:?} grouped GEMM family for {}x{}->{} with {}",
            stage,
            activation,
            weight,
            output,
            quantization.name()
        )));
    }

    Ok(TraitDescriptor {
        operation: Operation::GroupedGemm(stage),
        activation,
        weight,
        accumulator,
        output,
        head_size_q: 0,
        head_size_v: 0,
        is_group_mode: true,
        is_v_rowmajor: V_ROWMAJOR,
        has_logits_soft_cap: false,
        mask_kind: MaskKind::None,
        bias_kind: BiasKind::None,
        has_lse: false,
        has_dropout: false,
        do_fp8_static_quant: FP8_STATIC_QUANT,
        quantization,
        tile_swizzle,
        is_gated: stage == MoeStage::Stage1,
    })
}

/// Stage 1 traits for experts without a gate half: `out = act(x W^T)`.
///
/// Shares the stage 1 specialization families; only the epilogue differs.
pub fn moe_gemm_ungated_traits(
    activation: DataType,
    weight: DataType,
    output: DataType,
    quantization: QuantKind,
    tile_swizzle: bool,
) -> Result<TraitDescriptor> {
    let traits = moe_gemm_traits(
        MoeStage::Stage1,
        activation,
        weight,
        output,
        quantization,
        tile_swizzle,
    )?;
    Ok(TraitDescriptor {
        is_gated: false,
        ..traits
    })
}
