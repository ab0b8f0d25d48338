//! Grouped MoE GEMM specializations.

use super::{GemmKernel, TileShape};
use crate::types::{DataType, MoeStage, QuantKind};

/// Declare one grouped-GEMM family table.
///
/// Each entry is `(tile_m, tile_n, tile_k, vector_width, stages, partition, swizzled)`;
/// the symbol is derived from the family tag and the tile parameters.
macro_rules! gemm_family {
    (
        $name:ident, $tag:literal, $stage:ident,
        $act:ident, $wt:ident, $acc:ident, $out:ident, $quant:ident,
        [$((
            $m:literal, $n:literal, $k:literal,
            $vw:literal, $stages:literal, $part:literal, $swz:literal
        )),* $(,)?]
    ) => {
        const $name: &[GemmKernel] = &[
            $(
                GemmKernel {
                    symbol: concat!(
                        "moe_gemm_", $tag, "_", $m, "x", $n, "x", $k,
                        "_v", $vw, "_s", $stages, "_p", $part,
                        "_swz", $swz
                    ),
                    stage: MoeStage::$stage,
                    activation: DataType::$act,
                    weight: DataType::$wt,
                    accumulator: DataType::$acc,
                    output: DataType::$out,
                    quantization: QuantKind::$quant,
                    swizzled: $swz,
                    tile: TileShape { m: $m, n: $n, k: $k },
                    vector_width: $vw,
                    pipeline_stages: $stages,
                    partition: $part,
                },
            )*
        ];
    };
}

/// Stamp several families that share one entry list.
macro_rules! gemm_families {
    (
        $entries:tt;
        $($name:ident => (
            $tag:literal, $stage:ident,
            $act:ident, $wt:ident, $acc:ident, $out:ident, $quant:ident
        )),* $(,)?
    ) => {
        $(
            gemm_family!($name, $tag, $stage, $act, $wt, $acc, $out, $quant, $entries);
        )*
    };
}

// ============================================================================
// One-byte activations (fp8, int8): 16-wide vectors, K tile 128
// ============================================================================

gemm_families! {
    [
        (32, 128, 128, 16, 2, 1, false),
        (32, 128, 128, 16, 2, 1, true),
        (64, 128, 128, 16, 3, 2, false),
        (64, 128, 128, 16, 3, 2, true),
        (128, 128, 128, 16, 4, 4, false),
        (128, 128, 128, 16, 4, 4, true),
    ];
    S1_FP8_PERTENSOR => ("s1_fp8fp8_f32_bf16_pertensor", Stage1, Fp8, Fp8, Fp32, Bf16, PerTensor),
    S1_FP8_PERBLOCK => ("s1_fp8fp8_f32_bf16_perblock", Stage1, Fp8, Fp8, Fp32, Bf16, PerBlock),
    S1_I8_PERTENSOR => ("s1_i8i8_i32_bf16_pertensor", Stage1, Int8, Int8, Int32, Bf16, PerTensor),
    S2_FP8_PERTENSOR => ("s2_fp8fp8_f32_bf16_pertensor", Stage2, Fp8, Fp8, Fp32, Bf16, PerTensor),
    S2_FP8_PERBLOCK => ("s2_fp8fp8_f32_bf16_perblock", Stage2, Fp8, Fp8, Fp32, Bf16, PerBlock),
    S2_I8_PERTENSOR => ("s2_i8i8_i32_bf16_pertensor", Stage2, Int8, Int8, Int32, Bf16, PerTensor),
}

// ============================================================================
// Two-byte activations (bf16, fp16): 8-wide vectors, K tile 64
// ============================================================================

gemm_families! {
    [
        (32, 128, 64, 8, 2, 1, false),
        (32, 128, 64, 8, 2, 1, true),
        (64, 128, 64, 8, 3, 2, false),
        (64, 128, 64, 8, 3, 2, true),
        (128, 128, 64, 8, 4, 4, false),
        (128, 128, 64, 8, 4, 4, true),
    ];
    S1_BF16 => ("s1_bf16bf16_f32_bf16", Stage1, Bf16, Bf16, Fp32, Bf16, None),
    S1_FP16 => ("s1_f16f16_f32_f16", Stage1, Fp16, Fp16, Fp32, Fp16, None),
    S2_BF16 => ("s2_bf16bf16_f32_bf16", Stage2, Bf16, Bf16, Fp32, Bf16, None),
    S2_FP16 => ("s2_f16f16_f32_f16", Stage2, Fp16, Fp16, Fp32, Fp16, None),
}

/// Every grouped-GEMM family.
pub const GEMM_FAMILIES: &[&[GemmKernel]] = &[
    S1_FP8_PERTENSOR,
    S1_FP8_PERBLOCK,
    S1_I8_PERTENSOR,
    S1_BF16,
    S1_FP16,
    S2_FP8_PERTENSOR,
    S2_FP8_PERBLOCK,
    S2_I8_PERTENSOR,
    S2_BF16,
    S2_FP16,
];
