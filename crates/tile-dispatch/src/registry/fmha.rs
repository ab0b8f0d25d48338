//! Fused attention specializations.

use super::{FmhaKernel, FmhaTile};
use crate::types::{AttentionVariant, DataType};

/// Declare one attention family table.
///
/// Each entry is `(head_size_q, head_size_v, tile_m0, tile_n0, vector_width, stages)`.
macro_rules! fmha_family {
    (
        $name:ident, $tag:literal, $variant:ident, $dtype:ident,
        [$((
            $hq:literal, $hv:literal, $m0:literal,
            $n0:literal, $vw:literal, $stages:literal
        )),* $(,)?]
    ) => {
        const $name: &[FmhaKernel] = &[
            $(
                FmhaKernel {
                    symbol: concat!(
                        "fmha_", $tag, "_d", $hq, "x", $hv,
                        "_m", $m0, "x", $n0, "_v", $vw, "_s", $stages
                    ),
                    variant: AttentionVariant::$variant,
                    dtype: DataType::$dtype,
                    head_size_q: $hq,
                    head_size_v: $hv,
                    tile: FmhaTile { m0: $m0, n0: $n0 },
                    vector_width: $vw,
                    pipeline_stages: $stages,
                },
            )*
        ];
    };
}

macro_rules! fmha_families {
    ($entries:tt; $($name:ident => ($tag:literal, $variant:ident, $dtype:ident)),* $(,)?) => {
        $(
            fmha_family!($name, $tag, $variant, $dtype, $entries);
        )*
    };
}

// Dense forward: wide KV tiles for mid-size heads, narrower once registers
// are taken by large head dimensions.
fmha_families! {
    [
        (32, 32, 16, 64, 8, 2), (32, 32, 64, 64, 8, 2), (32, 32, 128, 64, 8, 3),
        (64, 64, 16, 64, 8, 2), (64, 64, 64, 64, 8, 2), (64, 64, 128, 64, 8, 3),
        (96, 96, 16, 128, 8, 2), (96, 96, 64, 128, 8, 2), (96, 96, 128, 128, 8, 3),
        (128, 128, 16, 128, 8, 2), (128, 128, 64, 128, 8, 2), (128, 128, 128, 128, 8, 3),
        (192, 128, 16, 64, 8, 2), (192, 128, 64, 64, 8, 2), (192, 128, 128, 64, 8, 2),
        (256, 256, 16, 64, 8, 1), (256, 256, 64, 64, 8, 2), (256, 256, 128, 64, 8, 2),
    ];
    FWD_FP16 => ("fwd_f16", Forward, Fp16),
    FWD_BF16 => ("fwd_bf16", Forward, Bf16),
}

// Split-KV: each split walks a short KV range, so KV tiles stay narrow.
fmha_families! {
    [
        (32, 32, 16, 32, 8, 2), (32, 32, 64, 32, 8, 2), (32, 32, 128, 32, 8, 2),
        (64, 64, 16, 64, 8, 2), (64, 64, 64, 64, 8, 2), (64, 64, 128, 64, 8, 2),
        (96, 96, 16, 64, 8, 2), (96, 96, 64, 64, 8, 2), (96, 96, 128, 64, 8, 2),
        (128, 128, 16, 64, 8, 2), (128, 128, 64, 64, 8, 2), (128, 128, 128, 64, 8, 2),
        (192, 128, 16, 32, 8, 1), (192, 128, 64, 32, 8, 2), (192, 128, 128, 32, 8, 2),
        (256, 256, 16, 32, 8, 1), (256, 256, 64, 32, 8, 1), (256, 256, 128, 32, 8, 2),
    ];
    SPLITKV_FP16 => ("fwd_splitkv_f16", SplitKv, Fp16),
    SPLITKV_BF16 => ("fwd_splitkv_bf16", SplitKv, Bf16),
}

// Batch prefill: KV tiles sized to whole cache pages.
fmha_families! {
    [
        (32, 32, 16, 64, 8, 2), (32, 32, 64, 64, 8, 2), (32, 32, 128, 64, 8, 2),
        (64, 64, 16, 64, 8, 2), (64, 64, 64, 64, 8, 2), (64, 64, 128, 64, 8, 2),
        (96, 96, 16, 64, 8, 2), (96, 96, 64, 64, 8, 2), (96, 96, 128, 64, 8, 2),
        (128, 128, 16, 64, 8, 2), (128, 128, 64, 64, 8, 2), (128, 128, 128, 64, 8, 3),
        (192, 128, 16, 64, 8, 1), (192, 128, 64, 64, 8, 2), (192, 128, 128, 64, 8, 2),
        (256, 256, 16, 64, 8, 1), (256, 256, 64, 64, 8, 1), (256, 256, 128, 64, 8, 2),
    ];
    PREFILL_FP16 => ("batch_prefill_f16", BatchPrefill, Fp16),
    PREFILL_BF16 => ("batch_prefill_bf16", BatchPrefill, Bf16),
}

/// Every attention family.
pub const FMHA_FAMILIES: &[&[FmhaKernel]] = &[
    FWD_FP16,
    FWD_BF16,
    SPLITKV_FP16,
    SPLITKV_BF16,
    PREFILL_FP16,
    PREFILL_BF16,
];
