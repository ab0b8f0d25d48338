//! Kernel selection and the public launch entry points.
//!
//! Selection is purely structural: by the time a [`TraitDescriptor`] exists
//! every type decision has been made, so the dispatcher only has to place the
//! runtime problem size on a bucket ladder and look the result up in the
//! registry.
//!
//! | Entry point | Builder | Registry |
//! |-------------|---------|----------|
//! | [`moe_gemm_stage1`] | [`moe_gemm_traits`] (Stage1) | grouped GEMM |
//! | [`moe_gemm_stage2`] | [`moe_gemm_traits`] (Stage2) | grouped GEMM |
//! | [`mha_fwd`] | [`mha_fwd_traits`] | attention fwd |
//! | [`mha_fwd_splitkv`] | [`mha_fwd_splitkv_traits`] | attention split-KV |
//! | [`mha_batch_prefill`] | [`mha_batch_prefill_traits`] | attention batch prefill |
//!
//! Every entry point validates all buffers before the first launch; an error
//! return guarantees nothing was submitted.
//!
//! [`moe_gemm_traits`]: crate::config::moe_gemm_traits
//! [`mha_fwd_traits`]: crate::config::mha_fwd_traits
//! [`mha_fwd_splitkv_traits`]: crate::config::mha_fwd_splitkv_traits
//! [`mha_batch_prefill_traits`]: crate::config::mha_batch_prefill_traits

mod attention;
mod gemm;

use crate::config::DispatchConfig;
use crate::error::{DispatchError, Result};
use crate::registry::{
    self, gemm_tile_policy, FmhaKernel, FmhaKey, FmhaTile, GemmKernel, GemmKey,
    FMHA_Q_BUCKETS, GEMM_TILE_BUCKETS,
};
use crate::types::TraitDescriptor;

pub use attention::{mha_batch_prefill, mha_fwd, mha_fwd_splitkv};
pub use gemm::{moe_gemm_stage1, moe_gemm_stage2};

/// Smallest ladder rung `>= size`, if any.
const fn ladder_bucket(ladder: &[u32], size: u32) -> Option<u32> {
    let mut i = 0;
    while i < ladder.len() {
        if ladder[i] >= size {
            return Some(ladder[i]);
        }
        i += 1;
    }
    None
}

/// Row bucket for an expert tile of `tile_rows` rows.
///
/// Never under-allocates: the result is the smallest registered bucket that
/// covers the request.
pub fn gemm_bucket(tile_rows: u32) -> Result<u32> {
    if tile_rows == 0 {
        return Err(DispatchError::InvalidArgument(
            "expert tile size must be positive".into(),
        ));
    }
    ladder_bucket(&GEMM_TILE_BUCKETS, tile_rows).ok_or_else(|| {
        DispatchError::InvalidArgument(format!(
            "expert tile size {} exceeds the largest bucket {}",
            tile_rows,
            GEMM_TILE_BUCKETS[GEMM_TILE_BUCKETS.len() - 1]
        ))
    })
}

/// Query-row bucket for attention.
///
/// Queries longer than the largest bucket are covered by iterating that
/// bucket's tile, so they map onto it.
pub fn fmha_bucket(max_seqlen_q: u32) -> Result<u32> {
    if max_seqlen_q == 0 {
        return Err(DispatchError::InvalidArgument(
            "max_seqlen_q must be positive".into(),
        ));
    }
    Ok(ladder_bucket(&FMHA_Q_BUCKETS, max_seqlen_q)
        .unwrap_or(FMHA_Q_BUCKETS[FMHA_Q_BUCKETS.len() - 1]))
}

/// Select the grouped-GEMM specialization for an expert tile of `tile_rows`.
pub fn select_gemm_kernel(traits: &TraitDescriptor, tile_rows: u32) -> Result<&'static GemmKernel> {
    let stage = traits.moe_stage().ok_or_else(|| {
        DispatchError::InvalidArgument(format!("{} is not a grouped GEMM descriptor", traits))
    })?;
    let bucket = gemm_bucket(tile_rows)?;
    let policy = gemm_tile_policy(bucket, traits.activation.byte_width());

    let key = GemmKey {
        stage,
        activation: traits.activation,
        weight: traits.weight,
        accumulator: traits.accumulator,
        output: traits.output,
        quantization: traits.quantization,
        swizzled: traits.tile_swizzle,
        tile_m: bucket,
    };
    match registry::find_gemm(&key) {
        Some(kernel) if kernel.vector_width == policy.vector_width => {
            tracing::debug!(
                kernel = kernel.symbol,
                tile_rows,
                bucket,
                "selected grouped GEMM specialization"
            );
            Ok(kernel)
        }
        _ => {
            tracing::error!(traits = %traits, bucket, "grouped GEMM registry has no entry");
            Err(DispatchError::NoMatchingSpecialization(format!(
                "{} bucket {}",
                traits, bucket
            )))
        }
    }
}

/// Select the attention specialization for `max_seqlen_q` query rows.
pub fn select_fmha_kernel(
    traits: &TraitDescriptor,
    max_seqlen_q: u32,
) -> Result<&'static FmhaKernel> {
    let variant = traits.attention_variant().ok_or_else(|| {
        DispatchError::InvalidArgument(format!("{} is not an attention descriptor", traits))
    })?;
    let bucket = fmha_bucket(max_seqlen_q)?;

    let key = FmhaKey {
        variant,
        dtype: traits.activation,
        head_size_q: traits.head_size_q,
        head_size_v: traits.head_size_v,
        tile_m0: bucket,
    };
    match registry::find_fmha(&key) {
        Some(kernel) => {
            tracing::debug!(
                kernel = kernel.symbol,
                max_seqlen_q,
                bucket,
                "selected attention specialization"
            );
            Ok(kernel)
        }
        None => {
            tracing::error!(traits = %traits, bucket, "attention registry has no entry");
            Err(DispatchError::NoMatchingSpecialization(format!(
                "{} bucket {}",
                traits, bucket
            )))
        }
    }
}

/// Suggest a KV split count that keeps the device busy.
///
/// Splitting only pays off when the query work alone does not fill the device.
/// Candidate counts that do not change the per-split KV block count are
/// skipped, and the smallest count within 85% of the best wave efficiency wins.
pub fn suggest_num_splits(
    config: &DispatchConfig,
    batch: usize,
    nhead: usize,
    max_seqlen_q: usize,
    max_seqlen_k: usize,
    tile: FmhaTile,
) -> u32 {
    let num_cu = config.num_compute_units.max(1) as usize;
    let m_blocks = max_seqlen_q.div_ceil(tile.m0.max(1) as usize);
    let n_blocks = max_seqlen_k.div_ceil(tile.n0.max(1) as usize);
    let work = batch * nhead * m_blocks;

    if work as f32 >= 0.8 * num_cu as f32 || n_blocks <= 1 {
        return 1;
    }

    let max_splits = (config.max_num_splits as usize).min(num_cu).min(n_blocks);
    let eligible = |s: usize| s == 1 || n_blocks.div_ceil(s) != n_blocks.div_ceil(s - 1);

    let efficiency: Vec<f32> = (1..=max_splits)
        .map(|s| {
            if !eligible(s) {
                return 0.0;
            }
            let waves = (work * s) as f32 / num_cu as f32;
            waves / waves.ceil()
        })
        .collect();
    let best = efficiency.iter().cloned().fold(0.0f32, f32::max);

    (1..=max_splits)
        .find(|&s| eligible(s) && efficiency[s - 1] >= 0.85 * best)
        .unwrap_or(1) as u32
}
