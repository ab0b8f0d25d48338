//! Configuration builders and dispatch settings.
//!
//! The builders turn the small set of parameters callers actually choose into a
//! fully resolved [`TraitDescriptor`], injecting fixed policy and rejecting
//! combinations no specialization family covers:
//!
//! | Builder | Operation |
//! |---------|-----------|
//! | [`mha_fwd_traits`] | Dense attention forward |
//! | [`mha_fwd_splitkv_traits`] | Split key/value attention forward |
//! | [`mha_batch_prefill_traits`] | Batched variable-length prefill |
//! | [`moe_gemm_traits`] | Grouped MoE GEMM, stage 1 or 2 |
//! | [`moe_gemm_ungated_traits`] | Stage 1 without a gate half |
//!
//! [`DispatchConfig`] holds the tunables that are not part of a kernel's
//! identity (device occupancy for the split heuristic, timing repetitions).
//!
//! [`TraitDescriptor`]: crate::types::TraitDescriptor

mod builder;
mod settings;

pub use builder::{
    mha_batch_prefill_traits, mha_fwd_splitkv_traits, mha_fwd_traits, moe_gemm_traits,
    moe_gemm_ungated_traits, FP8_STATIC_QUANT, V_ROWMAJOR,
};
pub use crate::registry::SUPPORTED_HEAD_SIZES;
pub use settings::{global_config, init_global_config, DispatchConfig};
