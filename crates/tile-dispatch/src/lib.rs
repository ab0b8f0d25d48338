//! Kernel selection and trait composition for grouped MoE GEMM and fused attention.
//!
//! This crate sits between callers that know a problem's shape and types and a
//! compute primitive that only knows how to run one fully specialized kernel.
//! A call flows through five layers:
//!
//! | Layer | Module | Output |
//! |-------|--------|--------|
//! | Trait descriptors | [`types`] | [`TraitDescriptor`] |
//! | Configuration builders | [`config`] | validated descriptor |
//! | Specialization registry | [`registry`] | `'static` kernel tables |
//! | Dispatcher | [`dispatch`] | one [`GemmKernel`] or [`FmhaKernel`] |
//! | Launch adapter | [`launch`] | elapsed milliseconds |
//!
//! The registry is declared with `macro_rules!` catalogs and checked for
//! totality and uniqueness at compile time, so a descriptor that passed its
//! builder always has exactly one kernel per bucket.
//!
//! # Supported Operations
//!
//! | Operation | Entry point | Types |
//! |-----------|-------------|-------|
//! | MoE gating and routing | [`moe::topk_softmax`], [`moe::moe_sorting`] | fp32 |
//! | MoE gate/up + activation | [`moe_gemm_stage1`] | fp8, int8, bf16, fp16 |
//! | MoE down + routing reduce | [`moe_gemm_stage2`] | fp8, int8, bf16, fp16 |
//! | Attention forward | [`mha_fwd`] | fp16, bf16 |
//! | Split-KV attention | [`mha_fwd_splitkv`] | fp16, bf16 |
//! | Paged batch prefill | [`mha_batch_prefill`] | fp16, bf16 |
//!
//! # Quick Start
//!
//! ```rust
//! use tile_dispatch::prelude::*;
//!
//! let traits = moe_gemm_traits(
//!     MoeStage::Stage2,
//!     DataType::Fp8,
//!     DataType::Fp8,
//!     DataType::Bf16,
//!     QuantKind::PerTensor,
//!     false,
//! )?;
//! assert_eq!(traits.accumulator, DataType::Fp32);
//!
//! // An expert tile of 100 rows runs on the 128-row specialization.
//! let kernel = select_gemm_kernel(&traits, 100)?;
//! assert_eq!(kernel.tile.m, 128);
//! # Ok::<(), tile_dispatch::DispatchError>(())
//! ```
//!
//! # Running on the Host
//!
//! [`HostBackend`] executes any registered kernel on the CPU. It is the
//! reference every device backend is checked against.
//!
//! ```rust
//! use tile_dispatch::prelude::*;
//!
//! let (tokens, n, k) = (2, 16, 32);
//! let sorting = moe_sorting(&[0, 1], &[1.0, 1.0], 1, 2, 32)?;
//! let sorted = sorting.host_buffers();
//! let input = HostBuffer::from_f32(DataType::Bf16, &vec![0.5; tokens * k]);
//! let weight = HostBuffer::from_f32(DataType::Bf16, &vec![0.25; 2 * n * k]);
//! let mut out = HostBuffer::zeros(DataType::Bf16, tokens * n);
//!
//! let traits = moe_gemm_traits(
//!     MoeStage::Stage2,
//!     DataType::Bf16,
//!     DataType::Bf16,
//!     DataType::Bf16,
//!     QuantKind::None,
//!     false,
//! )?;
//! let mut args = MoeGemmArgs {
//!     input: &input,
//!     weight: &weight,
//!     sorted_token_ids: &sorted.sorted_token_ids,
//!     sorted_expert_ids: &sorted.sorted_expert_ids,
//!     sorted_weights: Some(&sorted.sorted_weights),
//!     num_valid_ids: &sorted.num_valid_ids,
//!     a_scale: None,
//!     w_scale: None,
//!     out: &mut out,
//!     tokens,
//!     topk: 1,
//!     num_experts: 2,
//!     n,
//!     k,
//!     block_m: 32,
//!     activation: ActivationType::Silu,
//! };
//! let ms = moe_gemm_stage2(&HostBackend, &traits, &mut args, &StreamConfig::new(()))?;
//! assert_eq!(ms, 0.0);
//! assert!(out.to_f32().iter().all(|&x| (x - 4.0).abs() < 1e-2));
//! # Ok::<(), tile_dispatch::DispatchError>(())
//! ```
//!
//! # Features
//!
//! - `parallel` (default): compute host rows with rayon.

pub mod config;
pub mod dispatch;
pub mod epilogue;
pub mod error;
pub mod host;
pub mod launch;
pub mod moe;
pub mod registry;
pub mod types;

pub use config::{
    mha_batch_prefill_traits, mha_fwd_splitkv_traits, mha_fwd_traits, moe_gemm_traits,
    moe_gemm_ungated_traits, DispatchConfig,
};
pub use dispatch::{
    mha_batch_prefill, mha_fwd, mha_fwd_splitkv, moe_gemm_stage1, moe_gemm_stage2,
    select_fmha_kernel, select_gemm_kernel, suggest_num_splits,
};
pub use epilogue::{Epilogue, MultiplyMultiply};
pub use error::{DispatchError, Result};
pub use host::{HostBackend, HostBuffer};
pub use launch::{ComputeBackend, DeviceBuffer, StreamConfig};
pub use registry::{FmhaKernel, GemmKernel};
pub use types::{
    ActivationType, AttentionVariant, BiasKind, DataType, MaskInfo, MaskKind, MoeStage, QuantKind,
    TraitDescriptor,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{
        mha_batch_prefill_traits, mha_fwd_splitkv_traits, mha_fwd_traits, moe_gemm_traits,
        moe_gemm_ungated_traits,
    };
    pub use crate::dispatch::{
        mha_batch_prefill, mha_fwd, mha_fwd_splitkv, moe_gemm_stage1, moe_gemm_stage2,
        select_fmha_kernel, select_gemm_kernel,
    };
    pub use crate::error::{DispatchError, Result};
    pub use crate::host::{HostBackend, HostBuffer};
    pub use crate::launch::{
        AttentionParams, AttentionShape, BatchPrefillArgs, ComputeBackend, DeviceBuffer,
        FmhaFwdArgs, FmhaSplitKvArgs, MoeGemmArgs, PagedKv, StreamConfig,
    };
    pub use crate::moe::{moe_sorting, moe_sum, shuffle_weight, topk_softmax};
    pub use crate::types::{
        ActivationType, BiasKind, DataType, MaskInfo, MaskKind, MoeStage, QuantKind,
        TraitDescriptor,
    };
}
