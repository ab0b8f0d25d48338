//! Trait descriptor value types.
//!
//! A kernel's identity is the combination of its element types, its attention
//! traits (head sizes, mask, bias, auxiliary outputs) or its grouped-GEMM traits
//! (quantization, weight swizzle). All of these are plain `Copy` values that
//! can be hashed, compared and serialized.
//!
//! # Element Types
//!
//! | Type | Bytes | Typical role |
//! |------|-------|--------------|
//! | [`DataType::Fp8`] | 1 | Quantized activations and weights |
//! | [`DataType::Int8`] | 1 | Quantized activations and weights |
//! | [`DataType::Fp16`] | 2 | Attention inputs, GEMM output |
//! | [`DataType::Bf16`] | 2 | Attention inputs, GEMM output |
//! | [`DataType::Fp32`] | 4 | Accumulator, LSE, scales |
//! | [`DataType::Int32`] | 4 | Integer accumulator, offsets |
//!
//! Accumulation always happens in a type wider than the activation; the
//! output is produced by one narrowing step in the epilogue.
//!
//! # Example
//!
//! ```rust
//! use tile_dispatch::types::{DataType, MaskInfo, MaskKind};
//!
//! let dtype: DataType = "bfloat16".parse().unwrap();
//! assert_eq!(dtype.byte_width(), 2);
//!
//! let mask: MaskInfo = "w:128,0".parse().unwrap();
//! assert_eq!(mask.kind, MaskKind::Window);
//! ```

mod dtype;
mod mask;
mod traits;

pub use dtype::{fp8_e4m3_decode, fp8_e4m3_encode, DataType, FP8_E4M3_MAX};
pub use mask::{MaskInfo, MaskKind};
pub use traits::{
    ActivationType, AttentionVariant, BiasKind, MoeStage, Operation, QuantKind, TraitDescriptor,
};
