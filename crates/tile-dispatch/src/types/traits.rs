use super::{DataType, MaskKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Additive bias applied to attention scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiasKind {
    None,
    /// Explicit bias tensor added elementwise to the scores.
    Elementwise,
    /// Per-head linear distance penalty.
    Alibi,
}

impl fmt::Display for BiasKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BiasKind::None => write!(f, "no_bias"),
            BiasKind::Elementwise => write!(f, "elementwise_bias"),
            BiasKind::Alibi => write!(f, "alibi"),
        }
    }
}

/// Quantization granularity of grouped GEMM inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantKind {
    None,
    /// One activation scale and one scale per expert.
    PerTensor,
    /// 128×128 block scales along N and K.
    PerBlock,
}

impl QuantKind {
    pub(crate) const fn ordinal(self) -> u8 {
        self as u8
    }

    pub const fn name(self) -> &'static str {
        match self {
            QuantKind::None => "noquant",
            QuantKind::PerTensor => "pertensor",
            QuantKind::PerBlock => "perblock",
        }
    }
}

/// Attention entry point a descriptor was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionVariant {
    Forward,
    SplitKv,
    BatchPrefill,
}

impl AttentionVariant {
    pub(crate) const fn ordinal(self) -> u8 {
        self as u8
    }

    pub const fn name(self) -> &'static str {
        match self {
            AttentionVariant::Forward => "fwd",
            AttentionVariant::SplitKv => "fwd_splitkv",
            AttentionVariant::BatchPrefill => "batch_prefill",
        }
    }
}

/// Which half of the two-stage MoE block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoeStage {
    /// Gate/up projection with fused activation.
    Stage1,
    /// Down projection with routing-weight reduction.
    Stage2,
}

impl MoeStage {
    pub(crate) const fn ordinal(self) -> u8 {
        self as u8
    }
}

/// Activation fused into the stage-1 epilogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActivationType {
    #[default]
    Silu,
    Gelu,
}

impl ActivationType {
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            ActivationType::Silu => x / (1.0 + (-x).exp()),
            ActivationType::Gelu => {
                // tanh approximation
                let c = (2.0f32 / std::f32::consts::PI).sqrt();
                0.5 * x * (1.0 + (c * (x + 0.044715 * x * x * x)).tanh())
            }
        }
    }
}

/// Operation a [`TraitDescriptor`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Attention(AttentionVariant),
    GroupedGemm(MoeStage),
}

/// Fully resolved kernel identity.
///
/// Built only through the functions in [`crate::config`]; fields that do not
/// apply to the described [`Operation`] hold neutral values (zero head sizes for
/// GEMM, no quantization and no swizzle for attention).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraitDescriptor {
    pub operation: Operation,
    pub activation: DataType,
    pub weight: DataType,
    pub accumulator: DataType,
    pub output: DataType,
    pub head_size_q: u32,
    pub head_size_v: u32,
    pub is_group_mode: bool,
    pub is_v_rowmajor: bool,
    pub has_logits_soft_cap: bool,
    pub mask_kind: MaskKind,
    pub bias_kind: BiasKind,
    pub has_lse: bool,
    pub has_dropout: bool,
    pub do_fp8_static_quant: bool,
    pub quantization: QuantKind,
    pub tile_swizzle: bool,
    /// Stage 1 weights hold gate and up halves (g1u1); false for a plain
    /// activated projection (g1u0).
    pub is_gated: bool,
}

impl TraitDescriptor {
    pub fn attention_variant(&self) -> Option<AttentionVariant> {
        match self.operation {
            Operation::Attention(v) => Some(v),
            Operation::GroupedGemm(_) => None,
        }
    }

    pub fn moe_stage(&self) -> Option<MoeStage> {
        match self.operation {
            Operation::GroupedGemm(s) => Some(s),
            Operation::Attention(_) => None,
        }
    }
}

impl fmt::Display for TraitDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operation {
            Operation::Attention(v) => write!(
                f,
                "{}[{} d{}x{} {}{} {} {}{}{}]",
                v.name(),
                self.activation,
                self.head_size_q,
                self.head_size_v,
                if self.is_group_mode { "group " } else { "batch " },
                self.mask_kind,
                self.bias_kind,
                if self.has_lse { "lse " } else { "" },
                if self.has_dropout { "dropout " } else { "" },
                if self.has_logits_soft_cap { "softcap" } else { "" },
            ),
            Operation::GroupedGemm(s) => write!(
                f,
                "moe_{:?}[{}x{}->{}->{} {}{}{}]",
                s,
                self.activation,
                self.weight,
                self.accumulator,
                self.output,
                self.quantization.name(),
                if self.tile_swizzle { " swizzle" } else { "" },
                if s == MoeStage::Stage1 && !self.is_gated { " g1u0" } else { "" },
            ),
        }
    }
}
