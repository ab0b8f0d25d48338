//! Static catalog of compiled kernel specializations.
//!
//! Every specialization is one fixed-parameter kernel variant bound to a
//! concrete tile shape, vector width, pipeline depth and partition. They are
//! declared by macro invocation, one `const` table per family, and collected
//! into two `'static` registries:
//!
//! | Registry | Family key | Bucket axis |
//! |----------|------------|-------------|
//! | [`GEMM_FAMILIES`] | stage, element types, quantization | tile rows {32, 64, 128} × swizzle |
//! | [`FMHA_FAMILIES`] | variant, element type | head pair × query rows {16, 64, 128} |
//!
//! # Totality
//!
//! The dispatcher only ever asks for keys on its bucket ladders. `const`
//! assertions at the bottom of this module walk both registries and require
//! exactly one entry per (family, bucket) cell, with tile parameters matching
//! the [`gemm_tile_policy`] lookup, and globally unique kernel symbols. A
//! missing or duplicated entry is a compile error, never a runtime fallback.
//!
//! # Concurrency
//!
//! Both registries are `const` data promoted to `'static` memory; lookups take
//! no locks and can run from any number of threads.

mod fmha;
mod gemm;

use crate::types::{AttentionVariant, DataType, MoeStage, QuantKind};
use serde::Serialize;
use std::fmt;

pub use fmha::FMHA_FAMILIES;
pub use gemm::GEMM_FAMILIES;

/// Bytes moved per vector load, independent of element width.
pub const VECTOR_BYTES: usize = 16;

/// Row-tile ladder for grouped GEMM expert tiles.
pub const GEMM_TILE_BUCKETS: [u32; 3] = [32, 64, 128];

/// Query-tile ladder for attention.
pub const FMHA_Q_BUCKETS: [u32; 3] = [16, 64, 128];

/// Supported `(head_size_q, head_size_v)` pairs; every attention family
/// covers all of them.
pub const SUPPORTED_HEAD_SIZES: [(u32, u32); 6] =
    [(32, 32), (64, 64), (96, 96), (128, 128), (192, 128), (256, 256)];

/// GEMM block tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TileShape {
    pub m: u32,
    pub n: u32,
    pub k: u32,
}

/// Attention block tile: query rows and key/value columns per iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FmhaTile {
    pub m0: u32,
    pub n0: u32,
}

/// Per-bucket tile parameters shared by the registry and the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePolicy {
    pub vector_width: u32,
    pub pipeline_stages: u32,
    pub partition: u32,
}

/// Vector width and pipeline shape for a row bucket and activation width.
///
/// Narrower elements get proportionally wider vectors so every vector
/// instruction moves [`VECTOR_BYTES`].
pub const fn gemm_tile_policy(bucket: u32, activation_bytes: usize) -> TilePolicy {
    let (pipeline_stages, partition) = match bucket {
        0..=32 => (2, 1),
        33..=64 => (3, 2),
        _ => (4, 4),
    };
    TilePolicy {
        vector_width: (VECTOR_BYTES / activation_bytes) as u32,
        pipeline_stages,
        partition,
    }
}

/// One grouped-GEMM specialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct GemmKernel {
    /// Compiled kernel symbol.
    pub symbol: &'static str,
    pub stage: MoeStage,
    pub activation: DataType,
    pub weight: DataType,
    pub accumulator: DataType,
    pub output: DataType,
    pub quantization: QuantKind,
    /// Weights are expected in the pre-shuffled layout.
    pub swizzled: bool,
    pub tile: TileShape,
    pub vector_width: u32,
    pub pipeline_stages: u32,
    pub partition: u32,
}

impl GemmKernel {
    const fn same_family(&self, other: &GemmKernel) -> bool {
        self.stage.ordinal() == other.stage.ordinal()
            && self.activation.ordinal() == other.activation.ordinal()
            && self.weight.ordinal() == other.weight.ordinal()
            && self.accumulator.ordinal() == other.accumulator.ordinal()
            && self.output.ordinal() == other.output.ordinal()
            && self.quantization.ordinal() == other.quantization.ordinal()
    }

    const fn matches_policy(&self) -> bool {
        let policy = gemm_tile_policy(self.tile.m, self.activation.byte_width());
        self.vector_width == policy.vector_width
            && self.pipeline_stages == policy.pipeline_stages
            && self.partition == policy.partition
    }
}

impl fmt::Display for GemmKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol)
    }
}

/// One attention specialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FmhaKernel {
    pub symbol: &'static str,
    pub variant: AttentionVariant,
    pub dtype: DataType,
    pub head_size_q: u32,
    pub head_size_v: u32,
    pub tile: FmhaTile,
    pub vector_width: u32,
    pub pipeline_stages: u32,
}

impl fmt::Display for FmhaKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol)
    }
}

/// Lookup key for a grouped-GEMM specialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GemmKey {
    pub stage: MoeStage,
    pub activation: DataType,
    pub weight: DataType,
    pub accumulator: DataType,
    pub output: DataType,
    pub quantization: QuantKind,
    pub swizzled: bool,
    /// Minimum tile rows the kernel must cover.
    pub tile_m: u32,
}

impl GemmKey {
    fn family_matches(&self, k: &GemmKernel) -> bool {
        k.stage == self.stage
            && k.activation == self.activation
            && k.weight == self.weight
            && k.accumulator == self.accumulator
            && k.output == self.output
            && k.quantization == self.quantization
    }
}

/// Lookup key for an attention specialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FmhaKey {
    pub variant: AttentionVariant,
    pub dtype: DataType,
    pub head_size_q: u32,
    pub head_size_v: u32,
    /// Minimum query rows the kernel must cover.
    pub tile_m0: u32,
}

/// Find the GEMM specialization for `key`.
///
/// Among structurally matching entries whose tile covers `key.tile_m`, the
/// one with the smallest tile wins.
pub fn find_gemm(key: &GemmKey) -> Option<&'static GemmKernel> {
    gemm_kernels()
        .filter(|k| key.family_matches(k) && k.swizzled == key.swizzled && k.tile.m >= key.tile_m)
        .min_by_key(|k| k.tile.m)
}

/// Find the attention specialization for `key`, tightest query tile first.
pub fn find_fmha(key: &FmhaKey) -> Option<&'static FmhaKernel> {
    fmha_kernels()
        .filter(|k| {
            k.variant == key.variant
                && k.dtype == key.dtype
                && k.head_size_q == key.head_size_q
                && k.head_size_v == key.head_size_v
                && k.tile.m0 >= key.tile_m0
        })
        .min_by_key(|k| k.tile.m0)
}

/// Whether any GEMM family covers this element/quantization combination.
pub fn gemm_family_exists(
    stage: MoeStage,
    activation: DataType,
    weight: DataType,
    accumulator: DataType,
    output: DataType,
    quantization: QuantKind,
) -> bool {
    GEMM_FAMILIES.iter().any(|family| {
        let k = &family[0];
        k.stage == stage
            && k.activation == activation
            && k.weight == weight
            && k.accumulator == accumulator
            && k.output == output
            && k.quantization == quantization
    })
}

/// Whether an attention family exists for this variant and element type.
pub fn fmha_family_exists(variant: AttentionVariant, dtype: DataType) -> bool {
    FMHA_FAMILIES
        .iter()
        .any(|family| family[0].variant == variant && family[0].dtype == dtype)
}

/// All grouped-GEMM specializations.
pub fn gemm_kernels() -> impl Iterator<Item = &'static GemmKernel> {
    GEMM_FAMILIES.iter().flat_map(|family| family.iter())
}

/// All attention specializations.
pub fn fmha_kernels() -> impl Iterator<Item = &'static FmhaKernel> {
    FMHA_FAMILIES.iter().flat_map(|family| family.iter())
}

/// Every kernel symbol a backend module must provide.
pub fn all_symbols() -> impl Iterator<Item = &'static str> {
    gemm_kernels()
        .map(|k| k.symbol)
        .chain(fmha_kernels().map(|k| k.symbol))
}

// ============================================================================
// Compile-time integrity checks
// ============================================================================

const fn str_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut i = 0;
    while i < a.len() {
        if a[i] != b[i] {
            return false;
        }
        i += 1;
    }
    true
}

const fn gemm_cell_count(family: &[GemmKernel], bucket: u32, swizzled: bool) -> usize {
    let mut count = 0;
    let mut i = 0;
    while i < family.len() {
        let k = &family[i];
        if k.tile.m == bucket && k.swizzled == swizzled && k.matches_policy() {
            count += 1;
        }
        i += 1;
    }
    count
}

const fn gemm_registry_is_total() -> bool {
    let mut f = 0;
    while f < GEMM_FAMILIES.len() {
        let family = GEMM_FAMILIES[f];
        if family.len() != GEMM_TILE_BUCKETS.len() * 2 {
            return false;
        }
        let mut i = 0;
        while i < family.len() {
            if !family[i].same_family(&family[0]) {
                return false;
            }
            i += 1;
        }
        let mut b = 0;
        while b < GEMM_TILE_BUCKETS.len() {
            if gemm_cell_count(family, GEMM_TILE_BUCKETS[b], false) != 1
                || gemm_cell_count(family, GEMM_TILE_BUCKETS[b], true) != 1
            {
                return false;
            }
            b += 1;
        }
        let mut g = f + 1;
        while g < GEMM_FAMILIES.len() {
            if GEMM_FAMILIES[g][0].same_family(&family[0]) {
                return false;
            }
            g += 1;
        }
        f += 1;
    }
    true
}

const fn fmha_cell_count(family: &[FmhaKernel], hq: u32, hv: u32, m0: u32) -> usize {
    let mut count = 0;
    let mut i = 0;
    while i < family.len() {
        let k = &family[i];
        if k.head_size_q == hq
            && k.head_size_v == hv
            && k.tile.m0 == m0
            && k.vector_width as usize == VECTOR_BYTES / k.dtype.byte_width()
        {
            count += 1;
        }
        i += 1;
    }
    count
}

const fn fmha_registry_is_total() -> bool {
    let mut f = 0;
    while f < FMHA_FAMILIES.len() {
        let family = FMHA_FAMILIES[f];
        if family.len() != SUPPORTED_HEAD_SIZES.len() * FMHA_Q_BUCKETS.len() {
            return false;
        }
        let mut i = 0;
        while i < family.len() {
            if family[i].variant.ordinal() != family[0].variant.ordinal()
                || family[i].dtype.ordinal() != family[0].dtype.ordinal()
            {
                return false;
            }
            i += 1;
        }
        let mut h = 0;
        while h < SUPPORTED_HEAD_SIZES.len() {
            let (hq, hv) = SUPPORTED_HEAD_SIZES[h];
            let mut b = 0;
            while b < FMHA_Q_BUCKETS.len() {
                if fmha_cell_count(family, hq, hv, FMHA_Q_BUCKETS[b]) != 1 {
                    return false;
                }
                b += 1;
            }
            h += 1;
        }
        let mut g = f + 1;
        while g < FMHA_FAMILIES.len() {
            if FMHA_FAMILIES[g][0].variant.ordinal() == family[0].variant.ordinal()
                && FMHA_FAMILIES[g][0].dtype.ordinal() == family[0].dtype.ordinal()
            {
                return false;
            }
            g += 1;
        }
        f += 1;
    }
    true
}

const fn symbol_count(symbol: &str) -> usize {
    let mut count = 0;
    let mut f = 0;
    while f < GEMM_FAMILIES.len() {
        let mut i = 0;
        while i < GEMM_FAMILIES[f].len() {
            if str_eq(GEMM_FAMILIES[f][i].symbol, symbol) {
                count += 1;
            }
            i += 1;
        }
        f += 1;
    }
    f = 0;
    while f < FMHA_FAMILIES.len() {
        let mut i = 0;
        while i < FMHA_FAMILIES[f].len() {
            if str_eq(FMHA_FAMILIES[f][i].symbol, symbol) {
                count += 1;
            }
            i += 1;
        }
        f += 1;
    }
    count
}

const fn symbols_are_unique() -> bool {
    let mut f = 0;
    while f < GEMM_FAMILIES.len() {
        let mut i = 0;
        while i < GEMM_FAMILIES[f].len() {
            if symbol_count(GEMM_FAMILIES[f][i].symbol) != 1 {
                return false;
            }
            i += 1;
        }
        f += 1;
    }
    f = 0;
    while f < FMHA_FAMILIES.len() {
        let mut i = 0;
        while i < FMHA_FAMILIES[f].len() {
            if symbol_count(FMHA_FAMILIES[f][i].symbol) != 1 {
                return false;
            }
            i += 1;
        }
        f += 1;
    }
    true
}

const _: () = assert!(
    gemm_registry_is_total(),
    "grouped GEMM registry must have exactly one entry per family, bucket and swizzle mode"
);
const _: () = assert!(
    fmha_registry_is_total(),
    "attention registry must have exactly one entry per family, head pair and query bucket"
);
const _: () = assert!(symbols_are_unique(), "kernel symbols must be unique");
