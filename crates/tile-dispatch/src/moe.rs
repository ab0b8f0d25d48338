//! Routing preparation for the grouped MoE GEMM.
//!
//! [`topk_softmax`] turns router logits into per-token top-k expert choices,
//! [`moe_sorting`] turns those choices into the block-aligned routing the
//! grouped kernels consume, and [`moe_sum`] folds per-slot results back into
//! one row per token. [`shuffle_weight`] produces the tiled weight layout the
//! swizzled families read.
//!
//! # Sorted routing
//!
//! ```text
//! topk_ids  [tokens, topk]     token 0: (e2, e0)   token 1: (e0, e1)
//!
//! sorted_token_ids (block_m = 4, P = padding):
//!   | 1<<24|0  0<<24|1  P  P | 1<<24|1  P  P  P | 0<<24|0  P  P  P |
//!   |        expert 0        |     expert 1     |     expert 2     |
//! ```
//!
//! Each id packs the top-k slot in the high byte and the token index in the
//! low 24 bits; padding uses the token count, which no real row can reach.

use crate::error::{DispatchError, Result};
use crate::host::HostBuffer;
use crate::registry::VECTOR_BYTES;
use crate::types::DataType;

/// Rows per pre-shuffled weight tile.
pub const SHUFFLE_ROWS: usize = 16;

const TOKEN_BITS: u32 = 24;
const TOKEN_MASK: u32 = (1 << TOKEN_BITS) - 1;

/// Pack a routed row.
#[inline]
pub const fn pack_token_id(token: u32, slot: u32) -> u32 {
    (slot << TOKEN_BITS) | (token & TOKEN_MASK)
}

/// Unpack a routed row into `(token, slot)`.
#[inline]
pub const fn unpack_token_id(id: u32) -> (u32, u32) {
    (id & TOKEN_MASK, id >> TOKEN_BITS)
}

/// Block-aligned routing for one batch of tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct MoeSorting {
    /// Packed `slot << 24 | token`, padded per expert to `block_m`.
    pub sorted_token_ids: Vec<i32>,
    /// Routing weight of each sorted row, 0 for padding.
    pub sorted_weights: Vec<f32>,
    /// Expert of each `block_m` block.
    pub sorted_expert_ids: Vec<i32>,
    /// Entries of `sorted_token_ids` in use, padding included.
    pub num_valid_ids: usize,
    pub block_m: usize,
}

/// [`MoeSorting`] as host buffers ready for [`MoeGemmArgs`](crate::launch::MoeGemmArgs).
#[derive(Debug, Clone)]
pub struct SortedBuffers {
    pub sorted_token_ids: HostBuffer,
    pub sorted_weights: HostBuffer,
    pub sorted_expert_ids: HostBuffer,
    pub num_valid_ids: HostBuffer,
}

impl MoeSorting {
    pub fn num_blocks(&self) -> usize {
        self.sorted_expert_ids.len()
    }

    pub fn host_buffers(&self) -> SortedBuffers {
        SortedBuffers {
            sorted_token_ids: HostBuffer::from_i32(DataType::Int32, &self.sorted_token_ids),
            sorted_weights: HostBuffer::from_f32(DataType::Fp32, &self.sorted_weights),
            sorted_expert_ids: HostBuffer::from_i32(DataType::Int32, &self.sorted_expert_ids),
            num_valid_ids: HostBuffer::from_i32(DataType::Int32, &[self.num_valid_ids as i32]),
        }
    }
}

/// Group routed rows by expert and pad every group to a multiple of `block_m`.
///
/// `topk_ids` and `topk_weights` are `[tokens, topk]` row-major. Rows keep
/// token order inside each expert group; experts with no rows get no block.
pub fn moe_sorting(
    topk_ids: &[i32],
    topk_weights: &[f32],
    topk: usize,
    num_experts: usize,
    block_m: usize,
) -> Result<MoeSorting> {
    if topk == 0 || block_m == 0 || num_experts == 0 {
        return Err(DispatchError::InvalidArgument(format!(
            "moe_sorting: topk={} block_m={} experts={} must be positive",
            topk, block_m, num_experts
        )));
    }
    if topk_ids.len() % topk != 0 || topk_weights.len() != topk_ids.len() {
        return Err(DispatchError::InvalidArgument(format!(
            "moe_sorting: {} ids and {} weights do not form [tokens, {}]",
            topk_ids.len(),
            topk_weights.len(),
            topk
        )));
    }
    let tokens = topk_ids.len() / topk;
    if tokens > TOKEN_MASK as usize || topk > u8::MAX as usize {
        return Err(DispatchError::InvalidArgument(format!(
            "moe_sorting: {} tokens x {} slots exceeds the packed id range",
            tokens, topk
        )));
    }

    let mut per_expert: Vec<Vec<(u32, f32)>> = vec![Vec::new(); num_experts];
    for (idx, (&expert, &weight)) in topk_ids.iter().zip(topk_weights).enumerate() {
        let e = usize::try_from(expert)
            .ok()
            .filter(|&e| e < num_experts)
            .ok_or_else(|| {
                DispatchError::InvalidArgument(format!(
                    "moe_sorting: expert id {} outside 0..{}",
                    expert, num_experts
                ))
            })?;
        let id = pack_token_id((idx / topk) as u32, (idx % topk) as u32);
        per_expert[e].push((id, weight));
    }

    let padding = tokens as i32;
    let mut sorted_token_ids = Vec::new();
    let mut sorted_weights = Vec::new();
    let mut sorted_expert_ids = Vec::new();
    for (e, rows) in per_expert.iter().enumerate() {
        if rows.is_empty() {
            continue;
        }
        let blocks = rows.len().div_ceil(block_m);
        for &(id, weight) in rows {
            sorted_token_ids.push(id as i32);
            sorted_weights.push(weight);
        }
        let padded = blocks * block_m;
        sorted_token_ids.resize(sorted_token_ids.len() + padded - rows.len(), padding);
        sorted_weights.resize(sorted_weights.len() + padded - rows.len(), 0.0);
        sorted_expert_ids.extend(std::iter::repeat(e as i32).take(blocks));
    }

    let num_valid_ids = sorted_token_ids.len();
    tracing::trace!(tokens, topk, blocks = sorted_expert_ids.len(), "sorted moe routing");
    Ok(MoeSorting {
        sorted_token_ids,
        sorted_weights,
        sorted_expert_ids,
        num_valid_ids,
        block_m,
    })
}

/// Per-token expert choices, `[tokens, topk]` row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct TopkRouting {
    pub topk_ids: Vec<i32>,
    pub topk_weights: Vec<f32>,
    pub topk: usize,
    pub num_experts: usize,
}

impl TopkRouting {
    pub fn tokens(&self) -> usize {
        self.topk_ids.len() / self.topk
    }

    /// Block-aligned routing for these choices.
    pub fn sort(&self, block_m: usize) -> Result<MoeSorting> {
        moe_sorting(&self.topk_ids, &self.topk_weights, self.topk, self.num_experts, block_m)
    }
}

/// Softmax over each token's router logits, keeping the `topk` largest.
///
/// `gating` is `[tokens, num_experts]`. Choices are ordered by descending
/// probability; equal probabilities keep the lower expert first. With
/// `renormalize` the kept weights of each token sum to one.
pub fn topk_softmax(
    gating: &[f32],
    num_experts: usize,
    topk: usize,
    renormalize: bool,
) -> Result<TopkRouting> {
    if num_experts == 0 || topk == 0 || topk > num_experts {
        return Err(DispatchError::InvalidArgument(format!(
            "topk_softmax: topk {} must be in 1..={} experts",
            topk, num_experts
        )));
    }
    if gating.len() % num_experts != 0 {
        return Err(DispatchError::InvalidArgument(format!(
            "topk_softmax: {} logits do not form [tokens, {}]",
            gating.len(),
            num_experts
        )));
    }
    if let Some(pos) = gating.iter().position(|v| v.is_nan()) {
        return Err(DispatchError::InvalidArgument(format!(
            "topk_softmax: logit {} is NaN",
            pos
        )));
    }

    let tokens = gating.len() / num_experts;
    let mut topk_ids = Vec::with_capacity(tokens * topk);
    let mut topk_weights = Vec::with_capacity(tokens * topk);
    let mut order: Vec<usize> = Vec::with_capacity(num_experts);
    for logits in gating.chunks(num_experts) {
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exp: Vec<f32> = logits.iter().map(|&v| (v - max).exp()).collect();
        let total: f32 = exp.iter().sum();

        order.clear();
        order.extend(0..num_experts);
        order.sort_by(|&a, &b| exp[b].total_cmp(&exp[a]));

        let kept = &order[..topk];
        let norm = if renormalize {
            kept.iter().map(|&e| exp[e]).sum::<f32>()
        } else {
            total
        };
        for &e in kept {
            topk_ids.push(e as i32);
            topk_weights.push(exp[e] / norm);
        }
    }

    tracing::trace!(tokens, topk, num_experts, renormalize, "selected top-k experts");
    Ok(TopkRouting {
        topk_ids,
        topk_weights,
        topk,
        num_experts,
    })
}

/// Sum `[tokens, topk, hidden]` over the slot axis, in slot order.
pub fn moe_sum(input: &[f32], topk: usize, hidden: usize) -> Result<Vec<f32>> {
    let row = topk * hidden;
    if row == 0 || input.len() % row != 0 {
        return Err(DispatchError::InvalidArgument(format!(
            "moe_sum: {} values do not form [tokens, {}, {}]",
            input.len(),
            topk,
            hidden
        )));
    }
    let mut out = vec![0.0f32; input.len() / topk];
    for (dst, slots) in out.chunks_mut(hidden).zip(input.chunks(row)) {
        for slot in slots.chunks(hidden) {
            for (d, &v) in dst.iter_mut().zip(slot) {
                *d += v;
            }
        }
    }
    Ok(out)
}

/// Columns per pre-shuffled tile: one vector load of `dtype`.
pub const fn shuffle_col_tile(dtype: DataType) -> usize {
    VECTOR_BYTES / dtype.byte_width()
}

/// Element offset of `(row, col)` inside one pre-shuffled `[n, k]` matrix.
///
/// Tiles of `SHUFFLE_ROWS x col_tile` are stored contiguously, row-major
/// inside the tile, tiles ordered along K first.
#[inline]
pub const fn shuffled_index(row: usize, col: usize, k: usize, col_tile: usize) -> usize {
    let tile = (row / SHUFFLE_ROWS) * (k / col_tile) + col / col_tile;
    tile * SHUFFLE_ROWS * col_tile + (row % SHUFFLE_ROWS) * col_tile + col % col_tile
}

/// Rearrange `[experts, n, k]` row-major weights into the pre-shuffled layout.
pub fn shuffle_weight(
    data: &[u8],
    dtype: DataType,
    experts: usize,
    n: usize,
    k: usize,
) -> Result<Vec<u8>> {
    let width = dtype.byte_width();
    let col_tile = shuffle_col_tile(dtype);
    if n % SHUFFLE_ROWS != 0 || k % col_tile != 0 {
        return Err(DispatchError::InvalidArgument(format!(
            "shuffle_weight: [{}, {}] is not a multiple of the {}x{} tile",
            n, k, SHUFFLE_ROWS, col_tile
        )));
    }
    let matrix = n * k;
    if data.len() != experts * matrix * width {
        return Err(DispatchError::InvalidArgument(format!(
            "shuffle_weight: expected {} bytes, got {}",
            experts * matrix * width,
            data.len()
        )));
    }

    let mut out = vec![0u8; data.len()];
    for e in 0..experts {
        let base = e * matrix;
        for row in 0..n {
            for col in 0..k {
                let src = (base + row * k + col) * width;
                let dst = (base + shuffled_index(row, col, k, col_tile)) * width;
                out[dst..dst + width].copy_from_slice(&data[src..src + width]);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_topk_softmax_picks_largest() {
        let gating = [0.0, 2.0, 1.0, -1.0, 3.0, 3.0, 0.0, 0.0];
        let r = topk_softmax(&gating, 4, 2, false).unwrap();
        assert_eq!(r.tokens(), 2);
        assert_eq!(r.topk_ids, vec![1, 2, 0, 1]);

        let e = [1.0f32, 2.0f32.exp(), 1.0f32.exp(), (-1.0f32).exp()];
        let total: f32 = e.iter().sum();
        assert!((r.topk_weights[0] - e[1] / total).abs() < 1e-6);
        assert!((r.topk_weights[1] - e[2] / total).abs() < 1e-6);
        // Tied logits split the mass evenly and keep expert order.
        assert!((r.topk_weights[2] - r.topk_weights[3]).abs() < 1e-6);
    }

    #[test]
    fn test_topk_softmax_renormalize() {
        let gating = [0.5, -2.0, 1.5, 0.0, 4.0, 1.0];
        let r = topk_softmax(&gating, 3, 2, true).unwrap();
        for w in r.topk_weights.chunks(2) {
            assert!((w[0] + w[1] - 1.0).abs() < 1e-6);
            assert!(w[0] >= w[1]);
        }
        assert_eq!(r.topk_ids, vec![2, 0, 1, 2]);
    }

    #[test]
    fn test_topk_softmax_rejects_bad_shapes() {
        assert!(topk_softmax(&[0.0; 6], 3, 4, false).is_err());
        assert!(topk_softmax(&[0.0; 5], 3, 1, false).is_err());
        assert!(topk_softmax(&[0.0, f32::NAN, 1.0], 3, 1, false).is_err());
    }

    #[test]
    fn test_topk_routing_sorts() {
        let r = topk_softmax(&[0.0, 1.0, 5.0, 0.0, 0.0, 9.0], 3, 1, true).unwrap();
        let s = r.sort(4).unwrap();
        assert_eq!(s.sorted_expert_ids, vec![2]);
        assert_eq!(s.sorted_weights[..2], [1.0, 1.0]);
    }

    #[test]
    fn test_moe_sum() {
        // [2 tokens, 2 slots, 3 hidden]
        let input = [1.0, 2.0, 3.0, 10.0, 20.0, 30.0, -1.0, 0.5, 0.0, 1.0, 0.5, 2.0];
        assert_eq!(moe_sum(&input, 2, 3).unwrap(), vec![11.0, 22.0, 33.0, 0.0, 1.0, 2.0]);
        assert!(moe_sum(&input, 5, 3).is_err());
        assert!(moe_sum(&input, 0, 3).is_err());
    }

    #[test]
    fn test_sorting_layout() {
        // token 0 -> (2, 0), token 1 -> (0, 1)
        let ids = [2, 0, 0, 1];
        let weights = [0.6, 0.4, 0.7, 0.3];
        let s = moe_sorting(&ids, &weights, 2, 3, 4).unwrap();
        let pad = 2;
        assert_eq!(
            s.sorted_token_ids,
            vec![
                pack_token_id(0, 1) as i32, pack_token_id(1, 0) as i32, pad, pad,
                pack_token_id(1, 1) as i32, pad, pad, pad,
                pack_token_id(0, 0) as i32, pad, pad, pad,
            ]
        );
        assert_eq!(s.sorted_expert_ids, vec![0, 1, 2]);
        assert_eq!(s.sorted_weights[0], 0.4);
        assert_eq!(s.sorted_weights[2], 0.0);
        assert_eq!(s.num_valid_ids, 12);
    }

    #[test]
    fn test_sorting_skips_idle_experts() {
        let s = moe_sorting(&[3, 3, 3], &[1.0; 3], 1, 8, 2).unwrap();
        assert_eq!(s.sorted_expert_ids, vec![3, 3]);
        assert_eq!(s.num_blocks(), 2);
        assert_eq!(s.sorted_token_ids.len(), 4);
    }

    #[test]
    fn test_sorting_rejects_bad_input() {
        assert!(moe_sorting(&[0, 5], &[1.0, 1.0], 1, 4, 32).is_err());
        assert!(moe_sorting(&[0, -1], &[1.0, 1.0], 1, 4, 32).is_err());
        assert!(moe_sorting(&[0, 1, 2], &[1.0; 3], 2, 4, 32).is_err());
        assert!(moe_sorting(&[0], &[1.0], 1, 4, 0).is_err());
    }

    #[test]
    fn test_pack_roundtrip() {
        assert_eq!(unpack_token_id(pack_token_id(12345, 7)), (12345, 7));
    }

    #[test]
    fn test_shuffled_index_is_permutation() {
        let (n, k, tile) = (32, 48, 16);
        let seen: HashSet<_> = (0..n)
            .flat_map(|r| (0..k).map(move |c| shuffled_index(r, c, k, tile)))
            .collect();
        assert_eq!(seen.len(), n * k);
        assert!(seen.iter().all(|&i| i < n * k));
    }

    #[test]
    fn test_shuffle_weight_tile_contiguous() {
        let (n, k) = (16, 16);
        let data: Vec<u8> = (0..(n * k) as u32).map(|v| v as u8).collect();
        let out = shuffle_weight(&data, DataType::Fp8, 1, n, k).unwrap();
        // One 16x16 tile of one-byte elements is already row-major.
        assert_eq!(out, data);

        let wide: Vec<u8> = DataType::Bf16.from_f32(
            &(0..16 * 16).map(|v| v as f32).collect::<Vec<_>>(),
        );
        let out = shuffle_weight(&wide, DataType::Bf16, 1, 16, 16).unwrap();
        let vals = DataType::Bf16.to_f32(&out);
        // Second element of the first tile is (row 0, col 1); row 1 starts after 8 columns.
        assert_eq!(vals[1], 1.0);
        assert_eq!(vals[8], 16.0);
    }

    #[test]
    fn test_shuffle_weight_shape_checks() {
        assert!(shuffle_weight(&[0u8; 8 * 16], DataType::Fp8, 1, 8, 16).is_err());
        assert!(shuffle_weight(&[0u8; 16 * 12 * 2], DataType::Bf16, 1, 16, 12).is_err());
        assert!(shuffle_weight(&[0u8; 10], DataType::Fp8, 1, 16, 16).is_err());
    }
}
