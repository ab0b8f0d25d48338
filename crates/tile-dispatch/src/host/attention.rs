use super::{map_ordered, read_offsets, HostBuffer};
use crate::error::{DispatchError, Result};
use crate::launch::{
    AttentionParams, AttentionShape, BatchPrefillArgs, FmhaFwdArgs, FmhaSplitKvArgs, PagedKv,
};
use crate::types::{BiasKind, MaskInfo, MaskKind, TraitDescriptor};
use std::ops::Range;

// ============================================================================
// Mask policies
// ============================================================================

/// Visibility of key `j` from query `i`, whose bottom-right aligned
/// position is `row`.
trait MaskPolicy: Sync {
    fn visible(&self, i: i64, row: i64, j: i64) -> bool;
}

struct NoMask;

impl MaskPolicy for NoMask {
    #[inline]
    fn visible(&self, _i: i64, _row: i64, _j: i64) -> bool {
        true
    }
}

struct TopLeftCausal;

impl MaskPolicy for TopLeftCausal {
    #[inline]
    fn visible(&self, i: i64, _row: i64, j: i64) -> bool {
        j <= i
    }
}

struct BottomRightCausal;

impl MaskPolicy for BottomRightCausal {
    #[inline]
    fn visible(&self, _i: i64, row: i64, j: i64) -> bool {
        j <= row
    }
}

/// Negative extents are unbounded.
struct WindowMask {
    left: i64,
    right: i64,
}

impl MaskPolicy for WindowMask {
    #[inline]
    fn visible(&self, _i: i64, row: i64, j: i64) -> bool {
        (self.left < 0 || j >= row - self.left) && (self.right < 0 || j <= row + self.right)
    }
}

// ============================================================================
// Key/value sources
// ============================================================================

trait KvSource: Sync {
    fn seqlen(&self, b: usize) -> usize;
    fn key(&self, b: usize, hk: usize, j: usize) -> &[f32];
    fn value(&self, b: usize, hk: usize, j: usize) -> &[f32];
}

/// Contiguous `[rows, nhead_k, hdim]` keys and values.
struct DenseKv {
    k: Vec<f32>,
    v: Vec<f32>,
    seqs: Sequences,
    nhead_k: usize,
    hdim_q: usize,
    hdim_v: usize,
}

impl DenseKv {
    fn new(
        k: &HostBuffer,
        v: &HostBuffer,
        shape: &AttentionShape,
        group_mode: bool,
        seqstart_k: Option<&HostBuffer>,
    ) -> Result<Self> {
        Ok(Self {
            k: k.to_f32(),
            v: v.to_f32(),
            seqs: Sequences::new(
                "seqstart_k",
                shape.batch,
                shape.seqlen_k,
                group_mode,
                seqstart_k,
            )?,
            nhead_k: shape.nhead_k,
            hdim_q: shape.hdim_q,
            hdim_v: shape.hdim_v,
        })
    }
}

impl KvSource for DenseKv {
    fn seqlen(&self, b: usize) -> usize {
        self.seqs.lens[b]
    }

    fn key(&self, b: usize, hk: usize, j: usize) -> &[f32] {
        let off = ((self.seqs.starts[b] + j) * self.nhead_k + hk) * self.hdim_q;
        &self.k[off..off + self.hdim_q]
    }

    fn value(&self, b: usize, hk: usize, j: usize) -> &[f32] {
        let off = ((self.seqs.starts[b] + j) * self.nhead_k + hk) * self.hdim_v;
        &self.v[off..off + self.hdim_v]
    }
}

/// Keys and values scattered over cache pages.
struct PagedKvView {
    k: Vec<f32>,
    v: Vec<f32>,
    indptr: Vec<usize>,
    pages: Vec<usize>,
    lens: Vec<usize>,
    page_block_size: usize,
    nhead_k: usize,
    hdim_q: usize,
    hdim_v: usize,
}

impl PagedKvView {
    fn new(kv: &PagedKv<'_, HostBuffer>, shape: &AttentionShape) -> Result<Self> {
        let indptr = read_offsets("kv_indptr", kv.kv_indptr)?;
        let pages = read_offsets("kv_page_indices", kv.kv_page_indices)?;
        let last = read_offsets("kv_last_page_lens", kv.kv_last_page_lens)?;
        let pbs = kv.page_block_size;

        if let Some(&p) = pages.iter().find(|&&p| p >= kv.num_pages) {
            return Err(DispatchError::InvalidArgument(format!(
                "kv_page_indices: page {} >= num_pages {}",
                p, kv.num_pages
            )));
        }
        let mut lens = Vec::with_capacity(shape.batch);
        for b in 0..shape.batch {
            let (lo, hi) = (indptr[b], indptr[b + 1]);
            if lo > hi || hi > pages.len() {
                return Err(DispatchError::InvalidArgument(format!(
                    "kv_indptr[{}..{}] = {}..{} outside {} page indices",
                    b,
                    b + 2,
                    lo,
                    hi,
                    pages.len()
                )));
            }
            let npages = hi - lo;
            let len = match npages {
                0 => 0,
                _ if last[b] == 0 || last[b] > pbs => {
                    return Err(DispatchError::InvalidArgument(format!(
                        "kv_last_page_lens[{}] = {} outside 1..={}",
                        b, last[b], pbs
                    )))
                }
                _ => (npages - 1) * pbs + last[b],
            };
            lens.push(len);
        }

        Ok(Self {
            k: kv.k_pages.to_f32(),
            v: kv.v_pages.to_f32(),
            indptr,
            pages,
            lens,
            page_block_size: pbs,
            nhead_k: shape.nhead_k,
            hdim_q: shape.hdim_q,
            hdim_v: shape.hdim_v,
        })
    }

    #[inline]
    fn slot(&self, b: usize, j: usize) -> usize {
        let page = self.pages[self.indptr[b] + j / self.page_block_size];
        page * self.page_block_size + j % self.page_block_size
    }
}

impl KvSource for PagedKvView {
    fn seqlen(&self, b: usize) -> usize {
        self.lens[b]
    }

    fn key(&self, b: usize, hk: usize, j: usize) -> &[f32] {
        let off = (self.slot(b, j) * self.nhead_k + hk) * self.hdim_q;
        &self.k[off..off + self.hdim_q]
    }

    fn value(&self, b: usize, hk: usize, j: usize) -> &[f32] {
        let off = (self.slot(b, j) * self.nhead_k + hk) * self.hdim_v;
        &self.v[off..off + self.hdim_v]
    }
}

// ============================================================================
// Problem setup
// ============================================================================

/// Per-sequence row ranges in a batch- or group-mode tensor.
struct Sequences {
    starts: Vec<usize>,
    lens: Vec<usize>,
}

impl Sequences {
    fn new(
        name: &str,
        batch: usize,
        seqlen: usize,
        group_mode: bool,
        seqstart: Option<&HostBuffer>,
    ) -> Result<Self> {
        if !group_mode {
            return Ok(Self {
                starts: (0..batch).map(|b| b * seqlen).collect(),
                lens: vec![seqlen; batch],
            });
        }
        let buf = seqstart
            .ok_or_else(|| DispatchError::Backend(format!("{} missing in group mode", name)))?;
        let s = read_offsets(name, buf)?;
        if s.len() != batch + 1
            || s[0] != 0
            || s[batch] != seqlen
            || s.windows(2).any(|w| w[0] > w[1])
        {
            return Err(DispatchError::InvalidArgument(format!(
                "{} must rise from 0 to {} over {} sequences",
                name, seqlen, batch
            )));
        }
        Ok(Self {
            starts: s[..batch].to_vec(),
            lens: s.windows(2).map(|w| w[1] - w[0]).collect(),
        })
    }
}

enum BiasTerm {
    None,
    Elementwise { values: Vec<f32>, max_q: usize, max_k: usize },
    Alibi(Vec<f32>),
}

struct Dropout {
    p: f32,
    seed: u64,
    offset: u64,
}

impl Dropout {
    /// Counter-based keep decision; identical inputs always agree.
    fn keep(&self, r: RowId, j: usize) -> bool {
        let mut x = self.seed ^ splitmix64(self.offset);
        for v in [r.b, r.h, r.i, j] {
            x = splitmix64(x ^ v as u64);
        }
        let u = (x >> 40) as f32 / (1u64 << 24) as f32;
        u >= self.p
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

#[derive(Debug, Clone, Copy)]
struct RowId {
    b: usize,
    h: usize,
    i: usize,
}

/// Running softmax state over part of a key range.
#[derive(Debug, Clone)]
struct Partial {
    max: f32,
    sum: f32,
    /// Unnormalized `sum_j p_j * v_j`.
    acc: Vec<f32>,
}

impl Partial {
    fn lse(&self) -> f32 {
        if self.sum > 0.0 {
            self.max + self.sum.ln()
        } else {
            f32::NEG_INFINITY
        }
    }

    fn normalized(&self) -> Vec<f32> {
        if self.sum > 0.0 {
            self.acc.iter().map(|&a| a / self.sum).collect()
        } else {
            vec![0.0; self.acc.len()]
        }
    }
}

struct Attention<K> {
    q: Vec<f32>,
    queries: Sequences,
    kv: K,
    bias: BiasTerm,
    scale_s: f32,
    soft_cap: Option<f32>,
    dropout: Option<Dropout>,
    shape: AttentionShape,
    group_mode: bool,
}

impl<K: KvSource> Attention<K> {
    fn new(
        traits: &TraitDescriptor,
        shape: &AttentionShape,
        params: &AttentionParams,
        q: &HostBuffer,
        queries: Sequences,
        bias: Option<&HostBuffer>,
        kv: K,
    ) -> Result<Self> {
        let bias = match (traits.bias_kind, bias) {
            (BiasKind::None, _) => BiasTerm::None,
            (BiasKind::Elementwise, Some(b)) => {
                let (max_q, max_k) = (shape.max_seqlen_q, shape.max_seqlen_k);
                for bi in 0..shape.batch {
                    if queries.lens[bi] > max_q || kv.seqlen(bi) > max_k {
                        return Err(DispatchError::InvalidArgument(format!(
                            "sequence {} ({}x{}) exceeds the bias extent {}x{}",
                            bi,
                            queries.lens[bi],
                            kv.seqlen(bi),
                            max_q,
                            max_k
                        )));
                    }
                }
                BiasTerm::Elementwise {
                    values: b.to_f32(),
                    max_q,
                    max_k,
                }
            }
            (BiasKind::Alibi, Some(b)) => BiasTerm::Alibi(b.to_f32()),
            (kind, None) => {
                return Err(DispatchError::Backend(format!("{} launched without a buffer", kind)))
            }
        };

        Ok(Self {
            q: q.to_f32(),
            queries,
            kv,
            bias,
            scale_s: params.scale_s,
            soft_cap: traits.has_logits_soft_cap.then_some(params.logits_soft_cap),
            dropout: traits.has_dropout.then_some(Dropout {
                p: params.p_drop,
                seed: params.drop_seed,
                offset: params.drop_offset,
            }),
            shape: *shape,
            group_mode: traits.is_group_mode,
        })
    }

    fn rows(&self) -> Vec<RowId> {
        let mut rows = Vec::new();
        for b in 0..self.shape.batch {
            for h in 0..self.shape.nhead_q {
                for i in 0..self.queries.lens[b] {
                    rows.push(RowId { b, h, i });
                }
            }
        }
        rows
    }

    fn q_row(&self, r: RowId) -> usize {
        self.queries.starts[r.b] + r.i
    }

    /// Offset of row `r` in the `[rows, nhead_q, hdim_v]` output.
    fn out_offset(&self, r: RowId) -> usize {
        (self.q_row(r) * self.shape.nhead_q + r.h) * self.shape.hdim_v
    }

    /// Offset of row `r` in the LSE (and split workspace) layout.
    fn lse_index(&self, r: RowId) -> usize {
        if self.group_mode {
            r.h * self.shape.seqlen_q + self.q_row(r)
        } else {
            (r.b * self.shape.nhead_q + r.h) * self.shape.seqlen_q + r.i
        }
    }

    fn score(&self, q: &[f32], r: RowId, hk: usize, j: usize, aligned: i64) -> f32 {
        let k = self.kv.key(r.b, hk, j);
        let mut s = q.iter().zip(k).map(|(a, b)| a * b).sum::<f32>() * self.scale_s;
        if let Some(cap) = self.soft_cap {
            s = cap * (s / cap).tanh();
        }
        match &self.bias {
            BiasTerm::None => s,
            BiasTerm::Elementwise { values, max_q, max_k } => {
                s + values[(r.h * max_q + r.i) * max_k + j]
            }
            BiasTerm::Alibi(slopes) => s - slopes[r.h] * (aligned - j as i64).abs() as f32,
        }
    }

    fn partial<M: MaskPolicy>(&self, mask: &M, r: RowId, keys: Range<usize>) -> Partial {
        let (dq, dv) = (self.shape.hdim_q, self.shape.hdim_v);
        let hk = r.h / (self.shape.nhead_q / self.shape.nhead_k);
        let aligned = r.i as i64 + self.kv.seqlen(r.b) as i64 - self.queries.lens[r.b] as i64;
        let q_off = (self.q_row(r) * self.shape.nhead_q + r.h) * dq;
        let q = &self.q[q_off..q_off + dq];

        let scores: Vec<(usize, f32)> = keys
            .filter(|&j| mask.visible(r.i as i64, aligned, j as i64))
            .map(|j| (j, self.score(q, r, hk, j, aligned)))
            .collect();

        let max = scores.iter().map(|&(_, s)| s).fold(f32::NEG_INFINITY, f32::max);
        let mut partial = Partial {
            max,
            sum: 0.0,
            acc: vec![0.0; dv],
        };
        if scores.is_empty() {
            return partial;
        }

        let rescale = self.dropout.as_ref().map_or(1.0, |d| 1.0 / (1.0 - d.p));
        for (j, s) in scores {
            let p = (s - max).exp();
            partial.sum += p;
            let weight = match &self.dropout {
                Some(d) if !d.keep(r, j) => continue,
                Some(_) => p * rescale,
                None => p,
            };
            for (a, &v) in partial.acc.iter_mut().zip(self.kv.value(r.b, hk, j)) {
                *a += weight * v;
            }
        }
        partial
    }

    /// Partials of every row over `splits` equal key chunks.
    fn split_partials<M: MaskPolicy>(
        &self,
        mask: &M,
        rows: &[RowId],
        splits: usize,
    ) -> Vec<Vec<Partial>> {
        map_ordered(rows, |&r| {
            let sk = self.kv.seqlen(r.b);
            let chunk = sk.div_ceil(splits).max(1);
            (0..splits)
                .map(|s| {
                    let lo = (s * chunk).min(sk);
                    let hi = (lo + chunk).min(sk);
                    self.partial(mask, r, lo..hi)
                })
                .collect()
        })
    }

    fn partials(&self, mask: &MaskInfo, rows: &[RowId], splits: usize) -> Vec<Vec<Partial>> {
        match mask.kind {
            MaskKind::None => self.split_partials(&NoMask, rows, splits),
            MaskKind::CausalTopLeft => self.split_partials(&TopLeftCausal, rows, splits),
            MaskKind::CausalBottomRight => self.split_partials(&BottomRightCausal, rows, splits),
            MaskKind::Window => self.split_partials(
                &WindowMask {
                    left: mask.left as i64,
                    right: mask.right as i64,
                },
                rows,
                splits,
            ),
        }
    }

    /// Single-pass forward into `(out, lse)` host vectors.
    fn forward(&self, mask: &MaskInfo) -> (Vec<f32>, Vec<f32>) {
        let rows = self.rows();
        let partials = self.partials(mask, &rows, 1);
        let dv = self.shape.hdim_v;
        let mut out = vec![0.0f32; self.shape.rows_q(self.group_mode) * self.shape.nhead_q * dv];
        let mut lse = vec![f32::NEG_INFINITY; self.shape.lse_len(self.group_mode)];
        for (r, p) in rows.iter().zip(&partials) {
            let o = self.out_offset(*r);
            out[o..o + dv].copy_from_slice(&p[0].normalized());
            lse[self.lse_index(*r)] = p[0].lse();
        }
        (out, lse)
    }
}

fn store_outputs(
    out: &mut HostBuffer,
    lse: Option<&mut HostBuffer>,
    values: &[f32],
    lse_values: &[f32],
) {
    out.store_f32(values);
    if let Some(l) = lse {
        l.store_f32(lse_values);
    }
}

// ============================================================================
// Entry points
// ============================================================================

pub(super) fn fwd(
    traits: &TraitDescriptor,
    mask: &MaskInfo,
    args: &mut FmhaFwdArgs<'_, HostBuffer>,
) -> Result<()> {
    let shape = args.shape;
    let g = traits.is_group_mode;
    let queries = Sequences::new("seqstart_q", shape.batch, shape.seqlen_q, g, args.seqstart_q)?;
    let kv = DenseKv::new(args.k, args.v, &shape, g, args.seqstart_k)?;
    let attn = Attention::new(traits, &shape, &args.params, args.q, queries, args.bias, kv)?;

    let (out, lse) = attn.forward(mask);
    store_outputs(args.out, args.lse.as_deref_mut(), &out, &lse);
    Ok(())
}

pub(super) fn splitkv(
    traits: &TraitDescriptor,
    mask: &MaskInfo,
    args: &mut FmhaSplitKvArgs<'_, HostBuffer>,
) -> Result<()> {
    let shape = args.shape;
    let g = traits.is_group_mode;
    let splits = args.num_splits;
    let queries = Sequences::new("seqstart_q", shape.batch, shape.seqlen_q, g, args.seqstart_q)?;
    let kv = DenseKv::new(args.k, args.v, &shape, g, args.seqstart_k)?;
    let attn = Attention::new(traits, &shape, &args.params, args.q, queries, args.bias, kv)?;

    // Partial pass: one normalized output and LSE per split.
    let rows = attn.rows();
    let partials = attn.partials(mask, &rows, splits);
    let (lse_len, dv) = (shape.lse_len(g), shape.hdim_v);
    let mut lse_acc = vec![f32::NEG_INFINITY; splits * lse_len];
    let mut o_acc = vec![0.0f32; splits * lse_len * dv];
    for (r, per_split) in rows.iter().zip(&partials) {
        let idx = attn.lse_index(*r);
        for (s, p) in per_split.iter().enumerate() {
            lse_acc[s * lse_len + idx] = p.lse();
            let o = (s * lse_len + idx) * dv;
            o_acc[o..o + dv].copy_from_slice(&p.normalized());
        }
    }
    args.lse_acc.store_f32(&lse_acc);
    args.o_acc.store_f32(&o_acc);

    // Combine pass reads the workspace back.
    let lse_acc = args.lse_acc.to_f32();
    let o_acc = args.o_acc.to_f32();
    let mut out = vec![0.0f32; shape.rows_q(g) * shape.nhead_q * dv];
    let mut lse = vec![f32::NEG_INFINITY; lse_len];
    for r in &rows {
        let idx = attn.lse_index(*r);
        let o = attn.out_offset(*r);
        lse[idx] = combine_splits(&lse_acc, &o_acc, splits, lse_len, dv, idx, &mut out[o..o + dv]);
    }
    store_outputs(args.out, args.lse.as_deref_mut(), &out, &lse);
    Ok(())
}

/// Max-subtracted log-sum-exp merge of one row's split partials.
///
/// Splits are visited in order, so the result is deterministic; it agrees with
/// an unsplit pass up to rounding.
fn combine_splits(
    lse_acc: &[f32],
    o_acc: &[f32],
    splits: usize,
    lse_len: usize,
    dv: usize,
    idx: usize,
    out: &mut [f32],
) -> f32 {
    let lses: Vec<f32> = (0..splits).map(|s| lse_acc[s * lse_len + idx]).collect();
    let max = lses.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        out.fill(0.0);
        return max;
    }
    let sum: f32 = lses.iter().map(|&l| (l - max).exp()).sum();
    let lse = max + sum.ln();

    out.fill(0.0);
    for (s, &l) in lses.iter().enumerate() {
        let scale = (l - lse).exp();
        if scale == 0.0 {
            continue;
        }
        let part = &o_acc[(s * lse_len + idx) * dv..][..dv];
        for (d, &v) in out.iter_mut().zip(part) {
            *d += scale * v;
        }
    }
    lse
}

pub(super) fn batch_prefill(
    traits: &TraitDescriptor,
    mask: &MaskInfo,
    args: &mut BatchPrefillArgs<'_, HostBuffer>,
) -> Result<()> {
    let shape = args.shape;
    let queries = Sequences::new(
        "seqstart_q",
        shape.batch,
        shape.seqlen_q,
        true,
        Some(args.seqstart_q),
    )?;
    let kv = PagedKvView::new(&args.kv, &shape)?;
    let attn = Attention::new(traits, &shape, &args.params, args.q, queries, args.bias, kv)?;

    let (out, lse) = attn.forward(mask);
    store_outputs(args.out, args.lse.as_deref_mut(), &out, &lse);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{mha_batch_prefill_traits, mha_fwd_traits};
    use crate::types::DataType;

    fn fill(len: usize, seed: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (((i * 31 + seed * 17) % 23) as f32 - 11.0) / 16.0)
            .collect()
    }

    fn naive(
        q: &[f32],
        k: &[f32],
        v: &[f32],
        sq: usize,
        sk: usize,
        d: usize,
        mask: &MaskInfo,
    ) -> Vec<f32> {
        let scale = 1.0 / (d as f32).sqrt();
        let mut out = vec![0.0; sq * d];
        for i in 0..sq {
            let s: Vec<f32> = (0..sk)
                .map(|j| {
                    if !mask.is_visible(i, j, sq, sk) {
                        f32::NEG_INFINITY
                    } else {
                        (0..d).map(|c| q[i * d + c] * k[j * d + c]).sum::<f32>() * scale
                    }
                })
                .collect();
            let m = s.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let e: Vec<f32> = s.iter().map(|&x| (x - m).exp()).collect();
            let z: f32 = e.iter().sum();
            for j in 0..sk {
                for c in 0..d {
                    out[i * d + c] += e[j] / z * v[j * d + c];
                }
            }
        }
        out
    }

    #[test]
    fn test_mask_policies() {
        assert!(BottomRightCausal.visible(1, 3, 3));
        assert!(!BottomRightCausal.visible(1, 3, 4));
        assert!(TopLeftCausal.visible(1, 3, 1));
        assert!(!TopLeftCausal.visible(1, 3, 2));
        let w = WindowMask { left: 2, right: 0 };
        assert!(w.visible(0, 5, 3));
        assert!(!w.visible(0, 5, 2));
        assert!(!w.visible(0, 5, 6));
        let open = WindowMask { left: -1, right: 1 };
        assert!(open.visible(0, 5, 0));
        assert!(open.visible(0, 5, 6));
    }

    #[test]
    fn test_fwd_matches_naive_causal() {
        let (sq, sk, d) = (5, 9, 32);
        let traits = mha_fwd_traits(
            32,
            32,
            "fp16",
            false,
            false,
            &MaskInfo::causal(),
            BiasKind::None,
            true,
            false,
        )
        .unwrap();
        let (q, k, v) = (fill(sq * d, 1), fill(sk * d, 2), fill(sk * d, 3));
        let qb = HostBuffer::from_f32(DataType::Fp16, &q);
        let kb = HostBuffer::from_f32(DataType::Fp16, &k);
        let vb = HostBuffer::from_f32(DataType::Fp16, &v);
        let mut out = HostBuffer::zeros(DataType::Fp16, sq * d);
        let mut lse = HostBuffer::zeros(DataType::Fp32, sq);
        let shape = AttentionShape::batch(1, 1, sq, sk, d, d);
        let mut args = FmhaFwdArgs {
            q: &qb,
            k: &kb,
            v: &vb,
            bias: None,
            seqstart_q: None,
            seqstart_k: None,
            out: &mut out,
            lse: Some(&mut lse),
            shape,
            params: AttentionParams::new(d),
        };
        fwd(&traits, &MaskInfo::causal(), &mut args).unwrap();

        let expect = naive(&q, &k, &v, sq, sk, d, &MaskInfo::causal());
        for (g, e) in out.to_f32().iter().zip(&expect) {
            assert!((g - e).abs() < 5e-3, "{} vs {}", g, e);
        }
        assert!(lse.to_f32().iter().all(|l| l.is_finite()));
    }

    #[test]
    fn test_causal_alignment_is_honored() {
        let (sq, sk, d) = (3, 8, 32);
        let (q, k, v) = (fill(sq * d, 4), fill(sk * d, 5), fill(sk * d, 6));
        let qb = HostBuffer::from_f32(DataType::Bf16, &q);
        let kb = HostBuffer::from_f32(DataType::Bf16, &k);
        let vb = HostBuffer::from_f32(DataType::Bf16, &v);

        let mut outputs = Vec::new();
        for mask in [MaskInfo::causal_top_left(), MaskInfo::causal()] {
            let traits = mha_fwd_traits(
                32,
                32,
                "bf16",
                false,
                false,
                &mask,
                BiasKind::None,
                false,
                false,
            )
            .unwrap();
            let mut out = HostBuffer::zeros(DataType::Bf16, sq * d);
            let mut args = FmhaFwdArgs {
                q: &qb,
                k: &kb,
                v: &vb,
                bias: None,
                seqstart_q: None,
                seqstart_k: None,
                out: &mut out,
                lse: None,
                shape: AttentionShape::batch(1, 1, sq, sk, d, d),
                params: AttentionParams::new(d),
            };
            fwd(&traits, &mask, &mut args).unwrap();

            let expect = naive(&q, &k, &v, sq, sk, d, &mask);
            for (g, e) in out.to_f32().iter().zip(&expect) {
                assert!((g - e).abs() < 2e-2, "{}: {} vs {}", mask.kind, g, e);
            }
            outputs.push(out.to_f32());
        }
        // The first query of a top-left mask sees only key 0, so it copies v[0].
        let first = &outputs[0][..d];
        for (g, e) in first.iter().zip(&v[..d]) {
            assert!((g - e).abs() < 1e-2, "{} vs {}", g, e);
        }
        assert_ne!(outputs[0], outputs[1]);
    }

    #[test]
    fn test_combine_matches_single_partial() {
        let lse_acc = [0.5f32, f32::NEG_INFINITY];
        let o_acc = [1.0f32, 2.0, 9.0, 9.0];
        let mut out = [0.0f32; 2];
        let lse = combine_splits(&lse_acc, &o_acc, 2, 1, 2, 0, &mut out);
        assert!((lse - 0.5).abs() < 1e-6);
        assert_eq!(out, [1.0, 2.0]);
    }

    #[test]
    fn test_combine_all_masked() {
        let lse_acc = [f32::NEG_INFINITY; 2];
        let mut out = [3.0f32; 4];
        let lse = combine_splits(&lse_acc, &[0.0; 8], 2, 1, 4, 0, &mut out);
        assert_eq!(lse, f32::NEG_INFINITY);
        assert_eq!(out, [0.0; 4]);
    }

    #[test]
    fn test_dropout_is_deterministic() {
        let d = Dropout { p: 0.5, seed: 7, offset: 3 };
        let r = RowId { b: 0, h: 1, i: 2 };
        let a: Vec<bool> = (0..256).map(|j| d.keep(r, j)).collect();
        let b: Vec<bool> = (0..256).map(|j| d.keep(r, j)).collect();
        assert_eq!(a, b);
        let kept = a.iter().filter(|&&k| k).count();
        assert!(kept > 64 && kept < 192);
    }

    #[test]
    fn test_paged_matches_dense() {
        let (sq, sk, d, pbs) = (4, 10, 64, 4);
        let mask = MaskInfo::causal();
        let (q, k, v) = (fill(sq * d, 5), fill(sk * d, 6), fill(sk * d, 7));

        // Scatter keys over pages 2, 0, 3 (last page half full).
        let page_order = [2usize, 0, 3];
        let num_pages = 4;
        let mut kp = vec![0.0f32; num_pages * pbs * d];
        let mut vp = vec![0.0f32; num_pages * pbs * d];
        for j in 0..sk {
            let slot = page_order[j / pbs] * pbs + j % pbs;
            kp[slot * d..(slot + 1) * d].copy_from_slice(&k[j * d..(j + 1) * d]);
            vp[slot * d..(slot + 1) * d].copy_from_slice(&v[j * d..(j + 1) * d]);
        }

        let traits = mha_batch_prefill_traits(
            64,
            64,
            "bf16",
            true,
            false,
            &mask,
            BiasKind::None,
            false,
            false,
        )
        .unwrap();
        let qb = HostBuffer::from_f32(DataType::Bf16, &q);
        let kpb = HostBuffer::from_f32(DataType::Bf16, &kp);
        let vpb = HostBuffer::from_f32(DataType::Bf16, &vp);
        let indptr = HostBuffer::from_i32(DataType::Int32, &[0, 3]);
        let indices = HostBuffer::from_i32(DataType::Int32, &[2, 0, 3]);
        let last = HostBuffer::from_i32(DataType::Int32, &[2]);
        let seqstart = HostBuffer::from_i32(DataType::Int32, &[0, sq as i32]);
        let mut out = HostBuffer::zeros(DataType::Bf16, sq * d);
        let mut shape = AttentionShape::batch(1, 1, sq, sk, d, d);
        shape.max_seqlen_k = sk;
        let mut args = BatchPrefillArgs {
            q: &qb,
            kv: PagedKv {
                k_pages: &kpb,
                v_pages: &vpb,
                kv_indptr: &indptr,
                kv_page_indices: &indices,
                kv_last_page_lens: &last,
                num_pages,
                page_block_size: pbs,
            },
            bias: None,
            seqstart_q: &seqstart,
            out: &mut out,
            lse: None,
            shape,
            params: AttentionParams::new(d),
        };
        batch_prefill(&traits, &mask, &mut args).unwrap();

        let expect = naive(&q, &k, &v, sq, sk, d, &MaskInfo::causal());
        for (g, e) in out.to_f32().iter().zip(&expect) {
            assert!((g - e).abs() < 2e-2, "{} vs {}", g, e);
        }
    }

    #[test]
    fn test_bad_page_index_rejected() {
        let d = 32;
        let traits = mha_batch_prefill_traits(
            32,
            32,
            "fp16",
            true,
            false,
            &MaskInfo::none(),
            BiasKind::None,
            false,
            false,
        )
        .unwrap();
        let qb = HostBuffer::zeros(DataType::Fp16, d);
        let pages = HostBuffer::zeros(DataType::Fp16, 2 * d);
        let indptr = HostBuffer::from_i32(DataType::Int32, &[0, 1]);
        let indices = HostBuffer::from_i32(DataType::Int32, &[5]);
        let last = HostBuffer::from_i32(DataType::Int32, &[1]);
        let seqstart = HostBuffer::from_i32(DataType::Int32, &[0, 1]);
        let mut out = HostBuffer::zeros(DataType::Fp16, d);
        let mut args = BatchPrefillArgs {
            q: &qb,
            kv: PagedKv {
                k_pages: &pages,
                v_pages: &pages,
                kv_indptr: &indptr,
                kv_page_indices: &indices,
                kv_last_page_lens: &last,
                num_pages: 2,
                page_block_size: 1,
            },
            bias: None,
            seqstart_q: &seqstart,
            out: &mut out,
            lse: None,
            shape: AttentionShape::batch(1, 1, 1, 1, d, d),
            params: AttentionParams::new(d),
        };
        let err = batch_prefill(&traits, &MaskInfo::none(), &mut args).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidArgument(_)));
    }
}
