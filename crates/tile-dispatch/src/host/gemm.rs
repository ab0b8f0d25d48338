use super::{map_ordered, read_offsets, HostBuffer};
use crate::epilogue::{Epilogue, MultiplyMultiply};
use crate::error::{DispatchError, Result};
use crate::launch::{MoeGemmArgs, QUANT_BLOCK};
use crate::moe::{shuffle_col_tile, shuffled_index, unpack_token_id};
use crate::registry::GemmKernel;
use crate::types::{DataType, MoeStage, QuantKind, TraitDescriptor};

/// Element offset of `(row, col)` inside one expert's `[n, k]` weight.
trait WeightAccess: Sync {
    fn index(&self, row: usize, col: usize, k: usize) -> usize;
}

struct RowMajor;

impl WeightAccess for RowMajor {
    #[inline]
    fn index(&self, row: usize, col: usize, k: usize) -> usize {
        row * k + col
    }
}

struct Preshuffled {
    col_tile: usize,
}

impl WeightAccess for Preshuffled {
    #[inline]
    fn index(&self, row: usize, col: usize, k: usize) -> usize {
        shuffled_index(row, col, k, self.col_tile)
    }
}

/// Wide accumulator for one input element family.
trait Accumulate: Copy + Send + Sync {
    const ZERO: Self;

    fn decode(dtype: DataType, bytes: &[u8]) -> Vec<Self>;

    fn mul_add(self, a: Self, b: Self) -> Self;

    fn widen(self) -> f32;
}

impl Accumulate for f32 {
    const ZERO: Self = 0.0;

    fn decode(dtype: DataType, bytes: &[u8]) -> Vec<Self> {
        dtype.to_f32(bytes)
    }

    #[inline]
    fn mul_add(self, a: Self, b: Self) -> Self {
        self + a * b
    }

    #[inline]
    fn widen(self) -> f32 {
        self
    }
}

impl Accumulate for i32 {
    const ZERO: Self = 0;

    fn decode(dtype: DataType, bytes: &[u8]) -> Vec<Self> {
        dtype.to_i32(bytes)
    }

    #[inline]
    fn mul_add(self, a: Self, b: Self) -> Self {
        self.wrapping_add(a.wrapping_mul(b))
    }

    #[inline]
    fn widen(self) -> f32 {
        self as f32
    }
}

/// One valid row of the sorted routing.
#[derive(Debug, Clone, Copy)]
struct RoutedRow {
    /// Position in `sorted_token_ids`.
    pos: usize,
    token: usize,
    slot: usize,
    expert: usize,
}

/// Scales in the layout the quantization mode prescribes.
enum Scales {
    None,
    PerTensor { a: f32, w: Vec<f32> },
    PerBlock { a: Vec<f32>, w: Vec<f32>, k_blocks: usize, n_blocks: usize },
}

struct Problem<A> {
    input: Vec<A>,
    weight: Vec<A>,
    scales: Scales,
    n: usize,
    k: usize,
}

impl<A: Accumulate> Problem<A> {
    /// Scaled accumulator row for input row `row` against `expert`.
    fn row<W: WeightAccess>(&self, access: &W, row: usize, expert: usize) -> Vec<f32> {
        let (n, k) = (self.n, self.k);
        let x = &self.input[row * k..(row + 1) * k];
        let w = &self.weight[expert * n * k..(expert + 1) * n * k];

        (0..n)
            .map(|col| match &self.scales {
                Scales::PerBlock { a, w: ws, k_blocks, n_blocks } => {
                    let mut total = 0.0f32;
                    for kb in 0..*k_blocks {
                        let lo = kb * QUANT_BLOCK;
                        let hi = (lo + QUANT_BLOCK).min(k);
                        let mut acc = A::ZERO;
                        for c in lo..hi {
                            acc = acc.mul_add(x[c], w[access.index(col, c, k)]);
                        }
                        let op = MultiplyMultiply::new(
                            a[row * k_blocks + kb],
                            ws[(expert * n_blocks + col / QUANT_BLOCK) * k_blocks + kb],
                        );
                        total += op.apply(acc.widen());
                    }
                    total
                }
                scales => {
                    let mut acc = A::ZERO;
                    for c in 0..k {
                        acc = acc.mul_add(x[c], w[access.index(col, c, k)]);
                    }
                    let op = match scales {
                        Scales::PerTensor { a, w: ws } => MultiplyMultiply::new(*a, ws[expert]),
                        _ => MultiplyMultiply::IDENTITY,
                    };
                    op.apply(acc.widen())
                }
            })
            .collect()
    }
}

pub(super) fn run(
    kernel: &GemmKernel,
    traits: &TraitDescriptor,
    args: &mut MoeGemmArgs<'_, HostBuffer>,
) -> Result<()> {
    let stage = traits.moe_stage().ok_or_else(|| {
        DispatchError::Backend(format!("{} launched with a non-GEMM descriptor", kernel))
    })?;
    let rows = routed_rows(args)?;

    if traits.accumulator == DataType::Int32 {
        run_typed::<i32>(kernel, traits, stage, &rows, args)
    } else {
        run_typed::<f32>(kernel, traits, stage, &rows, args)
    }
}

fn run_typed<A: Accumulate>(
    kernel: &GemmKernel,
    traits: &TraitDescriptor,
    stage: MoeStage,
    rows: &[RoutedRow],
    args: &mut MoeGemmArgs<'_, HostBuffer>,
) -> Result<()> {
    let problem = Problem::<A> {
        input: A::decode(traits.activation, args.input.as_bytes()),
        weight: A::decode(traits.weight, args.weight.as_bytes()),
        scales: read_scales(traits.quantization, args),
        n: args.n,
        k: args.k,
    };
    let input_row = |r: &RoutedRow| match stage {
        MoeStage::Stage1 => r.token,
        MoeStage::Stage2 => r.token * args.topk + r.slot,
    };

    let results = if kernel.swizzled {
        let access = Preshuffled {
            col_tile: shuffle_col_tile(traits.weight),
        };
        map_ordered(rows, |r| problem.row(&access, input_row(r), r.expert))
    } else {
        map_ordered(rows, |r| problem.row(&RowMajor, input_row(r), r.expert))
    };

    let out = match stage {
        MoeStage::Stage1 => stage1_epilogue(args, traits.is_gated, rows, &results),
        MoeStage::Stage2 => stage2_epilogue(args, rows, &results),
    };
    // One narrowing step for the whole output.
    let bytes = Epilogue::new(MultiplyMultiply::IDENTITY, traits.output).store(&out);
    args.out.store_bytes(bytes)
}

/// `act(gate) * up` for gated experts, `act(y)` otherwise, one row per
/// `(token, slot)`.
fn stage1_epilogue(
    args: &MoeGemmArgs<'_, HostBuffer>,
    gated: bool,
    rows: &[RoutedRow],
    results: &[Vec<f32>],
) -> Vec<f32> {
    let cols = args.output_cols(MoeStage::Stage1, gated);
    let mut out = vec![0.0f32; args.tokens * args.topk * cols];
    for (r, y) in rows.iter().zip(results) {
        let dst = &mut out[(r.token * args.topk + r.slot) * cols..][..cols];
        if gated {
            for (i, d) in dst.iter_mut().enumerate() {
                *d = args.activation.apply(y[i]) * y[cols + i];
            }
        } else {
            for (d, &v) in dst.iter_mut().zip(y) {
                *d = args.activation.apply(v);
            }
        }
    }
    out
}

/// Routing-weighted sum over each token's slots, in slot order.
fn stage2_epilogue(
    args: &MoeGemmArgs<'_, HostBuffer>,
    rows: &[RoutedRow],
    results: &[Vec<f32>],
) -> Vec<f32> {
    let n = args.n;
    let weights = args
        .sorted_weights
        .map(|w| w.to_f32())
        .unwrap_or_default();

    let mut partials: Vec<Option<Vec<f32>>> = vec![None; args.tokens * args.topk];
    for (r, y) in rows.iter().zip(results) {
        let routing = weights.get(r.pos).copied().unwrap_or(0.0);
        let epilogue =
            Epilogue::new(MultiplyMultiply::IDENTITY, DataType::Fp32).with_routing_weight(routing);
        partials[r.token * args.topk + r.slot] = Some(
            y.iter().map(|&v| epilogue.scale(v)).collect(),
        );
    }

    let mut out = vec![0.0f32; args.tokens * n];
    for (token, dst) in out.chunks_mut(n).enumerate() {
        for slot in 0..args.topk {
            if let Some(p) = &partials[token * args.topk + slot] {
                for (d, v) in dst.iter_mut().zip(p) {
                    *d += v;
                }
            }
        }
    }
    out
}

fn read_scales(quant: QuantKind, args: &MoeGemmArgs<'_, HostBuffer>) -> Scales {
    let a = args.a_scale.map(|b| b.to_f32()).unwrap_or_default();
    let w = args.w_scale.map(|b| b.to_f32()).unwrap_or_default();
    match quant {
        QuantKind::None => Scales::None,
        QuantKind::PerTensor => Scales::PerTensor {
            a: a.first().copied().unwrap_or(1.0),
            w,
        },
        QuantKind::PerBlock => Scales::PerBlock {
            a,
            w,
            k_blocks: args.k.div_ceil(QUANT_BLOCK),
            n_blocks: args.n.div_ceil(QUANT_BLOCK),
        },
    }
}

/// Decode the sorted routing, dropping padding.
fn routed_rows(args: &MoeGemmArgs<'_, HostBuffer>) -> Result<Vec<RoutedRow>> {
    let ids = args.sorted_token_ids.to_i32();
    let experts = read_offsets("sorted_expert_ids", args.sorted_expert_ids)?;
    let num_valid = read_offsets("num_valid_ids", args.num_valid_ids)?
        .first()
        .copied()
        .unwrap_or(0)
        .min(ids.len());

    let mut rows = Vec::with_capacity(num_valid);
    for (pos, &id) in ids.iter().enumerate().take(num_valid) {
        let (token, slot) = unpack_token_id(id as u32);
        let (token, slot) = (token as usize, slot as usize);
        if token >= args.tokens {
            continue;
        }
        if slot >= args.topk {
            return Err(DispatchError::InvalidArgument(format!(
                "sorted_token_ids[{}]: slot {} >= topk {}",
                pos, slot, args.topk
            )));
        }
        let expert = experts[pos / args.block_m];
        if expert >= args.num_experts {
            return Err(DispatchError::InvalidArgument(format!(
                "sorted_expert_ids[{}]: expert {} >= {}",
                pos / args.block_m,
                expert,
                args.num_experts
            )));
        }
        rows.push(RoutedRow { pos, token, slot, expert });
    }
    Ok(rows)
}
