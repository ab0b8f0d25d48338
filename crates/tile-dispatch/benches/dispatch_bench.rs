//! Benchmarks for kernel selection and host execution.
//!
//! This benchmark compares:
//! - Descriptor construction plus registry lookup (the per-call dispatch cost)
//! - Host grouped GEMM stage 2 across expert tile buckets
//! - Host attention forward against split-KV

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tile_dispatch::prelude::*;

fn random_vec(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.random_range(-1.0..1.0)).collect()
}

/// Benchmark building traits and selecting a kernel.
fn bench_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("Selection");

    group.bench_function("moe_gemm", |bench| {
        bench.iter(|| {
            let traits = moe_gemm_traits(
                MoeStage::Stage2,
                DataType::Fp8,
                DataType::Fp8,
                DataType::Bf16,
                QuantKind::PerTensor,
                true,
            )
            .unwrap();
            black_box(select_gemm_kernel(&traits, black_box(100)).unwrap())
        });
    });

    group.bench_function("mha_fwd", |bench| {
        let mask = MaskInfo::causal();
        bench.iter(|| {
            let traits = mha_fwd_traits(
                128,
                128,
                "bf16",
                true,
                false,
                &mask,
                BiasKind::None,
                true,
                false,
            )
            .unwrap();
            black_box(select_fmha_kernel(&traits, black_box(2048)).unwrap())
        });
    });

    group.finish();
}

/// Benchmark host stage 2 for each expert tile bucket.
fn bench_host_moe(c: &mut Criterion) {
    let mut group = c.benchmark_group("Host_MoE_Stage2");
    group.sample_size(20);

    let (tokens, topk, experts, n, k) = (128, 2, 8, 256, 256);
    let mut rng = StdRng::seed_from_u64(0);
    let topk_ids: Vec<i32> = (0..tokens * topk)
        .map(|i| ((i * 5 + i / topk) % experts) as i32)
        .collect();
    let topk_weights = vec![0.5f32; tokens * topk];
    let input = HostBuffer::from_f32(DataType::Bf16, &random_vec(&mut rng, tokens * topk * k));
    let weight = HostBuffer::from_f32(DataType::Bf16, &random_vec(&mut rng, experts * n * k));
    let traits = moe_gemm_traits(
        MoeStage::Stage2,
        DataType::Bf16,
        DataType::Bf16,
        DataType::Bf16,
        QuantKind::None,
        false,
    )
    .unwrap();

    group.throughput(Throughput::Elements((2 * tokens * topk * n * k) as u64));

    for block_m in [32usize, 64, 128] {
        let sorted = moe_sorting(&topk_ids, &topk_weights, topk, experts, block_m)
            .unwrap()
            .host_buffers();
        let mut out = HostBuffer::zeros(DataType::Bf16, tokens * n);

        group.bench_with_input(BenchmarkId::new("bf16", block_m), &block_m, |bench, &block_m| {
            bench.iter(|| {
                let mut args = MoeGemmArgs {
                    input: &input,
                    weight: &weight,
                    sorted_token_ids: &sorted.sorted_token_ids,
                    sorted_expert_ids: &sorted.sorted_expert_ids,
                    sorted_weights: Some(&sorted.sorted_weights),
                    num_valid_ids: &sorted.num_valid_ids,
                    a_scale: None,
                    w_scale: None,
                    out: &mut out,
                    tokens,
                    topk,
                    num_experts: experts,
                    n,
                    k,
                    block_m,
                    activation: ActivationType::Silu,
                };
                black_box(
                    moe_gemm_stage2(
                        &HostBackend,
                        &traits,
                        &mut args,
                        &StreamConfig::new(()),
                    )
                    .unwrap(),
                )
            });
        });
    }

    group.finish();
}

/// Benchmark host attention forward against split-KV on a long KV range.
fn bench_host_attention(c: &mut Criterion) {
    let mut group = c.benchmark_group("Host_Attention");
    group.sample_size(10);

    let (batch, nhead, sq, sk, d) = (1, 4, 16, 1024, 64);
    let shape = AttentionShape::batch(batch, nhead, sq, sk, d, d);
    let mut rng = StdRng::seed_from_u64(1);
    let q = HostBuffer::from_f32(DataType::Fp16, &random_vec(&mut rng, batch * sq * nhead * d));
    let k = HostBuffer::from_f32(DataType::Fp16, &random_vec(&mut rng, batch * sk * nhead * d));
    let v = HostBuffer::from_f32(DataType::Fp16, &random_vec(&mut rng, batch * sk * nhead * d));
    let mask = MaskInfo::causal();
    let mut out = HostBuffer::zeros(DataType::Fp16, batch * sq * nhead * d);

    group.bench_function("fwd", |bench| {
        bench.iter(|| {
            let mut args = FmhaFwdArgs {
                q: &q,
                k: &k,
                v: &v,
                bias: None,
                seqstart_q: None,
                seqstart_k: None,
                out: &mut out,
                lse: None,
                shape,
                params: AttentionParams::new(d),
            };
            black_box(
                mha_fwd(
                    &HostBackend,
                    &mut args,
                    &StreamConfig::new(()),
                    "fp16",
                    false,
                    &mask,
                    BiasKind::None,
                    false,
                )
                .unwrap(),
            )
        });
    });

    for splits in [2usize, 4, 8] {
        let rows = shape.lse_len(false);
        let mut lse_acc = HostBuffer::zeros(DataType::Fp32, splits * rows);
        let mut o_acc = HostBuffer::zeros(DataType::Fp32, splits * rows * d);

        group.bench_with_input(BenchmarkId::new("splitkv", splits), &splits, |bench, &splits| {
            bench.iter(|| {
                let mut args = FmhaSplitKvArgs {
                    q: &q,
                    k: &k,
                    v: &v,
                    bias: None,
                    seqstart_q: None,
                    seqstart_k: None,
                    out: &mut out,
                    lse: None,
                    lse_acc: &mut lse_acc,
                    o_acc: &mut o_acc,
                    num_splits: splits,
                    shape,
                    params: AttentionParams::new(d),
                };
                black_box(
                    mha_fwd_splitkv(
                        &HostBackend,
                        &mut args,
                        &StreamConfig::new(()),
                        "fp16",
                        false,
                        &mask,
                        BiasKind::None,
                        false,
                    )
                    .unwrap(),
                )
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_selection, bench_host_moe, bench_host_attention);
criterion_main!(benches);
