//! Benchmark for CUDA launches through the dispatcher.
//!
//! This benchmark compares:
//! - Grouped GEMM stage 2 across expert tile buckets
//! - Attention forward against split-KV for decode-shaped queries
//!
//! Needs a device and `TILE_DISPATCH_PTX`; skipped otherwise.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tile_dispatch::prelude::*;
use tile_dispatch::DispatchConfig;
use tile_dispatch_cuda::{get_global_context, CudaBackend, CudaContext, DeviceTensor};

fn context() -> Option<&'static CudaContext> {
    match get_global_context() {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            println!("CUDA not available ({}), skipping GPU benchmarks", e);
            None
        }
    }
}

fn random_tensor(ctx: &CudaContext, rng: &mut StdRng, dtype: DataType, len: usize) -> DeviceTensor {
    let values: Vec<f32> = (0..len).map(|_| rng.random_range(-1.0..1.0)).collect();
    DeviceTensor::from_f32(ctx, dtype, &values).unwrap()
}

/// Benchmark fp8 per-tensor stage 2 for each expert tile bucket.
fn bench_moe_stage2(c: &mut Criterion) {
    let Some(ctx) = context() else { return };
    let backend = CudaBackend::new(ctx);
    let mut group = c.benchmark_group("GPU_MoE_Stage2");
    group.sample_size(20);

    let (tokens, topk, experts, n, k) = (512, 8, 64, 4096, 1408);
    let mut rng = StdRng::seed_from_u64(0);
    let topk_ids: Vec<i32> = (0..tokens * topk)
        .map(|i| ((i * 7 + i / topk) % experts) as i32)
        .collect();
    let topk_weights = vec![1.0 / topk as f32; tokens * topk];
    let input = random_tensor(ctx, &mut rng, DataType::Fp8, tokens * topk * k);
    let weight = random_tensor(ctx, &mut rng, DataType::Fp8, experts * n * k);
    let a_scale = DeviceTensor::from_f32(ctx, DataType::Fp32, &[0.01]).unwrap();
    let w_scale = DeviceTensor::from_f32(ctx, DataType::Fp32, &vec![0.01; experts]).unwrap();
    let mut out = DeviceTensor::zeros(ctx, DataType::Bf16, tokens * n).unwrap();
    let traits = moe_gemm_traits(
        MoeStage::Stage2,
        DataType::Fp8,
        DataType::Fp8,
        DataType::Bf16,
        QuantKind::PerTensor,
        false,
    )
    .unwrap();

    group.throughput(Throughput::Elements((2 * tokens * topk * n * k) as u64));

    for block_m in [32usize, 64, 128] {
        let sorted = moe_sorting(&topk_ids, &topk_weights, topk, experts, block_m)
            .unwrap()
            .host_buffers();
        let ids = DeviceTensor::from_host(ctx, &sorted.sorted_token_ids).unwrap();
        let expert_ids = DeviceTensor::from_host(ctx, &sorted.sorted_expert_ids).unwrap();
        let weights = DeviceTensor::from_host(ctx, &sorted.sorted_weights).unwrap();
        let valid = DeviceTensor::from_host(ctx, &sorted.num_valid_ids).unwrap();
        let stream = StreamConfig::new(ctx.new_stream().unwrap());

        group.bench_with_input(BenchmarkId::new("fp8", block_m), &block_m, |bench, &block_m| {
            bench.iter(|| {
                let mut args = MoeGemmArgs {
                    input: &input,
                    weight: &weight,
                    sorted_token_ids: &ids,
                    sorted_expert_ids: &expert_ids,
                    sorted_weights: Some(&weights),
                    num_valid_ids: &valid,
                    a_scale: Some(&a_scale),
                    w_scale: Some(&w_scale),
                    out: &mut out,
                    tokens,
                    topk,
                    num_experts: experts,
                    n,
                    k,
                    block_m,
                    activation: ActivationType::Silu,
                };
                moe_gemm_stage2(&backend, &traits, &mut args, &stream).unwrap();
                ctx.synchronize().unwrap();
                black_box(&out);
            });
        });
    }

    group.finish();
}

/// Benchmark decode-shaped attention with and without KV splitting.
fn bench_attention(c: &mut Criterion) {
    let Some(ctx) = context() else { return };
    let backend = CudaBackend::new(ctx);
    let mut group = c.benchmark_group("GPU_Attention");
    group.sample_size(20);

    let (batch, nhead, sq, sk, d) = (4, 32, 1, 8192, 128);
    let shape = AttentionShape::batch(batch, nhead, sq, sk, d, d);
    let mut rng = StdRng::seed_from_u64(1);
    let q = random_tensor(ctx, &mut rng, DataType::Bf16, batch * sq * nhead * d);
    let k = random_tensor(ctx, &mut rng, DataType::Bf16, batch * sk * nhead * d);
    let v = random_tensor(ctx, &mut rng, DataType::Bf16, batch * sk * nhead * d);
    let mut out = DeviceTensor::zeros(ctx, DataType::Bf16, batch * sq * nhead * d).unwrap();
    let mask = MaskInfo::causal();
    let stream = StreamConfig::new(ctx.new_stream().unwrap());

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
            mha_fwd(
                &backend,
                &mut args,
                &stream,
                "bf16",
                false,
                &mask,
                BiasKind::None,
                false,
            )
            .unwrap();
            ctx.synchronize().unwrap();
        });
    });

    let traits = mha_fwd_splitkv_traits(
        128,
        128,
        "bf16",
        false,
        false,
        &mask,
        BiasKind::None,
        false,
    )
    .unwrap();
    let kernel = select_fmha_kernel(&traits, sq as u32).unwrap();
    let suggested = tile_dispatch::suggest_num_splits(
        &DispatchConfig::default(),
        batch,
        nhead,
        sq,
        sk,
        kernel.tile,
    );

    let mut counts = vec![suggested as usize, 8];
    counts.dedup();

    for splits in counts {
        let rows = shape.lse_len(false);
        let mut lse_acc = DeviceTensor::zeros(ctx, DataType::Fp32, splits * rows).unwrap();
        let mut o_acc = DeviceTensor::zeros(ctx, DataType::Fp32, splits * rows * d).unwrap();

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
                mha_fwd_splitkv(
                    &backend,
                    &mut args,
                    &stream,
                    "bf16",
                    false,
                    &mask,
                    BiasKind::None,
                    false,
                )
                .unwrap();
                ctx.synchronize().unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_moe_stage2, bench_attention);
criterion_main!(benches);
