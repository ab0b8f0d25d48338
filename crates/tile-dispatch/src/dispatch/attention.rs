use super::select_fmha_kernel;
use crate::config::{mha_batch_prefill_traits, mha_fwd_splitkv_traits, mha_fwd_traits};
use crate::error::{DispatchError, Result};
use crate::launch::{
    run_timed, validate_batch_prefill, validate_fwd, validate_splitkv, AttentionShape,
    BatchPrefillArgs, ComputeBackend, FmhaFwdArgs, FmhaSplitKvArgs, StreamConfig,
};
use crate::types::{BiasKind, MaskInfo};

fn head_sizes(shape: &AttentionShape) -> Result<(u32, u32)> {
    let hq = u32::try_from(shape.hdim_q)
        .map_err(|_| {
            DispatchError::InvalidArgument(format!("hdim_q {} out of range", shape.hdim_q))
        })?;
    let hv = u32::try_from(shape.hdim_v)
        .map_err(|_| {
            DispatchError::InvalidArgument(format!("hdim_v {} out of range", shape.hdim_v))
        })?;
    Ok((hq, hv))
}

fn max_seqlen_q(shape: &AttentionShape) -> Result<u32> {
    u32::try_from(shape.max_seqlen_q).map_err(|_| {
        DispatchError::InvalidArgument(format!("max_seqlen_q {} out of range", shape.max_seqlen_q))
    })
}

/// Dense attention forward.
///
/// Soft-capping is enabled when `args.params.logits_soft_cap > 0` and dropout
/// when `args.params.p_drop > 0`. Writes `args.out` and, with `has_lse`,
/// `args.lse`.
#[allow(clippy::too_many_arguments)]
pub fn mha_fwd<B: ComputeBackend + ?Sized>(
    backend: &B,
    args: &mut FmhaFwdArgs<'_, B::Buffer>,
    stream: &StreamConfig<B::Stream>,
    dtype: &str,
    is_group_mode: bool,
    mask: &MaskInfo,
    bias_type: BiasKind,
    has_lse: bool,
) -> Result<f32> {
    let (hq, hv) = head_sizes(&args.shape)?;
    let traits = mha_fwd_traits(
        hq,
        hv,
        dtype,
        is_group_mode,
        args.params.has_logits_soft_cap(),
        mask,
        bias_type,
        has_lse,
        args.params.has_dropout(),
    )?;
    validate_fwd(&traits, args)?;
    let kernel = select_fmha_kernel(&traits, max_seqlen_q(&args.shape)?)?;

    run_timed(backend, stream, || {
        backend.launch_fmha_fwd(kernel, &traits, mask, args, &stream.stream)
    })
}

/// Split key/value attention forward.
///
/// The KV range of every sequence is cut into `args.num_splits` chunks whose
/// partial results land in `args.lse_acc`/`args.o_acc` before being merged
/// into `args.out`. Dropout is not available on this path.
#[allow(clippy::too_many_arguments)]
pub fn mha_fwd_splitkv<B: ComputeBackend + ?Sized>(
    backend: &B,
    args: &mut FmhaSplitKvArgs<'_, B::Buffer>,
    stream: &StreamConfig<B::Stream>,
    dtype: &str,
    is_group_mode: bool,
    mask: &MaskInfo,
    bias_type: BiasKind,
    has_lse: bool,
) -> Result<f32> {
    let (hq, hv) = head_sizes(&args.shape)?;
    let traits = mha_fwd_splitkv_traits(
        hq,
        hv,
        dtype,
        is_group_mode,
        args.params.has_logits_soft_cap(),
        mask,
        bias_type,
        has_lse,
    )?;
    validate_splitkv(&traits, args)?;
    let kernel = select_fmha_kernel(&traits, max_seqlen_q(&args.shape)?)?;

    run_timed(backend, stream, || {
        backend.launch_fmha_splitkv(kernel, &traits, mask, args, &stream.stream)
    })
}

/// Batched variable-length prefill against a paged KV cache.
///
/// Batch prefill always runs in group mode; `is_group_mode = false` is
/// rejected as an unsupported configuration.
#[allow(clippy::too_many_arguments)]
pub fn mha_batch_prefill<B: ComputeBackend + ?Sized>(
    backend: &B,
    args: &mut BatchPrefillArgs<'_, B::Buffer>,
    stream: &StreamConfig<B::Stream>,
    dtype: &str,
    is_group_mode: bool,
    mask: &MaskInfo,
    bias_type: BiasKind,
    has_lse: bool,
) -> Result<f32> {
    let (hq, hv) = head_sizes(&args.shape)?;
    let traits = mha_batch_prefill_traits(
        hq,
        hv,
        dtype,
        is_group_mode,
        args.params.has_logits_soft_cap(),
        mask,
        bias_type,
        has_lse,
        args.params.has_dropout(),
    )?;
    validate_batch_prefill(&traits, args)?;
    let kernel = select_fmha_kernel(&traits, max_seqlen_q(&args.shape)?)?;

    run_timed(backend, stream, || {
        backend.launch_batch_prefill(kernel, &traits, mask, args, &stream.stream)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostBackend, HostBuffer};
    use crate::launch::AttentionParams;
    use crate::types::DataType;

    struct Buffers {
        q: HostBuffer,
        k: HostBuffer,
        v: HostBuffer,
        out: HostBuffer,
        lse: HostBuffer,
    }

    fn buffers(shape: &AttentionShape, dtype: DataType) -> Buffers {
        let rq = shape.batch * shape.seqlen_q * shape.nhead_q;
        let rk = shape.batch * shape.seqlen_k * shape.nhead_k;
        let wave = |n: usize, s: usize| -> Vec<f32> {
            (0..n).map(|i| ((i * 7 + s) % 13) as f32 / 13.0 - 0.5).collect()
        };
        Buffers {
            q: HostBuffer::from_f32(dtype, &wave(rq * shape.hdim_q, 1)),
            k: HostBuffer::from_f32(dtype, &wave(rk * shape.hdim_q, 2)),
            v: HostBuffer::from_f32(dtype, &wave(rk * shape.hdim_v, 3)),
            out: HostBuffer::zeros(dtype, rq * shape.hdim_v),
            lse: HostBuffer::zeros(DataType::Fp32, rq),
        }
    }

    #[test]
    fn test_lse_required_when_requested() {
        let shape = AttentionShape::batch(1, 2, 8, 8, 64, 64);
        let mut b = buffers(&shape, DataType::Fp16);
        let mut args = FmhaFwdArgs {
            q: &b.q,
            k: &b.k,
            v: &b.v,
            bias: None,
            seqstart_q: None,
            seqstart_k: None,
            out: &mut b.out,
            lse: None,
            shape,
            params: AttentionParams::new(64),
        };
        let err = mha_fwd(
            &HostBackend,
            &mut args,
            &StreamConfig::new(()),
            "fp16",
            false,
            &MaskInfo::none(),
            BiasKind::None,
            true,
        )
        .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidArgument(_)));
    }

    #[test]
    fn test_gqa_ratio_checked() {
        let shape = AttentionShape::batch(1, 3, 4, 4, 32, 32).with_kv_heads(2);
        let mut b = buffers(&shape, DataType::Bf16);
        let mut args = FmhaFwdArgs {
            q: &b.q,
            k: &b.k,
            v: &b.v,
            bias: None,
            seqstart_q: None,
            seqstart_k: None,
            out: &mut b.out,
            lse: None,
            shape,
            params: AttentionParams::new(32),
        };
        assert!(mha_fwd(
            &HostBackend,
            &mut args,
            &StreamConfig::new(()),
            "bf16",
            false,
            &MaskInfo::none(),
            BiasKind::None,
            false,
        )
        .is_err());
    }

    #[test]
    fn test_gqa_shares_kv_heads() {
        let d = 32;
        let shape = AttentionShape::batch(1, 4, 6, 6, d, d).with_kv_heads(1);
        let mut b = buffers(&shape, DataType::Fp16);
        let mut args = FmhaFwdArgs {
            q: &b.q,
            k: &b.k,
            v: &b.v,
            bias: None,
            seqstart_q: None,
            seqstart_k: None,
            out: &mut b.out,
            lse: Some(&mut b.lse),
            shape,
            params: AttentionParams::new(d),
        };
        let ms = mha_fwd(
            &HostBackend,
            &mut args,
            &StreamConfig::new(()),
            "fp16",
            false,
            &MaskInfo::causal(),
            BiasKind::None,
            true,
        )
        .unwrap();
        assert_eq!(ms, 0.0);
        // First query row sees a single key, so its output is that value row.
        let out = b.out.to_f32();
        let v = b.v.to_f32();
        for c in 0..d {
            assert!((out[c] - v[c]).abs() < 1e-3);
        }
        assert!(b.lse.to_f32()[0].is_finite());
    }

    #[test]
    fn test_soft_cap_bounds_scores() {
        let d = 64;
        let shape = AttentionShape::batch(1, 1, 1, 2, d, d);
        let q = HostBuffer::from_f32(DataType::Bf16, &vec![4.0; d]);
        let k = HostBuffer::from_f32(DataType::Bf16, &[vec![4.0; d], vec![-4.0; d]].concat());
        let v = HostBuffer::from_f32(DataType::Bf16, &[vec![1.0; d], vec![0.0; d]].concat());
        let mut out = HostBuffer::zeros(DataType::Bf16, d);
        let mut lse = HostBuffer::zeros(DataType::Fp32, 1);
        let mut args = FmhaFwdArgs {
            q: &q,
            k: &k,
            v: &v,
            bias: None,
            seqstart_q: None,
            seqstart_k: None,
            out: &mut out,
            lse: Some(&mut lse),
            shape,
            params: AttentionParams::new(d).with_soft_cap(1.0),
        };
        mha_fwd(
            &HostBackend,
            &mut args,
            &StreamConfig::new(()),
            "bf16",
            false,
            &MaskInfo::none(),
            BiasKind::None,
            true,
        )
        .unwrap();
        // Scores are capped to about +-1, so the weights are e/(e + 1/e).
        let p = 1.0f32.exp() / (1.0f32.exp() + (-1.0f32).exp());
        assert!((out.to_f32()[0] - p).abs() < 1e-2);
        assert!(lse.to_f32()[0] < 1.5);
    }

    #[test]
    fn test_alibi_penalizes_distance() {
        let d = 32;
        let shape = AttentionShape::batch(1, 1, 1, 3, d, d);
        let q = HostBuffer::from_f32(DataType::Fp16, &vec![0.0; d]);
        let k = HostBuffer::from_f32(DataType::Fp16, &vec![0.0; 3 * d]);
        let v = HostBuffer::from_f32(
            DataType::Fp16,
            &[vec![1.0; d], vec![2.0; d], vec![3.0; d]].concat(),
        );
        let slopes = HostBuffer::from_f32(DataType::Fp32, &[100.0]);
        let mut out = HostBuffer::zeros(DataType::Fp16, d);
        let mut args = FmhaFwdArgs {
            q: &q,
            k: &k,
            v: &v,
            bias: Some(&slopes),
            seqstart_q: None,
            seqstart_k: None,
            out: &mut out,
            lse: None,
            shape,
            params: AttentionParams::new(d),
        };
        mha_fwd(
            &HostBackend,
            &mut args,
            &StreamConfig::new(()),
            "fp16",
            false,
            &MaskInfo::none(),
            BiasKind::Alibi,
            false,
        )
        .unwrap();
        // Only the diagonal key survives a steep slope.
        assert!((out.to_f32()[0] - 3.0).abs() < 1e-2);
    }

    #[test]
    fn test_group_mode_matches_batch_mode() {
        let d = 64;
        let (sq, sk) = (5, 7);
        let batch_shape = AttentionShape::batch(2, 1, sq, sk, d, d);
        let mut b = buffers(&batch_shape, DataType::Bf16);
        let mask = MaskInfo::causal();

        let mut dense_args = FmhaFwdArgs {
            q: &b.q,
            k: &b.k,
            v: &b.v,
            bias: None,
            seqstart_q: None,
            seqstart_k: None,
            out: &mut b.out,
            lse: None,
            shape: batch_shape,
            params: AttentionParams::new(d),
        };
        mha_fwd(
            &HostBackend,
            &mut dense_args,
            &StreamConfig::new(()),
            "bf16",
            false,
            &mask,
            BiasKind::None,
            false,
        )
        .unwrap();

        // The same two sequences packed back to back.
        let group_shape = AttentionShape::group(2, 1, 2 * sq, 2 * sk, sq, sk, d, d);
        let sq_start = HostBuffer::from_i32(DataType::Int32, &[0, sq as i32, 2 * sq as i32]);
        let sk_start = HostBuffer::from_i32(DataType::Int32, &[0, sk as i32, 2 * sk as i32]);
        let mut group_out = HostBuffer::zeros(DataType::Bf16, 2 * sq * d);
        let mut group_args = FmhaFwdArgs {
            q: &b.q,
            k: &b.k,
            v: &b.v,
            bias: None,
            seqstart_q: Some(&sq_start),
            seqstart_k: Some(&sk_start),
            out: &mut group_out,
            lse: None,
            shape: group_shape,
            params: AttentionParams::new(d),
        };
        mha_fwd(
            &HostBackend,
            &mut group_args,
            &StreamConfig::new(()),
            "bf16",
            true,
            &mask,
            BiasKind::None,
            false,
        )
        .unwrap();

        assert_eq!(b.out, group_out);
    }

    #[test]
    fn test_splitkv_rejects_dropout() {
        let d = 32;
        let shape = AttentionShape::batch(1, 1, 1, 8, d, d);
        let mut b = buffers(&shape, DataType::Fp16);
        let mut lse_acc = HostBuffer::zeros(DataType::Fp32, 2);
        let mut o_acc = HostBuffer::zeros(DataType::Fp32, 2 * d);
        let mut args = FmhaSplitKvArgs {
            q: &b.q,
            k: &b.k,
            v: &b.v,
            bias: None,
            seqstart_q: None,
            seqstart_k: None,
            out: &mut b.out,
            lse: None,
            lse_acc: &mut lse_acc,
            o_acc: &mut o_acc,
            num_splits: 2,
            shape,
            params: AttentionParams::new(d).with_dropout(0.1, 1, 0),
        };
        let err = mha_fwd_splitkv(
            &HostBackend,
            &mut args,
            &StreamConfig::new(()),
            "fp16",
            false,
            &MaskInfo::none(),
            BiasKind::None,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidArgument(_)));
    }
}
