// SPDX-License-Identifier: Apache-2.0

//! The tensor-level attention entry point.
//!
//! [`run_attention`] is the quantize-then-dispatch pipeline: validate the
//! launch, quantize Q and K to per-block INT8 (and V to per-channel FP8
//! when the V-rescale fusion is requested), select the kernel variant by
//! exact key match, and launch it. Callers that manage their own quantized
//! buffers can go through [`run_attention_quantized`] instead and skip the
//! tensor conversion.

use candle_core::{DType, Tensor};

use crate::error::{Result, SageError};
use crate::kernels::config::{AttentionConfig, F16_SAFE_KV_LEN, SUPPORTED_HEAD_DIMS};
use crate::kernels::{registry, AccumPrecision, LaunchParams, ValueView};
use crate::quant::{quantize_fp8_per_channel, quantize_int8, QuantStats};

/// Scaled dot-product attention over quantized inputs.
///
/// `q`, `k`, and `v` are contiguous `[batch, heads, seq, head_dim]`
/// tensors; `q` may have a different sequence length than `k`/`v`. The
/// output is a full-precision tensor of `q`'s shape on `q`'s device.
///
/// # Errors
///
/// * [`SageError::ShapeMismatch`] for non-4D, non-contiguous, or
///   inconsistent inputs, or an unsupported head dimension.
/// * [`SageError::UnsupportedConfiguration`] when no kernel variant is
///   registered for the configuration's key.
/// * [`SageError::AccumulationOverflow`] from the f16 accumulation path.
pub fn run_attention(q: &Tensor, k: &Tensor, v: &Tensor, config: &AttentionConfig) -> Result<Tensor> {
    config.validate()?;

    let (batch, heads, q_len, head_dim) = q.dims4()?;
    let (kb, kh, kv_len, kd) = k.dims4()?;
    let v_dims = v.dims4()?;

    if (kb, kh, kd) != (batch, heads, head_dim) {
        return Err(SageError::ShapeMismatch {
            expected: format!("K with batch/heads/head_dim [{batch}, {heads}, _, {head_dim}]"),
            actual: k.dims().to_vec(),
        });
    }
    if v_dims != (kb, kh, kv_len, kd) {
        return Err(SageError::ShapeMismatch {
            expected: format!("V with shape [{kb}, {kh}, {kv_len}, {kd}]"),
            actual: v.dims().to_vec(),
        });
    }
    if !SUPPORTED_HEAD_DIMS.contains(&head_dim) {
        return Err(SageError::ShapeMismatch {
            expected: format!("head_dim in {SUPPORTED_HEAD_DIMS:?}"),
            actual: vec![head_dim],
        });
    }
    for (tensor, name) in [(q, "Q"), (k, "K"), (v, "V")] {
        if !tensor.is_contiguous() {
            return Err(SageError::ShapeMismatch {
                expected: format!("contiguous row-major {name}"),
                actual: tensor.dims().to_vec(),
            });
        }
    }

    let q_data = q.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let k_data = k.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let v_data = v.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;

    let out = run_attention_inner(
        &q_data,
        [batch, heads, q_len, head_dim],
        &k_data,
        &v_data,
        [batch, heads, kv_len, head_dim],
        config,
    )?;

    Ok(Tensor::from_vec(
        out,
        (batch, heads, q_len, head_dim),
        q.device(),
    )?)
}

/// The quantization and dispatch pipeline over raw f32 slices.
pub(crate) fn run_attention_inner(
    q_data: &[f32],
    q_shape: [usize; 4],
    k_data: &[f32],
    v_data: &[f32],
    kv_shape: [usize; 4],
    config: &AttentionConfig,
) -> Result<Vec<f32>> {
    // Key smoothing shifts scores by a whole-sequence channel mean; under
    // causal masking that statistic would couple early rows to later keys
    // through the quantization grid, so it is skipped there.
    let smooth_k = config.smooth_k && !config.causal;
    if config.smooth_k && !smooth_k {
        tracing::debug!("key smoothing disabled for causal launch");
    }

    let mut stats = QuantStats::default();
    let (q, q_stats) = quantize_int8(q_data, q_shape, config.quant_block_rows, false)?;
    stats.merge(&q_stats);
    let (k, k_stats) = quantize_int8(k_data, kv_shape, config.quant_block_rows, smooth_k)?;
    stats.merge(&k_stats);

    let fp8_v;
    let v = if config.fuse_v_scale {
        let (tensor, v_stats) = quantize_fp8_per_channel(v_data, kv_shape)?;
        stats.merge(&v_stats);
        fp8_v = tensor;
        ValueView::Fp8(&fp8_v)
    } else {
        ValueView::F32 {
            data: v_data,
            shape: kv_shape,
        }
    };

    let kv_len = kv_shape[2];
    if config.accum == AccumPrecision::F16 && kv_len > F16_SAFE_KV_LEN {
        tracing::warn!(
            kv_len,
            limit = F16_SAFE_KV_LEN,
            "f16 accumulation over a long sequence; running sums may overflow"
        );
    }

    let key = config.kernel_key();
    let kernel = registry().select(&key)?;
    let head_dim = q_shape[3];
    tracing::debug!(
        kernel = kernel.name(),
        key = %key,
        workspace_bytes = kernel.workspace(head_dim).total_bytes(),
        degenerate_blocks = stats.degenerate_blocks,
        "dispatching attention kernel"
    );

    let params = LaunchParams {
        q: &q,
        k: &k,
        v,
        softmax_scale: config.resolved_softmax_scale(head_dim),
        causal: config.causal,
        fusion: config.fusion(),
    };
    let mut out = vec![0.0f32; q_shape.iter().product()];
    kernel.launch(&params, &mut out)?;
    Ok(out)
}

/// Attention over caller-quantized inputs, bypassing tensor conversion and
/// quantization. The output is row-major `[batch, heads, q_len, head_dim]`.
///
/// The value view must match the configuration: FP8 exactly when
/// `fuse_v_scale` is set.
///
/// # Errors
///
/// Same as [`run_attention`], plus [`SageError::InvalidConfig`] when the
/// value representation contradicts the fusion flags.
pub fn run_attention_quantized(
    q: &crate::quant::Int8Tensor,
    k: &crate::quant::Int8Tensor,
    v: ValueView<'_>,
    config: &AttentionConfig,
) -> Result<Vec<f32>> {
    config.validate()?;

    let [batch, heads, q_len, head_dim] = q.shape;
    let key = config.kernel_key();
    let kernel = registry().select(&key)?;
    tracing::debug!(kernel = kernel.name(), key = %key, "dispatching pre-quantized launch");

    let params = LaunchParams {
        q,
        k,
        v,
        softmax_scale: config.resolved_softmax_scale(head_dim),
        causal: config.causal,
        fusion: config.fusion(),
    };
    let mut out = vec![0.0f32; batch * heads * q_len * head_dim];
    kernel.launch(&params, &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CudaArch;
    use candle_core::Device;

    #[test]
    fn test_rejects_unsupported_head_dim() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 1, 8, 32), DType::F32, &device)?;
        let config = AttentionConfig::new(CudaArch::Sm80);
        let err = run_attention(&q, &q, &q, &config).unwrap_err();
        assert!(matches!(err, SageError::ShapeMismatch { .. }));
        Ok(())
    }

    #[test]
    fn test_rejects_mismatched_kv() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 8, 64), DType::F32, &device)?;
        let k = Tensor::zeros((1, 2, 8, 64), DType::F32, &device)?;
        let v = Tensor::zeros((1, 2, 4, 64), DType::F32, &device)?;
        let config = AttentionConfig::new(CudaArch::Sm80);
        let err = run_attention(&q, &k, &v, &config).unwrap_err();
        assert!(matches!(err, SageError::ShapeMismatch { .. }));
        Ok(())
    }

    #[test]
    fn test_rejects_non_contiguous_input() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 8, 64), DType::F32, &device)?;
        let kt = Tensor::zeros((1, 2, 64, 8), DType::F32, &device)?.transpose(2, 3)?;
        let config = AttentionConfig::new(CudaArch::Sm80);
        let err = run_attention(&q, &kt, &q, &config).unwrap_err();
        assert!(matches!(err, SageError::ShapeMismatch { .. }));
        Ok(())
    }

    #[test]
    fn test_unregistered_key_is_surfaced() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 1, 8, 64), DType::F32, &device)?;
        // Sm80 has no FP8 value path, so v_scale fusion cannot dispatch.
        let config = AttentionConfig::new(CudaArch::Sm80).with_fusion(true, false);
        let err = run_attention(&q, &q, &q, &config).unwrap_err();
        assert!(matches!(err, SageError::UnsupportedConfiguration { .. }));
        Ok(())
    }
}
