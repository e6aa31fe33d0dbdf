// SPDX-License-Identifier: Apache-2.0

//! Quantized attention walkthrough: build inputs, run the pipeline under a
//! few configurations, and compare against full-precision matmul attention.
//!
//! Run with `cargo run --example quantized_attention`.

use anyhow::Result;
use candle_core::{DType, Device, Tensor, D};
use candle_nn::ops::softmax;

use sageattn_rs::{run_attention, AccumPrecision, AttentionConfig, CudaArch, Schedule};

fn full_precision_attention(q: &Tensor, k: &Tensor, v: &Tensor, scale: f64) -> Result<Tensor> {
    let scores = (q.matmul(&k.transpose(D::Minus2, D::Minus1)?)? * scale)?;
    let weights = softmax(&scores, D::Minus1)?;
    Ok(weights.matmul(v)?)
}

fn rel_l2_error(actual: &Tensor, expected: &Tensor) -> Result<f64> {
    let diff = (actual - expected)?.sqr()?.sum_all()?.to_scalar::<f32>()?;
    let norm = expected.sqr()?.sum_all()?.to_scalar::<f32>()?;
    Ok(f64::from(diff).sqrt() / f64::from(norm).sqrt())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let device = Device::Cpu;
    let (batch, heads, seq, head_dim) = (1, 8, 512, 64);
    let q = Tensor::randn(0.0f32, 1.0, (batch, heads, seq, head_dim), &device)?;
    let k = Tensor::randn(0.0f32, 1.0, (batch, heads, seq, head_dim), &device)?;
    let v = Tensor::randn(0.0f32, 1.0, (batch, heads, seq, head_dim), &device)?;

    let scale = 1.0 / (head_dim as f64).sqrt();
    let expected = full_precision_attention(&q, &k, &v, scale)?.to_dtype(DType::F32)?;

    let configs = [
        ("sm80 int8 Q/K", AttentionConfig::new(CudaArch::Sm80)),
        (
            "sm89 + fp8 V (fused rescale)",
            AttentionConfig::new(CudaArch::Sm89).with_fusion(true, false),
        ),
        (
            "sm89 instruction-buffered",
            AttentionConfig::new(CudaArch::Sm89).with_schedule(Schedule::InstBuffered),
        ),
        (
            "sm89 f16 accumulation (buffered)",
            AttentionConfig::new(CudaArch::Sm89)
                .with_accum(AccumPrecision::F16)
                .with_schedule(Schedule::InstBuffered),
        ),
    ];

    println!("quantized attention vs full precision ({batch}x{heads}x{seq}x{head_dim})");
    for (label, config) in configs {
        match run_attention(&q, &k, &v, &config) {
            Ok(out) => {
                let err = rel_l2_error(&out, &expected)?;
                println!("  {label:<35} rel l2 error {err:.5}");
            }
            Err(e) => println!("  {label:<35} failed: {e}"),
        }
    }

    // Exact-match dispatch: an unregistered combination is an error, never
    // a silent substitute.
    let unsupported = AttentionConfig::new(CudaArch::Sm80).with_fusion(true, false);
    if let Err(e) = run_attention(&q, &k, &v, &unsupported) {
        println!("\nrejected as expected: {e}");
    }

    Ok(())
}
