// SPDX-License-Identifier: Apache-2.0

//! Shared test utilities: deterministic input generation and a
//! full-precision reference attention to compare the quantized kernels
//! against.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Deterministic pseudo-random values in `[-amplitude, amplitude]`.
pub fn seeded_values(count: usize, amplitude: f32, seed: u64) -> Vec<f32> {
    (0..count)
        .map(|i| {
            let mut hasher = DefaultHasher::new();
            (seed + i as u64).hash(&mut hasher);
            let normalized = (hasher.finish() as f64) / (u64::MAX as f64);
            ((normalized * 2.0 - 1.0) * f64::from(amplitude)) as f32
        })
        .collect()
}

/// Full-precision scaled dot-product attention with f64 intermediates.
///
/// Shapes are row-major `[batch, heads, seq, head_dim]`; `q` may have a
/// different sequence length than `k`/`v`. Under causal masking, query `i`
/// sees keys `j <= i + (kv_len - q_len)`; rows with no visible keys come
/// out as zeros.
pub fn reference_attention(
    q: &[f32],
    k: &[f32],
    v: &[f32],
    q_shape: [usize; 4],
    kv_len: usize,
    softmax_scale: f32,
    causal: bool,
) -> Vec<f32> {
    let [batch, heads, q_len, dim] = q_shape;
    let mut out = vec![0.0f32; batch * heads * q_len * dim];
    let offset = kv_len as isize - q_len as isize;

    for b in 0..batch {
        for h in 0..heads {
            let q_base = (b * heads + h) * q_len * dim;
            let kv_base = (b * heads + h) * kv_len * dim;

            for i in 0..q_len {
                let visible = if causal {
                    let limit = i as isize + offset;
                    if limit < 0 {
                        continue;
                    }
                    (limit as usize + 1).min(kv_len)
                } else {
                    kv_len
                };

                let q_row = &q[q_base + i * dim..q_base + (i + 1) * dim];
                let mut scores = Vec::with_capacity(visible);
                let mut max_score = f64::NEG_INFINITY;
                for j in 0..visible {
                    let k_row = &k[kv_base + j * dim..kv_base + (j + 1) * dim];
                    let dot: f64 = q_row
                        .iter()
                        .zip(k_row)
                        .map(|(&a, &b)| f64::from(a) * f64::from(b))
                        .sum();
                    let score = dot * f64::from(softmax_scale);
                    max_score = max_score.max(score);
                    scores.push(score);
                }

                let weights: Vec<f64> = scores.iter().map(|s| (s - max_score).exp()).collect();
                let total: f64 = weights.iter().sum();
                let out_row = &mut out[q_base + i * dim..q_base + (i + 1) * dim];
                for (j, w) in weights.iter().enumerate() {
                    let v_row = &v[kv_base + j * dim..kv_base + (j + 1) * dim];
                    for (o, &x) in out_row.iter_mut().zip(v_row) {
                        *o += (w / total * f64::from(x)) as f32;
                    }
                }
            }
        }
    }
    out
}

/// Relative L2 error of `actual` against `expected`.
pub fn rel_l2_error(actual: &[f32], expected: &[f32]) -> f64 {
    assert_eq!(actual.len(), expected.len());
    let mut diff_sq = 0.0f64;
    let mut norm_sq = 0.0f64;
    for (&a, &e) in actual.iter().zip(expected) {
        diff_sq += (f64::from(a) - f64::from(e)).powi(2);
        norm_sq += f64::from(e).powi(2);
    }
    if norm_sq == 0.0 {
        return if diff_sq == 0.0 { 0.0 } else { f64::INFINITY };
    }
    (diff_sq / norm_sq).sqrt()
}

/// Largest absolute elementwise difference.
pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .fold(0.0f32, |m, (&x, &y)| m.max((x - y).abs()))
}
