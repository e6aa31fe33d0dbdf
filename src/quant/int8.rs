// SPDX-License-Identifier: Apache-2.0

//! Per-block symmetric INT8 quantization for Q and K.
//!
//! Each (batch, head) slice is split into row blocks of `block_rows`
//! sequence positions; every block gets one f32 scale so that
//! `original ≈ quantized * scale`. Symmetric quantization keeps the
//! integer dot product free of zero-point cross terms:
//!
//! ```text
//! q_f32 · k_f32 ≈ (q_i8 · k_i8) * q_scale * k_scale
//! ```
//!
//! ## Error bound
//!
//! Rounding to the 254-step integer grid bounds the elementwise error by
//! `scale / 2`, i.e. a relative error of at most `1/254` of the block's
//! dynamic range. Degenerate blocks (all zeros) clamp the scale to
//! [`MIN_QUANT_SCALE`](super::MIN_QUANT_SCALE) and reconstruct to exact
//! zeros.
//!
//! ## Key smoothing
//!
//! K can optionally be mean-centered per (batch, head) channel before
//! quantization. The softmax is invariant to a per-query constant shift of
//! the score row, so removing the K mean changes no output while shrinking
//! the quantization range of outlier-heavy keys. The removed mean is not
//! re-added.

use super::{QuantStats, MIN_QUANT_SCALE};
use crate::error::{Result, SageError};

/// INT8 tensor with per-row-block scales.
///
/// Data layout is row-major `[batch, heads, seq, head_dim]`; scales are
/// `[batch, heads, ceil(seq / block_rows)]`.
#[derive(Debug, Clone)]
pub struct Int8Tensor {
    /// Quantized values in `[-127, 127]`.
    pub data: Vec<i8>,
    /// One strictly positive, finite scale per row block per head.
    pub scales: Vec<f32>,
    /// Sequence rows covered by one scale.
    pub block_rows: usize,
    /// Logical shape `[batch, heads, seq, head_dim]`.
    pub shape: [usize; 4],
}

impl Int8Tensor {
    /// Number of scale blocks along the sequence dimension.
    #[must_use]
    pub const fn blocks_per_seq(&self) -> usize {
        self.shape[2].div_ceil(self.block_rows)
    }

    /// Scale for a given sequence row of a given (batch, head).
    #[must_use]
    pub fn scale_for_row(&self, batch: usize, head: usize, row: usize) -> f32 {
        let blocks = self.blocks_per_seq();
        self.scales[(batch * self.shape[1] + head) * blocks + row / self.block_rows]
    }

    /// Borrow one quantized row `[head_dim]`.
    #[must_use]
    pub fn row(&self, batch: usize, head: usize, row: usize) -> &[i8] {
        let [_, heads, seq, dim] = self.shape;
        let offset = ((batch * heads + head) * seq + row) * dim;
        &self.data[offset..offset + dim]
    }
}

/// Quantize a row-major `[batch, heads, seq, head_dim]` tensor to INT8 with
/// per-row-block scales.
///
/// When `smooth` is set, the per-(batch, head) channel mean is subtracted
/// before quantization (intended for K; see the module docs).
///
/// # Errors
///
/// Returns [`SageError::ShapeMismatch`] if `data` does not match `shape` or
/// `block_rows` is zero.
pub fn quantize_int8(
    data: &[f32],
    shape: [usize; 4],
    block_rows: usize,
    smooth: bool,
) -> Result<(Int8Tensor, QuantStats)> {
    let [batch, heads, seq, dim] = shape;
    let expected = batch * heads * seq * dim;
    if data.len() != expected || block_rows == 0 {
        return Err(SageError::ShapeMismatch {
            expected: format!("{expected} elements with block_rows >= 1"),
            actual: vec![data.len(), block_rows],
        });
    }

    let blocks = seq.div_ceil(block_rows);
    let mut out = vec![0i8; expected];
    let mut scales = vec![0.0f32; batch * heads * blocks];
    let mut stats = QuantStats {
        total_blocks: batch * heads * blocks,
        ..QuantStats::default()
    };

    let mut channel_mean = vec![0.0f32; dim];
    for b in 0..batch {
        for h in 0..heads {
            let head_offset = ((b * heads) + h) * seq * dim;
            let head_data = &data[head_offset..head_offset + seq * dim];

            if smooth {
                channel_mean.iter_mut().for_each(|m| *m = 0.0);
                for row in head_data.chunks_exact(dim) {
                    for (m, &x) in channel_mean.iter_mut().zip(row) {
                        *m += x;
                    }
                }
                #[allow(clippy::cast_precision_loss)]
                let inv_rows = 1.0 / seq as f32;
                channel_mean.iter_mut().for_each(|m| *m *= inv_rows);
            }

            for block in 0..blocks {
                let row_start = block * block_rows;
                let row_end = (row_start + block_rows).min(seq);

                let mut max_abs = 0.0f32;
                for row in row_start..row_end {
                    let slice = &head_data[row * dim..(row + 1) * dim];
                    for (d, &x) in slice.iter().enumerate() {
                        let v = if smooth { x - channel_mean[d] } else { x };
                        max_abs = max_abs.max(v.abs());
                    }
                }

                let scale = (max_abs / 127.0).max(MIN_QUANT_SCALE);
                if max_abs / 127.0 < MIN_QUANT_SCALE {
                    stats.degenerate_blocks += 1;
                }
                scales[(b * heads + h) * blocks + block] = scale;

                let inv_scale = 1.0 / scale;
                for row in row_start..row_end {
                    let src = &head_data[row * dim..(row + 1) * dim];
                    let dst_offset = head_offset + row * dim;
                    for (d, &x) in src.iter().enumerate() {
                        let v = if smooth { x - channel_mean[d] } else { x };
                        let q = (v * inv_scale).round().clamp(-127.0, 127.0);
                        #[allow(clippy::cast_possible_truncation)]
                        {
                            out[dst_offset + d] = q as i8;
                        }
                        let err = (v - q * scale).abs();
                        stats.max_abs_error = stats.max_abs_error.max(err);
                    }
                }
            }
        }
    }

    if stats.degenerate_blocks > 0 {
        tracing::warn!(
            degenerate = stats.degenerate_blocks,
            total = stats.total_blocks,
            "int8 quantization clamped degenerate blocks to the epsilon scale"
        );
    }

    Ok((
        Int8Tensor {
            data: out,
            scales,
            block_rows,
            shape,
        },
        stats,
    ))
}

/// Reconstruct an f32 tensor from its INT8 representation (validation aid).
#[must_use]
pub fn dequantize_int8(tensor: &Int8Tensor) -> Vec<f32> {
    let [batch, heads, seq, dim] = tensor.shape;
    let mut out = vec![0.0f32; batch * heads * seq * dim];
    for b in 0..batch {
        for h in 0..heads {
            for row in 0..seq {
                let scale = tensor.scale_for_row(b, h, row);
                let offset = ((b * heads + h) * seq + row) * dim;
                for (dst, &q) in out[offset..offset + dim]
                    .iter_mut()
                    .zip(tensor.row(b, h, row))
                {
                    *dst = f32::from(q) * scale;
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_values(count: usize, amplitude: f32, seed: u64) -> Vec<f32> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        (0..count)
            .map(|i| {
                let mut hasher = DefaultHasher::new();
                (seed + i as u64).hash(&mut hasher);
                let normalized = (hasher.finish() as f64) / (u64::MAX as f64);
                ((normalized * 2.0 - 1.0) * f64::from(amplitude)) as f32
            })
            .collect()
    }

    #[test]
    fn test_roundtrip_error_bound() -> crate::Result<()> {
        let shape = [1, 2, 64, 32];
        let data = seeded_values(2 * 64 * 32, 3.0, 7);
        let (q, stats) = quantize_int8(&data, shape, 32, false)?;
        let restored = dequantize_int8(&q);

        for (block, chunk) in data.chunks(32 * 32).enumerate() {
            let max_abs = chunk.iter().fold(0.0f32, |m, &x| m.max(x.abs()));
            let bound = (max_abs / 127.0).max(MIN_QUANT_SCALE) / 2.0 + 1e-6;
            let offset = block * 32 * 32;
            for (i, &x) in chunk.iter().enumerate() {
                let err = (x - restored[offset + i]).abs();
                assert!(err <= bound, "block {block} err {err} > bound {bound}");
            }
        }
        assert_eq!(stats.degenerate_blocks, 0);
        Ok(())
    }

    #[test]
    fn test_all_zero_block_clamps_scale() -> crate::Result<()> {
        let shape = [1, 1, 16, 8];
        let data = vec![0.0f32; 16 * 8];
        let (q, stats) = quantize_int8(&data, shape, 8, false)?;

        assert_eq!(stats.degenerate_blocks, 2);
        for &s in &q.scales {
            assert_eq!(s, MIN_QUANT_SCALE);
            assert!(s.is_finite() && s > 0.0);
        }
        assert!(dequantize_int8(&q).iter().all(|&x| x == 0.0));
        assert!(stats.check_strict().is_err());
        Ok(())
    }

    #[test]
    fn test_high_dynamic_range_block() -> crate::Result<()> {
        let shape = [1, 1, 4, 4];
        let mut data = vec![1e-4f32; 16];
        data[5] = 1000.0;
        let (q, stats) = quantize_int8(&data, shape, 4, false)?;

        // The outlier dominates the scale; small values collapse to zero
        // but never to NaN, and the outlier itself reconstructs closely.
        let restored = dequantize_int8(&q);
        assert!((restored[5] - 1000.0).abs() <= 1000.0 / 254.0 + 1e-3);
        assert!(restored.iter().all(|x| x.is_finite()));
        assert_eq!(stats.degenerate_blocks, 0);
        Ok(())
    }

    #[test]
    fn test_smoothing_removes_channel_mean() -> crate::Result<()> {
        let shape = [1, 1, 8, 4];
        // Every channel carries a large constant offset.
        let mut data = Vec::with_capacity(32);
        for row in 0..8 {
            for d in 0..4 {
                data.push(100.0 + (row as f32) * 0.1 + (d as f32));
            }
        }
        let (q, _) = quantize_int8(&data, shape, 8, true)?;

        // With the mean removed, residuals span ~[-0.35, 0.35], so the scale
        // must be far below the unsmoothed 100/127.
        assert!(q.scales[0] < 0.01, "scale {} not smoothed", q.scales[0]);
        Ok(())
    }

    #[test]
    fn test_shape_validation() {
        let err = quantize_int8(&[0.0; 8], [1, 1, 4, 4], 4, false).unwrap_err();
        assert!(matches!(err, SageError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_scale_lookup_per_block() -> crate::Result<()> {
        let shape = [1, 1, 4, 2];
        let data = vec![1.0, 1.0, 1.0, 1.0, 8.0, 8.0, 8.0, 8.0];
        let (q, _) = quantize_int8(&data, shape, 2, false)?;

        assert_eq!(q.blocks_per_seq(), 2);
        assert!((q.scale_for_row(0, 0, 0) - 1.0 / 127.0).abs() < 1e-9);
        assert!((q.scale_for_row(0, 0, 3) - 8.0 / 127.0).abs() < 1e-9);
        Ok(())
    }
}
