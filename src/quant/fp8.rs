// SPDX-License-Identifier: Apache-2.0

//! FP8 (E4M3) codec and per-channel value quantization.
//!
//! The FP8 value path stores V as E4M3 codes with one scale per
//! (batch, head, channel), sized so the scaled values span the E4M3 range.
//! The kernel accumulates probability-weighted raw codes and folds the
//! per-channel scale into the epilogue (the V-rescale fusion), so no
//! separate dequantization pass over V is needed.
//!
//! E4M3 here is the saturating "fn" variant: no infinities, the largest
//! finite magnitude is [`FP8_E4M3_MAX`] (448), and out-of-range values clamp
//! to it. Three mantissa bits bound the relative rounding error of normal
//! values by `2^-4` (6.25%).

use super::{QuantStats, MIN_QUANT_SCALE};
use crate::error::{Result, SageError};

/// Largest finite E4M3 magnitude.
pub const FP8_E4M3_MAX: f32 = 448.0;

/// Smallest positive E4M3 normal exponent value, `2^-6`.
const E4M3_MIN_NORMAL_EXP: i32 = -6;

/// Encode a finite f32 into a saturating E4M3 code.
///
/// Values beyond ±448 clamp to the maximum finite code; NaN encodes to the
/// E4M3 NaN pattern (`0x7F`). Rounding is to nearest.
#[must_use]
pub fn fp8_e4m3_encode(x: f32) -> u8 {
    if x.is_nan() {
        return 0x7F;
    }
    let sign = if x.is_sign_negative() { 0x80u8 } else { 0x00 };
    let a = x.abs().min(FP8_E4M3_MAX);
    // Half of the smallest subnormal (2^-9) rounds to zero.
    if a < 2f32.powi(-10) {
        return sign;
    }

    let bits = a.to_bits();
    let mut exp = ((bits >> 23) & 0xFF) as i32 - 127;

    if exp < E4M3_MIN_NORMAL_EXP {
        // Subnormal: value = mantissa/8 * 2^-6.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let mant = (a / 2f32.powi(E4M3_MIN_NORMAL_EXP) * 8.0).round() as u32;
        if mant >= 8 {
            // Rounded up into the smallest normal.
            return sign | 0x08;
        }
        return sign | mant as u8;
    }

    let frac = a / 2f32.powi(exp); // in [1, 2)
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let mut mant = (frac * 8.0).round() as u32; // 8..=16
    if mant == 16 {
        mant = 8;
        exp += 1;
    }
    if exp > 8 {
        return sign | 0x7E; // saturate to 448
    }
    let biased = (exp + 7) as u32; // 1..=15
    let code = (biased << 3) | (mant - 8);
    if code >= 0x7F {
        // biased 15 / mantissa 7 is NaN; saturate instead.
        sign | 0x7E
    } else {
        sign | code as u8
    }
}

/// Decode an E4M3 code back to f32.
#[must_use]
pub fn fp8_e4m3_decode(code: u8) -> f32 {
    let sign = if code & 0x80 != 0 { -1.0f32 } else { 1.0 };
    let biased = i32::from((code >> 3) & 0x0F);
    let mant = f32::from(code & 0x07);
    if biased == 0 {
        sign * (mant / 8.0) * 2f32.powi(E4M3_MIN_NORMAL_EXP)
    } else if biased == 15 && (code & 0x07) == 0x07 {
        f32::NAN
    } else {
        sign * (1.0 + mant / 8.0) * 2f32.powi(biased - 7)
    }
}

/// FP8 value tensor with per-channel scales and channel means.
///
/// Layout mirrors [`Int8Tensor`](super::Int8Tensor): codes are row-major
/// `[batch, heads, seq, head_dim]`, scales and means are
/// `[batch, heads, head_dim]`. The channel means are gathered in the same
/// pass over V so the mean-centering epilogue never re-reads the tensor.
#[derive(Debug, Clone)]
pub struct Fp8Tensor {
    /// E4M3 codes.
    pub data: Vec<u8>,
    /// One strictly positive, finite scale per (batch, head, channel).
    pub scales: Vec<f32>,
    /// Per-(batch, head, channel) mean of the original values.
    pub channel_means: Vec<f32>,
    /// Logical shape `[batch, heads, seq, head_dim]`.
    pub shape: [usize; 4],
}

impl Fp8Tensor {
    /// Borrow one row of codes `[head_dim]`.
    #[must_use]
    pub fn row(&self, batch: usize, head: usize, row: usize) -> &[u8] {
        let [_, heads, seq, dim] = self.shape;
        let offset = ((batch * heads + head) * seq + row) * dim;
        &self.data[offset..offset + dim]
    }

    /// Borrow the per-channel scales `[head_dim]` of one (batch, head).
    #[must_use]
    pub fn head_scales(&self, batch: usize, head: usize) -> &[f32] {
        let [_, heads, _, dim] = self.shape;
        let offset = (batch * heads + head) * dim;
        &self.scales[offset..offset + dim]
    }

    /// Borrow the per-channel means `[head_dim]` of one (batch, head).
    #[must_use]
    pub fn head_means(&self, batch: usize, head: usize) -> &[f32] {
        let [_, heads, _, dim] = self.shape;
        let offset = (batch * heads + head) * dim;
        &self.channel_means[offset..offset + dim]
    }
}

/// Quantize a row-major `[batch, heads, seq, head_dim]` value tensor to
/// E4M3 with per-channel scales.
///
/// # Errors
///
/// Returns [`SageError::ShapeMismatch`] if `data` does not match `shape`.
pub fn quantize_fp8_per_channel(data: &[f32], shape: [usize; 4]) -> Result<(Fp8Tensor, QuantStats)> {
    let [batch, heads, seq, dim] = shape;
    let expected = batch * heads * seq * dim;
    if data.len() != expected || seq == 0 {
        return Err(SageError::ShapeMismatch {
            expected: format!("{expected} elements with seq >= 1"),
            actual: vec![data.len(), seq],
        });
    }

    let mut codes = vec![0u8; expected];
    let mut scales = vec![0.0f32; batch * heads * dim];
    let mut means = vec![0.0f32; batch * heads * dim];
    let mut stats = QuantStats {
        total_blocks: batch * heads * dim,
        ..QuantStats::default()
    };

    for b in 0..batch {
        for h in 0..heads {
            let head_offset = (b * heads + h) * seq * dim;
            let chan_offset = (b * heads + h) * dim;
            let head_data = &data[head_offset..head_offset + seq * dim];

            for d in 0..dim {
                let mut max_abs = 0.0f32;
                let mut sum = 0.0f64;
                for row in 0..seq {
                    let x = head_data[row * dim + d];
                    max_abs = max_abs.max(x.abs());
                    sum += f64::from(x);
                }
                #[allow(clippy::cast_possible_truncation)]
                {
                    means[chan_offset + d] = (sum / seq as f64) as f32;
                }

                let scale = (max_abs / FP8_E4M3_MAX).max(MIN_QUANT_SCALE);
                if max_abs / FP8_E4M3_MAX < MIN_QUANT_SCALE {
                    stats.degenerate_blocks += 1;
                }
                scales[chan_offset + d] = scale;

                for row in 0..seq {
                    let x = head_data[row * dim + d];
                    let code = fp8_e4m3_encode(x / scale);
                    codes[head_offset + row * dim + d] = code;
                    let err = (x - fp8_e4m3_decode(code) * scale).abs();
                    stats.max_abs_error = stats.max_abs_error.max(err);
                }
            }
        }
    }

    if stats.degenerate_blocks > 0 {
        tracing::warn!(
            degenerate = stats.degenerate_blocks,
            total = stats.total_blocks,
            "fp8 quantization clamped degenerate channels to the epsilon scale"
        );
    }

    Ok((
        Fp8Tensor {
            data: codes,
            scales,
            channel_means: means,
            shape,
        },
        stats,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_exact_values() {
        // Exactly representable E4M3 values round-trip bit-for-bit.
        for &v in &[0.0f32, 1.0, -1.0, 0.5, 1.75, 448.0, -448.0, 0.015625] {
            let decoded = fp8_e4m3_decode(fp8_e4m3_encode(v));
            assert_eq!(decoded, v, "value {v} did not round-trip");
        }
    }

    #[test]
    fn test_codec_saturates() {
        assert_eq!(fp8_e4m3_decode(fp8_e4m3_encode(1e9)), FP8_E4M3_MAX);
        assert_eq!(fp8_e4m3_decode(fp8_e4m3_encode(-1e9)), -FP8_E4M3_MAX);
        assert_eq!(fp8_e4m3_decode(fp8_e4m3_encode(460.0)), FP8_E4M3_MAX);
    }

    #[test]
    fn test_codec_relative_error_bound() {
        // Normal-range values stay within the 2^-4 relative error bound.
        for i in 1..=1000 {
            let v = (i as f32) * 0.437; // spans subnormal through ~437
            let decoded = fp8_e4m3_decode(fp8_e4m3_encode(v));
            let rel = (v - decoded).abs() / v.abs().max(2f32.powi(-6));
            assert!(rel <= 0.0625 + 1e-6, "value {v}: rel err {rel}");
        }
    }

    #[test]
    fn test_codec_subnormals() {
        let tiny = 2f32.powi(-9); // smallest subnormal
        assert_eq!(fp8_e4m3_decode(fp8_e4m3_encode(tiny)), tiny);
        assert_eq!(fp8_e4m3_encode(2f32.powi(-12)), 0);
        assert!(fp8_e4m3_decode(fp8_e4m3_encode(f32::NAN)).is_nan());
    }

    #[test]
    fn test_per_channel_quantization() -> crate::Result<()> {
        let shape = [1, 1, 4, 2];
        // Channel 0 spans ±8, channel 1 is all zeros.
        let data = vec![8.0, 0.0, -4.0, 0.0, 2.0, 0.0, -8.0, 0.0];
        let (v, stats) = quantize_fp8_per_channel(&data, shape)?;

        assert!((v.head_scales(0, 0)[0] - 8.0 / FP8_E4M3_MAX).abs() < 1e-9);
        assert_eq!(v.head_scales(0, 0)[1], MIN_QUANT_SCALE);
        assert_eq!(stats.degenerate_blocks, 1);
        assert!((v.head_means(0, 0)[0] - (-0.5)).abs() < 1e-6);
        assert_eq!(v.head_means(0, 0)[1], 0.0);

        // Codes in the zero channel reconstruct to exact zero.
        for row in 0..4 {
            assert_eq!(fp8_e4m3_decode(v.row(0, 0, row)[1]), 0.0);
        }
        Ok(())
    }
}
