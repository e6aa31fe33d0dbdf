// SPDX-License-Identifier: Apache-2.0

//! Low-bit quantization for the attention inputs.
//!
//! Q and K are quantized to symmetric per-block INT8 before the kernel
//! runs; the value tensor is optionally quantized to FP8 (E4M3) with
//! per-channel scales for architectures with an FP8 value path.
//!
//! ## Scale invariant
//!
//! For every quantization granule, `dequantized ≈ quantized * scale` with
//! the maximum relative error documented per format ([`int8`], [`fp8`]).
//! Scales are always strictly positive and finite: a granule whose dynamic
//! range collapses to zero gets its scale clamped to [`MIN_QUANT_SCALE`]
//! instead of producing NaN/Inf. Such granules are counted in
//! [`QuantStats`] and logged as precision-risk events.

pub mod fp8;
pub mod int8;

pub use fp8::{fp8_e4m3_decode, fp8_e4m3_encode, quantize_fp8_per_channel, Fp8Tensor, FP8_E4M3_MAX};
pub use int8::{dequantize_int8, quantize_int8, Int8Tensor};

use crate::error::{Result, SageError};

/// Minimum scale value; granules with a collapsed dynamic range are clamped
/// here rather than dividing by zero.
pub const MIN_QUANT_SCALE: f32 = 1e-6;

/// Statistics gathered while quantizing one tensor.
#[derive(Debug, Clone, Default)]
pub struct QuantStats {
    /// Total number of quantization granules (row blocks or channels).
    pub total_blocks: usize,
    /// Granules whose scale was clamped to [`MIN_QUANT_SCALE`].
    pub degenerate_blocks: usize,
    /// Maximum absolute reconstruction error observed across all elements.
    pub max_abs_error: f32,
}

impl QuantStats {
    /// Merge statistics from another quantization pass.
    pub fn merge(&mut self, other: &QuantStats) {
        self.total_blocks += other.total_blocks;
        self.degenerate_blocks += other.degenerate_blocks;
        self.max_abs_error = self.max_abs_error.max(other.max_abs_error);
    }

    /// Fail if any granule degenerated, for callers that prefer a hard error
    /// over the epsilon-clamped recovery.
    ///
    /// # Errors
    ///
    /// Returns [`SageError::QuantizationDegenerate`] if any block's scale
    /// was clamped.
    pub fn check_strict(&self) -> Result<()> {
        if self.degenerate_blocks > 0 {
            return Err(SageError::QuantizationDegenerate {
                degenerate: self.degenerate_blocks,
                total: self.total_blocks,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_merge() {
        let mut a = QuantStats {
            total_blocks: 4,
            degenerate_blocks: 1,
            max_abs_error: 0.01,
        };
        let b = QuantStats {
            total_blocks: 2,
            degenerate_blocks: 0,
            max_abs_error: 0.03,
        };
        a.merge(&b);
        assert_eq!(a.total_blocks, 6);
        assert_eq!(a.degenerate_blocks, 1);
        assert!((a.max_abs_error - 0.03).abs() < 1e-9);
    }

    #[test]
    fn test_check_strict() {
        let clean = QuantStats {
            total_blocks: 8,
            degenerate_blocks: 0,
            max_abs_error: 0.0,
        };
        assert!(clean.check_strict().is_ok());

        let degenerate = QuantStats {
            total_blocks: 8,
            degenerate_blocks: 2,
            max_abs_error: 0.0,
        };
        assert!(matches!(
            degenerate.check_strict(),
            Err(SageError::QuantizationDegenerate {
                degenerate: 2,
                total: 8
            })
        ));
    }
}
