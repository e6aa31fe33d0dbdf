// SPDX-License-Identifier: Apache-2.0

//! Attention configuration and kernel variant selectors.
//!
//! An [`AttentionConfig`] is constructed once per call, is immutable for
//! the duration of the launch, and is discarded afterwards. Everything the
//! dispatcher needs to pick a variant is derived from it via
//! [`AttentionConfig::kernel_key`].

use crate::arch::CudaArch;
use crate::error::{Result, SageError};

/// Head dimensions the kernel family is tuned for.
pub const SUPPORTED_HEAD_DIMS: [usize; 2] = [64, 128];

/// Key/value length above which f16 accumulation is a documented
/// precision risk (running sums approach the f16 dynamic range).
pub const F16_SAFE_KV_LEN: usize = 8192;

/// Numeric width of the kernel's running sums, independent of the input
/// and output storage precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AccumPrecision {
    /// 32-bit running sums. The default; safe for long sequences.
    #[default]
    F32,
    /// 16-bit running sums. Faster, with a documented increase in rounding
    /// error; not the default and warned about on long sequences.
    F16,
}

impl AccumPrecision {
    /// Short tag used in kernel names and error messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
        }
    }
}

impl std::fmt::Display for AccumPrecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fused epilogue operations requested for a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FusionFlags {
    /// Multiply the output tile by the per-channel V scale (folds FP8 value
    /// dequantization into the write-back).
    pub v_scale: bool,
    /// Subtract the per-channel V mean gathered during the same launch.
    pub v_mean: bool,
}

impl FusionFlags {
    /// No fused epilogue.
    pub const NONE: Self = Self {
        v_scale: false,
        v_mean: false,
    };
    /// V-rescale only.
    pub const V_SCALE: Self = Self {
        v_scale: true,
        v_mean: false,
    };
    /// V-rescale plus mean-centering.
    pub const V_SCALE_V_MEAN: Self = Self {
        v_scale: true,
        v_mean: true,
    };
}

impl std::fmt::Display for FusionFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.v_scale, self.v_mean) {
            (false, false) => f.write_str("none"),
            (true, false) => f.write_str("v_scale"),
            (false, true) => f.write_str("v_mean"),
            (true, true) => f.write_str("v_scale+v_mean"),
        }
    }
}

/// Global-memory scheduling strategy of a kernel variant.
///
/// The choice is made at dispatch time and never adaptively at runtime, so
/// the performance characteristics of a launch stay predictable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Schedule {
    /// Load each key/value tile, then compute on it.
    #[default]
    Flat,
    /// Issue the load of the next key/value tile before computing on the
    /// current one, buffered in extra scratch (trades footprint for fewer
    /// pipeline stalls).
    InstBuffered,
}

impl Schedule {
    /// Short tag used in kernel names and error messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Flat => "flat",
            Self::InstBuffered => "inst_buf",
        }
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for one attention launch.
#[derive(Debug, Clone, Copy)]
pub struct AttentionConfig {
    /// Architecture the caller detected at startup (see
    /// [`CudaArch::from_capability`]).
    pub arch: CudaArch,
    /// Restrict each query to itself and earlier key positions.
    pub causal: bool,
    /// Softmax temperature scale. `None` derives `1/sqrt(head_dim)` at
    /// launch; explicit values must be strictly positive and finite.
    pub softmax_scale: Option<f32>,
    /// Accumulation precision for the kernel's running sums.
    pub accum: AccumPrecision,
    /// Fold the per-channel V dequantization scale into the epilogue.
    /// Routes V through the FP8 value path.
    pub fuse_v_scale: bool,
    /// Subtract the per-channel V mean in the epilogue. Requires
    /// `fuse_v_scale` (the mean is gathered by the value quantizer).
    pub fuse_v_mean: bool,
    /// Memory scheduling variant to dispatch.
    pub schedule: Schedule,
    /// Mean-center K per channel before quantization (see `quant::int8`).
    pub smooth_k: bool,
    /// Sequence rows per quantization scale block for Q and K.
    pub quant_block_rows: usize,
}

impl AttentionConfig {
    /// Configuration with defaults for the given architecture: non-causal,
    /// f32 accumulation, flat schedule, no fusion, key smoothing on,
    /// 64-row quantization blocks.
    #[must_use]
    pub fn new(arch: CudaArch) -> Self {
        Self {
            arch,
            causal: false,
            softmax_scale: None,
            accum: AccumPrecision::F32,
            fuse_v_scale: false,
            fuse_v_mean: false,
            schedule: Schedule::Flat,
            smooth_k: true,
            quant_block_rows: 64,
        }
    }

    /// Enable or disable causal masking.
    #[must_use]
    pub const fn with_causal(mut self, causal: bool) -> Self {
        self.causal = causal;
        self
    }

    /// Set an explicit softmax scale.
    #[must_use]
    pub const fn with_softmax_scale(mut self, scale: f32) -> Self {
        self.softmax_scale = Some(scale);
        self
    }

    /// Select the accumulation precision.
    #[must_use]
    pub const fn with_accum(mut self, accum: AccumPrecision) -> Self {
        self.accum = accum;
        self
    }

    /// Request fused epilogue operations.
    #[must_use]
    pub const fn with_fusion(mut self, v_scale: bool, v_mean: bool) -> Self {
        self.fuse_v_scale = v_scale;
        self.fuse_v_mean = v_mean;
        self
    }

    /// Select the memory scheduling variant.
    #[must_use]
    pub const fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Enable or disable key smoothing.
    #[must_use]
    pub const fn with_smooth_k(mut self, smooth_k: bool) -> Self {
        self.smooth_k = smooth_k;
        self
    }

    /// The fusion flags requested by this configuration.
    #[must_use]
    pub const fn fusion(&self) -> FusionFlags {
        FusionFlags {
            v_scale: self.fuse_v_scale,
            v_mean: self.fuse_v_mean,
        }
    }

    /// Resolve the softmax scale for a given head dimension.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn resolved_softmax_scale(&self, head_dim: usize) -> f32 {
        self.softmax_scale
            .unwrap_or_else(|| 1.0 / (head_dim as f32).sqrt())
    }

    /// Validate configuration consistency.
    ///
    /// # Errors
    ///
    /// Returns [`SageError::InvalidConfig`] for a non-positive or non-finite
    /// softmax scale, a zero quantization block size, or mean-centering
    /// requested without V-rescale.
    pub fn validate(&self) -> Result<()> {
        if let Some(scale) = self.softmax_scale {
            if !(scale.is_finite() && scale > 0.0) {
                return Err(SageError::InvalidConfig(format!(
                    "softmax_scale must be finite and > 0, got {scale}"
                )));
            }
        }
        if self.quant_block_rows == 0 {
            return Err(SageError::InvalidConfig(
                "quant_block_rows must be >= 1".to_string(),
            ));
        }
        if self.fuse_v_mean && !self.fuse_v_scale {
            return Err(SageError::InvalidConfig(
                "fuse_v_mean requires fuse_v_scale: the V mean is gathered by the value quantizer"
                    .to_string(),
            ));
        }
        Ok(())
    }
}
