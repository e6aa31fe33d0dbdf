// SPDX-License-Identifier: Apache-2.0

//! The quantized attention kernel family.
//!
//! One tiled core ([`tiled`]) carries the blocked Q·Kᵗ → online softmax →
//! weighted-V pipeline; fusion epilogues ([`epilogue`]) and the
//! instruction-buffered scheduling variant ([`buffered`]) compose with it
//! rather than duplicating the whole kernel per combination. Concrete
//! variants are registered once per [`registry::KernelKey`] and selected by
//! exact match at dispatch time.
//!
//! ## Module structure
//!
//! - [`config`] - Launch configuration and variant selectors
//! - [`registry`] - Variant registry and dispatcher
//! - [`tiled`] - The tiled attention core (flat schedule)
//! - [`buffered`] - Instruction-buffered scheduling variant
//! - [`epilogue`] - Composable fusion post-processing

pub mod buffered;
pub mod config;
pub mod epilogue;
pub mod registry;
pub mod tiled;

pub use config::{AccumPrecision, AttentionConfig, FusionFlags, Schedule};
pub use registry::{registry, KernelKey, KernelRegistry};

use crate::error::{Result, SageError};
use crate::quant::{Fp8Tensor, Int8Tensor};
use crate::workspace::WorkspaceEstimate;

/// Value tensor view handed to a kernel launch.
///
/// The FP8 variant keeps V in raw codes; the kernel accumulates code values
/// and the epilogue folds in the per-channel scale (the V-rescale fusion).
#[derive(Debug)]
pub enum ValueView<'a> {
    /// Full-precision values, row-major `[batch, heads, seq, head_dim]`.
    F32 {
        /// Borrowed value data.
        data: &'a [f32],
        /// Logical shape.
        shape: [usize; 4],
    },
    /// FP8 (E4M3) values with per-channel scales and means.
    Fp8(&'a Fp8Tensor),
}

impl ValueView<'_> {
    /// Logical shape `[batch, heads, seq, head_dim]`.
    #[must_use]
    pub const fn shape(&self) -> [usize; 4] {
        match self {
            Self::F32 { shape, .. } => *shape,
            Self::Fp8(t) => t.shape,
        }
    }
}

/// Borrowed inputs for a single kernel launch.
///
/// All backing memory is caller-owned; the kernel allocates only its own
/// per-unit scratch for the duration of the launch.
#[derive(Debug)]
pub struct LaunchParams<'a> {
    /// Quantized query, `[batch, heads, q_len, head_dim]`.
    pub q: &'a Int8Tensor,
    /// Quantized key, `[batch, heads, kv_len, head_dim]`.
    pub k: &'a Int8Tensor,
    /// Value tensor, `[batch, heads, kv_len, head_dim]`.
    pub v: ValueView<'a>,
    /// Softmax temperature scale (strictly positive).
    pub softmax_scale: f32,
    /// Causal masking: query `i` sees keys `j <= i + (kv_len - q_len)`.
    pub causal: bool,
    /// Fused epilogue operations.
    pub fusion: FusionFlags,
}

impl LaunchParams<'_> {
    /// Check shape agreement and fusion/value-representation consistency.
    ///
    /// # Errors
    ///
    /// Returns [`SageError::ShapeMismatch`] or [`SageError::InvalidConfig`]
    /// before any work is performed.
    pub fn validate(&self, out_len: usize) -> Result<()> {
        let [qb, qh, q_len, qd] = self.q.shape;
        let [kb, kh, kv_len, kd] = self.k.shape;
        if qb != kb || qh != kh || qd != kd {
            return Err(SageError::ShapeMismatch {
                expected: format!("K with batch/heads/head_dim [{qb}, {qh}, _, {qd}]"),
                actual: self.k.shape.to_vec(),
            });
        }
        let v_shape = self.v.shape();
        if v_shape != [kb, kh, kv_len, kd] {
            return Err(SageError::ShapeMismatch {
                expected: format!("V with shape [{kb}, {kh}, {kv_len}, {kd}]"),
                actual: v_shape.to_vec(),
            });
        }
        if out_len != qb * qh * q_len * qd {
            return Err(SageError::ShapeMismatch {
                expected: format!("output buffer of {} elements", qb * qh * q_len * qd),
                actual: vec![out_len],
            });
        }
        match (&self.v, self.fusion.v_scale) {
            (ValueView::F32 { .. }, true) => Err(SageError::InvalidConfig(
                "v_scale fusion requires an FP8 value tensor".to_string(),
            )),
            (ValueView::Fp8(_), false) => Err(SageError::InvalidConfig(
                "FP8 values carry raw codes; launch them with v_scale fusion".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// One registered kernel variant: the strategy interface selected by the
/// dispatcher. Implementations are stateless and shared across launches.
pub trait AttentionKernel: Send + Sync {
    /// The exact-match key this variant is registered under.
    fn key(&self) -> KernelKey;

    /// Stable variant name used in logs and overflow reports.
    fn name(&self) -> &'static str;

    /// Per-unit scratch footprint of this variant.
    fn workspace(&self, head_dim: usize) -> WorkspaceEstimate;

    /// Run the attention pipeline, writing full-precision output rows.
    ///
    /// The output buffer is written exactly once per element on success;
    /// on failure its contents are undefined and must be discarded.
    ///
    /// # Errors
    ///
    /// [`SageError::ShapeMismatch`]/[`SageError::InvalidConfig`] before any
    /// work, [`SageError::AccumulationOverflow`] during the launch.
    fn launch(&self, params: &LaunchParams<'_>, out: &mut [f32]) -> Result<()>;
}

impl core::fmt::Debug for dyn AttentionKernel + '_ {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AttentionKernel")
            .field("name", &self.name())
            .finish()
    }
}
