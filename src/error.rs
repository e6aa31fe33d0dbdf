// SPDX-License-Identifier: Apache-2.0

//! Error types for sageattn-rs.
//!
//! A kernel launch either fully succeeds or fully fails: every error here is
//! detected before or during a single launch and reported as the terminal
//! result for that launch. There is no partial-success state, and a failed
//! launch leaves the output buffer undefined.

use thiserror::Error;

/// Result type alias for sageattn-rs operations.
pub type Result<T> = std::result::Result<T, SageError>;

/// Errors that can occur in sageattn-rs operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SageError {
    /// No kernel is registered for the requested (architecture, accumulation
    /// precision, fusion, schedule) combination. Never silently substituted.
    #[error("unsupported configuration: no kernel registered for {requested}; registered variants: {available}")]
    UnsupportedConfiguration {
        /// The kernel key that was requested.
        requested: String,
        /// Human-readable list of registered variants.
        available: String,
    },

    /// A quantization block's dynamic range collapsed to zero.
    ///
    /// Recovered locally with an epsilon-clamped scale and reported through
    /// [`crate::quant::QuantStats`]; it only becomes an error when a caller
    /// opts into strict quantization via
    /// [`crate::quant::QuantStats::check_strict`].
    #[error("degenerate quantization: {degenerate} of {total} blocks collapsed to the epsilon scale")]
    QuantizationDegenerate {
        /// Number of blocks whose scale was clamped.
        degenerate: usize,
        /// Total number of quantization blocks.
        total: usize,
    },

    /// An integer dot product or running sum exceeded the representable
    /// range for the selected accumulation precision. Fatal for the launch;
    /// silent saturation would corrupt downstream results without signal.
    #[error("accumulation overflow in {kernel} at kv tile {kv_tile}: {detail}")]
    AccumulationOverflow {
        /// Name of the kernel variant that detected the overflow.
        kernel: &'static str,
        /// Index of the key/value tile being processed.
        kv_tile: usize,
        /// What overflowed and the representable bound that was exceeded.
        detail: String,
    },

    /// Caller-supplied tensor shapes or strides violate the kernel's
    /// constraints. Rejected before launch; no partial work is performed.
    #[error("shape mismatch: expected {expected}, got {actual:?}")]
    ShapeMismatch {
        /// Description of the expected shape or layout.
        expected: String,
        /// The offending dimensions as supplied.
        actual: Vec<usize>,
    },

    /// Invalid configuration (rejected by validation before launch).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Candle error from the tensor substrate.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
