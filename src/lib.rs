// SPDX-License-Identifier: Apache-2.0

//! Quantized scaled dot-product attention kernels.
//!
//! This crate implements the low-bit attention pipeline used for inference
//! acceleration: Q and K are quantized to per-block INT8 and scored with
//! exact integer dot products, softmax runs online over streamed key/value
//! tiles, and V optionally rides an FP8 (E4M3) path whose dequantization is
//! fused into the output epilogue. Kernel variants are registered per
//! (architecture, accumulation precision, fusion, schedule) key and selected
//! by exact match, never by silent fallback.
//!
//! # Example
//!
//! ```
//! use candle_core::{Device, Tensor};
//! use sageattn_rs::{run_attention, AttentionConfig, CudaArch};
//!
//! let device = Device::Cpu;
//! let q = Tensor::randn(0.0f32, 1.0, (1, 2, 64, 64), &device)?;
//! let k = Tensor::randn(0.0f32, 1.0, (1, 2, 64, 64), &device)?;
//! let v = Tensor::randn(0.0f32, 1.0, (1, 2, 64, 64), &device)?;
//!
//! let config = AttentionConfig::new(CudaArch::Sm80).with_causal(true);
//! let out = run_attention(&q, &k, &v, &config)?;
//! assert_eq!(out.dims(), &[1, 2, 64, 64]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Modules
//!
//! - [`arch`] - Architecture tags and tile geometry
//! - [`quant`] - INT8 and FP8 quantization
//! - [`kernels`] - The kernel family, registry, and dispatcher
//! - [`attention`] - Tensor-level entry points
//! - [`workspace`] - Scratch-memory accounting
//! - [`error`] - Error types

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod arch;
pub mod attention;
pub mod error;
pub mod kernels;
pub mod quant;
pub mod workspace;

pub use arch::{CudaArch, TileShape};
pub use attention::{run_attention, run_attention_quantized};
pub use error::{Result, SageError};
pub use kernels::{
    registry, AccumPrecision, AttentionConfig, FusionFlags, KernelKey, Schedule, ValueView,
};
pub use quant::{quantize_fp8_per_channel, quantize_int8, Fp8Tensor, Int8Tensor, QuantStats};
pub use workspace::{estimate_workspace, WorkspaceEstimate};
