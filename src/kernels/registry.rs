// SPDX-License-Identifier: Apache-2.0

//! Kernel variant registry and dispatcher.
//!
//! Every compiled variant registers under a [`KernelKey`] once at startup;
//! dispatch is a pure exact-match lookup. A configuration with no matching
//! variant is an error that names the requested key and the registered
//! alternatives. The dispatcher never substitutes a "close enough" variant:
//! silently falling back to, say, f32 accumulation when f16 was requested
//! would change both the performance and the numerics the caller asked for.
//!
//! The registered set mirrors what each architecture generation is actually
//! built with: Sm80 has no FP8 value path, only Sm89 carries the
//! instruction-buffered schedules, and the f16-accumulation variants exist
//! solely in instruction-buffered form there.

use std::collections::HashMap;
use std::sync::LazyLock;

use super::buffered::BufferedAttentionKernel;
use super::config::{AccumPrecision, FusionFlags, Schedule};
use super::tiled::TiledAttentionKernel;
use super::AttentionKernel;
use crate::arch::CudaArch;
use crate::error::{Result, SageError};

/// Exact-match identity of one kernel variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelKey {
    /// Architecture generation the variant is compiled for.
    pub arch: CudaArch,
    /// Accumulation precision of the running sums.
    pub accum: AccumPrecision,
    /// Fused epilogue operations baked into the variant.
    pub fusion: FusionFlags,
    /// Memory scheduling strategy.
    pub schedule: Schedule,
}

impl std::fmt::Display for KernelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.arch, self.accum, self.fusion, self.schedule
        )
    }
}

impl super::config::AttentionConfig {
    /// The exact-match key this configuration dispatches on.
    #[must_use]
    pub const fn kernel_key(&self) -> KernelKey {
        KernelKey {
            arch: self.arch,
            accum: self.accum,
            fusion: self.fusion(),
            schedule: self.schedule,
        }
    }
}

/// The set of registered kernel variants, keyed for exact-match dispatch.
pub struct KernelRegistry {
    kernels: HashMap<KernelKey, Box<dyn AttentionKernel>>,
}

impl KernelRegistry {
    /// Build the registry of built-in variants.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self {
            kernels: HashMap::new(),
        };

        use AccumPrecision::{F16, F32};
        use CudaArch::{Sm80, Sm89, Sm90};
        use FusionFlags as FF;
        use Schedule::{Flat, InstBuffered};

        registry.register(Sm80, F32, FF::NONE, Flat, "sm80_qk_int8_sv_f16_accum_f32");
        registry.register(Sm80, F16, FF::NONE, Flat, "sm80_qk_int8_sv_f16_accum_f16");

        registry.register(Sm89, F32, FF::NONE, Flat, "sm89_qk_int8_sv_f16_accum_f32");
        registry.register(
            Sm89,
            F32,
            FF::NONE,
            InstBuffered,
            "sm89_qk_int8_sv_f16_accum_f32_inst_buf",
        );
        registry.register(
            Sm89,
            F16,
            FF::NONE,
            InstBuffered,
            "sm89_qk_int8_sv_f16_accum_f16_inst_buf",
        );
        registry.register(
            Sm89,
            F32,
            FF::V_SCALE,
            Flat,
            "sm89_qk_int8_sv_f8_accum_f32_fuse_v_scale",
        );
        registry.register(
            Sm89,
            F32,
            FF::V_SCALE,
            InstBuffered,
            "sm89_qk_int8_sv_f8_accum_f32_fuse_v_scale_inst_buf",
        );
        registry.register(
            Sm89,
            F16,
            FF::V_SCALE,
            InstBuffered,
            "sm89_qk_int8_sv_f8_accum_f16_fuse_v_scale_inst_buf",
        );
        registry.register(
            Sm89,
            F32,
            FF::V_SCALE_V_MEAN,
            Flat,
            "sm89_qk_int8_sv_f8_accum_f32_fuse_v_scale_fuse_v_mean",
        );

        registry.register(Sm90, F32, FF::NONE, Flat, "sm90_qk_int8_sv_f16_accum_f32");
        registry.register(
            Sm90,
            F32,
            FF::V_SCALE,
            Flat,
            "sm90_qk_int8_sv_f8_accum_f32_fuse_v_scale",
        );

        registry
    }

    fn register(
        &mut self,
        arch: CudaArch,
        accum: AccumPrecision,
        fusion: FusionFlags,
        schedule: Schedule,
        name: &'static str,
    ) {
        let key = KernelKey {
            arch,
            accum,
            fusion,
            schedule,
        };
        let kernel: Box<dyn AttentionKernel> = match schedule {
            Schedule::Flat => Box::new(TiledAttentionKernel::new(key, name)),
            Schedule::InstBuffered => Box::new(BufferedAttentionKernel::new(key, name)),
        };
        let previous = self.kernels.insert(key, kernel);
        debug_assert!(previous.is_none(), "duplicate kernel key {key}");
    }

    /// Look up the variant for a key. Exact match only.
    ///
    /// # Errors
    ///
    /// Returns [`SageError::UnsupportedConfiguration`] naming the requested
    /// key and every registered variant when nothing matches.
    pub fn select(&self, key: &KernelKey) -> Result<&dyn AttentionKernel> {
        self.kernels
            .get(key)
            .map(|kernel| kernel.as_ref())
            .ok_or_else(|| SageError::UnsupportedConfiguration {
                requested: key.to_string(),
                available: self.available(),
            })
    }

    /// Registered keys, in arbitrary order.
    pub fn keys(&self) -> impl Iterator<Item = &KernelKey> {
        self.kernels.keys()
    }

    /// Number of registered variants.
    #[must_use]
    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    fn available(&self) -> String {
        let mut keys: Vec<String> = self.kernels.keys().map(ToString::to_string).collect();
        keys.sort_unstable();
        keys.join(", ")
    }
}

static REGISTRY: LazyLock<KernelRegistry> = LazyLock::new(KernelRegistry::builtin);

/// The process-wide registry of built-in variants. Built once, read-only
/// afterwards.
#[must_use]
pub fn registry() -> &'static KernelRegistry {
    &REGISTRY
}
