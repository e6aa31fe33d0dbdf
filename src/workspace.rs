// SPDX-License-Identifier: Apache-2.0

//! Scratch-memory accounting for kernel variants.
//!
//! Each unit of work owns one query tile and streams key/value tiles
//! through fixed-size staging buffers, so the per-unit footprint is a
//! function of tile geometry, head dimension, accumulation precision, and
//! schedule alone. The totals here let callers size launch grids against a
//! shared-memory budget before dispatching.

use crate::arch::TileShape;
use crate::kernels::config::{AccumPrecision, Schedule};

/// Per-unit scratch footprint of one kernel variant, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkspaceEstimate {
    /// Staged INT8 query tile.
    pub q_tile_bytes: usize,
    /// Staged key/value tiles (doubled by instruction buffering).
    pub kv_stage_bytes: usize,
    /// Integer score tile for one Q×KV tile pair.
    pub score_tile_bytes: usize,
    /// Running max, running sum, and output accumulator rows.
    pub softmax_state_bytes: usize,
}

impl WorkspaceEstimate {
    /// Total scratch bytes per unit of work.
    #[must_use]
    pub const fn total_bytes(&self) -> usize {
        self.q_tile_bytes + self.kv_stage_bytes + self.score_tile_bytes + self.softmax_state_bytes
    }

    /// Whether the footprint fits a given per-unit scratch budget.
    #[must_use]
    pub const fn fits_within(&self, budget_bytes: usize) -> bool {
        self.total_bytes() <= budget_bytes
    }
}

/// Estimate the per-unit scratch footprint for a variant's geometry.
///
/// Keys stage as INT8 (one byte per element) and values stage decoded to
/// f32; the instruction-buffered schedule doubles the key/value staging to
/// overlap the next tile's loads with compute. Accumulation width affects
/// only the softmax state rows.
#[must_use]
pub fn estimate_workspace(
    tile: TileShape,
    head_dim: usize,
    accum: AccumPrecision,
    schedule: Schedule,
) -> WorkspaceEstimate {
    let accum_bytes = match accum {
        AccumPrecision::F32 => 4,
        AccumPrecision::F16 => 2,
    };
    let kv_tile = tile.kv_rows * head_dim * (1 + 4);
    let kv_stage_bytes = match schedule {
        Schedule::Flat => kv_tile,
        Schedule::InstBuffered => 2 * kv_tile,
    };

    WorkspaceEstimate {
        q_tile_bytes: tile.q_rows * head_dim,
        kv_stage_bytes,
        score_tile_bytes: tile.q_rows * tile.kv_rows * 4,
        softmax_state_bytes: tile.q_rows * (4 + accum_bytes + head_dim * accum_bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::CudaArch;

    #[test]
    fn test_buffered_doubles_kv_staging() {
        let tile = CudaArch::Sm89.tile_shape();
        let flat = estimate_workspace(tile, 64, AccumPrecision::F32, Schedule::Flat);
        let buffered = estimate_workspace(tile, 64, AccumPrecision::F32, Schedule::InstBuffered);
        assert_eq!(buffered.kv_stage_bytes, 2 * flat.kv_stage_bytes);
        assert_eq!(buffered.q_tile_bytes, flat.q_tile_bytes);
        assert!(buffered.total_bytes() > flat.total_bytes());
    }

    #[test]
    fn test_monotonic_in_head_dim() {
        let tile = CudaArch::Sm80.tile_shape();
        let narrow = estimate_workspace(tile, 64, AccumPrecision::F32, Schedule::Flat);
        let wide = estimate_workspace(tile, 128, AccumPrecision::F32, Schedule::Flat);
        assert!(wide.total_bytes() > narrow.total_bytes());
    }

    #[test]
    fn test_f16_state_is_smaller() {
        let tile = CudaArch::Sm80.tile_shape();
        let f32_ws = estimate_workspace(tile, 64, AccumPrecision::F32, Schedule::Flat);
        let f16_ws = estimate_workspace(tile, 64, AccumPrecision::F16, Schedule::Flat);
        assert!(f16_ws.softmax_state_bytes < f32_ws.softmax_state_bytes);
        assert_eq!(f16_ws.score_tile_bytes, f32_ws.score_tile_bytes);
    }
}
