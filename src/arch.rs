// SPDX-License-Identifier: Apache-2.0

//! GPU architecture tags and per-architecture tile geometry.
//!
//! The kernel family is compiled per architecture generation; the caller
//! (the binding layer) detects the running device's compute capability once
//! at startup and passes the resulting [`CudaArch`] explicitly through the
//! attention configuration. Nothing in this crate reads ambient global
//! state to decide which variant to run.

use crate::error::{Result, SageError};

/// GPU architecture generation a kernel variant is specialized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CudaArch {
    /// Ampere datacenter/consumer (compute capability 8.0/8.6):
    /// INT8 Q·K with half-precision value path.
    Sm80,
    /// Ada and Blackwell consumer (8.9, 12.0): INT8 Q·K with FP8 value
    /// path and instruction-buffered scheduling variants.
    Sm89,
    /// Hopper (9.0): INT8 Q·K with FP8 value path on wide tiles.
    Sm90,
}

impl CudaArch {
    /// Map a compute capability to the kernel architecture family.
    ///
    /// Capabilities below 8.0 have no INT8 attention path and are rejected.
    ///
    /// # Errors
    ///
    /// Returns [`SageError::UnsupportedConfiguration`] for capabilities the
    /// kernel family is not built for.
    pub fn from_capability(major: u32, minor: u32) -> Result<Self> {
        match (major, minor) {
            (8, 0) | (8, 6) => Ok(Self::Sm80),
            (8, 9) | (12, 0) => Ok(Self::Sm89),
            (9, 0) => Ok(Self::Sm90),
            _ => Err(SageError::UnsupportedConfiguration {
                requested: format!("compute capability {major}.{minor}"),
                available: "8.0, 8.6, 8.9, 9.0, 12.0".to_string(),
            }),
        }
    }

    /// Short architecture tag (e.g. `"sm89"`).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sm80 => "sm80",
            Self::Sm89 => "sm89",
            Self::Sm90 => "sm90",
        }
    }

    /// Tile geometry this architecture's kernels are tuned for.
    ///
    /// Sm89 favors tall query tiles; Sm90 favors wide key/value tiles to
    /// feed its larger matrix pipes.
    #[must_use]
    pub const fn tile_shape(self) -> TileShape {
        match self {
            Self::Sm80 => TileShape {
                q_rows: 64,
                kv_rows: 64,
            },
            Self::Sm89 => TileShape {
                q_rows: 128,
                kv_rows: 64,
            },
            Self::Sm90 => TileShape {
                q_rows: 64,
                kv_rows: 128,
            },
        }
    }

    /// Whether this architecture's value path consumes FP8 (E4M3) data.
    #[must_use]
    pub const fn has_fp8_value_path(self) -> bool {
        matches!(self, Self::Sm89 | Self::Sm90)
    }
}

impl std::fmt::Display for CudaArch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tile geometry for the blocked attention computation.
///
/// One unit of work owns a `q_rows × head_dim` query tile and streams
/// `kv_rows × head_dim` key/value tiles through its scratch memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileShape {
    /// Query rows per tile.
    pub q_rows: usize,
    /// Key/value rows per tile.
    pub kv_rows: usize,
}

impl TileShape {
    /// Number of key/value tiles needed to cover a sequence.
    #[must_use]
    pub const fn num_kv_tiles(&self, kv_len: usize) -> usize {
        kv_len.div_ceil(self.kv_rows)
    }

    /// Number of query tiles needed to cover a sequence.
    #[must_use]
    pub const fn num_q_tiles(&self, q_len: usize) -> usize {
        q_len.div_ceil(self.q_rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_mapping() {
        assert_eq!(CudaArch::from_capability(8, 0).unwrap(), CudaArch::Sm80);
        assert_eq!(CudaArch::from_capability(8, 6).unwrap(), CudaArch::Sm80);
        assert_eq!(CudaArch::from_capability(8, 9).unwrap(), CudaArch::Sm89);
        assert_eq!(CudaArch::from_capability(12, 0).unwrap(), CudaArch::Sm89);
        assert_eq!(CudaArch::from_capability(9, 0).unwrap(), CudaArch::Sm90);
    }

    #[test]
    fn test_low_capability_rejected() {
        let err = CudaArch::from_capability(7, 5).unwrap_err();
        assert!(matches!(
            err,
            SageError::UnsupportedConfiguration { .. }
        ));
    }

    #[test]
    fn test_tile_counts() {
        let tile = CudaArch::Sm80.tile_shape();
        assert_eq!(tile.num_kv_tiles(64), 1);
        assert_eq!(tile.num_kv_tiles(65), 2);
        assert_eq!(tile.num_q_tiles(128), 2);
    }
}
