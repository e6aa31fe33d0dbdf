// SPDX-License-Identifier: Apache-2.0

//! Instruction-buffered scheduling variant.
//!
//! Identical math to the flat kernel, different memory schedule: two
//! staging buffers alternate so the next key/value tile is resident before
//! compute on the current one begins. On hardware this overlaps global
//! loads with tensor-core work; here the prefetch order is preserved so the
//! variant produces bitwise-identical output to the flat schedule while
//! exercising the doubled staging footprint.

use half::f16;

use super::epilogue::Epilogue;
use super::registry::KernelKey;
use super::tiled::{
    for_each_q_tile, process_staged_tile, tile_fully_masked, AccumElem, KvTileStage,
    OnlineSoftmaxTile,
};
use super::{AttentionKernel, LaunchParams};
use crate::error::Result;
use crate::workspace::{estimate_workspace, WorkspaceEstimate};

/// Double-buffered tiled kernel: prefetch tile `t + 1` while tile `t`
/// is being scored.
pub struct BufferedAttentionKernel {
    key: KernelKey,
    name: &'static str,
}

impl BufferedAttentionKernel {
    pub(crate) const fn new(key: KernelKey, name: &'static str) -> Self {
        Self { key, name }
    }
}

impl AttentionKernel for BufferedAttentionKernel {
    fn key(&self) -> KernelKey {
        self.key
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn workspace(&self, head_dim: usize) -> WorkspaceEstimate {
        estimate_workspace(
            self.key.arch.tile_shape(),
            head_dim,
            self.key.accum,
            self.key.schedule,
        )
    }

    fn launch(&self, params: &LaunchParams<'_>, out: &mut [f32]) -> Result<()> {
        params.validate(out.len())?;
        match self.key.accum {
            super::AccumPrecision::F32 => run_buffered::<f32>(params, self, out),
            super::AccumPrecision::F16 => run_buffered::<f16>(params, self, out),
        }
    }
}

fn run_buffered<A: AccumElem>(
    params: &LaunchParams<'_>,
    kernel: &BufferedAttentionKernel,
    out: &mut [f32],
) -> Result<()> {
    let tile = kernel.key.arch.tile_shape();
    let dim = params.q.shape[3];
    let kv_len = params.k.shape[2];
    let name = kernel.name;

    for_each_q_tile(params, tile.q_rows, out, |batch, head, q_start, q_rows, tile_out| {
        let mut buffers = [
            KvTileStage::new(tile.kv_rows, dim),
            KvTileStage::new(tile.kv_rows, dim),
        ];
        let mut state = OnlineSoftmaxTile::<A>::new(q_rows, dim);

        // Count the tiles this query tile actually touches, then prime the
        // first buffer before the compute loop starts.
        let mut num_tiles = tile.num_kv_tiles(kv_len);
        for kt in 0..num_tiles {
            if tile_fully_masked(params, q_start, q_rows, kt * tile.kv_rows) {
                num_tiles = kt;
                break;
            }
        }
        if num_tiles > 0 {
            buffers[0].load(params, batch, head, 0, tile.kv_rows);
        }

        for kt in 0..num_tiles {
            let (current, next) = {
                let (a, b) = buffers.split_at_mut(1);
                if kt % 2 == 0 {
                    (&mut a[0], &mut b[0])
                } else {
                    (&mut b[0], &mut a[0])
                }
            };
            // Prefetch the next tile before scoring the current one.
            if kt + 1 < num_tiles {
                next.load(params, batch, head, (kt + 1) * tile.kv_rows, tile.kv_rows);
            }
            process_staged_tile::<A>(
                params, batch, head, q_start, q_rows, current, kt, &mut state, name,
            )?;
        }

        state.finalize_into(tile_out, &Epilogue::for_head(params, batch, head));
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::config::{AccumPrecision, FusionFlags, Schedule};
    use crate::kernels::tiled::TiledAttentionKernel;
    use crate::kernels::ValueView;
    use crate::quant::quantize_int8;
    use crate::CudaArch;

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
    fn test_buffered_matches_flat_bitwise() -> crate::Result<()> {
        // Multi-tile sequence so the prefetch path is actually exercised.
        let shape = [1, 2, 192, 64];
        let count = 2 * 192 * 64;
        let q_data = seeded_values(count, 2.0, 11);
        let k_data = seeded_values(count, 2.0, 23);
        let v_data = seeded_values(count, 1.0, 37);

        let (q, _) = quantize_int8(&q_data, shape, 64, false)?;
        let (k, _) = quantize_int8(&k_data, shape, 64, false)?;

        for causal in [false, true] {
            let params = LaunchParams {
                q: &q,
                k: &k,
                v: ValueView::F32 {
                    data: &v_data,
                    shape,
                },
                softmax_scale: 0.125,
                causal,
                fusion: FusionFlags::NONE,
            };

            let flat = TiledAttentionKernel::new(
                KernelKey {
                    arch: CudaArch::Sm89,
                    accum: AccumPrecision::F32,
                    fusion: FusionFlags::NONE,
                    schedule: Schedule::Flat,
                },
                "test_flat",
            );
            let buffered = BufferedAttentionKernel::new(
                KernelKey {
                    arch: CudaArch::Sm89,
                    accum: AccumPrecision::F32,
                    fusion: FusionFlags::NONE,
                    schedule: Schedule::InstBuffered,
                },
                "test_buffered",
            );

            let mut out_flat = vec![0.0f32; count];
            let mut out_buffered = vec![0.0f32; count];
            flat.launch(&params, &mut out_flat)?;
            buffered.launch(&params, &mut out_buffered)?;

            assert_eq!(out_flat, out_buffered, "causal={causal}");
        }
        Ok(())
    }
}
