// SPDX-License-Identifier: Apache-2.0

//! The tiled attention core.
//!
//! Work is decomposed over (batch, head, query tile) units. Each unit stages
//! one key/value tile at a time, computes the integer score tile, and folds
//! it into an online softmax state, so no full `q_len × kv_len` score matrix
//! ever materializes. The same staging, scoring, and accumulation routines
//! back the instruction-buffered variant ([`super::buffered`]); only the
//! tile loop differs.
//!
//! ## Score path
//!
//! Scores are exact `i32` dot products of INT8 rows, mapped back to f32 as
//! `raw * q_scale * k_scale * softmax_scale`. With `head_dim <= 128` the
//! integer dot is bounded by `128 * 127^2 < 2^21`, so the i32 product can
//! never wrap; overflow checks concern the f16 accumulation path only.
//!
//! ## Causal masking
//!
//! Query `i` sees keys `j <= i + (kv_len - q_len)`. Masked positions are
//! never scored at all, which is how their softmax weight is exactly zero
//! rather than a large-negative-bias approximation. Tiles entirely above
//! the diagonal are skipped before their data is staged.

use half::f16;
use rayon::prelude::*;

use super::epilogue::Epilogue;
use super::registry::KernelKey;
use super::{AttentionKernel, LaunchParams, ValueView};
use crate::error::{Result, SageError};
use crate::quant::fp8_e4m3_decode;
use crate::workspace::{estimate_workspace, WorkspaceEstimate};

/// Element type of the kernel's running sums.
///
/// The f16 instantiation models half-precision accumulator registers: every
/// intermediate is rounded through f16 storage, and values that leave the
/// representable range surface as infinities caught by the overflow checks.
pub(crate) trait AccumElem: Copy + Send + Sync + 'static {
    /// Largest raw integer score magnitude representable in this precision,
    /// or `None` when the precision cannot overflow on valid inputs.
    const RAW_DOT_LIMIT: Option<f32>;

    fn from_f32(x: f32) -> Self;
    fn to_f32(self) -> f32;
}

impl AccumElem for f32 {
    const RAW_DOT_LIMIT: Option<f32> = None;

    fn from_f32(x: f32) -> Self {
        x
    }

    fn to_f32(self) -> f32 {
        self
    }
}

impl AccumElem for f16 {
    const RAW_DOT_LIMIT: Option<f32> = Some(65504.0);

    fn from_f32(x: f32) -> Self {
        f16::from_f32(x)
    }

    fn to_f32(self) -> f32 {
        self.to_f32()
    }
}

/// Exact integer dot product of two quantized rows.
#[must_use]
pub(crate) fn int8_dot(a: &[i8], b: &[i8]) -> i32 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| i32::from(x) * i32::from(y))
        .sum()
}

/// Online softmax state for one query tile.
///
/// Holds the running row maxima, the running normalizers, and the
/// probability-weighted value accumulators. Folding in a new score rescales
/// the existing state by `exp(m_old - m_new)` so the final normalization is
/// a single divide per row.
pub(crate) struct OnlineSoftmaxTile<A: AccumElem> {
    dim: usize,
    m: Vec<f32>,
    l: Vec<A>,
    acc: Vec<A>,
}

impl<A: AccumElem> OnlineSoftmaxTile<A> {
    pub(crate) fn new(rows: usize, dim: usize) -> Self {
        Self {
            dim,
            m: vec![f32::NEG_INFINITY; rows],
            l: vec![A::from_f32(0.0); rows],
            acc: vec![A::from_f32(0.0); rows * dim],
        }
    }

    /// Fold one (score, value row) pair into a query row's state.
    pub(crate) fn accumulate(&mut self, row: usize, score: f32, value: &[f32]) {
        let acc = &mut self.acc[row * self.dim..(row + 1) * self.dim];
        if score > self.m[row] {
            // exp(-inf) = 0 covers the first score of a fresh row.
            let correction = (self.m[row] - score).exp();
            self.m[row] = score;
            self.l[row] = A::from_f32(self.l[row].to_f32() * correction);
            for a in acc.iter_mut() {
                *a = A::from_f32(a.to_f32() * correction);
            }
        }
        let p = (score - self.m[row]).exp();
        self.l[row] = A::from_f32(self.l[row].to_f32() + p);
        for (a, &v) in acc.iter_mut().zip(value) {
            *a = A::from_f32(a.to_f32() + p * v);
        }
    }

    /// Detect running sums that left the representable range.
    pub(crate) fn check_finite(&self, kernel: &'static str, kv_tile: usize) -> Result<()> {
        if A::RAW_DOT_LIMIT.is_none() {
            return Ok(());
        }
        for (row, l) in self.l.iter().enumerate() {
            if !l.to_f32().is_finite() {
                return Err(SageError::AccumulationOverflow {
                    kernel,
                    kv_tile,
                    detail: format!("softmax normalizer for tile row {row} left the f16 range"),
                });
            }
        }
        if self.acc.iter().any(|a| !a.to_f32().is_finite()) {
            return Err(SageError::AccumulationOverflow {
                kernel,
                kv_tile,
                detail: "output accumulator left the f16 range".to_string(),
            });
        }
        Ok(())
    }

    /// Normalize into the output tile and apply the fused epilogue.
    ///
    /// Rows that accumulated nothing (fully masked) are written as zeros.
    pub(crate) fn finalize_into(&self, out: &mut [f32], epilogue: &Epilogue<'_>) {
        for (row, out_row) in out.chunks_mut(self.dim).enumerate() {
            let l = self.l[row].to_f32();
            if l == 0.0 {
                out_row.fill(0.0);
                continue;
            }
            let inv = 1.0 / l;
            let acc = &self.acc[row * self.dim..(row + 1) * self.dim];
            for (o, a) in out_row.iter_mut().zip(acc) {
                *o = a.to_f32() * inv;
            }
            epilogue.apply_row(out_row);
        }
    }
}

/// Staging buffer for one key/value tile.
///
/// Keys stage as INT8 rows; values stage decoded to f32. For FP8 values the
/// decode yields raw code values, leaving the per-channel scale to the
/// fused epilogue.
pub(crate) struct KvTileStage {
    pub(crate) start: usize,
    pub(crate) rows: usize,
    dim: usize,
    k: Vec<i8>,
    v: Vec<f32>,
}

impl KvTileStage {
    pub(crate) fn new(capacity_rows: usize, dim: usize) -> Self {
        Self {
            start: 0,
            rows: 0,
            dim,
            k: Vec::with_capacity(capacity_rows * dim),
            v: Vec::with_capacity(capacity_rows * dim),
        }
    }

    /// Load up to `max_rows` key/value rows starting at `start`.
    pub(crate) fn load(
        &mut self,
        params: &LaunchParams<'_>,
        batch: usize,
        head: usize,
        start: usize,
        max_rows: usize,
    ) {
        let [_, heads, kv_len, dim] = params.k.shape;
        self.start = start;
        self.rows = max_rows.min(kv_len - start);
        self.k.clear();
        self.v.clear();
        for row in start..start + self.rows {
            self.k.extend_from_slice(params.k.row(batch, head, row));
            match &params.v {
                ValueView::F32 { data, .. } => {
                    let offset = ((batch * heads + head) * kv_len + row) * dim;
                    self.v.extend_from_slice(&data[offset..offset + dim]);
                }
                ValueView::Fp8(v) => {
                    self.v
                        .extend(v.row(batch, head, row).iter().map(|&c| fp8_e4m3_decode(c)));
                }
            }
        }
    }

    pub(crate) fn k_row(&self, i: usize) -> &[i8] {
        &self.k[i * self.dim..(i + 1) * self.dim]
    }

    pub(crate) fn v_row(&self, i: usize) -> &[f32] {
        &self.v[i * self.dim..(i + 1) * self.dim]
    }
}

/// Whether a key/value tile lies entirely above the causal diagonal for
/// every query row in the tile.
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub(crate) fn tile_fully_masked(
    params: &LaunchParams<'_>,
    q_start: usize,
    q_rows: usize,
    kv_start: usize,
) -> bool {
    if !params.causal {
        return false;
    }
    let q_len = params.q.shape[2];
    let kv_len = params.k.shape[2];
    let offset = kv_len as isize - q_len as isize;
    let last_visible = (q_start + q_rows - 1) as isize + offset;
    kv_start as isize > last_visible
}

/// Score one staged key/value tile against a query tile and fold it into
/// the softmax state.
#[allow(clippy::too_many_arguments, clippy::cast_possible_wrap, clippy::cast_precision_loss)]
pub(crate) fn process_staged_tile<A: AccumElem>(
    params: &LaunchParams<'_>,
    batch: usize,
    head: usize,
    q_start: usize,
    q_rows: usize,
    stage: &KvTileStage,
    kv_tile: usize,
    state: &mut OnlineSoftmaxTile<A>,
    kernel: &'static str,
) -> Result<()> {
    let q_len = params.q.shape[2];
    let kv_len = params.k.shape[2];
    let causal_offset = kv_len as isize - q_len as isize;

    for qi in 0..q_rows {
        let gq = q_start + qi;
        let q_row = params.q.row(batch, head, gq);
        let q_scale = params.q.scale_for_row(batch, head, gq);
        let visible = if params.causal {
            gq as isize + causal_offset
        } else {
            kv_len as isize - 1
        };

        for kj in 0..stage.rows {
            let gk = stage.start + kj;
            // Key rows are in sequence order; past the diagonal means done.
            if gk as isize > visible {
                break;
            }
            let raw = int8_dot(q_row, stage.k_row(kj));
            if let Some(limit) = A::RAW_DOT_LIMIT {
                if (raw as f32).abs() > limit {
                    return Err(SageError::AccumulationOverflow {
                        kernel,
                        kv_tile,
                        detail: format!(
                            "integer score {raw} for query row {gq} exceeds the f16 magnitude {limit}"
                        ),
                    });
                }
            }
            let score = raw as f32
                * q_scale
                * params.k.scale_for_row(batch, head, gk)
                * params.softmax_scale;
            state.accumulate(qi, score, stage.v_row(kj));
        }
    }
    state.check_finite(kernel, kv_tile)
}

/// Run `f` once per (batch, head, query tile) unit, in parallel, handing it
/// the output slice for that tile.
pub(crate) fn for_each_q_tile<F>(
    params: &LaunchParams<'_>,
    q_tile_rows: usize,
    out: &mut [f32],
    f: F,
) -> Result<()>
where
    F: Fn(usize, usize, usize, usize, &mut [f32]) -> Result<()> + Send + Sync,
{
    let [_, heads, q_len, dim] = params.q.shape;
    out.par_chunks_mut(q_len * dim)
        .enumerate()
        .try_for_each(|(unit, head_out)| {
            let (batch, head) = (unit / heads, unit % heads);
            head_out
                .par_chunks_mut(q_tile_rows * dim)
                .enumerate()
                .try_for_each(|(qt, tile_out)| {
                    let q_start = qt * q_tile_rows;
                    let q_rows = tile_out.len() / dim;
                    f(batch, head, q_start, q_rows, tile_out)
                })
        })
}

/// The flat-schedule tiled kernel: load a key/value tile, compute on it,
/// move to the next.
pub struct TiledAttentionKernel {
    key: KernelKey,
    name: &'static str,
}

impl TiledAttentionKernel {
    pub(crate) const fn new(key: KernelKey, name: &'static str) -> Self {
        Self { key, name }
    }
}

impl AttentionKernel for TiledAttentionKernel {
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
            super::AccumPrecision::F32 => run_flat::<f32>(params, self, out),
            super::AccumPrecision::F16 => run_flat::<f16>(params, self, out),
        }
    }
}

fn run_flat<A: AccumElem>(
    params: &LaunchParams<'_>,
    kernel: &TiledAttentionKernel,
    out: &mut [f32],
) -> Result<()> {
    let tile = kernel.key.arch.tile_shape();
    let dim = params.q.shape[3];
    let kv_len = params.k.shape[2];
    let name = kernel.name;

    for_each_q_tile(params, tile.q_rows, out, |batch, head, q_start, q_rows, tile_out| {
        let mut stage = KvTileStage::new(tile.kv_rows, dim);
        let mut state = OnlineSoftmaxTile::<A>::new(q_rows, dim);

        for kt in 0..tile.num_kv_tiles(kv_len) {
            let kv_start = kt * tile.kv_rows;
            if tile_fully_masked(params, q_start, q_rows, kv_start) {
                break;
            }
            stage.load(params, batch, head, kv_start, tile.kv_rows);
            process_staged_tile::<A>(
                params, batch, head, q_start, q_rows, &stage, kt, &mut state, name,
            )?;
        }

        state.finalize_into(tile_out, &Epilogue::for_head(params, batch, head));
        Ok(())
    })
}
