// SPDX-License-Identifier: Apache-2.0

//! Fused post-processing applied during output write-back.
//!
//! Epilogues operate on the normalized output tile while it is still in
//! scratch, so a fused launch touches global memory exactly once. Each
//! epilogue is bit-equivalent to its unfused counterpart running as a
//! separate pass over the written output: the same multiplies and subtracts
//! in the same per-element order, just without the extra round trip.

use super::{FusionFlags, LaunchParams, ValueView};

/// Per-(batch, head) epilogue state resolved once per unit of work.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Epilogue<'a> {
    v_scale: Option<&'a [f32]>,
    v_mean: Option<&'a [f32]>,
}

impl<'a> Epilogue<'a> {
    /// Resolve the epilogue inputs for one (batch, head).
    ///
    /// Relies on [`LaunchParams::validate`] having established that V-rescale
    /// fusion is requested exactly when V is FP8.
    pub(crate) fn for_head(params: &'a LaunchParams<'_>, batch: usize, head: usize) -> Self {
        let FusionFlags { v_scale, v_mean } = params.fusion;
        match &params.v {
            ValueView::Fp8(v) if v_scale => Self {
                v_scale: Some(v.head_scales(batch, head)),
                v_mean: v_mean.then(|| v.head_means(batch, head)),
            },
            _ => Self::default(),
        }
    }

    /// Apply the fused operations to one normalized output row.
    pub(crate) fn apply_row(&self, row: &mut [f32]) {
        if let Some(scales) = self.v_scale {
            for (x, &s) in row.iter_mut().zip(scales) {
                *x *= s;
            }
        }
        if let Some(means) = self.v_mean {
            for (x, &m) in row.iter_mut().zip(means) {
                *x -= m;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_without_fusion() {
        let epilogue = Epilogue::default();
        let mut row = vec![1.0f32, -2.0, 3.5];
        epilogue.apply_row(&mut row);
        assert_eq!(row, vec![1.0, -2.0, 3.5]);
    }

    #[test]
    fn test_scale_then_center() {
        let scales = [2.0f32, 0.5];
        let means = [1.0f32, -1.0];
        let epilogue = Epilogue {
            v_scale: Some(&scales),
            v_mean: Some(&means),
        };
        let mut row = vec![3.0f32, 4.0];
        epilogue.apply_row(&mut row);
        assert_eq!(row, vec![5.0, 3.0]);
    }
}
