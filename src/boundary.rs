//! # Boundary Estimation
//!
//! Sample-based computation of the partition boundaries both datasets are
//! segmented against. [`SegmentBounds`] is the realized boundary list:
//! `N + 1` non-decreasing cut points defining `N` contiguous, gapless,
//! half-open ranges `[b_i, b_{i+1})` that cover the full key domain
//! `[0, MAX_MZ)`. The outer bounds are forced to the domain edges
//! regardless of sampled extremes, so every in-domain record maps to
//! exactly one range.
//!
//! Two estimators produce bounds:
//!
//! - [`estimate_spectra_bounds`]: draws a fixed-ratio random sample of
//!   spectra, extrapolates the total record count, sizes the segment count
//!   from estimated byte volume, and cuts at uniform quantiles of the
//!   sampled m/z values.
//! - [`estimate_centroid_bounds`]: collects anchor-peak m/z values from the
//!   clipped centroid chunks and cuts at uniform quantiles, with the
//!   segment count driven by spectra volume, retained peak count, and a
//!   fixed floor.
//!
//! Degenerate samples (empty, single distinct value) are legal: tied
//! quantiles yield empty but valid ranges, and the segment count never
//! drops below one.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::chunk::{SpectraSource, SourceError};
use crate::config::{SegmentationConfig, MIB};
use crate::fabric::{ExecutionFabric, FabricError};
use crate::model::{CentroidRecord, MAX_MZ};
use crate::store::{get_records, ObjectStore, StoreError};

/// Errors raised during boundary estimation.
#[derive(Debug, thiserror::Error)]
pub enum BoundaryError {
    /// The spectra source failed while drawing the sample.
    #[error("spectra source error: {0}")]
    Source(#[from] SourceError),

    /// A clipped centroid chunk could not be read.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The anchor-collection stage failed.
    #[error(transparent)]
    Fabric(#[from] FabricError),
}

/// A realized boundary list: `N` half-open m/z ranges covering `[0, MAX_MZ)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentBounds {
    cuts: Vec<f64>,
}

impl SegmentBounds {
    /// Bounds from quantile cut points, with the outer bounds forced to
    /// `[0, MAX_MZ)`. `cuts` must hold at least two points and be
    /// non-decreasing; duplicates (from tied quantiles) are legal and
    /// produce empty ranges.
    pub fn from_quantile_cuts(mut cuts: Vec<f64>) -> Self {
        debug_assert!(cuts.len() >= 2);
        debug_assert!(cuts.windows(2).all(|w| w[0] <= w[1]));
        if let Some(first) = cuts.first_mut() {
            *first = 0.0;
        }
        if let Some(last) = cuts.last_mut() {
            *last = MAX_MZ;
        }
        Self { cuts }
    }

    /// The single-range bounds covering the whole domain.
    pub fn whole_domain() -> Self {
        Self {
            cuts: vec![0.0, MAX_MZ],
        }
    }

    /// Number of ranges.
    pub fn len(&self) -> usize {
        self.cuts.len() - 1
    }

    /// Whether the bounds hold zero ranges (never produced by estimation).
    pub fn is_empty(&self) -> bool {
        self.cuts.len() < 2
    }

    /// The `i`-th half-open range `[lower, upper)`.
    pub fn range(&self, i: usize) -> (f64, f64) {
        (self.cuts[i], self.cuts[i + 1])
    }

    /// Lower edge of the key domain (always `0`).
    pub fn mz_min(&self) -> f64 {
        self.cuts[0]
    }

    /// Upper edge of the key domain (always [`MAX_MZ`]).
    pub fn mz_max(&self) -> f64 {
        self.cuts[self.cuts.len() - 1]
    }

    /// All cut points.
    pub fn cuts(&self) -> &[f64] {
        &self.cuts
    }

    /// Index of the range containing `mz`, or `None` when `mz` lies
    /// outside `[0, MAX_MZ)` (including NaN). A key exactly equal to a cut
    /// point belongs to the range starting at that value; among duplicate
    /// cuts it lands in the last, leaving the earlier duplicates empty.
    pub fn range_index(&self, mz: f64) -> Option<usize> {
        if !(mz >= self.mz_min()) || mz >= self.mz_max() {
            return None;
        }
        let upper = self.cuts.partition_point(|&c| c <= mz);
        Some(upper - 1)
    }

    /// Contiguous sub-bounds spanning ranges `[start, end)` of these
    /// bounds, without re-forcing the outer edges.
    pub fn slice(&self, start: usize, end: usize) -> SegmentBounds {
        SegmentBounds {
            cuts: self.cuts[start..=end].to_vec(),
        }
    }
}

/// Linear-interpolation quantile of a sorted, non-empty sample.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let pos = q.clamp(0.0, 1.0) * (n - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = (lo + 1).min(n - 1);
    let frac = pos - lo as f64;
    sorted[lo] + frac * (sorted[hi] - sorted[lo])
}

/// Cut a sorted sample at `n + 1` uniform quantiles and force the outer
/// bounds to the domain edges. An empty sample degrades to the
/// whole-domain single range.
fn bounds_from_sample(mut sample: Vec<f64>, segment_count: usize) -> SegmentBounds {
    if sample.is_empty() {
        return SegmentBounds::whole_domain();
    }
    sample.sort_by(f64::total_cmp);
    let n = segment_count.max(1);
    let cuts: Vec<f64> = (0..=n).map(|i| quantile(&sample, i as f64 / n as f64)).collect();
    SegmentBounds::from_quantile_cuts(cuts)
}

/// Draw the boundary sample: a fixed fraction of spectra chosen uniformly
/// with replacement, seeded from the job config so estimation is
/// reproducible. Returns the concatenated sampled m/z values.
fn sample_spectra_mz<S: SpectraSource>(
    source: &S,
    config: &SegmentationConfig,
) -> Result<Vec<f64>, SourceError> {
    let spectra_count = source.coordinates().len();
    let sample_size = (spectra_count as f64 * config.sample_ratio) as usize;
    let mut rng = StdRng::seed_from_u64(config.sample_seed);
    let mut sample = Vec::new();
    for _ in 0..sample_size {
        let index = rng.gen_range(0..spectra_count);
        let (mzs, _) = source.spectrum(index)?;
        sample.extend(mzs);
    }
    Ok(sample)
}

/// Result of spectra boundary estimation.
#[derive(Debug, Clone)]
pub struct SpectraBoundsEstimate {
    /// The realized boundary list (outer bounds forced to the domain).
    pub bounds: SegmentBounds,
    /// Sampled key extremes `(min, max)`, before the outer bounds were
    /// forced. This is the realized spectral key range the centroid
    /// clipper filters against.
    pub observed_range: (f64, f64),
}

/// Estimate dataset segment bounds from a spectra sample.
///
/// The segment count is the estimated byte volume of the full dataset
/// (3 numeric columns × the source's element width × extrapolated record
/// count) divided by the per-segment budget, floored at one.
pub fn estimate_spectra_bounds<S: SpectraSource>(
    source: &S,
    config: &SegmentationConfig,
) -> Result<SpectraBoundsEstimate, BoundaryError> {
    log::info!("defining dataset segment bounds");
    let sample = sample_spectra_mz(source, config)?;
    if sample.is_empty() {
        return Ok(SpectraBoundsEstimate {
            bounds: SegmentBounds::whole_domain(),
            observed_range: (0.0, MAX_MZ),
        });
    }

    let observed_min = sample.iter().copied().fold(f64::INFINITY, f64::min);
    let observed_max = sample.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let estimated_records = sample.len() as f64 / config.sample_ratio;
    let columns = 3.0;
    let estimated_bytes = columns * estimated_records * source.element_width() as f64;
    let segment_count = ((estimated_bytes / (config.segment_size_mb * MIB) as f64) as usize).max(1);

    let bounds = bounds_from_sample(sample, segment_count);
    log::info!(
        "generated {} dataset bounds over observed range {observed_min:.4}..{observed_max:.4}",
        bounds.len()
    );
    Ok(SpectraBoundsEstimate {
        bounds,
        observed_range: (observed_min, observed_max),
    })
}

/// Estimate centroid segment bounds from the anchor peaks of the clipped
/// centroid chunks stored under `clip_prefix`.
///
/// The segment count is the largest of: realized spectra volume
/// (`ds_segment_count` × segment budget) over the centroid data budget,
/// retained peak count over the peaks-per-segment constant, and the fixed
/// floor.
pub fn estimate_centroid_bounds<F: ExecutionFabric>(
    store: &dyn ObjectStore,
    fabric: &F,
    config: &SegmentationConfig,
    clip_prefix: &str,
    centroid_count: usize,
    ds_segment_count: usize,
) -> Result<SegmentBounds, BoundaryError> {
    log::info!("defining centroid segment bounds");
    let keys = store.list(&format!("{clip_prefix}/"))?;
    let retry = config.read_retry;
    let anchor_mzs: Vec<Vec<f64>> = fabric.run(
        "collect-anchor-mz",
        keys,
        config.task_memory_mb(),
        |key| {
            let records: Vec<CentroidRecord> = get_records(store, &retry, &key)?;
            Ok(records
                .iter()
                .filter(|r| r.is_anchor())
                .map(|r| r.mz)
                .collect())
        },
    )?;
    let sample: Vec<f64> = anchor_mzs.into_iter().flatten().collect();

    let ds_size_mb = ds_segment_count * config.segment_size_mb;
    let segment_count = (ds_size_mb / config.centroid_segment_size_mb)
        .max(centroid_count / config.peaks_per_centroid_segment)
        .max(config.min_centroid_segments);

    let bounds = bounds_from_sample(sample, segment_count);
    log::info!("generated {} centroid bounds", bounds.len());
    Ok(bounds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outer_bounds_are_forced_to_domain_edges() {
        let bounds = SegmentBounds::from_quantile_cuts(vec![99.5, 200.0, 310.2]);
        assert_eq!(bounds.len(), 2);
        assert_eq!(bounds.mz_min(), 0.0);
        assert_eq!(bounds.mz_max(), MAX_MZ);
        assert_eq!(bounds.range(0), (0.0, 200.0));
        assert_eq!(bounds.range(1), (200.0, MAX_MZ));
    }

    #[test]
    fn range_index_uses_half_open_ranges() {
        let bounds = SegmentBounds::from_quantile_cuts(vec![0.0, 100.0, 200.0, MAX_MZ]);
        assert_eq!(bounds.range_index(0.0), Some(0));
        assert_eq!(bounds.range_index(99.999), Some(0));
        // A key equal to a cut belongs to the range starting there.
        assert_eq!(bounds.range_index(100.0), Some(1));
        assert_eq!(bounds.range_index(-1.0), None);
        assert_eq!(bounds.range_index(MAX_MZ), None);
        assert_eq!(bounds.range_index(f64::NAN), None);
    }

    #[test]
    fn duplicate_cuts_leave_empty_ranges() {
        let bounds = SegmentBounds::from_quantile_cuts(vec![0.0, 50.0, 50.0, MAX_MZ]);
        // [50, 50) is empty; the key lands in the range starting at 50
        // that can actually contain it.
        assert_eq!(bounds.range_index(50.0), Some(2));
        assert_eq!(bounds.range_index(49.0), Some(0));
    }

    #[test]
    fn quantile_interpolates_linearly() {
        let sample = vec![0.0, 10.0, 20.0, 30.0];
        assert_eq!(quantile(&sample, 0.0), 0.0);
        assert_eq!(quantile(&sample, 0.5), 15.0);
        assert_eq!(quantile(&sample, 1.0), 30.0);
        assert_eq!(quantile(&[7.0], 0.5), 7.0);
    }

    #[test]
    fn single_value_sample_yields_valid_bounds() {
        let bounds = bounds_from_sample(vec![123.4; 50], 4);
        assert_eq!(bounds.len(), 4);
        assert_eq!(bounds.mz_min(), 0.0);
        assert_eq!(bounds.mz_max(), MAX_MZ);
        // All interior cuts are tied; every in-domain key still maps.
        assert!(bounds.range_index(123.4).is_some());
        assert!(bounds.range_index(5.0).is_some());
    }

    #[test]
    fn empty_sample_degrades_to_whole_domain() {
        let bounds = bounds_from_sample(Vec::new(), 8);
        assert_eq!(bounds.len(), 1);
        assert_eq!(bounds.range(0), (0.0, MAX_MZ));
    }

    #[test]
    fn slice_preserves_interior_cuts() {
        let bounds = SegmentBounds::from_quantile_cuts(vec![0.0, 10.0, 20.0, 30.0, MAX_MZ]);
        let sub = bounds.slice(1, 3);
        assert_eq!(sub.len(), 2);
        assert_eq!(sub.range(0), (10.0, 20.0));
        assert_eq!(sub.range(1), (20.0, 30.0));
    }
}
