//! # Centroid Clipper
//!
//! Filters candidate annotation peaks to the observed spectral key range
//! before they are partitioned. Clipping is formula-level: a formula is
//! retained when its anchor peak (peak index 0) lies strictly inside the
//! realized spectral range, and a retained formula keeps *all* of its
//! isotope peaks, including ones outside the range. Records with
//! non-positive m/z are dropped unconditionally.
//!
//! One fabric task per centroid chunk; each task writes the clipped chunk
//! under the clip prefix with the same chunk index and reports its
//! retained count, which feeds the centroid boundary estimator.

use std::collections::HashSet;

use crate::config::SegmentationConfig;
use crate::fabric::{ExecutionFabric, FabricError};
use crate::model::{sort_by_mz, CentroidRecord};
use crate::store::{get_records, object_key, put_records, ObjectStore, StoreError};

/// Errors raised during centroid clipping.
#[derive(Debug, thiserror::Error)]
pub enum ClipError {
    /// Chunk listing failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The clipping stage failed.
    #[error(transparent)]
    Fabric(#[from] FabricError),
}

/// Statistics from a clipping run.
#[derive(Debug, Clone)]
pub struct ClipStats {
    /// Retained peak count per clipped chunk, in chunk order.
    pub chunk_counts: Vec<usize>,
}

impl ClipStats {
    /// Total retained peaks across all chunks.
    pub fn retained(&self) -> usize {
        self.chunk_counts.iter().sum()
    }
}

/// Clip one chunk's records to the `(mz_min, mz_max)` window.
///
/// Exposed for direct testing; the pipeline runs it through
/// [`clip_centroid_chunks`].
pub fn clip_records(
    mut records: Vec<CentroidRecord>,
    mz_min: f64,
    mz_max: f64,
) -> Vec<CentroidRecord> {
    sort_by_mz(&mut records);
    records.retain(|r| r.mz > 0.0);
    let retained_formulas: HashSet<u32> = records
        .iter()
        .filter(|r| r.is_anchor() && r.mz > mz_min && r.mz < mz_max)
        .map(|r| r.formula_id)
        .collect();
    records.retain(|r| retained_formulas.contains(&r.formula_id));
    records
}

/// Clip every centroid chunk under `centroid_prefix` to the observed
/// spectral key range, writing the results under `clip_prefix`.
pub fn clip_centroid_chunks<F: ExecutionFabric>(
    store: &dyn ObjectStore,
    fabric: &F,
    config: &SegmentationConfig,
    centroid_prefix: &str,
    clip_prefix: &str,
    mz_min: f64,
    mz_max: f64,
) -> Result<ClipStats, ClipError> {
    let keys = store.list(&format!("{centroid_prefix}/"))?;
    // Stale outputs from a previous run must not leak into this job.
    store.delete_prefix(&format!("{clip_prefix}/"))?;

    let retry = config.read_retry;
    let inputs: Vec<(usize, String)> = keys.into_iter().enumerate().collect();
    let chunk_counts = fabric.run(
        "clip-centroids",
        inputs,
        config.task_memory_mb(),
        |(chunk_id, key)| {
            log::debug!("clipping centroid chunk {key}");
            let records: Vec<CentroidRecord> = get_records(store, &retry, &key)?;
            let clipped = clip_records(records, mz_min, mz_max);
            let count = clipped.len();
            put_records(store, &object_key(clip_prefix, chunk_id), &clipped)?;
            Ok(count)
        },
    )?;

    let stats = ClipStats { chunk_counts };
    log::info!("prepared {} centroids", stats.retained());
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::RayonFabric;
    use crate::store::{InMemoryStore, RetryPolicy};

    #[test]
    fn anchor_inside_window_keeps_all_peaks() {
        // Formula 1 anchors at 150 (inside 100..200): all peaks kept,
        // including the secondary at 205. Formula 2 anchors at 250: dropped
        // entirely.
        let records = vec![
            CentroidRecord::new(1, 0, 150.0, 1.0),
            CentroidRecord::new(1, 1, 205.0, 0.4),
            CentroidRecord::new(2, 0, 250.0, 1.0),
            CentroidRecord::new(2, 1, 251.0, 0.3),
        ];
        let clipped = clip_records(records, 100.0, 200.0);
        assert_eq!(clipped.len(), 2);
        assert!(clipped.iter().all(|r| r.formula_id == 1));
        assert!(clipped.iter().any(|r| r.mz == 205.0));
    }

    #[test]
    fn window_edges_are_exclusive() {
        let records = vec![
            CentroidRecord::new(1, 0, 100.0, 1.0),
            CentroidRecord::new(2, 0, 200.0, 1.0),
            CentroidRecord::new(3, 0, 100.001, 1.0),
        ];
        let clipped = clip_records(records, 100.0, 200.0);
        assert_eq!(clipped.len(), 1);
        assert_eq!(clipped[0].formula_id, 3);
    }

    #[test]
    fn non_positive_mz_is_dropped_even_for_retained_formulas() {
        let records = vec![
            CentroidRecord::new(1, 0, 150.0, 1.0),
            CentroidRecord::new(1, 1, 0.0, 0.2),
            CentroidRecord::new(1, 2, -5.0, 0.1),
        ];
        let clipped = clip_records(records, 100.0, 200.0);
        assert_eq!(clipped.len(), 1);
        assert_eq!(clipped[0].mz, 150.0);
    }

    #[test]
    fn clipped_chunks_are_sorted_and_counted() {
        let store = InMemoryStore::new();
        let fabric = RayonFabric::with_workers(2).unwrap();
        let config = SegmentationConfig::small_dataset();

        crate::store::put_records(
            &store,
            "db/centroids/0",
            &[
                CentroidRecord::new(1, 0, 180.0, 1.0),
                CentroidRecord::new(1, 1, 120.0, 0.5),
                CentroidRecord::new(9, 0, 900.0, 1.0),
            ],
        )
        .unwrap();
        crate::store::put_records(
            &store,
            "db/centroids/1",
            &[CentroidRecord::new(2, 0, 160.0, 1.0)],
        )
        .unwrap();

        let stats = clip_centroid_chunks(
            &store,
            &fabric,
            &config,
            "db/centroids",
            "db/clipped",
            100.0,
            200.0,
        )
        .unwrap();
        assert_eq!(stats.chunk_counts, vec![2, 1]);
        assert_eq!(stats.retained(), 3);

        let first: Vec<CentroidRecord> =
            get_records(&store, &RetryPolicy::none(), "db/clipped/0").unwrap();
        assert!(first.windows(2).all(|w| w[0].mz <= w[1].mz));
    }
}
