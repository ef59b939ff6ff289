//! # Centroid Ingestion
//!
//! Builds the candidate-annotation side of the pipeline's input: centroid
//! chunks, pre-grouped by formula, written to the object store under the
//! centroid chunk prefix.
//!
//! Isotope-peak physics is out of scope; the [`IsotopePeakSource`] trait
//! models it as an injected capability (formula id → peak list). The
//! partitioning core never depends on this module — it consumes centroid
//! chunks from the store regardless of who produced them.

use crate::config::SegmentationConfig;
use crate::fabric::{ExecutionFabric, FabricError};
use crate::model::CentroidRecord;
use crate::store::{object_key, put_records, ObjectStore, StoreError};

/// Injected isotope-peak capability.
///
/// Returns the `(mz, intensity)` isotope envelope of a formula in peak
/// order (the first entry is the anchor), or `None` for formulas the
/// calculator cannot centroid.
pub trait IsotopePeakSource: Send + Sync {
    /// Peaks of one formula's isotope envelope.
    fn peaks_for(&self, formula_id: u32) -> Option<Vec<(f64, f32)>>;
}

/// Errors raised while building centroid chunks.
#[derive(Debug, thiserror::Error)]
pub enum CentroidBuildError {
    /// Prefix cleanup failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The build stage failed.
    #[error(transparent)]
    Fabric(#[from] FabricError),
}

/// Statistics from a centroid chunk build.
#[derive(Debug, Clone)]
pub struct CentroidBuildStats {
    /// Peak count per written chunk.
    pub chunk_counts: Vec<usize>,
}

impl CentroidBuildStats {
    /// Total peaks written across all chunks.
    pub fn total_peaks(&self) -> usize {
        self.chunk_counts.iter().sum()
    }
}

/// Materialize centroid chunks for `formula_chunks` under
/// `{centroid_prefix}/{chunk_id}`, one fabric task per chunk.
///
/// Formulas the capability cannot centroid are skipped. Within a chunk,
/// records stay grouped by formula in envelope order — the grouping the
/// clipper and the centroid partition scheme rely on.
pub fn build_centroid_chunks<F: ExecutionFabric, I: IsotopePeakSource>(
    store: &dyn ObjectStore,
    fabric: &F,
    config: &SegmentationConfig,
    isotopes: &I,
    formula_chunks: Vec<Vec<u32>>,
    centroid_prefix: &str,
) -> Result<CentroidBuildStats, CentroidBuildError> {
    store.delete_prefix(&format!("{centroid_prefix}/"))?;

    let inputs: Vec<(usize, Vec<u32>)> = formula_chunks.into_iter().enumerate().collect();
    let chunk_counts = fabric.run(
        "build-centroids",
        inputs,
        config.task_memory_mb(),
        |(chunk_id, formula_ids)| {
            let mut records = Vec::new();
            for formula_id in formula_ids {
                if let Some(peaks) = isotopes.peaks_for(formula_id) {
                    records.extend(peaks.into_iter().enumerate().map(
                        |(peak_index, (mz, intensity))| {
                            CentroidRecord::new(formula_id, peak_index as u32, mz, intensity)
                        },
                    ));
                }
            }
            put_records(store, &object_key(centroid_prefix, chunk_id), &records)?;
            Ok(records.len())
        },
    )?;

    let stats = CentroidBuildStats { chunk_counts };
    log::info!(
        "built {} centroid chunks ({} peaks)",
        stats.chunk_counts.len(),
        stats.total_peaks()
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::RayonFabric;
    use crate::store::{get_records, InMemoryStore, RetryPolicy};

    /// Two-peak envelope spaced one neutron apart, anchored at a mass
    /// derived from the formula id. Odd ids cannot be centroided.
    struct StubIsotopes;

    impl IsotopePeakSource for StubIsotopes {
        fn peaks_for(&self, formula_id: u32) -> Option<Vec<(f64, f32)>> {
            if formula_id % 2 == 1 {
                return None;
            }
            let anchor = 100.0 + formula_id as f64;
            Some(vec![(anchor, 1.0), (anchor + 1.003, 0.3)])
        }
    }

    #[test]
    fn chunks_keep_formula_grouping_and_peak_order() {
        let store = InMemoryStore::new();
        let fabric = RayonFabric::with_workers(2).unwrap();
        let config = SegmentationConfig::small_dataset();

        let stats = build_centroid_chunks(
            &store,
            &fabric,
            &config,
            &StubIsotopes,
            vec![vec![0, 1, 2], vec![4]],
            "db/centroids",
        )
        .unwrap();

        // Formula 1 is skipped; formulas 0 and 2 contribute two peaks each.
        assert_eq!(stats.chunk_counts, vec![4, 2]);
        assert_eq!(stats.total_peaks(), 6);

        let first: Vec<CentroidRecord> =
            get_records(&store, &RetryPolicy::none(), "db/centroids/0").unwrap();
        assert_eq!(first[0].formula_id, 0);
        assert!(first[0].is_anchor());
        assert_eq!(first[1].peak_index, 1);
        assert_eq!(first[2].formula_id, 2);
    }

    #[test]
    fn stale_chunks_are_removed_first() {
        let store = InMemoryStore::new();
        let fabric = RayonFabric::with_workers(2).unwrap();
        let config = SegmentationConfig::small_dataset();
        store.put("db/centroids/7", vec![1, 2, 3]).unwrap();

        build_centroid_chunks(&store, &fabric, &config, &StubIsotopes, vec![vec![0]], "db/centroids")
            .unwrap();
        assert_eq!(store.list("db/centroids/").unwrap(), vec!["db/centroids/0"]);
    }
}
