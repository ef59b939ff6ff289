//! # Job Orchestration
//!
//! [`JobContext`] is the explicit per-run value that replaces any
//! process-wide state: it owns the store handle, the fabric handle, the
//! configuration, the key layout, and the telemetry ledger. Constructed
//! once per job; nothing in the crate is a singleton.
//!
//! The two orchestrations mirror the dataflow:
//!
//! ```text
//! spectra source ─▶ chunker ─▶ bounds ─▶ partitioner ─▶ dataset segments
//! centroid chunks ─▶ clipper ─▶ bounds ─▶ partitioner ─▶ centroid segments
//! ```
//!
//! The two segmentations are not index-aligned: downstream scoring joins
//! a dataset segment with every centroid segment whose key range overlaps
//! it. Consumed inputs (ingestion chunks, clipped chunks) are deleted once
//! their stage completes; nothing relies on store-side expiry.

use crate::boundary::{
    estimate_centroid_bounds, estimate_spectra_bounds, BoundaryError, SegmentBounds,
};
use crate::chunk::{ChunkerError, SpectraChunker, SpectraSource};
use crate::clip::{clip_centroid_chunks, ClipError};
use crate::config::SegmentationConfig;
use crate::fabric::ExecutionFabric;
use crate::isotopes::{build_centroid_chunks, CentroidBuildError, IsotopePeakSource};
use crate::partition::{
    CentroidScheme, PartitionError, RangePartitioner, SpectrumScheme,
};
use crate::stats::JobStats;
use crate::store::{ObjectStore, StoreError};

/// Errors raised by the orchestration layer.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Spectra ingestion failed.
    #[error(transparent)]
    Chunker(#[from] ChunkerError),

    /// Boundary estimation failed.
    #[error(transparent)]
    Boundary(#[from] BoundaryError),

    /// Centroid clipping failed.
    #[error(transparent)]
    Clip(#[from] ClipError),

    /// Centroid chunk building failed.
    #[error(transparent)]
    CentroidBuild(#[from] CentroidBuildError),

    /// Scatter/merge partitioning failed.
    #[error(transparent)]
    Partition(#[from] PartitionError),

    /// A store operation failed on the driver.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Store key prefixes of one job's objects.
#[derive(Debug, Clone)]
pub struct JobKeys {
    /// Ingestion chunk prefix.
    pub ds_chunks: String,
    /// Final dataset segment prefix (also namespaces interim objects).
    pub ds_segments: String,
    /// Raw centroid chunk prefix.
    pub centroid_chunks: String,
    /// Clipped centroid chunk prefix.
    pub clipped_chunks: String,
    /// Final centroid segment prefix.
    pub centroid_segments: String,
}

impl Default for JobKeys {
    fn default() -> Self {
        Self {
            ds_chunks: "ds/chunks".to_string(),
            ds_segments: "ds/segments".to_string(),
            centroid_chunks: "db/centroids".to_string(),
            clipped_chunks: "db/clipped".to_string(),
            centroid_segments: "db/segments".to_string(),
        }
    }
}

/// Result of the spectra segmentation flow.
#[derive(Debug, Clone)]
pub struct SpectraSegments {
    /// The realized boundary list the segments were cut against.
    pub bounds: SegmentBounds,
    /// Observed (sampled) spectral key range, the centroid clip window.
    pub observed_range: (f64, f64),
    /// Record count per segment id.
    pub segment_lengths: Vec<usize>,
}

impl SpectraSegments {
    /// Number of dataset segments.
    pub fn segment_count(&self) -> usize {
        self.bounds.len()
    }
}

/// Result of the centroid segmentation flow.
#[derive(Debug, Clone)]
pub struct CentroidSegments {
    /// The centroid boundary list.
    pub bounds: SegmentBounds,
    /// Peak count per segment id.
    pub segment_lengths: Vec<usize>,
    /// Peaks retained by clipping.
    pub retained_peaks: usize,
}

impl CentroidSegments {
    /// Number of centroid segments.
    pub fn segment_count(&self) -> usize {
        self.bounds.len()
    }
}

/// Per-job context: store, fabric, config, key layout, and telemetry.
pub struct JobContext<'a, F: ExecutionFabric> {
    /// Shared object store.
    pub store: &'a dyn ObjectStore,
    /// Execution fabric for scatter/merge/clip stages.
    pub fabric: &'a F,
    /// Job configuration.
    pub config: SegmentationConfig,
    /// Key layout.
    pub keys: JobKeys,
    /// Telemetry ledger, appended to by every stage.
    pub stats: JobStats,
}

impl<'a, F: ExecutionFabric> JobContext<'a, F> {
    /// Context with the default key layout.
    pub fn new(store: &'a dyn ObjectStore, fabric: &'a F, config: SegmentationConfig) -> Self {
        Self {
            store,
            fabric,
            config,
            keys: JobKeys::default(),
            stats: JobStats::new(),
        }
    }

    /// Materialize centroid chunks from formula ids through the injected
    /// isotope capability (skipped when chunks are supplied externally).
    pub fn build_centroids<I: IsotopePeakSource>(
        &mut self,
        isotopes: &I,
        formula_chunks: Vec<Vec<u32>>,
    ) -> Result<usize, PipelineError> {
        let timer = self.stats.stage("build-centroids");
        let built = build_centroid_chunks(
            self.store,
            self.fabric,
            &self.config,
            isotopes,
            formula_chunks,
            &self.keys.centroid_chunks,
        )?;
        let chunks = built.chunk_counts.len();
        timer.finish(chunks, self.config.task_memory_mb(), chunks, 0);
        Ok(built.total_peaks())
    }

    /// Run the spectra side: ingest, estimate bounds, partition, clean up
    /// the consumed chunks.
    pub fn segment_spectra<S: SpectraSource>(
        &mut self,
        source: &S,
    ) -> Result<SpectraSegments, PipelineError> {
        let timer = self.stats.stage("chunk-spectra");
        let chunker = SpectraChunker::new(&self.config, &self.keys.ds_chunks);
        let ingest = chunker.ingest(source, self.store)?;
        timer.finish(
            ingest.chunks_written,
            self.config.chunk_max_bytes / crate::config::MIB,
            ingest.chunks_written,
            0,
        );

        let timer = self.stats.stage("estimate-ds-bounds");
        let estimate = estimate_spectra_bounds(source, &self.config)?;
        timer.finish(1, 0, 0, 0);

        let timer = self.stats.stage("partition-spectra");
        let partitioner =
            RangePartitioner::new(self.store, self.fabric, &self.config, SpectrumScheme)?;
        let outcome = partitioner.partition(
            &self.keys.ds_chunks,
            &self.keys.ds_segments,
            &estimate.bounds,
            self.config.segment_size_mb,
        )?;
        let chunks_deleted = self
            .store
            .delete_prefix(&format!("{}/", self.keys.ds_chunks))?;
        let segments_written = outcome.segment_lengths.iter().filter(|&&n| n > 0).count();
        timer.finish(
            outcome.chunks_read + outcome.group_count,
            self.config.task_memory_mb(),
            outcome.interim_objects + segments_written,
            outcome.interim_objects + chunks_deleted,
        );

        Ok(SpectraSegments {
            bounds: estimate.bounds,
            observed_range: estimate.observed_range,
            segment_lengths: outcome.segment_lengths,
        })
    }

    /// Run the centroid side against an already segmented dataset: clip to
    /// the observed spectral range, estimate bounds sized from the spectra
    /// volume, partition, clean up the clipped chunks.
    pub fn segment_centroids(
        &mut self,
        spectra: &SpectraSegments,
    ) -> Result<CentroidSegments, PipelineError> {
        let (mz_min, mz_max) = spectra.observed_range;
        let timer = self.stats.stage("clip-centroids");
        let clip = clip_centroid_chunks(
            self.store,
            self.fabric,
            &self.config,
            &self.keys.centroid_chunks,
            &self.keys.clipped_chunks,
            mz_min,
            mz_max,
        )?;
        let clip_chunks = clip.chunk_counts.len();
        timer.finish(clip_chunks, self.config.task_memory_mb(), clip_chunks, 0);

        let timer = self.stats.stage("estimate-centroid-bounds");
        let bounds = estimate_centroid_bounds(
            self.store,
            self.fabric,
            &self.config,
            &self.keys.clipped_chunks,
            clip.retained(),
            spectra.segment_count(),
        )?;
        timer.finish(clip_chunks, self.config.task_memory_mb(), 0, 0);

        let timer = self.stats.stage("partition-centroids");
        let partitioner =
            RangePartitioner::new(self.store, self.fabric, &self.config, CentroidScheme)?;
        let outcome = partitioner.partition(
            &self.keys.clipped_chunks,
            &self.keys.centroid_segments,
            &bounds,
            self.config.centroid_segment_size_mb,
        )?;
        let chunks_deleted = self
            .store
            .delete_prefix(&format!("{}/", self.keys.clipped_chunks))?;
        let segments_written = outcome.segment_lengths.iter().filter(|&&n| n > 0).count();
        timer.finish(
            outcome.chunks_read + outcome.group_count,
            self.config.task_memory_mb(),
            outcome.interim_objects + segments_written,
            outcome.interim_objects + chunks_deleted,
        );

        Ok(CentroidSegments {
            bounds,
            segment_lengths: outcome.segment_lengths,
            retained_peaks: clip.retained(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::RayonFabric;
    use crate::store::InMemoryStore;

    struct TinySource;

    impl SpectraSource for TinySource {
        fn coordinates(&self) -> &[(u32, u32)] {
            const COORDS: [(u32, u32); 4] = [(0, 0), (1, 0), (0, 1), (1, 1)];
            &COORDS
        }

        fn spectrum(&self, index: usize) -> Result<(Vec<f64>, Vec<f32>), anyhow::Error> {
            let base = 100.0 * (index + 1) as f64;
            Ok((vec![base, base + 1.0, base + 2.0], vec![1.0, 2.0, 3.0]))
        }

        fn element_width(&self) -> usize {
            8
        }
    }

    #[test]
    fn spectra_flow_cleans_up_chunks_and_records_stages() {
        let store = InMemoryStore::new();
        let fabric = RayonFabric::with_workers(2).unwrap();
        let mut config = SegmentationConfig::small_dataset();
        config.sample_ratio = 1.0;
        let mut ctx = JobContext::new(&store, &fabric, config);

        let spectra = ctx.segment_spectra(&TinySource).unwrap();
        assert_eq!(spectra.segment_lengths.iter().sum::<usize>(), 12);
        assert!(spectra.observed_range.0 >= 100.0);

        // Consumed chunks and interim objects are gone; only segments
        // remain under the dataset prefixes.
        assert!(store.list("ds/chunks/").unwrap().is_empty());
        assert!(store.list("ds/segments/chunk/").unwrap().is_empty());
        assert!(!store.list("ds/segments/").unwrap().is_empty());

        let stages: Vec<&str> = ctx.stats.stages.iter().map(|s| s.stage.as_str()).collect();
        assert_eq!(
            stages,
            vec!["chunk-spectra", "estimate-ds-bounds", "partition-spectra"]
        );
    }
}
