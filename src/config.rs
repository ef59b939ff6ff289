//! # Job Configuration
//!
//! One configuration value carries every tunable of a segmentation job.
//! The two memory budgets — first-level group size and per-segment target
//! size — deterministically trade task count against per-task memory: a
//! merge task must hold one full coarse group, so its provisioning follows
//! `first_level_size_mb` directly.

use serde::Serialize;

use crate::store::RetryPolicy;

/// Megabyte, in bytes.
pub const MIB: usize = 1024 * 1024;

/// Tunables for one segmentation job.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentationConfig {
    /// Byte budget for one ingestion chunk (estimated as
    /// 2 × mz-array-bytes + intensity-bytes while accumulating).
    pub chunk_max_bytes: usize,

    /// Fraction of spectra sampled for boundary estimation.
    pub sample_ratio: f64,

    /// Seed for the boundary sample; fixed per job so identical inputs
    /// produce identical boundaries.
    pub sample_seed: u64,

    /// Target size of one final dataset segment, in MiB.
    pub segment_size_mb: usize,

    /// Byte budget of one first-level (coarse) group, in MiB. A merge task
    /// holds one coarse group in memory, so this bounds per-task memory.
    pub first_level_size_mb: usize,

    /// Target data volume of one centroid segment, in MiB.
    pub centroid_segment_size_mb: usize,

    /// Target number of isotope peaks per centroid segment.
    pub peaks_per_centroid_segment: usize,

    /// Floor on the centroid segment count.
    pub min_centroid_segments: usize,

    /// Concurrent store operations inside one task (fan-out / fan-in pool).
    pub io_workers: usize,

    /// Background uploader threads in the ingestion chunker.
    pub upload_workers: usize,

    /// Pending chunks allowed in the uploader queue before accumulation
    /// blocks (backpressure).
    pub upload_queue_capacity: usize,

    /// Retry policy for store reads.
    pub read_retry: RetryPolicy,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            chunk_max_bytes: 512 * MIB,
            sample_ratio: 0.05,
            sample_seed: 0,
            segment_size_mb: 5,
            first_level_size_mb: 512,
            centroid_segment_size_mb: 50,
            peaks_per_centroid_segment: 10_000,
            min_centroid_segments: 32,
            io_workers: 128,
            upload_workers: 8,
            upload_queue_capacity: 4,
            read_retry: RetryPolicy::default(),
        }
    }
}

impl SegmentationConfig {
    /// Configuration scaled down for small datasets and local runs: tiny
    /// budgets so the two-level hierarchy is exercised even by test-sized
    /// inputs.
    pub fn small_dataset() -> Self {
        Self {
            chunk_max_bytes: MIB,
            segment_size_mb: 1,
            first_level_size_mb: 4,
            centroid_segment_size_mb: 1,
            peaks_per_centroid_segment: 100,
            min_centroid_segments: 4,
            io_workers: 8,
            upload_workers: 2,
            upload_queue_capacity: 2,
            ..Self::default()
        }
    }

    /// Memory budget requested for one scatter or merge task, in MiB:
    /// room for one coarse group twice over (fan-in buffers plus the
    /// concatenated sort), plus fixed headroom.
    pub fn task_memory_mb(&self) -> usize {
        self.first_level_size_mb * 2 + 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_budgets_match_contract() {
        let config = SegmentationConfig::default();
        assert_eq!(config.chunk_max_bytes, 512 * MIB);
        assert_eq!(config.segment_size_mb, 5);
        assert_eq!(config.task_memory_mb(), 512 * 2 + 1024);
    }
}
