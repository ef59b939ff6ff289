//! # Two-Level Range Partitioner
//!
//! The reusable core of the pipeline: given locally sorted input chunks
//! and a final boundary list of `N` ranges, produce exactly `N` final
//! segments — each internally key-sorted, with stable ids `0..N-1` — such
//! that every in-domain input record appears in exactly one segment. The
//! engine is invoked once for spectra and once for clipped centroids; the
//! differences between the two (placement key, in-segment order, formula
//! co-location) live behind [`PartitionScheme`].
//!
//! ## Algorithm
//!
//! Per-task memory is bounded independently of `N` and of total volume by
//! a two-level hierarchy:
//!
//! 1. **Plan**: fold the `N` fine ranges into `G` coarse groups, each a
//!    contiguous run of consecutive fine ranges whose estimated data
//!    volume fits the first-level memory budget.
//! 2. **Scatter**: one task per input chunk, in parallel. Each record's
//!    placement key is binary-searched against the shared boundary list
//!    and bucketed by coarse group; one interim object is written per
//!    non-empty (chunk, group) pair, with the fan-out writes running on
//!    the bounded I/O pool.
//! 3. **Merge**: one task per coarse group, in parallel, after a
//!    synchronous barrier. The group's interim objects are fetched with
//!    retrying reads on the bounded I/O pool, concatenated, sorted by the
//!    scheme's order, and the interim objects deleted. The group's slice
//!    of the boundary list then splits the sorted block into final
//!    segments; segment id = the group's first fine-range index plus the
//!    local index, so ids are globally contiguous and independent of task
//!    completion order.
//!
//! A single level would force a choice between thousands of
//! latency-dominated tiny merge tasks and few tasks holding unbounded
//! memory; the coarse group size is exactly the per-merge-task memory
//! provisioning contract.

use std::collections::HashMap;
use std::ops::Range;

use rayon::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::boundary::SegmentBounds;
use crate::config::SegmentationConfig;
use crate::fabric::{ExecutionFabric, FabricError};
use crate::model::{decode_records, sort_by_mz, CentroidRecord, SpectrumRecord};
use crate::store::{
    get_with_retry, interim_key, interim_prefix, object_key, put_records, ObjectStore, StoreError,
};

/// Errors raised by the partitioner.
#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    /// A store operation outside a fabric task failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A scatter or merge stage failed.
    #[error(transparent)]
    Fabric(#[from] FabricError),

    /// The bounded I/O pool could not be built.
    #[error("I/O pool initialization failed: {0}")]
    PoolInit(String),
}

/// Dataset-specific behavior plugged into the generic engine.
///
/// Placement keys are computed set-at-a-time because a record's key may
/// depend on siblings (a centroid peak is placed by its formula's anchor).
/// Implementations must order records by non-decreasing placement key in
/// [`sort`](PartitionScheme::sort); the merge step relies on it to split
/// a sorted block with binary searches.
pub trait PartitionScheme: Send + Sync {
    /// Record type moved through the engine.
    type Record: Serialize + DeserializeOwned + Send + Clone;

    /// Placement key of each record, `None` for records excluded from
    /// partitioning.
    fn placement_keys(&self, records: &[Self::Record]) -> Vec<Option<f64>>;

    /// Final in-segment ordering.
    fn sort(&self, records: &mut Vec<Self::Record>);
}

/// Spectra: records are placed and ordered by their own m/z.
pub struct SpectrumScheme;

impl PartitionScheme for SpectrumScheme {
    type Record = SpectrumRecord;

    fn placement_keys(&self, records: &[SpectrumRecord]) -> Vec<Option<f64>> {
        records.iter().map(|r| Some(r.mz)).collect()
    }

    fn sort(&self, records: &mut Vec<SpectrumRecord>) {
        sort_by_mz(records.as_mut_slice());
    }
}

/// Centroids: every peak of a formula is placed by the formula's anchor
/// m/z, so the whole envelope lands in the anchor's segment. Peaks whose
/// formula has no anchor in the set are excluded (chunks arrive grouped
/// by formula, so an anchor is normally co-resident).
pub struct CentroidScheme;

impl CentroidScheme {
    fn anchor_mzs(records: &[CentroidRecord]) -> HashMap<u32, f64> {
        records
            .iter()
            .filter(|r| r.is_anchor())
            .map(|r| (r.formula_id, r.mz))
            .collect()
    }
}

impl PartitionScheme for CentroidScheme {
    type Record = CentroidRecord;

    fn placement_keys(&self, records: &[CentroidRecord]) -> Vec<Option<f64>> {
        let anchors = Self::anchor_mzs(records);
        records
            .iter()
            .map(|r| anchors.get(&r.formula_id).copied())
            .collect()
    }

    fn sort(&self, records: &mut Vec<CentroidRecord>) {
        // Order envelopes by anchor m/z and keep each formula's peaks
        // adjacent to its anchor, in envelope order.
        let anchors = Self::anchor_mzs(records);
        records.sort_by(|a, b| {
            let ka = anchors.get(&a.formula_id).copied().unwrap_or(f64::MAX);
            let kb = anchors.get(&b.formula_id).copied().unwrap_or(f64::MAX);
            ka.total_cmp(&kb)
                .then(a.formula_id.cmp(&b.formula_id))
                .then(a.peak_index.cmp(&b.peak_index))
        });
    }
}

/// Fold `segment_count` fine ranges into contiguous coarse groups whose
/// estimated volume (`segment_size_mb` per fine range) stays under
/// `first_level_size_mb`. Groups are near-equal contiguous spans; the
/// group count is floored at one.
pub fn plan_coarse_groups(
    segment_count: usize,
    segment_size_mb: usize,
    first_level_size_mb: usize,
) -> Vec<Range<usize>> {
    let group_count = ((segment_count * segment_size_mb) / first_level_size_mb.max(1)).max(1);
    let group_count = group_count.min(segment_count.max(1));
    let base = segment_count / group_count;
    let remainder = segment_count % group_count;
    let mut groups = Vec::with_capacity(group_count);
    let mut start = 0;
    for i in 0..group_count {
        let len = base + usize::from(i < remainder);
        groups.push(start..start + len);
        start += len;
    }
    groups
}

/// Outcome of one partitioning run.
#[derive(Debug, Clone)]
pub struct PartitionOutcome {
    /// Total number of fine ranges (= final segment ids `0..count`).
    pub segment_count: usize,
    /// Record count per segment id; zero-length ranges produce no object
    /// but still occupy their id.
    pub segment_lengths: Vec<usize>,
    /// Number of coarse groups used.
    pub group_count: usize,
    /// Interim objects written by scatter (all deleted again by merge).
    pub interim_objects: usize,
    /// Input chunks consumed.
    pub chunks_read: usize,
}

/// Generic two-level scatter/merge engine.
pub struct RangePartitioner<'a, P, F> {
    store: &'a dyn ObjectStore,
    fabric: &'a F,
    config: &'a SegmentationConfig,
    scheme: P,
    io_pool: rayon::ThreadPool,
}

impl<'a, P, F> RangePartitioner<'a, P, F>
where
    P: PartitionScheme,
    F: ExecutionFabric,
{
    /// Build a partitioner with its bounded I/O pool.
    pub fn new(
        store: &'a dyn ObjectStore,
        fabric: &'a F,
        config: &'a SegmentationConfig,
        scheme: P,
    ) -> Result<Self, PartitionError> {
        let io_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.io_workers.max(1))
            .thread_name(|i| format!("mzsegment-io-{i}"))
            .build()
            .map_err(|e| PartitionError::PoolInit(e.to_string()))?;
        Ok(Self {
            store,
            fabric,
            config,
            scheme,
            io_pool,
        })
    }

    /// Partition the chunks under `{chunks_prefix}/` into one segment per
    /// range of `bounds`, written under `{segments_prefix}/{id}`.
    /// `segment_size_mb` is the per-fine-range volume estimate driving the
    /// coarse grouping.
    pub fn partition(
        &self,
        chunks_prefix: &str,
        segments_prefix: &str,
        bounds: &SegmentBounds,
        segment_size_mb: usize,
    ) -> Result<PartitionOutcome, PartitionError> {
        let chunk_keys = self.store.list(&format!("{chunks_prefix}/"))?;
        let groups = plan_coarse_groups(
            bounds.len(),
            segment_size_mb,
            self.config.first_level_size_mb,
        );
        // Fine range -> coarse group table, shared by every scatter task.
        let mut fine_to_group = vec![0usize; bounds.len()];
        for (group_id, span) in groups.iter().enumerate() {
            for slot in &mut fine_to_group[span.clone()] {
                *slot = group_id;
            }
        }
        log::info!(
            "partitioning {} chunks into {} segments across {} coarse groups",
            chunk_keys.len(),
            bounds.len(),
            groups.len()
        );

        let chunks_read = chunk_keys.len();
        let interim_objects =
            self.scatter(segments_prefix, chunk_keys, bounds, &fine_to_group, groups.len())?;
        let segment_lengths = self.merge(segments_prefix, bounds, &groups)?;

        Ok(PartitionOutcome {
            segment_count: bounds.len(),
            segment_lengths,
            group_count: groups.len(),
            interim_objects,
            chunks_read,
        })
    }

    /// Step 2: route every chunk's records to coarse groups.
    fn scatter(
        &self,
        segments_prefix: &str,
        chunk_keys: Vec<String>,
        bounds: &SegmentBounds,
        fine_to_group: &[usize],
        group_count: usize,
    ) -> Result<usize, PartitionError> {
        let store = self.store;
        let scheme = &self.scheme;
        let io_pool = &self.io_pool;
        let inputs: Vec<(usize, String)> = chunk_keys.into_iter().enumerate().collect();

        let written_per_chunk: Vec<usize> = self.fabric.run(
            "scatter",
            inputs,
            self.config.task_memory_mb(),
            |(chunk_id, key)| {
                log::debug!("scattering chunk {key}");
                let records: Vec<P::Record> = decode_records(&store.get(&key)?)?;
                let keys = scheme.placement_keys(&records);

                let mut buckets: Vec<Vec<P::Record>> = vec![Vec::new(); group_count];
                for (record, key) in records.into_iter().zip(keys) {
                    let group = key
                        .and_then(|mz| bounds.range_index(mz))
                        .map(|fine| fine_to_group[fine]);
                    if let Some(group) = group {
                        buckets[group].push(record);
                    }
                }

                let written = io_pool.install(|| {
                    buckets
                        .into_par_iter()
                        .enumerate()
                        .filter(|(_, bucket)| !bucket.is_empty())
                        .map(|(group_id, bucket)| {
                            put_records(
                                store,
                                &interim_key(segments_prefix, group_id, chunk_id),
                                &bucket,
                            )
                        })
                        .collect::<Result<Vec<()>, StoreError>>()
                })?;
                Ok(written.len())
            },
        )?;
        Ok(written_per_chunk.iter().sum())
    }

    /// Step 3: assemble each coarse group and split it into final segments.
    fn merge(
        &self,
        segments_prefix: &str,
        bounds: &SegmentBounds,
        groups: &[Range<usize>],
    ) -> Result<Vec<usize>, PartitionError> {
        let store = self.store;
        let scheme = &self.scheme;
        let io_pool = &self.io_pool;
        let retry = self.config.read_retry;
        let inputs: Vec<(usize, Range<usize>)> = groups.iter().cloned().enumerate().collect();

        let lengths_per_group: Vec<Vec<usize>> = self.fabric.run(
            "merge",
            inputs,
            self.config.task_memory_mb(),
            |(group_id, span)| {
                log::debug!("merging coarse group {group_id}");
                let prefix = interim_prefix(segments_prefix, group_id);
                let keys = store.list(&prefix)?;

                let parts: Vec<Vec<P::Record>> = io_pool.install(|| {
                    keys.par_iter()
                        .map(|key| {
                            let bytes = get_with_retry(store, &retry, key)?;
                            Ok(decode_records(&bytes)?)
                        })
                        .collect::<Result<_, StoreError>>()
                })?;
                let mut records: Vec<P::Record> = parts.into_iter().flatten().collect();
                scheme.sort(&mut records);
                store.delete_prefix(&prefix)?;

                // Binary-search split of the sorted block against this
                // group's slice of the boundary list. Drops nothing: every
                // record here was routed by an in-domain placement key.
                let placement: Vec<f64> = scheme
                    .placement_keys(&records)
                    .into_iter()
                    .map(|k| k.unwrap_or(f64::MAX))
                    .collect();
                let base_id = span.start;
                let mut lengths = Vec::with_capacity(span.len());
                for local in 0..span.len() {
                    let (lower, upper) = bounds.range(base_id + local);
                    let start = placement.partition_point(|&k| k < lower);
                    let end = placement.partition_point(|&k| k < upper);
                    lengths.push(end - start);
                    if end > start {
                        let segment_id = base_id + local;
                        log::debug!("storing segment {segment_id}");
                        put_records(
                            store,
                            &object_key(segments_prefix, segment_id),
                            &records[start..end],
                        )?;
                    }
                }
                Ok(lengths)
            },
        )?;

        Ok(lengths_per_group.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::RayonFabric;
    use crate::model::MAX_MZ;
    use crate::store::{get_records, InMemoryStore, RetryPolicy};

    fn spectra_setup(
        store: &InMemoryStore,
        chunks: &[Vec<SpectrumRecord>],
    ) {
        for (i, chunk) in chunks.iter().enumerate() {
            put_records(store, &object_key("ds/chunks", i), chunk).unwrap();
        }
    }

    #[test]
    fn coarse_plan_splits_evenly() {
        // 1000 fine ranges at 50 per coarse group -> exactly 20 groups.
        let groups = plan_coarse_groups(1000, 5, 250);
        assert_eq!(groups.len(), 20);
        assert!(groups.iter().all(|g| g.len() == 50));
        assert_eq!(groups.first().unwrap().start, 0);
        assert_eq!(groups.last().unwrap().end, 1000);

        // Contiguity with uneven division.
        let groups = plan_coarse_groups(10, 5, 15);
        assert_eq!(groups.iter().map(|g| g.len()).sum::<usize>(), 10);
        for pair in groups.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn coarse_plan_floors_at_one_group() {
        assert_eq!(plan_coarse_groups(3, 5, 512), vec![0..3]);
        assert_eq!(plan_coarse_groups(0, 5, 512), vec![0..0]);
    }

    #[test]
    fn coarse_plan_never_exceeds_segment_count() {
        let groups = plan_coarse_groups(2, 500, 1);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn spectra_partition_is_complete_and_disjoint() {
        let store = InMemoryStore::new();
        let fabric = RayonFabric::with_workers(4).unwrap();
        let config = SegmentationConfig::small_dataset();

        // Two unsorted-across chunks, sorted within.
        let mut a: Vec<SpectrumRecord> = (0..500)
            .map(|i| SpectrumRecord::new(0, (i * 7 % 1000) as f64, i as f32))
            .collect();
        let mut b: Vec<SpectrumRecord> = (0..500)
            .map(|i| SpectrumRecord::new(1, (i * 13 % 1000) as f64 + 0.5, i as f32))
            .collect();
        sort_by_mz(&mut a);
        sort_by_mz(&mut b);
        spectra_setup(&store, &[a.clone(), b.clone()]);

        let bounds =
            SegmentBounds::from_quantile_cuts(vec![0.0, 250.0, 500.0, 750.0, MAX_MZ]);
        let partitioner =
            RangePartitioner::new(&store, &fabric, &config, SpectrumScheme).unwrap();
        let outcome = partitioner
            .partition("ds/chunks", "ds/segments", &bounds, 1)
            .unwrap();

        assert_eq!(outcome.segment_count, 4);
        assert_eq!(outcome.chunks_read, 2);
        assert_eq!(outcome.segment_lengths.iter().sum::<usize>(), 1000);

        // Interim objects are gone.
        assert!(store.list("ds/segments/chunk/").unwrap().is_empty());

        // Each segment is sorted and within its range; the union is the
        // input set.
        let mut seen = 0;
        for id in 0..4 {
            let (lower, upper) = bounds.range(id);
            let segment: Vec<SpectrumRecord> =
                get_records(&store, &RetryPolicy::none(), &object_key("ds/segments", id))
                    .unwrap();
            assert_eq!(segment.len(), outcome.segment_lengths[id]);
            assert!(segment.windows(2).all(|w| w[0].mz <= w[1].mz));
            assert!(segment.iter().all(|r| r.mz >= lower && r.mz < upper));
            seen += segment.len();
        }
        assert_eq!(seen, 1000);
    }

    #[test]
    fn key_on_cut_point_goes_to_upper_segment() {
        let store = InMemoryStore::new();
        let fabric = RayonFabric::with_workers(2).unwrap();
        let config = SegmentationConfig::small_dataset();
        spectra_setup(
            &store,
            &[vec![
                SpectrumRecord::new(0, 499.999, 1.0),
                SpectrumRecord::new(0, 500.0, 2.0),
            ]],
        );

        let bounds = SegmentBounds::from_quantile_cuts(vec![0.0, 500.0, MAX_MZ]);
        let partitioner =
            RangePartitioner::new(&store, &fabric, &config, SpectrumScheme).unwrap();
        let outcome = partitioner
            .partition("ds/chunks", "ds/segments", &bounds, 1)
            .unwrap();
        assert_eq!(outcome.segment_lengths, vec![1, 1]);

        let upper: Vec<SpectrumRecord> =
            get_records(&store, &RetryPolicy::none(), "ds/segments/1").unwrap();
        assert_eq!(upper[0].mz, 500.0);
    }

    #[test]
    fn out_of_domain_records_are_excluded() {
        let store = InMemoryStore::new();
        let fabric = RayonFabric::with_workers(2).unwrap();
        let config = SegmentationConfig::small_dataset();
        spectra_setup(
            &store,
            &[vec![
                SpectrumRecord::new(0, -1.0, 1.0),
                SpectrumRecord::new(0, 100.0, 1.0),
                SpectrumRecord::new(0, MAX_MZ, 1.0),
                SpectrumRecord::new(0, MAX_MZ + 5.0, 1.0),
            ]],
        );

        let bounds = SegmentBounds::whole_domain();
        let partitioner =
            RangePartitioner::new(&store, &fabric, &config, SpectrumScheme).unwrap();
        let outcome = partitioner
            .partition("ds/chunks", "ds/segments", &bounds, 1)
            .unwrap();
        assert_eq!(outcome.segment_lengths, vec![1]);
    }

    #[test]
    fn empty_fine_ranges_occupy_ids_without_objects() {
        let store = InMemoryStore::new();
        let fabric = RayonFabric::with_workers(2).unwrap();
        let config = SegmentationConfig::small_dataset();
        spectra_setup(&store, &[vec![SpectrumRecord::new(0, 600.0, 1.0)]]);

        let bounds =
            SegmentBounds::from_quantile_cuts(vec![0.0, 100.0, 200.0, 500.0, MAX_MZ]);
        let partitioner =
            RangePartitioner::new(&store, &fabric, &config, SpectrumScheme).unwrap();
        let outcome = partitioner
            .partition("ds/chunks", "ds/segments", &bounds, 1)
            .unwrap();
        assert_eq!(outcome.segment_lengths, vec![0, 0, 0, 1]);
        assert_eq!(store.list("ds/segments/").unwrap(), vec!["ds/segments/3"]);
    }

    #[test]
    fn centroid_envelopes_follow_their_anchor() {
        let store = InMemoryStore::new();
        let fabric = RayonFabric::with_workers(2).unwrap();
        let config = SegmentationConfig::small_dataset();

        // Formula 1 anchors at 199.9 with a secondary peak at 201.0, which
        // would cross the 200.0 cut on its own m/z.
        put_records(
            &store,
            "db/clipped/0",
            &[
                CentroidRecord::new(1, 0, 199.9, 1.0),
                CentroidRecord::new(1, 1, 201.0, 0.3),
                CentroidRecord::new(2, 0, 300.0, 1.0),
                CentroidRecord::new(2, 1, 301.0, 0.2),
            ],
        )
        .unwrap();

        let bounds = SegmentBounds::from_quantile_cuts(vec![0.0, 200.0, MAX_MZ]);
        let partitioner =
            RangePartitioner::new(&store, &fabric, &config, CentroidScheme).unwrap();
        let outcome = partitioner
            .partition("db/clipped", "db/segments", &bounds, 1)
            .unwrap();
        assert_eq!(outcome.segment_lengths, vec![2, 2]);

        let lower: Vec<CentroidRecord> =
            get_records(&store, &RetryPolicy::none(), "db/segments/0").unwrap();
        assert!(lower.iter().all(|r| r.formula_id == 1));
        // Envelope order: anchor first, peaks adjacent.
        assert_eq!(lower[0].peak_index, 0);
        assert_eq!(lower[1].peak_index, 1);
    }

    #[test]
    fn anchorless_centroid_peaks_are_dropped() {
        let store = InMemoryStore::new();
        let fabric = RayonFabric::with_workers(2).unwrap();
        let config = SegmentationConfig::small_dataset();
        put_records(
            &store,
            "db/clipped/0",
            &[
                CentroidRecord::new(5, 1, 150.0, 0.4),
                CentroidRecord::new(6, 0, 160.0, 1.0),
            ],
        )
        .unwrap();

        let bounds = SegmentBounds::whole_domain();
        let partitioner =
            RangePartitioner::new(&store, &fabric, &config, CentroidScheme).unwrap();
        let outcome = partitioner
            .partition("db/clipped", "db/segments", &bounds, 1)
            .unwrap();
        assert_eq!(outcome.segment_lengths, vec![1]);
    }

    #[test]
    fn segment_contents_are_deterministic_across_runs() {
        let config = SegmentationConfig::small_dataset();
        let chunks: Vec<Vec<SpectrumRecord>> = (0..4)
            .map(|c| {
                let mut chunk: Vec<SpectrumRecord> = (0..200)
                    .map(|i| SpectrumRecord::new(c, ((i * 37 + c as usize * 11) % 997) as f64, i as f32))
                    .collect();
                sort_by_mz(&mut chunk);
                chunk
            })
            .collect();
        let bounds = SegmentBounds::from_quantile_cuts(vec![0.0, 97.0, 300.0, 700.0, MAX_MZ]);

        let run = |workers: usize| -> Vec<Vec<u8>> {
            let store = InMemoryStore::new();
            let fabric = RayonFabric::with_workers(workers).unwrap();
            spectra_setup(&store, &chunks);
            let partitioner =
                RangePartitioner::new(&store, &fabric, &config, SpectrumScheme).unwrap();
            let outcome = partitioner
                .partition("ds/chunks", "ds/segments", &bounds, 1)
                .unwrap();
            (0..outcome.segment_count)
                .map(|id| store.get(&object_key("ds/segments", id)).unwrap_or_default())
                .collect()
        };

        // Different worker counts change scheduling order, not output.
        assert_eq!(run(1), run(8));
    }
}
