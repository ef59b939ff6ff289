//! # mzSegment - Range Partitioning for MSI Annotation Pipelines
//!
//! `mzsegment` is the partitioning core of a mass-spectrometry-imaging
//! annotation pipeline: it range-partitions a dataset of raw spectral
//! measurements too large for one worker's memory, and a separately
//! produced dataset of candidate annotation peaks sharing the same m/z key
//! domain, into aligned, ordered, memory-bounded segments in a shared
//! object store. A downstream per-segment scoring stage (out of scope)
//! joins the two segmentations by overlapping key range and scores them
//! independently and in parallel.
//!
//! ## Key Properties
//!
//! - **Completeness & disjointness**: every in-domain input record appears
//!   in exactly one final segment.
//! - **Deterministic identity**: segment ids come from static boundary
//!   prefix sums, so identical inputs, boundaries, and budgets produce
//!   byte-identical segments regardless of task scheduling order.
//! - **Bounded memory**: the two-level scatter/merge hierarchy caps
//!   per-task memory at one coarse group, independent of segment count and
//!   total volume.
//! - **Group preservation**: every isotope peak of a candidate formula
//!   lands in the same segment as the formula's anchor peak.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mzsegment::config::SegmentationConfig;
//! use mzsegment::fabric::RayonFabric;
//! use mzsegment::pipeline::JobContext;
//! use mzsegment::store::InMemoryStore;
//! # use mzsegment::chunk::{SpectraSource, PixelCoord};
//! # struct MySource;
//! # impl SpectraSource for MySource {
//! #     fn coordinates(&self) -> &[PixelCoord] { &[] }
//! #     fn spectrum(&self, _: usize) -> Result<(Vec<f64>, Vec<f32>), anyhow::Error> {
//! #         Ok((vec![], vec![]))
//! #     }
//! #     fn element_width(&self) -> usize { 8 }
//! # }
//!
//! let store = InMemoryStore::new();
//! let fabric = RayonFabric::new()?;
//! let mut job = JobContext::new(&store, &fabric, SegmentationConfig::default());
//!
//! // Spectra side: ingest -> estimate bounds -> partition.
//! let spectra = job.segment_spectra(&MySource)?;
//! println!("{} dataset segments", spectra.segment_count());
//!
//! // Centroid side: clip -> estimate bounds -> partition.
//! let centroids = job.segment_centroids(&spectra)?;
//! println!("{} centroid segments", centroids.segment_count());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! ```text
//! spectra source ──▶ chunk ──▶ boundary ──▶ partition ──▶ {prefix}/{segment_id}
//!                                 ▲               │
//! centroid chunks ─▶ clip ────────┘               └── interim: {prefix}/chunk/{group}/{chunk}
//! ```
//!
//! - [`store`]: object-store trait, key conventions, retrying reads
//! - [`fabric`]: parallel-map execution fabric with stage barriers
//! - [`model`]: typed records and the blob codec
//! - [`chunk`]: memory-bounded spectra ingestion
//! - [`boundary`]: sample-based quantile boundary estimation
//! - [`clip`]: formula-level centroid clipping
//! - [`isotopes`]: injected isotope capability, centroid chunk building
//! - [`partition`]: the generic two-level scatter/merge engine
//! - [`stats`]: per-stage telemetry ledger
//! - [`pipeline`]: job context and end-to-end orchestration
//!
//! All entities are transient and job-scoped: ingestion chunks and interim
//! scatter objects are explicitly deleted once consumed, and no store-side
//! expiry is relied upon.

// Documentation lints - enforce complete documentation for publication
#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]

pub mod boundary;
pub mod chunk;
pub mod clip;
pub mod config;
pub mod fabric;
pub mod isotopes;
pub mod model;
pub mod partition;
pub mod pipeline;
pub mod stats;
pub mod store;

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::boundary::{
        estimate_centroid_bounds, estimate_spectra_bounds, SegmentBounds, SpectraBoundsEstimate,
    };
    pub use crate::chunk::{IngestStats, PixelCoord, SpectraChunker, SpectraSource};
    pub use crate::clip::{clip_centroid_chunks, ClipStats};
    pub use crate::config::SegmentationConfig;
    pub use crate::fabric::{ExecutionFabric, FabricError, RayonFabric};
    pub use crate::isotopes::{build_centroid_chunks, IsotopePeakSource};
    pub use crate::model::{CentroidRecord, SpectrumRecord, MAX_MZ};
    pub use crate::partition::{
        plan_coarse_groups, CentroidScheme, PartitionOutcome, PartitionScheme, RangePartitioner,
        SpectrumScheme,
    };
    pub use crate::pipeline::{CentroidSegments, JobContext, JobKeys, SpectraSegments};
    pub use crate::stats::{JobStats, StageStats};
    pub use crate::store::{
        get_with_retry, InMemoryStore, LocalDirStore, ObjectStore, RetryPolicy, StoreError,
    };
}
