//! # Spectra Ingestion Chunker
//!
//! Converts raw per-pixel spectra into memory-bounded, locally m/z-sorted
//! chunks in the object store — the input format of the range partitioner.
//!
//! Accumulation is sequential and order-sensitive: spectra are streamed in
//! source order, and a chunk is emitted as soon as the estimated byte
//! footprint (2 × mz-array-bytes + intensity-bytes) exceeds the configured
//! budget, with a final partial chunk flushed at end of input. Sorting,
//! encoding, and uploading of emitted chunks happen on background uploader
//! threads fed through a bounded channel, so the next chunk accumulates
//! while earlier ones are still in flight:
//!
//! ```text
//! ┌──────────────┐    bounded channel     ┌──────────────────┐
//! │ accumulator  │ ──(id, records)──────▶ │ uploader threads │──▶ store
//! │ (source ord) │ ◀───first-error slot── │ (sort + encode)  │
//! └──────────────┘                        └──────────────────┘
//! ```
//!
//! Errors on the uploader side are surfaced fail-fast through a shared
//! error slot checked before every send.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crossbeam_channel::bounded;

use crate::config::SegmentationConfig;
use crate::model::{sort_by_mz, SpectrumRecord};
use crate::store::{object_key, put_records, ObjectStore, StoreError};

/// Opaque error produced by an external spectra source.
pub type SourceError = anyhow::Error;

/// Pixel coordinate of one spectrum, in instrument order.
pub type PixelCoord = (u32, u32);

/// External source of raw spectra (instrument-file parsing is out of
/// scope; implementations wrap whatever parser produced the data).
pub trait SpectraSource: Send + Sync {
    /// Pixel coordinates, one per spectrum, in source order.
    fn coordinates(&self) -> &[PixelCoord];

    /// The `index`-th spectrum's parallel (mz, intensity) arrays.
    fn spectrum(&self, index: usize) -> Result<(Vec<f64>, Vec<f32>), SourceError>;

    /// Width in bytes of the source's numeric elements (4 or 8), consumed
    /// by the byte-volume heuristics.
    fn element_width(&self) -> usize;
}

/// Map pixel coordinates to stable per-spectrum indices.
///
/// Coordinates are normalized to the grid's minimum corner and flattened
/// row-major (`y * ncols + x`), so the index of a pixel is independent of
/// the order the instrument visited it in.
pub fn pixel_indices(coordinates: &[PixelCoord]) -> Vec<u32> {
    if coordinates.is_empty() {
        return Vec::new();
    }
    let min_x = coordinates.iter().map(|&(x, _)| x).min().unwrap_or(0);
    let min_y = coordinates.iter().map(|&(_, y)| y).min().unwrap_or(0);
    let ncols = coordinates
        .iter()
        .map(|&(x, _)| x - min_x)
        .max()
        .unwrap_or(0)
        + 1;
    coordinates
        .iter()
        .map(|&(x, y)| (y - min_y) * ncols + (x - min_x))
        .collect()
}

/// Errors raised during spectra ingestion.
#[derive(Debug, thiserror::Error)]
pub enum ChunkerError {
    /// The spectra source failed.
    #[error("spectra source error: {0}")]
    Source(#[from] SourceError),

    /// A chunk failed to encode or upload.
    #[error("chunk upload failed: {0}")]
    Upload(String),
}

/// Statistics from one ingestion run.
#[derive(Debug, Clone)]
pub struct IngestStats {
    /// Number of chunks written to the store.
    pub chunks_written: usize,
    /// Total records across all chunks.
    pub records_written: usize,
    /// Number of spectra consumed from the source.
    pub spectra_read: usize,
}

/// Memory-bounded spectra chunker writing under a fixed key prefix.
pub struct SpectraChunker<'a> {
    config: &'a SegmentationConfig,
    prefix: &'a str,
}

impl<'a> SpectraChunker<'a> {
    /// Chunker writing chunks under `{prefix}/{id}`.
    pub fn new(config: &'a SegmentationConfig, prefix: &'a str) -> Self {
        Self { config, prefix }
    }

    /// Stream `source` into sorted chunks in `store`.
    pub fn ingest<S: SpectraSource>(
        &self,
        source: &S,
        store: &dyn ObjectStore,
    ) -> Result<IngestStats, ChunkerError> {
        let coordinates = source.coordinates();
        let sp_indices = pixel_indices(coordinates);
        let width = source.element_width();

        let (sender, receiver) = bounded::<(usize, Vec<SpectrumRecord>)>(
            self.config.upload_queue_capacity.max(1),
        );
        let first_error: Mutex<Option<String>> = Mutex::new(None);
        let records_written = AtomicUsize::new(0);
        let mut stats = IngestStats {
            chunks_written: 0,
            records_written: 0,
            spectra_read: 0,
        };

        std::thread::scope(|scope| -> Result<(), ChunkerError> {
            for _ in 0..self.config.upload_workers.max(1) {
                let receiver = receiver.clone();
                let first_error = &first_error;
                let records_written = &records_written;
                let prefix = self.prefix;
                scope.spawn(move || {
                    for (chunk_id, mut records) in receiver.iter() {
                        if first_error.lock().unwrap_or_else(|e| e.into_inner()).is_some() {
                            continue;
                        }
                        sort_by_mz(&mut records);
                        log::info!(
                            "uploading spectra chunk {chunk_id}: {} records",
                            records.len()
                        );
                        match upload_chunk(store, prefix, chunk_id, &records) {
                            Ok(()) => {
                                records_written.fetch_add(records.len(), Ordering::Relaxed);
                                log::debug!("spectra chunk {chunk_id} finished");
                            }
                            Err(err) => {
                                let mut slot =
                                    first_error.lock().unwrap_or_else(|e| e.into_inner());
                                slot.get_or_insert(err.to_string());
                            }
                        }
                    }
                });
            }
            drop(receiver);

            let mut pending: Vec<SpectrumRecord> = Vec::new();
            let mut estimated_bytes = 0usize;
            let mut next_chunk_id = 0usize;

            for (i, _) in coordinates.iter().enumerate() {
                let (mzs, intensities) = source.spectrum(i)?;
                let sp_index = sp_indices[i];
                estimated_bytes += mzs.len() * 2 * width + intensities.len() * width;
                pending.extend(
                    mzs.iter()
                        .zip(intensities.iter())
                        .map(|(&mz, &intensity)| SpectrumRecord::new(sp_index, mz, intensity)),
                );
                stats.spectra_read += 1;

                if estimated_bytes > self.config.chunk_max_bytes {
                    self.send_chunk(&sender, &first_error, next_chunk_id, std::mem::take(&mut pending))?;
                    next_chunk_id += 1;
                    estimated_bytes = 0;
                }
            }
            if !pending.is_empty() {
                self.send_chunk(&sender, &first_error, next_chunk_id, pending)?;
                next_chunk_id += 1;
            }
            stats.chunks_written = next_chunk_id;
            drop(sender);
            Ok(())
        })?;

        if let Some(err) = first_error.into_inner().unwrap_or_else(|e| e.into_inner()) {
            return Err(ChunkerError::Upload(err));
        }
        stats.records_written = records_written.into_inner();
        log::info!(
            "parsed dataset into {} chunks ({} records)",
            stats.chunks_written,
            stats.records_written
        );
        Ok(stats)
    }

    fn send_chunk(
        &self,
        sender: &crossbeam_channel::Sender<(usize, Vec<SpectrumRecord>)>,
        first_error: &Mutex<Option<String>>,
        chunk_id: usize,
        records: Vec<SpectrumRecord>,
    ) -> Result<(), ChunkerError> {
        // Fail fast if an uploader already errored.
        if let Some(err) = first_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return Err(ChunkerError::Upload(err));
        }
        sender
            .send((chunk_id, records))
            .map_err(|_| ChunkerError::Upload("uploader threads exited unexpectedly".to_string()))
    }
}

fn upload_chunk(
    store: &dyn ObjectStore,
    prefix: &str,
    chunk_id: usize,
    records: &[SpectrumRecord],
) -> Result<(), StoreError> {
    put_records(store, &object_key(prefix, chunk_id), records)
}
