//! # Typed Record Model
//!
//! Fixed-field record types shared by every stage of the partitioning
//! pipeline, plus the binary codec used for every blob that crosses the
//! object-store boundary (ingestion chunks, interim scatter objects, and
//! final segments).
//!
//! Records are deliberately plain `Copy` structs: a chunk is a `Vec` of
//! records, and sorting/splitting a chunk never needs column bookkeeping.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Upper bound of the m/z key domain.
///
/// Every record with `mz` in `[0, MAX_MZ)` maps to exactly one segment;
/// records outside the domain are excluded from partitioning by definition.
/// No real instrument produces m/z values anywhere near this ceiling, but
/// whether upstream data can ever legitimately exceed it is unresolved, so
/// the exclusion is pinned by tests rather than silently clamped.
pub const MAX_MZ: f64 = 1e5;

/// One measured peak of one pixel's spectrum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpectrumRecord {
    /// Stable per-pixel spectrum index (from the pixel coordinate map).
    pub spectrum_index: u32,
    /// Mass-to-charge ratio, the partition key.
    pub mz: f64,
    /// Signal intensity.
    pub intensity: f32,
}

impl SpectrumRecord {
    /// Create a record.
    pub fn new(spectrum_index: u32, mz: f64, intensity: f32) -> Self {
        Self {
            spectrum_index,
            mz,
            intensity,
        }
    }
}

/// One theoretical isotope peak of one candidate formula/adduct.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CentroidRecord {
    /// Stable id of the owning formula/adduct combination.
    pub formula_id: u32,
    /// Position of this peak in the formula's isotope envelope; `0` marks
    /// the anchor peak that decides clipping and segment placement.
    pub peak_index: u32,
    /// Mass-to-charge ratio of the peak.
    pub mz: f64,
    /// Predicted relative intensity.
    pub intensity: f32,
}

impl CentroidRecord {
    /// Create a record.
    pub fn new(formula_id: u32, peak_index: u32, mz: f64, intensity: f32) -> Self {
        Self {
            formula_id,
            peak_index,
            mz,
            intensity,
        }
    }

    /// Whether this is the anchor (monoisotopic) peak of its envelope.
    pub fn is_anchor(&self) -> bool {
        self.peak_index == 0
    }
}

/// Access to the m/z partition key, shared by both record types.
pub trait MzKeyed {
    /// The record's own m/z value.
    fn mz(&self) -> f64;
}

impl MzKeyed for SpectrumRecord {
    fn mz(&self) -> f64 {
        self.mz
    }
}

impl MzKeyed for CentroidRecord {
    fn mz(&self) -> f64 {
        self.mz
    }
}

/// Sort records in place by ascending m/z.
///
/// NaN keys sort last; they are out of domain and dropped at scatter time.
pub fn sort_by_mz<R: MzKeyed>(records: &mut [R]) {
    records.sort_by(|a, b| a.mz().total_cmp(&b.mz()));
}

/// Encode a record slice into the store blob format.
pub fn encode_records<R: Serialize>(records: &[R]) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(records)
}

/// Decode a store blob back into records.
pub fn decode_records<R: DeserializeOwned>(bytes: &[u8]) -> Result<Vec<R>, bincode::Error> {
    bincode::deserialize(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spectrum_blob_roundtrip() {
        let records = vec![
            SpectrumRecord::new(0, 100.5, 1e4),
            SpectrumRecord::new(1, 99.9, 2e4),
        ];
        let bytes = encode_records(&records).unwrap();
        let decoded: Vec<SpectrumRecord> = decode_records(&bytes).unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn sort_by_mz_orders_records() {
        let mut records = vec![
            SpectrumRecord::new(0, 300.0, 1.0),
            SpectrumRecord::new(1, 100.0, 2.0),
            SpectrumRecord::new(2, 200.0, 3.0),
        ];
        sort_by_mz(&mut records);
        let mzs: Vec<f64> = records.iter().map(|r| r.mz).collect();
        assert_eq!(mzs, vec![100.0, 200.0, 300.0]);
    }

    #[test]
    fn anchor_detection() {
        assert!(CentroidRecord::new(7, 0, 150.0, 1.0).is_anchor());
        assert!(!CentroidRecord::new(7, 3, 154.0, 0.1).is_anchor());
    }
}
