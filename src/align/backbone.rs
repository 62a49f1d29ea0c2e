//! Consensus axis, per-sample corrections and global alignment statistics.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::align::recalibrate::SampleRecalibration;

/// Mass deviation with a relative (ppm) and an absolute component, matching
/// how instrument accuracy behaves across the mass range.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MassDeviation {
    pub ppm: f64,
    pub absolute: f64,
}

impl MassDeviation {
    pub fn new(ppm: f64, absolute: f64) -> Self {
        MassDeviation { ppm, absolute }
    }

    /// Absolute tolerance at the given mass.
    pub fn absolute_for(&self, mass: f64) -> f64 {
        (self.ppm * 1e-6 * mass).max(self.absolute)
    }
}

/// Global statistics over all samples in one alignment run. Built once before
/// alignment; the expected deviations are refined after each recalibration
/// barrier.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AlignmentStatistics {
    pub min_mass: f64,
    pub max_mass: f64,
    pub min_rt: f64,
    pub max_rt: f64,
    pub expected_mass_deviation: MassDeviation,
    pub expected_rt_deviation: f64,
    /// Longest per-sample scan axis; sizes the consensus axis.
    pub max_mapping_len: usize,
}

/// Monotonic retention-time axis: `(retention time, scan index)` pairs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanPointMapping {
    rts: Vec<f64>,
    scan_ids: Vec<usize>,
}

impl ScanPointMapping {
    /// Build from explicit axis points. Panics if retention times are not
    /// strictly increasing; a non-monotonic axis is a programming error.
    pub fn new(rts: Vec<f64>, scan_ids: Vec<usize>) -> Self {
        assert_eq!(rts.len(), scan_ids.len());
        assert!(
            rts.windows(2).all(|w| w[0] < w[1]),
            "scan-point mapping must be strictly increasing in retention time"
        );
        ScanPointMapping { rts, scan_ids }
    }

    /// Uniform axis with `len` points spanning `[min_rt, max_rt]`.
    pub fn uniform(min_rt: f64, max_rt: f64, len: usize) -> Self {
        assert!(len >= 2, "mapping needs at least two scan points");
        assert!(max_rt > min_rt);
        let step = (max_rt - min_rt) / (len - 1) as f64;
        let rts: Vec<f64> = (0..len).map(|k| min_rt + step * k as f64).collect();
        let scan_ids: Vec<usize> = (0..len).collect();
        ScanPointMapping { rts, scan_ids }
    }

    pub fn len(&self) -> usize {
        self.rts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rts.is_empty()
    }

    /// Retention time at a scan index.
    pub fn rt_at(&self, idx: usize) -> f64 {
        self.rts[idx]
    }

    pub fn scan_id_at(&self, idx: usize) -> usize {
        self.scan_ids[idx]
    }

    /// Index of the scan point closest to `rt`, clamped to the axis.
    pub fn idx_for_rt(&self, rt: f64) -> usize {
        let upper = self.rts.partition_point(|&r| r < rt);
        if upper == 0 {
            return 0;
        }
        if upper >= self.rts.len() {
            return self.rts.len() - 1;
        }
        if (rt - self.rts[upper - 1]) <= (self.rts[upper] - rt) {
            upper - 1
        } else {
            upper
        }
    }

    pub fn min_rt(&self) -> f64 {
        self.rts[0]
    }

    pub fn max_rt(&self) -> f64 {
        self.rts[self.rts.len() - 1]
    }
}

/// The alignment backbone: consensus scan axis, one correction pair per
/// sample, the refined statistics and the frozen anchor uids. Immutable once
/// returned by the orchestrator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AlignmentBackbone {
    pub mapping: ScanPointMapping,
    /// Per-sample corrections, keyed by sample index.
    pub recalibrations: FxHashMap<i32, SampleRecalibration>,
    pub statistics: AlignmentStatistics,
    /// Uids of the frozen backbone anchors in the consensus store.
    pub anchor_uids: Vec<u64>,
    /// Mean absolute RT residual over all samples, for diagnostics.
    pub average_rt_residual: f64,
}

impl AlignmentBackbone {
    /// The correction pair for a sample; identity if the sample had too few
    /// calibration points.
    pub fn recalibration_for(&self, sample_idx: i32) -> SampleRecalibration {
        self.recalibrations
            .get(&sample_idx)
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of backbone anchors.
    pub fn anchor_count(&self) -> usize {
        self.anchor_uids.len()
    }
}
