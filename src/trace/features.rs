//! Feature extraction: maps consensus trace segments back onto each
//! contributing sample's own trace.
//!
//! Segment edges are translated through the per-sample scan-point
//! interpolator and clamped to the sample trace. The consensus apex position
//! is never trusted as exact; the true local apex is re-located inside the
//! mapped window on the sample's raw intensities.

use serde::{Deserialize, Serialize};

use crate::align::moi::Confidence;
use crate::trace::segmentation::{
    detect_segments, resolve_overlaps, SegmentationConfig, Trace, TraceSegment,
};

/// Per-sample mapping between that sample's native scan indices and the
/// consensus scan-index axis. Implemented by external sample storage.
pub trait ScanPointInterpolator {
    /// Largest sample scan index at or below the given consensus index.
    fn lower_idx(&self, consensus_idx: usize) -> usize;
    /// Smallest sample scan index at or above the given consensus index.
    fn upper_idx(&self, consensus_idx: usize) -> usize;
    /// Sample trace intensity projected onto a consensus scan index.
    fn interpolate_intensity(&self, trace: &dyn Trace, consensus_idx: usize) -> f64;
}

/// One contributing sample of an [`AlignedFeature`], with everything needed
/// to map consensus segments into its scan space.
pub struct FeatureSample<'a> {
    pub sample_idx: i32,
    /// Handle of the sample's raw trace in external trace storage.
    pub trace_id: i64,
    pub trace: &'a dyn Trace,
    pub interpolator: &'a dyn ScanPointInterpolator,
    /// Intensity normalization factor, computed by the external normalizer.
    pub normalization_factor: f64,
}

/// One sample's share of a feature, in that sample's own scan space.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SampleContribution {
    pub sample_idx: i32,
    pub trace_id: i64,
    /// Segment over the sample's native scan indices, apex re-located.
    pub segment: TraceSegment,
    /// Raw intensity at the re-located apex.
    pub apex_intensity: f64,
    /// Sample intensity projected onto the consensus apex scan.
    pub projected_apex_intensity: f64,
    /// Raw intensity integrated over the segment (trapezoid over RT).
    pub area: f64,
    pub normalization_factor: f64,
}

/// Output record for one consensus segment: consensus coordinates plus the
/// per-sample boundaries resolved onto each contributing trace.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AlignedFeature {
    pub mass: f64,
    pub apex_rt: f64,
    /// Segment over consensus scan indices.
    pub segment: TraceSegment,
    pub contributions: Vec<SampleContribution>,
    /// Isotope group members, by storage uid.
    pub isotope_uids: Vec<u64>,
    pub quality: Confidence,
}

/// Segment the merged trace and resolve every retained segment onto the
/// contributing samples.
///
/// Samples whose mapped window is empty for a segment contribute no entry
/// for that feature. A merged trace without significant segments yields an
/// empty list.
pub fn extract_features(
    config: &SegmentationConfig,
    merged: &dyn Trace,
    isotope_uids: &[u64],
    quality: Confidence,
    samples: &[FeatureSample<'_>],
    noise_level: &dyn Fn(usize) -> f64,
) -> Vec<AlignedFeature> {
    let segments = detect_segments(config, merged, noise_level);
    if segments.is_empty() {
        return Vec::new();
    }

    // per-sample child segments, indexed [sample][segment]
    let child_segments: Vec<Vec<Option<TraceSegment>>> = samples
        .iter()
        .map(|sample| assign_segments_to_sample(sample, &segments))
        .collect();

    segments
        .iter()
        .enumerate()
        .map(|(k, &segment)| {
            let contributions = samples
                .iter()
                .zip(child_segments.iter())
                .filter_map(|(sample, children)| {
                    children[k].map(|child| contribution(sample, child, segment.apex))
                })
                .collect();
            AlignedFeature {
                mass: merged.averaged_mass(),
                apex_rt: merged.retention_time(segment.apex),
                segment,
                contributions,
                isotope_uids: isotope_uids.to_vec(),
                quality,
            }
        })
        .collect()
}

/// Map consensus segments into one sample's scan space. Entries are `None`
/// where the mapped window misses the sample trace entirely.
fn assign_segments_to_sample(
    sample: &FeatureSample<'_>,
    merged_segments: &[TraceSegment],
) -> Vec<Option<TraceSegment>> {
    let trace = sample.trace;
    let mut children: Vec<Option<TraceSegment>> = merged_segments
        .iter()
        .map(|seg| {
            let a = trace.start_idx().max(sample.interpolator.lower_idx(seg.left));
            let b = trace.end_idx().min(sample.interpolator.upper_idx(seg.right));
            if b < a {
                return None;
            }
            let mut apex = a;
            for j in a..=b {
                if trace.intensity(j) > trace.intensity(apex) {
                    apex = j;
                }
            }
            Some(TraceSegment { apex, left: a, right: b })
        })
        .collect();

    let mut resolved: Vec<TraceSegment> = children.iter().flatten().copied().collect();
    resolve_overlaps(&mut resolved);
    let mut it = resolved.into_iter();
    for child in children.iter_mut() {
        if let Some(slot) = child.as_mut() {
            if let Some(seg) = it.next() {
                *slot = seg;
            }
        }
    }
    children
}

fn contribution(
    sample: &FeatureSample<'_>,
    child: TraceSegment,
    consensus_apex: usize,
) -> SampleContribution {
    let trace = sample.trace;
    let mut area = 0.0;
    for j in child.left..child.right {
        let dt = trace.retention_time(j + 1) - trace.retention_time(j);
        area += 0.5 * (trace.intensity(j) + trace.intensity(j + 1)) * dt;
    }
    SampleContribution {
        sample_idx: sample.sample_idx,
        trace_id: sample.trace_id,
        segment: child,
        apex_intensity: trace.intensity(child.apex),
        projected_apex_intensity: sample
            .interpolator
            .interpolate_intensity(trace, consensus_apex),
        area,
        normalization_factor: sample.normalization_factor,
    }
}
