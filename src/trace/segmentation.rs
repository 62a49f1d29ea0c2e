//! Persistence-based segmentation of merged intensity traces.
//!
//! Local maxima are tracked through a descending intensity sweep; a maximum's
//! persistence is its height above the saddle connecting it to a higher
//! maximum. Maxima that do not persist above the local noise level are folded
//! into their neighbours, everything else becomes a segment with watershed
//! boundaries.

use serde::{Deserialize, Serialize};

/// Intensity-over-scan-index series, the shape shared by merged consensus
/// traces and per-sample raw traces. Implemented by external trace storage;
/// [`MergedTrace`] is the owned in-memory form.
pub trait Trace {
    /// First valid scan index (inclusive).
    fn start_idx(&self) -> usize;
    /// Last valid scan index (inclusive).
    fn end_idx(&self) -> usize;
    fn intensity(&self, idx: usize) -> f64;
    fn retention_time(&self, idx: usize) -> f64;
    fn averaged_mass(&self) -> f64;

    fn len(&self) -> usize {
        self.end_idx() - self.start_idx() + 1
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Scan index of the highest intensity.
    fn apex_idx(&self) -> usize {
        let mut apex = self.start_idx();
        for idx in self.start_idx()..=self.end_idx() {
            if self.intensity(idx) > self.intensity(apex) {
                apex = idx;
            }
        }
        apex
    }
}

/// Owned trace backed by vectors, offset into the consensus scan axis.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MergedTrace {
    pub offset: usize,
    pub intensities: Vec<f64>,
    pub retention_times: Vec<f64>,
    pub mass: f64,
}

impl MergedTrace {
    pub fn new(offset: usize, intensities: Vec<f64>, retention_times: Vec<f64>, mass: f64) -> Self {
        assert_eq!(intensities.len(), retention_times.len());
        assert!(!intensities.is_empty());
        MergedTrace {
            offset,
            intensities,
            retention_times,
            mass,
        }
    }
}

impl Trace for MergedTrace {
    fn start_idx(&self) -> usize {
        self.offset
    }

    fn end_idx(&self) -> usize {
        self.offset + self.intensities.len() - 1
    }

    fn intensity(&self, idx: usize) -> f64 {
        self.intensities[idx - self.offset]
    }

    fn retention_time(&self, idx: usize) -> f64 {
        self.retention_times[idx - self.offset]
    }

    fn averaged_mass(&self) -> f64 {
        self.mass
    }
}

/// One detected peak segment over consensus scan indices.
/// Invariant: `left <= apex <= right`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceSegment {
    pub apex: usize,
    pub left: usize,
    pub right: usize,
}

/// Optional smoothing applied before extrema tracking. Tagged variants
/// selected by configuration; all feed the same persistence detector.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Smoothing {
    NoSmoothing,
    /// Gaussian kernel with the given sigma, in scan units.
    Gaussian { sigma: f64 },
    /// Five-point quadratic Savitzky-Golay filter.
    SavitzkyGolay,
    /// Mexican-hat wavelet response at the given scale, in scan units.
    Wavelet { scale: f64 },
}

impl Smoothing {
    pub fn apply(&self, values: &[f64]) -> Vec<f64> {
        match *self {
            Smoothing::NoSmoothing => values.to_vec(),
            Smoothing::Gaussian { sigma } => gaussian_smooth(values, sigma),
            Smoothing::SavitzkyGolay => savitzky_golay_5(values),
            Smoothing::Wavelet { scale } => wavelet_response(values, scale),
        }
    }
}

/// Segmentation tuning. The defaults follow the persistent-homology
/// reference behaviour.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SegmentationConfig {
    /// A maximum must persist above this multiple of the local noise level.
    pub noise_coefficient: f64,
    /// A maximum must persist above this fraction of its own apex height.
    pub persistence_coefficient: f64,
    /// Adjacent segments merge when the valley between them stays above this
    /// fraction of the smaller apex.
    pub merge_coefficient: f64,
    pub smoothing: Smoothing,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        SegmentationConfig {
            noise_coefficient: 2.0,
            persistence_coefficient: 0.1,
            merge_coefficient: 0.8,
            smoothing: Smoothing::NoSmoothing,
        }
    }
}

/// Detect significant peak segments in a merged trace.
///
/// `noise_level` supplies the local noise estimate per scan index (from
/// sample statistics, computed externally). Returned segments are ordered by
/// apex index and never overlap.
pub fn detect_segments(
    config: &SegmentationConfig,
    trace: &dyn Trace,
    noise_level: &dyn Fn(usize) -> f64,
) -> Vec<TraceSegment> {
    let offset = trace.start_idx();
    let n = trace.len();
    if n == 0 {
        return Vec::new();
    }
    let raw: Vec<f64> = (0..n).map(|i| trace.intensity(offset + i)).collect();
    let smoothed = config.smoothing.apply(&raw);

    let peaks = persistent_maxima(&smoothed);
    let mut apexes: Vec<usize> = peaks
        .iter()
        .filter(|p| {
            let apex_abs = p.apex + offset;
            let height = smoothed[p.apex];
            p.persistence >= config.noise_coefficient * noise_level(apex_abs)
                && p.persistence >= config.persistence_coefficient * height
                && raw[p.apex] > noise_level(apex_abs)
        })
        .map(|p| p.apex)
        .collect();
    apexes.sort_unstable();
    if apexes.is_empty() {
        return Vec::new();
    }

    // watershed boundaries: valleys between adjacent retained apexes
    let mut segments: Vec<TraceSegment> = Vec::with_capacity(apexes.len());
    for (k, &apex) in apexes.iter().enumerate() {
        let left = if k == 0 {
            0
        } else {
            valley_between(&smoothed, apexes[k - 1], apex)
        };
        let right = if k + 1 == apexes.len() {
            n - 1
        } else {
            valley_between(&smoothed, apex, apexes[k + 1])
        };
        segments.push(TraceSegment { apex, left, right });
    }

    // fold shallow neighbours together when the valley barely dips
    let mut merged: Vec<TraceSegment> = Vec::with_capacity(segments.len());
    for seg in segments {
        match merged.last_mut() {
            Some(prev) => {
                let valley = smoothed[seg.left];
                let lower_apex = smoothed[prev.apex].min(smoothed[seg.apex]);
                if valley > config.merge_coefficient * lower_apex {
                    prev.right = seg.right;
                    if smoothed[seg.apex] > smoothed[prev.apex] {
                        prev.apex = seg.apex;
                    }
                } else {
                    merged.push(seg);
                }
            }
            None => merged.push(seg),
        }
    }

    for seg in merged.iter_mut() {
        seg.apex += offset;
        seg.left += offset;
        seg.right += offset;
    }
    resolve_overlaps(&mut merged);
    merged
}

/// Make segments ordered by apex non-overlapping. Overlapping neighbours are
/// cut at the later segment's left edge, clamped so that both apexes stay
/// inside their segments.
pub fn resolve_overlaps(segments: &mut [TraceSegment]) {
    for k in 1..segments.len() {
        let prev = segments[k - 1];
        let seg = segments[k];
        if seg.left < prev.right {
            let boundary = seg
                .left
                .max(prev.apex)
                .min(seg.apex)
                .min(prev.right);
            segments[k - 1].right = boundary;
            segments[k].left = boundary;
        }
    }
}

struct PersistentPeak {
    apex: usize,
    persistence: f64,
}

/// All local maxima with their topological persistence: the height above the
/// saddle connecting each maximum to a higher one. The global maximum
/// persists by its full height above the trace minimum.
fn persistent_maxima(values: &[f64]) -> Vec<PersistentPeak> {
    let n = values.len();
    if n == 0 {
        return Vec::new();
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        values[b]
            .partial_cmp(&values[a])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });

    // component id per position; components keep their birth apex
    let mut component: Vec<Option<usize>> = vec![None; n];
    let mut peaks: Vec<PersistentPeak> = Vec::new();

    fn find(component: &[Option<usize>], mut i: usize) -> usize {
        while let Some(parent) = component[i] {
            if parent == i {
                break;
            }
            i = parent;
        }
        i
    }

    for &idx in &order {
        let left = if idx > 0 { component[idx - 1] } else { None };
        let right = if idx + 1 < n { component[idx + 1] } else { None };
        match (left, right) {
            (None, None) => {
                // a new maximum is born
                component[idx] = Some(idx);
            }
            (Some(_), None) => {
                let root = find(&component, idx - 1);
                component[idx] = Some(root);
            }
            (None, Some(_)) => {
                let root = find(&component, idx + 1);
                component[idx] = Some(root);
            }
            (Some(_), Some(_)) => {
                // saddle point: the younger maximum dies here
                let left_root = find(&component, idx - 1);
                let right_root = find(&component, idx + 1);
                let (survivor, dying) = if values[left_root] >= values[right_root] {
                    (left_root, right_root)
                } else {
                    (right_root, left_root)
                };
                peaks.push(PersistentPeak {
                    apex: dying,
                    persistence: values[dying] - values[idx],
                });
                component[dying] = Some(survivor);
                component[idx] = Some(survivor);
            }
        }
    }

    // the survivor of the whole sweep persists by its full relief
    let min_value = values.iter().cloned().fold(f64::INFINITY, f64::min);
    if let Some(&first) = order.first() {
        let global_root = find(&component, first);
        peaks.push(PersistentPeak {
            apex: global_root,
            persistence: values[global_root] - min_value,
        });
    }
    peaks
}

/// Index of the lowest value strictly between two apexes.
fn valley_between(values: &[f64], left_apex: usize, right_apex: usize) -> usize {
    debug_assert!(left_apex < right_apex);
    let mut valley = left_apex + 1;
    for i in (left_apex + 1)..right_apex {
        if values[i] < values[valley] {
            valley = i;
        }
    }
    valley.min(right_apex)
}

fn gaussian_smooth(values: &[f64], sigma: f64) -> Vec<f64> {
    if values.is_empty() || sigma <= 0.0 {
        return values.to_vec();
    }
    let radius = (3.0 * sigma).ceil() as isize;
    let two_sigma2 = 2.0 * sigma * sigma;
    let kernel: Vec<f64> = (-radius..=radius)
        .map(|dx| {
            let x = dx as f64;
            (-x * x / two_sigma2).exp()
        })
        .collect();
    let n = values.len();
    let mut out = vec![0.0; n];
    for i in 0..n {
        let mut acc = 0.0;
        let mut norm = 0.0;
        for (k, &w) in kernel.iter().enumerate() {
            let di = i as isize + (k as isize - radius);
            if di >= 0 && (di as usize) < n {
                acc += w * values[di as usize];
                norm += w;
            }
        }
        out[i] = if norm > 0.0 { acc / norm } else { values[i] };
    }
    out
}

/// Five-point quadratic Savitzky-Golay coefficients (-3, 12, 17, 12, -3)/35.
fn savitzky_golay_5(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    if n < 5 {
        return values.to_vec();
    }
    const COEFFS: [f64; 5] = [-3.0, 12.0, 17.0, 12.0, -3.0];
    let mut out = values.to_vec();
    for i in 2..n - 2 {
        let mut acc = 0.0;
        for (k, &c) in COEFFS.iter().enumerate() {
            acc += c * values[i + k - 2];
        }
        out[i] = acc / 35.0;
    }
    out
}

/// Mexican-hat wavelet response; ridges of this response sit on peak apexes
/// of width comparable to `scale`.
fn wavelet_response(values: &[f64], scale: f64) -> Vec<f64> {
    if values.is_empty() || scale <= 0.0 {
        return values.to_vec();
    }
    let radius = (5.0 * scale).ceil() as isize;
    let kernel: Vec<f64> = (-radius..=radius)
        .map(|dx| {
            let t = dx as f64 / scale;
            (1.0 - t * t) * (-t * t / 2.0).exp()
        })
        .collect();
    let n = values.len();
    let mut out = vec![0.0; n];
    for i in 0..n {
        let mut acc = 0.0;
        for (k, &w) in kernel.iter().enumerate() {
            let di = i as isize + (k as isize - radius);
            if di >= 0 && (di as usize) < n {
                acc += w * values[di as usize];
            }
        }
        out[i] = acc.max(0.0);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gaussian_trace(apex: usize, sigma: f64, height: f64, len: usize) -> MergedTrace {
        let intensities: Vec<f64> = (0..len)
            .map(|i| {
                let d = i as f64 - apex as f64;
                height * (-d * d / (2.0 * sigma * sigma)).exp()
            })
            .collect();
        let rts: Vec<f64> = (0..len).map(|i| i as f64).collect();
        MergedTrace::new(0, intensities, rts, 400.0)
    }

    #[test]
    fn trace_len_counts_inclusive_indices() {
        let trace = gaussian_trace(40, 4.0, 1000.0, 100);
        assert_eq!(trace.len(), 100);
        assert!(!trace.is_empty());
        assert_eq!(trace.apex_idx(), 40);
    }

    #[test]
    fn single_gaussian_peak_yields_one_segment() {
        let trace = gaussian_trace(40, 4.0, 1000.0, 100);
        let config = SegmentationConfig::default();
        let segments = detect_segments(&config, &trace, &|_| 10.0);
        assert_eq!(segments.len(), 1);
        assert!(
            (segments[0].apex as i64 - 40).abs() <= 1,
            "apex at {}",
            segments[0].apex
        );
        assert!(segments[0].left <= segments[0].apex);
        assert!(segments[0].apex <= segments[0].right);
    }

    #[test]
    fn smoothing_variants_agree_on_clean_peak() {
        let trace = gaussian_trace(50, 5.0, 1000.0, 120);
        for smoothing in [
            Smoothing::NoSmoothing,
            Smoothing::Gaussian { sigma: 2.0 },
            Smoothing::SavitzkyGolay,
            Smoothing::Wavelet { scale: 5.0 },
        ] {
            let config = SegmentationConfig {
                smoothing,
                ..SegmentationConfig::default()
            };
            let segments = detect_segments(&config, &trace, &|_| 10.0);
            assert_eq!(segments.len(), 1, "{smoothing:?}");
            assert!(
                (segments[0].apex as i64 - 50).abs() <= 2,
                "{smoothing:?}: apex {}",
                segments[0].apex
            );
        }
    }

    #[test]
    fn two_resolved_peaks_yield_two_segments() {
        let a = gaussian_trace(30, 3.0, 1000.0, 120);
        let b = gaussian_trace(80, 3.0, 800.0, 120);
        let intensities: Vec<f64> = a
            .intensities
            .iter()
            .zip(b.intensities.iter())
            .map(|(x, y)| x + y)
            .collect();
        let rts: Vec<f64> = (0..120).map(|i| i as f64).collect();
        let trace = MergedTrace::new(0, intensities, rts, 400.0);
        let segments = detect_segments(&SegmentationConfig::default(), &trace, &|_| 10.0);
        assert_eq!(segments.len(), 2);
        assert!((segments[0].apex as i64 - 30).abs() <= 1);
        assert!((segments[1].apex as i64 - 80).abs() <= 1);
        // watershed edges do not overlap
        assert!(segments[0].right <= segments[1].left);
    }

    #[test]
    fn sub_noise_peak_is_dropped() {
        let trace = gaussian_trace(40, 4.0, 50.0, 100);
        let segments = detect_segments(&SegmentationConfig::default(), &trace, &|_| 100.0);
        assert!(segments.is_empty());
    }

    #[test]
    fn weakly_persistent_bump_is_absorbed() {
        // a bump persisting below twice the noise level is not a segment
        let main = gaussian_trace(50, 6.0, 1000.0, 120);
        let intensities: Vec<f64> = main
            .intensities
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                let d = i as f64 - 90.0;
                v + 15.0 * (-d * d / 8.0).exp()
            })
            .collect();
        let rts: Vec<f64> = (0..120).map(|i| i as f64).collect();
        let trace = MergedTrace::new(0, intensities, rts, 400.0);
        let segments = detect_segments(&SegmentationConfig::default(), &trace, &|_| 10.0);
        assert_eq!(segments.len(), 1);
        assert!((segments[0].apex as i64 - 50).abs() <= 1);
    }

    #[test]
    fn shallow_valley_merges_neighbouring_segments() {
        let intensities = vec![
            0.0, 100.0, 300.0, 600.0, 900.0, 1000.0, 950.0, 850.0, 940.0, 980.0, 960.0, 700.0,
            300.0, 100.0, 0.0,
        ];
        let rts: Vec<f64> = (0..intensities.len()).map(|i| i as f64).collect();
        let trace = MergedTrace::new(0, intensities, rts, 400.0);
        let segments = detect_segments(&SegmentationConfig::default(), &trace, &|_| 10.0);
        // valley at 850 stays above 0.8 * 980: one merged segment
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].apex, 5);
    }

    #[test]
    fn overlapping_segments_resolve_to_non_overlapping() {
        let mut segments = vec![
            TraceSegment { apex: 50, left: 40, right: 60 },
            TraceSegment { apex: 55, left: 52, right: 70 },
        ];
        resolve_overlaps(&mut segments);
        assert_eq!(segments[0], TraceSegment { apex: 50, left: 40, right: 52 });
        assert_eq!(segments[1], TraceSegment { apex: 55, left: 52, right: 70 });
    }

    #[test]
    fn offset_traces_report_absolute_indices() {
        let base = gaussian_trace(40, 4.0, 1000.0, 100);
        let trace = MergedTrace::new(500, base.intensities, base.retention_times, 400.0);
        let segments = detect_segments(&SegmentationConfig::default(), &trace, &|_| 10.0);
        assert_eq!(segments.len(), 1);
        assert!((segments[0].apex as i64 - 540).abs() <= 1);
        assert!(segments[0].left >= 500);
    }
}
