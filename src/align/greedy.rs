//! Greedy two-stage multi-sample alignment.
//!
//! Stage one folds samples one after another into a growing consensus,
//! restricted to confident points, and derives the alignment backbone:
//! consensus scan axis, anchors and per-sample retention-time corrections.
//! Stage two re-aligns every sample (all points this time) onto the frozen
//! backbone with the corrections in place and refines both the retention-time
//! and mass deviation statistics.
//!
//! Samples are folded strictly in quality-descending order; this ordering is
//! part of the contract, it decides which points seed which anchors and must
//! stay reproducible. Between the per-sample barriers, bin jobs only read
//! consensus snapshots and return action lists; the orchestrator is the only
//! writer.

use log::{debug, info};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::align::backbone::{
    AlignmentBackbone, AlignmentStatistics, MassDeviation, ScanPointMapping,
};
use crate::align::bins::mass_bins;
use crate::align::moi::{AlignedMoI, Confidence};
use crate::align::pairwise::{align, AlignAction};
use crate::align::recalibrate::{fit_recalibration, RecalibrationFunction, SampleRecalibration};
use crate::align::scorer::AlignmentScorer;
use crate::align::storage::{AlignmentStorage, StoredPoint};
use crate::error::{Error, Result};
use crate::scheduler::Scheduler;
use crate::stats::robust_average;

/// One processed run entering alignment: its own point store, its scan axis
/// and the per-run quality numbers the orchestrator sorts and scores by.
#[derive(Clone, Debug)]
pub struct SampleData {
    pub sample_idx: i32,
    pub storage: AlignmentStorage,
    pub mapping: ScanPointMapping,
    /// Average mass deviation within FWHM, from per-run statistics.
    pub mass_accuracy: MassDeviation,
    /// Count of high-confidence traces; the per-sample quality score.
    pub high_quality_traces: usize,
}

/// Tuning knobs for the orchestrator. Defaults follow the reference
/// behaviour of the greedy strategy.
#[derive(Clone, Copy, Debug)]
pub struct AlignerConfig {
    /// An anchor needs max(2, ceil(fraction * samples)) contributing samples.
    pub min_anchor_fraction: f64,
    /// Start pruning stale points once this many samples are folded in.
    pub prune_after: usize,
    /// Prune every this many samples.
    pub prune_interval: usize,
    /// Single-member points from samples older than this many folds are
    /// considered stale.
    pub prune_window: usize,
    /// Temporal regions for the recalibration gate.
    pub regions: usize,
}

impl Default for AlignerConfig {
    fn default() -> Self {
        AlignerConfig {
            min_anchor_fraction: 0.1,
            prune_after: 10,
            prune_interval: 5,
            prune_window: 5,
            regions: 3,
        }
    }
}

/// The greedy one-sample-at-a-time orchestrator.
pub struct GreedyTwoStageAligner<'a> {
    scheduler: &'a Scheduler,
    scorer: AlignmentScorer,
    config: AlignerConfig,
}

impl<'a> GreedyTwoStageAligner<'a> {
    pub fn new(scheduler: &'a Scheduler, scorer: AlignmentScorer, config: AlignerConfig) -> Self {
        GreedyTwoStageAligner {
            scheduler,
            scorer,
            config,
        }
    }

    /// Stage one: build the alignment backbone from the confident points of
    /// all samples. Sorts `samples` by descending quality as a side effect;
    /// the sorted order is the fold order.
    pub fn make_backbone(
        &self,
        consensus: &mut AlignmentStorage,
        samples: &mut [SampleData],
    ) -> Result<AlignmentBackbone> {
        if samples.is_empty() {
            return Err(Error::InvalidInput("no samples to align".into()));
        }
        samples.sort_by(|a, b| b.high_quality_traces.cmp(&a.high_quality_traces));
        let mut stats = collect_statistics(samples)?;
        let bins = mass_bins(stats.min_mass, stats.max_mass);
        info!(
            "aligning {} samples over {} mass bins, rt {:.1}..{:.1}",
            samples.len(),
            bins.len() - 1,
            stats.min_rt,
            stats.max_rt
        );

        // seed the consensus with the best sample's confident points
        for point in samples[0].storage.iter() {
            if let StoredPoint::Single(moi) = point {
                if moi.confidence >= Confidence::Confident {
                    consensus.insert(moi.clone());
                }
            }
        }

        let identity = SampleRecalibration::default();
        for sample in samples.iter().skip(1) {
            self.fold_sample(
                consensus,
                &sample.storage,
                &bins,
                &stats,
                &identity,
                Some(Confidence::Confident),
            )?;
        }

        let min_samples = self.min_anchor_support(samples.len());
        let anchors = select_anchors(consensus, min_samples);
        debug!("selected {} backbone anchors", anchors.len());

        let mapping =
            ScanPointMapping::uniform(stats.min_rt, stats.max_rt, stats.max_mapping_len.max(1) + 1);
        let counts =
            sample_points_per_region(consensus, &mapping, &anchors, self.config.regions);

        let fits = self.recalibrate_all(consensus, &anchors, samples, &counts, false)?;
        let mut recalibrations: FxHashMap<i32, SampleRecalibration> = FxHashMap::default();
        let mut rt_errors: Vec<f64> = Vec::with_capacity(fits.len());
        for fit in fits {
            rt_errors.push(fit.rt_residual);
            recalibrations.insert(fit.sample_idx, fit.recalibration);
        }
        let average_rt_residual = robust_average(&rt_errors);
        if average_rt_residual > 0.0 {
            stats.expected_rt_deviation = average_rt_residual;
        }

        Ok(AlignmentBackbone {
            mapping,
            recalibrations,
            statistics: stats,
            anchor_uids: anchors,
            average_rt_residual,
        })
    }

    /// Stage two: re-align every sample, unfiltered, onto the frozen
    /// backbone using the stage-one corrections. Returns the refined
    /// backbone; `consensus` afterwards holds the merged feature candidates.
    pub fn align_to_backbone(
        &self,
        consensus: &mut AlignmentStorage,
        backbone: &AlignmentBackbone,
        samples: &mut [SampleData],
    ) -> Result<AlignmentBackbone> {
        if samples.is_empty() {
            return Err(Error::InvalidInput("no samples to align".into()));
        }
        samples.sort_by(|a, b| b.high_quality_traces.cmp(&a.high_quality_traces));
        let mut stats = backbone.statistics.clone();
        let bins = mass_bins(stats.min_mass, stats.max_mass);

        consensus.clear();
        // transfer the best sample, recalibrated onto the backbone axis
        let first_recal = backbone.recalibration_for(samples[0].sample_idx);
        for point in samples[0].storage.iter() {
            if let StoredPoint::Single(moi) = point {
                let cal_mass = first_recal.mass.apply(moi.mass);
                let cal_rt = first_recal.rt.apply(moi.retention_time);
                consensus.insert_aligned(AlignedMoI::seeded(moi.clone(), cal_mass, cal_rt));
            }
        }

        let mut folded: Vec<i32> = vec![samples[0].sample_idx];
        for (k, sample) in samples.iter().enumerate().skip(1) {
            let recal = backbone.recalibration_for(sample.sample_idx);
            self.fold_sample(consensus, &sample.storage, &bins, &stats, &recal, None)?;
            folded.push(sample.sample_idx);
            if k > self.config.prune_after && k % self.config.prune_interval == 0 {
                prune_stale(consensus, &folded, self.config.prune_window);
            }
        }

        let min_samples = self.min_anchor_support(samples.len());
        let anchors = select_anchors(consensus, min_samples);
        debug!("refined backbone has {} anchors", anchors.len());

        let counts =
            sample_points_per_region(consensus, &backbone.mapping, &anchors, self.config.regions);
        let fits = self.recalibrate_all(consensus, &anchors, samples, &counts, true)?;

        let mut recalibrations: FxHashMap<i32, SampleRecalibration> = FxHashMap::default();
        let mut rt_errors = Vec::with_capacity(fits.len());
        let mut ppm_errors = Vec::new();
        let mut abs_errors = Vec::new();
        for fit in fits {
            rt_errors.push(fit.rt_residual);
            if fit.mass_ppm_residual > 0.0 {
                ppm_errors.push(fit.mass_ppm_residual);
            }
            if fit.mass_abs_residual > 0.0 {
                abs_errors.push(fit.mass_abs_residual);
            }
            recalibrations.insert(fit.sample_idx, fit.recalibration);
        }
        let average_rt_residual = robust_average(&rt_errors);
        if average_rt_residual > 0.0 {
            stats.expected_rt_deviation = average_rt_residual;
        }
        if !ppm_errors.is_empty() || !abs_errors.is_empty() {
            stats.expected_mass_deviation = MassDeviation::new(
                robust_average(&ppm_errors),
                robust_average(&abs_errors),
            );
        }

        // everything still unmerged after the full pass is noise for the
        // consensus; only merged candidates move on to segmentation
        consensus.retain(|point| point.member_count() > 1);

        Ok(AlignmentBackbone {
            mapping: backbone.mapping.clone(),
            recalibrations,
            statistics: stats,
            anchor_uids: anchors,
            average_rt_residual,
        })
    }

    fn min_anchor_support(&self, sample_count: usize) -> usize {
        let fraction = (self.config.min_anchor_fraction * sample_count as f64).ceil() as usize;
        fraction.max(2)
    }

    /// Fold one sample into the consensus: one alignment job per mass bin,
    /// barrier on all of them, then apply the action lists sequentially.
    /// A failing bin job aborts the whole sample via the returned error.
    fn fold_sample(
        &self,
        consensus: &mut AlignmentStorage,
        sample_storage: &AlignmentStorage,
        bins: &[f64],
        stats: &AlignmentStatistics,
        recal: &SampleRecalibration,
        min_confidence: Option<Confidence>,
    ) -> Result<()> {
        let consensus_view: &AlignmentStorage = consensus;
        let scorer = &self.scorer;
        let bin_actions: Result<Vec<Vec<AlignAction>>> = self.scheduler.install(|| {
            (0..bins.len() - 1)
                .into_par_iter()
                .map(|i| {
                    let (from, to) = (bins[i], bins[i + 1]);
                    let left = consensus_view.points_within(from, to);
                    if left.is_empty() {
                        return Ok(Vec::new());
                    }
                    let right = match min_confidence {
                        Some(conf) => {
                            sample_storage.points_within_min_confidence(from, to, conf)
                        }
                        None => sample_storage.points_within(from, to),
                    };
                    if right.is_empty() {
                        return Ok(Vec::new());
                    }
                    if let Some(bad) = left
                        .iter()
                        .chain(right.iter())
                        .find(|p| !p.mass.is_finite() || !p.retention_time.is_finite())
                    {
                        return Err(Error::JobFailed(format!(
                            "non-finite coordinates on point {}",
                            bad.uid
                        )));
                    }
                    Ok(align(stats, scorer, recal, &left, &right))
                })
                .collect()
        });

        for actions in bin_actions? {
            for action in actions {
                match action {
                    AlignAction::Merge {
                        left_uid,
                        right_uid,
                    } => {
                        if let Some(StoredPoint::Single(moi)) = sample_storage.get(right_uid) {
                            let cal_mass = recal.mass.apply(moi.mass);
                            let cal_rt = recal.rt.apply(moi.retention_time);
                            consensus.merge_into(left_uid, moi.clone(), cal_mass, cal_rt);
                        }
                    }
                    AlignAction::Insert { right_uid } => {
                        if let Some(StoredPoint::Single(moi)) = sample_storage.get(right_uid) {
                            let cal_mass = recal.mass.apply(moi.mass);
                            let cal_rt = recal.rt.apply(moi.retention_time);
                            consensus
                                .insert_aligned(AlignedMoI::seeded(moi.clone(), cal_mass, cal_rt));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// One recalibration job per sample, in parallel, with a barrier on all
    /// of them.
    fn recalibrate_all(
        &self,
        consensus: &AlignmentStorage,
        anchors: &[u64],
        samples: &[SampleData],
        region_counts: &FxHashMap<i32, Vec<usize>>,
        with_mass: bool,
    ) -> Result<Vec<SampleFit>> {
        self.scheduler.install(|| {
            samples
                .par_iter()
                .map(|sample| {
                    let counts = region_counts
                        .get(&sample.sample_idx)
                        .map(|c| c.as_slice())
                        .unwrap_or(&[]);
                    let fit = recalibrate_sample(
                        consensus,
                        anchors,
                        sample.sample_idx,
                        counts,
                        with_mass,
                    );
                    if !fit.rt_residual.is_finite() {
                        return Err(Error::JobFailed(format!(
                            "recalibration diverged for sample {}",
                            sample.sample_idx
                        )));
                    }
                    Ok(fit)
                })
                .collect()
        })
    }
}

struct SampleFit {
    sample_idx: i32,
    recalibration: SampleRecalibration,
    rt_residual: f64,
    mass_ppm_residual: f64,
    mass_abs_residual: f64,
}

/// Global statistics over all samples, collected before alignment.
pub fn collect_statistics(samples: &[SampleData]) -> Result<AlignmentStatistics> {
    let mut min_mass = f64::INFINITY;
    let mut max_mass = f64::NEG_INFINITY;
    let mut min_rt = f64::INFINITY;
    let mut max_rt = f64::NEG_INFINITY;
    let mut max_mapping_len = 0usize;
    let mut ppm = 0.0;
    let mut abs = 0.0;
    for sample in samples {
        min_rt = min_rt.min(sample.mapping.min_rt());
        max_rt = max_rt.max(sample.mapping.max_rt());
        max_mapping_len = max_mapping_len.max(sample.mapping.len());
        for point in sample.storage.iter() {
            min_mass = min_mass.min(point.mass());
            max_mass = max_mass.max(point.mass());
        }
        ppm += sample.mass_accuracy.ppm;
        abs += sample.mass_accuracy.absolute;
    }
    if !min_mass.is_finite() || !min_rt.is_finite() {
        return Err(Error::InvalidInput(
            "samples contain no points to align".into(),
        ));
    }
    let n = samples.len() as f64;
    Ok(AlignmentStatistics {
        min_mass,
        max_mass,
        min_rt,
        max_rt,
        expected_mass_deviation: MassDeviation::new(ppm / n, abs / n),
        // before any recalibration, allow a twentieth of the gradient
        expected_rt_deviation: (max_rt - min_rt) / 20.0,
        max_mapping_len,
    })
}

/// Freeze every aligned point with enough supporting samples and return the
/// anchor uids, sorted for reproducibility.
fn select_anchors(consensus: &mut AlignmentStorage, min_samples: usize) -> Vec<u64> {
    let frozen: Vec<(u64, AlignedMoI)> = consensus
        .iter()
        .filter_map(|p| {
            p.as_aligned()
                .filter(|a| a.members.len() >= min_samples)
                .map(|a| (p.uid(), a.finish_merging()))
        })
        .collect();
    let mut anchors = Vec::with_capacity(frozen.len());
    for (uid, point) in frozen {
        consensus.replace(uid, StoredPoint::Aligned(point));
        anchors.push(uid);
    }
    anchors.sort_unstable();
    anchors
}

/// Count each sample's anchor matches per temporal region. Recalibration is
/// only trusted for samples with calibration points spread over the whole
/// gradient; a sample whose points pile up in one region would otherwise get
/// extrapolated corrections.
fn sample_points_per_region(
    consensus: &AlignmentStorage,
    mapping: &ScanPointMapping,
    anchors: &[u64],
    regions: usize,
) -> FxHashMap<i32, Vec<usize>> {
    let mut counts: FxHashMap<i32, Vec<usize>> = FxHashMap::default();
    let span = (mapping.max_rt() - mapping.min_rt()) / regions as f64;
    for &uid in anchors {
        let Some(point) = consensus.get(uid) else {
            continue;
        };
        let Some(aligned) = point.as_aligned() else {
            continue;
        };
        let offset = (aligned.retention_time - mapping.min_rt()).max(0.0);
        let region = if span > 0.0 {
            ((offset / span) as usize).min(regions - 1)
        } else {
            0
        };
        for member in &aligned.members {
            counts
                .entry(member.sample_idx)
                .or_insert_with(|| vec![0; regions])[region] += 1;
        }
    }
    counts
}

/// Fit RT (and optionally mass) corrections for one sample from its anchor
/// matches, and report the residuals used for the global statistics.
fn recalibrate_sample(
    consensus: &AlignmentStorage,
    anchors: &[u64],
    sample_idx: i32,
    region_counts: &[usize],
    with_mass: bool,
) -> SampleFit {
    let mut rt_x = Vec::new();
    let mut rt_y = Vec::new();
    let mut mass_x = Vec::new();
    let mut mass_y = Vec::new();
    for &uid in anchors {
        let Some(aligned) = consensus.get(uid).and_then(|p| p.as_aligned()) else {
            continue;
        };
        if let Some(member) = aligned.for_sample_idx(sample_idx) {
            rt_x.push(member.retention_time);
            rt_y.push(aligned.retention_time);
            if with_mass {
                mass_x.push(member.mass);
                mass_y.push(aligned.mass);
            }
        }
    }
    let min_bucket = region_counts.iter().copied().min().unwrap_or(0);

    let rt_fit = fit_recalibration(&rt_x, &rt_y, min_bucket);
    let mut fit = SampleFit {
        sample_idx,
        recalibration: SampleRecalibration {
            rt: rt_fit.function,
            mass: RecalibrationFunction::Identity,
        },
        rt_residual: rt_fit.residual,
        mass_ppm_residual: 0.0,
        mass_abs_residual: 0.0,
    };
    if with_mass && !mass_x.is_empty() {
        let mass_fit = fit_recalibration(&mass_x, &mass_y, min_bucket);
        // split the residual into ppm above 250 Da and absolute below, the
        // two regimes instrument accuracy is quoted in
        let (mut ppm_sum, mut ppm_n) = (0.0, 0usize);
        let (mut abs_sum, mut abs_n) = (0.0, 0usize);
        for (&x, &y) in mass_x.iter().zip(mass_y.iter()) {
            let err = (mass_fit.function.apply(x) - y).abs();
            if y > 250.0 {
                ppm_sum += 1e6 * err / y;
                ppm_n += 1;
            } else {
                abs_sum += err;
                abs_n += 1;
            }
        }
        if ppm_n > 0 {
            fit.mass_ppm_residual = ppm_sum / ppm_n as f64;
        }
        if abs_n > 0 {
            fit.mass_abs_residual = abs_sum / abs_n as f64;
        }
        fit.recalibration.mass = mass_fit.function;
    }
    fit
}

/// Drop single-member points from samples folded in more than `window`
/// samples before the current one, plus any raw unmerged record. The sample
/// folded exactly `window` folds ago is still recent; multi-member points
/// always survive.
fn prune_stale(consensus: &mut AlignmentStorage, folded: &[i32], window: usize) {
    let stale: FxHashSet<i32> = folded[..folded.len().saturating_sub(window + 1)]
        .iter()
        .copied()
        .collect();
    consensus.retain(|point| match point {
        StoredPoint::Aligned(a) => {
            a.members.len() > 1 || !stale.contains(&a.members[0].sample_idx)
        }
        StoredPoint::Single(_) => false,
    });
}
