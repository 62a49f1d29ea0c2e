//! Scoring of candidate point pairs during pairwise alignment.

use statrs::distribution::{Continuous, Normal};

use crate::align::backbone::AlignmentStatistics;
use crate::align::pairwise::PointRef;
use crate::align::recalibrate::SampleRecalibration;

/// Gaussian match scorer. The candidate window spans a fixed number of
/// standard deviations around the expected mass and retention-time
/// deviations. Recalibrated samples are matched against deviation statistics
/// that were refined from the recalibration residuals, so their windows are
/// already far tighter; `recalibrated_tightening` lets callers shrink them
/// further on top of that.
#[derive(Clone, Copy, Debug)]
pub struct AlignmentScorer {
    /// Window half-width in standard deviations.
    pub window_sigmas: f64,
    /// Extra factor on the RT window once a recalibration is in place.
    pub recalibrated_tightening: f64,
}

impl Default for AlignmentScorer {
    fn default() -> Self {
        AlignmentScorer {
            window_sigmas: 3.0,
            recalibrated_tightening: 1.0,
        }
    }
}

impl AlignmentScorer {
    /// Score a candidate pair, or `None` when the pair falls outside the
    /// tolerance window. Higher is better; the score is the joint gaussian
    /// log-density of the mass and retention-time deviations.
    pub fn score(
        &self,
        stats: &AlignmentStatistics,
        recal: &SampleRecalibration,
        left: &PointRef,
        right: &PointRef,
    ) -> Option<f64> {
        // accept-if-within: a non-finite deviation fails the comparison and
        // is rejected instead of sliding past a reject-if-greater gate
        if !self.within_window(stats, recal, left, right) {
            return None;
        }
        let (sigma_mass, sigma_rt) = self.sigmas(stats, recal, left.mass);
        let d_mass = recal.mass.apply(right.mass) - left.mass;
        let d_rt = recal.rt.apply(right.retention_time) - left.retention_time;

        let mass_model = Normal::new(0.0, sigma_mass).expect("sigma is positive");
        let rt_model = Normal::new(0.0, sigma_rt).expect("sigma is positive");
        Some(mass_model.ln_pdf(d_mass) + rt_model.ln_pdf(d_rt))
    }

    /// Whether the pair falls inside the tolerance window at all.
    pub fn within_window(
        &self,
        stats: &AlignmentStatistics,
        recal: &SampleRecalibration,
        left: &PointRef,
        right: &PointRef,
    ) -> bool {
        let (sigma_mass, sigma_rt) = self.sigmas(stats, recal, left.mass);
        let d_mass = recal.mass.apply(right.mass) - left.mass;
        let d_rt = recal.rt.apply(right.retention_time) - left.retention_time;
        d_mass.abs() <= self.window_sigmas * sigma_mass
            && d_rt.abs() <= self.window_sigmas * sigma_rt
    }

    fn sigmas(
        &self,
        stats: &AlignmentStatistics,
        recal: &SampleRecalibration,
        left_mass: f64,
    ) -> (f64, f64) {
        let sigma_mass = stats
            .expected_mass_deviation
            .absolute_for(left_mass)
            .max(1e-12);
        let tighten = if recal.is_identity() {
            1.0
        } else {
            self.recalibrated_tightening
        };
        let sigma_rt = (stats.expected_rt_deviation * tighten).max(1e-12);
        (sigma_mass, sigma_rt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::backbone::MassDeviation;

    fn stats() -> AlignmentStatistics {
        AlignmentStatistics {
            min_mass: 100.0,
            max_mass: 1000.0,
            min_rt: 0.0,
            max_rt: 600.0,
            expected_mass_deviation: MassDeviation::new(10.0, 0.001),
            expected_rt_deviation: 5.0,
            max_mapping_len: 100,
        }
    }

    fn point(mass: f64, rt: f64) -> PointRef {
        PointRef {
            uid: 0,
            mass,
            retention_time: rt,
            intensity: 1.0,
        }
    }

    #[test]
    fn close_pair_beats_distant_pair() {
        let scorer = AlignmentScorer::default();
        let recal = SampleRecalibration::default();
        let left = point(300.0, 100.0);
        let near = scorer.score(&stats(), &recal, &left, &point(300.0005, 101.0));
        let far = scorer.score(&stats(), &recal, &left, &point(300.002, 110.0));
        let near = near.expect("inside window");
        let far = far.expect("inside window");
        assert!(near > far);
    }

    #[test]
    fn non_finite_coordinates_never_score() {
        let scorer = AlignmentScorer::default();
        let recal = SampleRecalibration::default();
        let left = point(300.0, 100.0);
        assert!(scorer.score(&stats(), &recal, &left, &point(300.0, f64::NAN)).is_none());
        assert!(scorer.score(&stats(), &recal, &left, &point(f64::NAN, 100.0)).is_none());
        assert!(!scorer.within_window(&stats(), &recal, &left, &point(300.0, f64::NAN)));
    }

    #[test]
    fn window_membership_matches_scoring() {
        let scorer = AlignmentScorer::default();
        let recal = SampleRecalibration::default();
        let left = point(300.0, 100.0);
        assert!(scorer.within_window(&stats(), &recal, &left, &point(300.0005, 101.0)));
        assert!(!scorer.within_window(&stats(), &recal, &left, &point(300.5, 100.0)));
    }

    #[test]
    fn outside_window_is_rejected() {
        let scorer = AlignmentScorer::default();
        let recal = SampleRecalibration::default();
        let left = point(300.0, 100.0);
        assert!(scorer.score(&stats(), &recal, &left, &point(300.5, 100.0)).is_none());
        assert!(scorer.score(&stats(), &recal, &left, &point(300.0, 200.0)).is_none());
    }
}
