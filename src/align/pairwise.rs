//! Pairwise one-to-one matching between a consensus snapshot and one
//! sample's points, per mass bin.
//!
//! Instead of firing merge/insert callbacks mid-match, `align` returns an
//! explicit action list that the orchestrator applies sequentially after the
//! barrier. Bin jobs therefore only ever read storage snapshots.

use itertools::iproduct;
use rustc_hash::FxHashSet;

use crate::align::backbone::AlignmentStatistics;
use crate::align::recalibrate::SampleRecalibration;
use crate::align::scorer::AlignmentScorer;
use crate::align::storage::StoredPoint;

/// Reduced view of a stored point, owned by the job that queried it.
#[derive(Clone, Copy, Debug)]
pub struct PointRef {
    pub uid: u64,
    pub mass: f64,
    pub retention_time: f64,
    pub intensity: f64,
}

impl PointRef {
    pub fn from_stored(point: &StoredPoint) -> Self {
        PointRef {
            uid: point.uid(),
            mass: point.mass(),
            retention_time: point.retention_time(),
            intensity: point.intensity(),
        }
    }
}

/// One step of applying an alignment result to the consensus store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlignAction {
    /// Fold the sample point into an existing consensus point.
    Merge { left_uid: u64, right_uid: u64 },
    /// The sample point matched nothing; it becomes a new consensus point.
    Insert { right_uid: u64 },
}

/// Match `right` (one sample's points) against `left` (the consensus
/// snapshot) within one mass bin.
///
/// Candidates inside the scorer's window are taken greedily by descending
/// score, ties broken by `(left uid, right uid)` so repeated runs produce
/// identical matchings. Each point on either side is used at most once.
/// Unmatched right points yield [`AlignAction::Insert`]. An empty side is a
/// no-op, not an error.
pub fn align(
    stats: &AlignmentStatistics,
    scorer: &AlignmentScorer,
    recal: &SampleRecalibration,
    left: &[PointRef],
    right: &[PointRef],
) -> Vec<AlignAction> {
    if left.is_empty() || right.is_empty() {
        return Vec::new();
    }

    let mut candidates: Vec<(f64, usize, usize)> = iproduct!(0..left.len(), 0..right.len())
        .filter_map(|(li, ri)| {
            scorer
                .score(stats, recal, &left[li], &right[ri])
                .map(|s| (s, li, ri))
        })
        .collect();
    candidates.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                (left[a.1].uid, right[a.2].uid).cmp(&(left[b.1].uid, right[b.2].uid))
            })
    });

    let mut used_left: FxHashSet<usize> = FxHashSet::default();
    let mut used_right: FxHashSet<usize> = FxHashSet::default();
    let mut actions: Vec<AlignAction> = Vec::new();
    for (_, li, ri) in candidates {
        if used_left.contains(&li) || used_right.contains(&ri) {
            continue;
        }
        used_left.insert(li);
        used_right.insert(ri);
        actions.push(AlignAction::Merge {
            left_uid: left[li].uid,
            right_uid: right[ri].uid,
        });
    }
    for (ri, r) in right.iter().enumerate() {
        if !used_right.contains(&ri) {
            actions.push(AlignAction::Insert { right_uid: r.uid });
        }
    }
    actions
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

    fn point(uid: u64, mass: f64, rt: f64) -> PointRef {
        PointRef {
            uid,
            mass,
            retention_time: rt,
            intensity: 1.0,
        }
    }

    #[test]
    fn empty_side_is_noop() {
        let scorer = AlignmentScorer::default();
        let recal = SampleRecalibration::default();
        assert!(align(&stats(), &scorer, &recal, &[], &[point(0, 300.0, 1.0)]).is_empty());
        assert!(align(&stats(), &scorer, &recal, &[point(0, 300.0, 1.0)], &[]).is_empty());
    }

    #[test]
    fn close_points_merge_one_to_one() {
        let scorer = AlignmentScorer::default();
        let recal = SampleRecalibration::default();
        let left = vec![point(0, 300.1, 100.0), point(1, 305.2, 200.0)];
        let right = vec![point(10, 300.1005, 101.0), point(11, 305.2002, 199.0)];
        let actions = align(&stats(), &scorer, &recal, &left, &right);
        let merges: Vec<_> = actions
            .iter()
            .filter(|a| matches!(a, AlignAction::Merge { .. }))
            .collect();
        assert_eq!(merges.len(), 2);
        assert!(actions.contains(&AlignAction::Merge { left_uid: 0, right_uid: 10 }));
        assert!(actions.contains(&AlignAction::Merge { left_uid: 1, right_uid: 11 }));
    }

    #[test]
    fn best_score_wins_contested_point() {
        let scorer = AlignmentScorer::default();
        let recal = SampleRecalibration::default();
        // two right points compete for the same left point; the closer one wins
        let left = vec![point(0, 300.1, 100.0)];
        let right = vec![point(10, 300.1, 104.0), point(11, 300.1, 100.5)];
        let actions = align(&stats(), &scorer, &recal, &left, &right);
        assert!(actions.contains(&AlignAction::Merge { left_uid: 0, right_uid: 11 }));
        assert!(actions.contains(&AlignAction::Insert { right_uid: 10 }));
    }

    #[test]
    fn unmatched_right_points_become_inserts() {
        let scorer = AlignmentScorer::default();
        let recal = SampleRecalibration::default();
        let left = vec![point(0, 300.1, 100.0)];
        let right = vec![point(10, 300.1, 100.2), point(11, 390.0, 100.2)];
        let actions = align(&stats(), &scorer, &recal, &left, &right);
        assert_eq!(actions.len(), 2);
        assert!(actions.contains(&AlignAction::Insert { right_uid: 11 }));
    }

    #[test]
    fn matching_is_deterministic_under_ties() {
        let scorer = AlignmentScorer::default();
        let recal = SampleRecalibration::default();
        // two exactly symmetric candidates: uid order must decide, every run
        let left = vec![point(0, 300.1, 100.0), point(1, 300.1, 100.0)];
        let right = vec![point(10, 300.1, 100.0), point(11, 300.1, 100.0)];
        let first = align(&stats(), &scorer, &recal, &left, &right);
        for _ in 0..5 {
            assert_eq!(first, align(&stats(), &scorer, &recal, &left, &right));
        }
        assert!(first.contains(&AlignAction::Merge { left_uid: 0, right_uid: 10 }));
    }
}
