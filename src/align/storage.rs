//! Arena-backed point store with a mass index.
//!
//! Points are addressed by a `uid` into an arena and indexed by mass for the
//! range queries that drive bin-sharded alignment. Range queries return owned
//! snapshots, so worker jobs never hold references into a store that the
//! orchestrator is about to mutate; all writes happen between barriers with
//! exactly one writer.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Included};

use ordered_float::OrderedFloat;

use crate::align::moi::{AlignedMoI, Confidence, MoI};
use crate::align::pairwise::PointRef;

/// A record in the store: either a raw per-sample observation or a consensus
/// point owning several of them.
#[derive(Clone, Debug)]
pub enum StoredPoint {
    Single(MoI),
    Aligned(AlignedMoI),
}

impl StoredPoint {
    pub fn mass(&self) -> f64 {
        match self {
            StoredPoint::Single(m) => m.mass,
            StoredPoint::Aligned(a) => a.mass,
        }
    }

    pub fn retention_time(&self) -> f64 {
        match self {
            StoredPoint::Single(m) => m.retention_time,
            StoredPoint::Aligned(a) => a.retention_time,
        }
    }

    pub fn intensity(&self) -> f64 {
        match self {
            StoredPoint::Single(m) => m.intensity,
            StoredPoint::Aligned(a) => a.intensity,
        }
    }

    pub fn uid(&self) -> u64 {
        match self {
            StoredPoint::Single(m) => m.uid,
            StoredPoint::Aligned(a) => a.uid,
        }
    }

    pub fn confidence(&self) -> Confidence {
        match self {
            StoredPoint::Single(m) => m.confidence,
            StoredPoint::Aligned(a) => a.confidence(),
        }
    }

    /// Number of per-sample observations backing this record.
    pub fn member_count(&self) -> usize {
        match self {
            StoredPoint::Single(_) => 1,
            StoredPoint::Aligned(a) => a.members.len(),
        }
    }

    pub fn as_aligned(&self) -> Option<&AlignedMoI> {
        match self {
            StoredPoint::Single(_) => None,
            StoredPoint::Aligned(a) => Some(a),
        }
    }
}

/// Indexed container of points supporting mass-range queries, removal and
/// single-writer mutation. One logical owner per sample or per consensus.
#[derive(Clone, Debug, Default)]
pub struct AlignmentStorage {
    arena: Vec<Option<StoredPoint>>,
    mass_index: BTreeMap<OrderedFloat<f64>, Vec<u64>>,
    live: usize,
}

impl AlignmentStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live points.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Insert a raw observation; assigns and returns its uid.
    pub fn insert(&mut self, mut moi: MoI) -> u64 {
        let uid = self.arena.len() as u64;
        moi.uid = uid;
        let mass = moi.mass;
        self.arena.push(Some(StoredPoint::Single(moi)));
        self.index_add(mass, uid);
        self.live += 1;
        uid
    }

    /// Insert a consensus point; assigns and returns its uid.
    pub fn insert_aligned(&mut self, mut aligned: AlignedMoI) -> u64 {
        let uid = self.arena.len() as u64;
        aligned.uid = uid;
        let mass = aligned.mass;
        self.arena.push(Some(StoredPoint::Aligned(aligned)));
        self.index_add(mass, uid);
        self.live += 1;
        uid
    }

    /// Remove a point. Unknown uids are a no-op.
    pub fn remove(&mut self, uid: u64) {
        let Some(slot) = self.arena.get_mut(uid as usize) else {
            return;
        };
        if let Some(point) = slot.take() {
            let mass = point.mass();
            self.index_remove(mass, uid);
            self.live -= 1;
        }
    }

    /// Look up a point. Unknown uids yield `None`.
    pub fn get(&self, uid: u64) -> Option<&StoredPoint> {
        self.arena.get(uid as usize).and_then(|slot| slot.as_ref())
    }

    /// Merge an observation into the record at `uid`, placing it at its
    /// recalibrated coordinates. A raw record is promoted to a consensus
    /// point first. Unknown uids are a no-op.
    pub fn merge_into(&mut self, uid: u64, moi: MoI, cal_mass: f64, cal_rt: f64) {
        let Some(slot) = self.arena.get_mut(uid as usize) else {
            return;
        };
        let Some(point) = slot.take() else {
            return;
        };
        let old_mass = point.mass();
        let mut aligned = match point {
            StoredPoint::Aligned(a) => a,
            StoredPoint::Single(existing) => {
                let (mass, rt) = (existing.mass, existing.retention_time);
                let mut seeded = AlignedMoI::seeded(existing, mass, rt);
                seeded.uid = uid;
                seeded
            }
        };
        debug_assert!(
            !aligned.finished,
            "merge into frozen consensus point {uid}"
        );
        aligned.merge_point(moi, cal_mass, cal_rt);
        let new_mass = aligned.mass;
        *slot = Some(StoredPoint::Aligned(aligned));
        if new_mass != old_mass {
            self.index_remove(old_mass, uid);
            self.index_add(new_mass, uid);
        }
    }

    /// Replace the record at `uid`, keeping its uid. Used to freeze backbone
    /// anchors in place. Unknown uids are a no-op.
    pub fn replace(&mut self, uid: u64, mut point: StoredPoint) {
        let Some(slot) = self.arena.get_mut(uid as usize) else {
            return;
        };
        let Some(old) = slot.take() else {
            return;
        };
        let old_mass = old.mass();
        match &mut point {
            StoredPoint::Single(m) => m.uid = uid,
            StoredPoint::Aligned(a) => a.uid = uid,
        }
        let new_mass = point.mass();
        *slot = Some(point);
        if new_mass != old_mass {
            self.index_remove(old_mass, uid);
            self.index_add(new_mass, uid);
        }
    }

    /// Drop every point for which the predicate returns `false`.
    pub fn retain<F: FnMut(&StoredPoint) -> bool>(&mut self, mut keep: F) {
        let doomed: Vec<u64> = self
            .iter()
            .filter(|p| !keep(p))
            .map(|p| p.uid())
            .collect();
        for uid in doomed {
            self.remove(uid);
        }
    }

    /// Remove all points but keep uid numbering monotonic across reuse.
    pub fn clear(&mut self) {
        for slot in self.arena.iter_mut() {
            *slot = None;
        }
        self.mass_index.clear();
        self.live = 0;
    }

    /// Iterate over all live points. No ordering guarantee.
    pub fn iter(&self) -> impl Iterator<Item = &StoredPoint> {
        self.arena.iter().filter_map(|slot| slot.as_ref())
    }

    /// Owned snapshot of all points with `lo <= mass < hi`, reduced to the
    /// coordinates pairwise matching needs.
    pub fn points_within(&self, lo: f64, hi: f64) -> Vec<PointRef> {
        self.range_uids(lo, hi)
            .filter_map(|uid| self.get(uid))
            .map(PointRef::from_stored)
            .collect()
    }

    /// Like [`points_within`](Self::points_within) but restricted to points
    /// of at least the given confidence.
    pub fn points_within_min_confidence(
        &self,
        lo: f64,
        hi: f64,
        min_confidence: Confidence,
    ) -> Vec<PointRef> {
        self.range_uids(lo, hi)
            .filter_map(|uid| self.get(uid))
            .filter(|p| p.confidence() >= min_confidence)
            .map(PointRef::from_stored)
            .collect()
    }

    fn range_uids(&self, lo: f64, hi: f64) -> impl Iterator<Item = u64> + '_ {
        self.mass_index
            .range((Included(OrderedFloat(lo)), Excluded(OrderedFloat(hi))))
            .flat_map(|(_, uids)| uids.iter().copied())
    }

    fn index_add(&mut self, mass: f64, uid: u64) {
        self.mass_index.entry(OrderedFloat(mass)).or_default().push(uid);
    }

    fn index_remove(&mut self, mass: f64, uid: u64) {
        if let Some(uids) = self.mass_index.get_mut(&OrderedFloat(mass)) {
            uids.retain(|&u| u != uid);
            if uids.is_empty() {
                self.mass_index.remove(&OrderedFloat(mass));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn moi(mass: f64, rt: f64) -> MoI {
        MoI::new(mass, rt, 1.0, 0, Confidence::Confident)
    }

    #[test]
    fn insert_get_remove_roundtrip() {
        let mut storage = AlignmentStorage::new();
        let uid = storage.insert(moi(300.1, 100.0));
        assert_eq!(storage.len(), 1);
        assert_eq!(storage.get(uid).unwrap().mass(), 300.1);
        storage.remove(uid);
        assert!(storage.get(uid).is_none());
        assert_eq!(storage.len(), 0);
        // unknown uid: silent no-op
        storage.remove(9999);
    }

    #[test]
    fn range_query_is_half_open() {
        let mut storage = AlignmentStorage::new();
        storage.insert(moi(299.9, 1.0));
        storage.insert(moi(300.0, 2.0));
        storage.insert(moi(300.5, 3.0));
        storage.insert(moi(301.0, 4.0));
        let hits = storage.points_within(300.0, 301.0);
        let mut masses: Vec<f64> = hits.iter().map(|p| p.mass).collect();
        masses.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(masses, vec![300.0, 300.5]);
    }

    #[test]
    fn merge_promotes_single_and_reindexes() {
        let mut storage = AlignmentStorage::new();
        let uid = storage.insert(moi(300.0, 100.0));
        let mut other = moi(300.5, 102.0);
        other.sample_idx = 1;
        storage.merge_into(uid, other, 300.5, 102.0);
        let point = storage.get(uid).unwrap();
        assert_eq!(point.member_count(), 2);
        // aggregate moved to 300.25; the index must have followed
        assert_eq!(storage.points_within(300.2, 300.3).len(), 1);
        assert!(storage.points_within(299.9, 300.1).is_empty());
    }

    #[test]
    #[should_panic(expected = "frozen")]
    fn merging_into_frozen_point_panics() {
        let mut storage = AlignmentStorage::new();
        let uid = storage.insert_aligned(AlignedMoI::seeded(moi(300.0, 100.0), 300.0, 100.0));
        let frozen = storage
            .get(uid)
            .unwrap()
            .as_aligned()
            .unwrap()
            .finish_merging();
        storage.replace(uid, StoredPoint::Aligned(frozen));
        let mut other = moi(300.1, 101.0);
        other.sample_idx = 1;
        storage.merge_into(uid, other, 300.1, 101.0);
    }

    #[test]
    fn retain_prunes_by_predicate() {
        let mut storage = AlignmentStorage::new();
        storage.insert(moi(100.0, 1.0));
        storage.insert(moi(200.0, 2.0));
        storage.retain(|p| p.mass() > 150.0);
        assert_eq!(storage.len(), 1);
        assert_eq!(storage.iter().next().unwrap().mass(), 200.0);
    }
}
