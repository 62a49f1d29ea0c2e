//! Masses of interest: the per-sample observations fed into alignment and
//! the consensus points produced by merging them.

use serde::{Deserialize, Serialize};

/// Confidence tag assigned during per-run preprocessing. Ordered: a
/// `Confident` point is also good enough for every lower tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Confidence {
    /// Likely noise; kept only as potential evidence in the full pass.
    Low,
    /// Not feature-worthy on its own but usable as an alignment landmark.
    KeepForAlignment,
    /// High-quality trace apex; drives the first alignment pass.
    Confident,
}

/// A single detected chromatographic point candidate in one sample.
///
/// Immutable after creation; `uid` is assigned when the point enters an
/// [`AlignmentStorage`](crate::align::storage::AlignmentStorage) and is
/// unique within that store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MoI {
    pub mass: f64,
    pub retention_time: f64,
    pub intensity: f64,
    pub sample_idx: i32,
    pub confidence: Confidence,
    pub has_isotopes: bool,
    /// Handle into the external trace storage this point was picked from.
    pub trace_id: i64,
    /// Assigned by storage on insertion; 0 until then.
    pub uid: u64,
}

impl MoI {
    pub fn new(
        mass: f64,
        retention_time: f64,
        intensity: f64,
        sample_idx: i32,
        confidence: Confidence,
    ) -> Self {
        MoI {
            mass,
            retention_time,
            intensity,
            sample_idx,
            confidence,
            has_isotopes: false,
            trace_id: -1,
            uid: 0,
        }
    }

    pub fn with_isotopes(mut self, has_isotopes: bool) -> Self {
        self.has_isotopes = has_isotopes;
        self
    }

    pub fn with_trace_id(mut self, trace_id: i64) -> Self {
        self.trace_id = trace_id;
        self
    }
}

/// A consensus point owning the per-sample observations merged into it.
///
/// Members keep their raw (pre-recalibration) coordinates; the aggregate
/// `mass`/`retention_time` are intensity-weighted means over the members'
/// *recalibrated* coordinates and are what later matching runs against.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AlignedMoI {
    pub mass: f64,
    pub retention_time: f64,
    /// Summed member intensity; also the weight denominator.
    pub intensity: f64,
    pub uid: u64,
    /// At most one member per sample index, sorted by sample index.
    pub members: Vec<MoI>,
    /// Set once the orchestrator freezes this point as a backbone anchor.
    pub finished: bool,
}

impl AlignedMoI {
    /// Start a consensus point from one observation, placed at its
    /// recalibrated coordinates.
    pub fn seeded(moi: MoI, cal_mass: f64, cal_rt: f64) -> Self {
        AlignedMoI {
            mass: cal_mass,
            retention_time: cal_rt,
            intensity: moi.intensity,
            uid: 0,
            members: vec![moi],
            finished: false,
        }
    }

    /// Merge one more observation into this consensus point at its
    /// recalibrated coordinates.
    ///
    /// Re-merging the identical observation is a no-op, which makes a second
    /// alignment pass over already-merged data idempotent. A *different*
    /// observation carrying an already-present sample index is a programming
    /// error and panics.
    pub fn merge_point(&mut self, moi: MoI, cal_mass: f64, cal_rt: f64) {
        if let Some(existing) = self.for_sample_idx(moi.sample_idx) {
            if existing.mass == moi.mass && existing.retention_time == moi.retention_time {
                return;
            }
            panic!(
                "duplicate sample index {} in aligned point {}",
                moi.sample_idx, self.uid
            );
        }
        let total = self.intensity + moi.intensity;
        debug_assert!(total > 0.0);
        self.mass = (self.mass * self.intensity + cal_mass * moi.intensity) / total;
        self.retention_time =
            (self.retention_time * self.intensity + cal_rt * moi.intensity) / total;
        self.intensity = total;
        let pos = self
            .members
            .partition_point(|m| m.sample_idx < moi.sample_idx);
        self.members.insert(pos, moi);
    }

    /// The member contributed by `sample_idx`, if any.
    pub fn for_sample_idx(&self, sample_idx: i32) -> Option<&MoI> {
        self.members
            .binary_search_by_key(&sample_idx, |m| m.sample_idx)
            .ok()
            .map(|i| &self.members[i])
    }

    /// Highest confidence among the members.
    pub fn confidence(&self) -> Confidence {
        self.members
            .iter()
            .map(|m| m.confidence)
            .max()
            .unwrap_or(Confidence::Low)
    }

    /// Whether any member carries isotope evidence.
    pub fn has_isotopes(&self) -> bool {
        self.members.iter().any(|m| m.has_isotopes)
    }

    /// Freeze this point as a backbone anchor. The frozen copy keeps the
    /// aggregate coordinates and is never merged into again.
    pub fn finish_merging(&self) -> AlignedMoI {
        let mut frozen = self.clone();
        frozen.finished = true;
        frozen
    }
}
