//! Retention-time alignment and feature extraction for LC-MS runs.
//!
//! The crate aligns masses of interest (MoIs) from many samples onto one
//! consensus retention-time axis: adaptive mass bins shard the work, a
//! greedy one-to-one matcher merges points per bin, per-sample
//! recalibration functions are fitted against backbone anchors, and a
//! second pass folds all remaining points onto the frozen backbone. The
//! resulting consensus traces are segmented by topological persistence and
//! resolved back onto each contributing sample as aligned features.

pub mod align;
pub mod error;
pub mod scheduler;
pub mod stats;
pub mod trace;

pub use error::{Error, Result};
pub use scheduler::Scheduler;
