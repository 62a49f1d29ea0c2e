pub mod backbone;
pub mod bins;
pub mod greedy;
pub mod moi;
pub mod pairwise;
pub mod recalibrate;
pub mod scorer;
pub mod storage;

// Re-export commonly used types
pub use backbone::{AlignmentBackbone, AlignmentStatistics, MassDeviation, ScanPointMapping};
pub use greedy::{AlignerConfig, GreedyTwoStageAligner, SampleData};
pub use moi::{AlignedMoI, Confidence, MoI};
pub use pairwise::{AlignAction, PointRef};
pub use recalibrate::{fit_recalibration, RecalibrationFunction, SampleRecalibration};
pub use scorer::AlignmentScorer;
pub use storage::{AlignmentStorage, StoredPoint};
