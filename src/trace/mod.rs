pub mod features;
pub mod segmentation;

// Re-export commonly used types
pub use features::{AlignedFeature, FeatureSample, SampleContribution, ScanPointInterpolator};
pub use segmentation::{
    detect_segments, MergedTrace, SegmentationConfig, Smoothing, Trace, TraceSegment,
};
