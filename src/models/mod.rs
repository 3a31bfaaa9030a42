pub mod analysis;
pub mod dimension;
pub mod page;
pub mod report;
pub mod viewport;

pub use analysis::{AnalysisResult, AnalysisStatus, CacheEntry, ScoreCard};
pub use dimension::{parse_dimension_list, Dimension, DimensionScores};
pub use page::{CaptureKey, CaptureResult, CaptureStatus, Fingerprint, PageTask};
pub use report::{
    AbortReason, CaptureFailure, DimensionScore, Grade, GradeScale, Insights, PageReport,
    PageStage, PageStatus, RunOutcome, RunStats, RunSummary,
};
pub use viewport::Viewport;
