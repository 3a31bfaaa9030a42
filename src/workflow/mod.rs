pub mod aggregator;
pub mod analysis_stage;
pub mod capture_stage;
pub mod events;

pub use aggregator::{Aggregator, PageRecord, RunMeta};
pub use analysis_stage::AnalysisStage;
pub use capture_stage::CaptureStage;
pub use events::{CaptureJob, CaptureOutcome, StageEvent};
