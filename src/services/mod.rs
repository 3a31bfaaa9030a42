pub mod image_optimizer;
pub mod page_capturer;
pub mod report_writer;
pub mod url_source;
pub mod vision_scorer;

pub use image_optimizer::{optimize_image, ImageLimits, PreparedImage};
pub use page_capturer::{CapturedImage, ChromiumCapturer, PageCapturer};
pub use report_writer::ReportWriter;
pub use url_source::{FileUrlSource, StaticUrlSource, UrlCandidate, UrlSource};
pub use vision_scorer::{OpenAiVisionScorer, PromptProfile, VisionScorer};
