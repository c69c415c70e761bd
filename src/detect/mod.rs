mod result;
mod summary;

pub use result::DetectionBox;
pub use summary::DetectSummary;
