use serde::{Deserialize, Serialize};

/// One detection box in source-image pixel space.
///
/// Class id and confidence come from the engine and are passed through verbatim.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    pub class_id: Option<i32>,
    pub confidence: Option<f32>,
}

impl DetectionBox {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
            class_id: None,
            confidence: None,
        }
    }

    pub fn with_class(mut self, class_id: i32, confidence: f32) -> Self {
        self.class_id = Some(class_id);
        self.confidence = Some(confidence);
        self
    }

    pub fn width(&self) -> f32 {
        (self.right - self.left).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.bottom - self.top).max(0.0)
    }
}
