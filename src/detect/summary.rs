use serde::{Deserialize, Serialize};

/// Inference metrics snapshot.
///
/// Timings and fps come from the engine; `cpu_usage_percent` is computed
/// locally by the metrics poller and merged in before publishing.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectSummary {
    pub total_time_ms: f32,
    pub infer_time_ms: f32,
    pub fps: f32,
    pub log_text: String,
    pub cpu_usage_percent: f32,
}

impl DetectSummary {
    pub fn new(total_time_ms: f32, infer_time_ms: f32, fps: f32, log_text: impl Into<String>) -> Self {
        Self {
            total_time_ms,
            infer_time_ms,
            fps,
            log_text: log_text.into(),
            cpu_usage_percent: 0.0,
        }
    }

    pub fn with_cpu_usage(mut self, cpu_usage_percent: f32) -> Self {
        self.cpu_usage_percent = non_negative(cpu_usage_percent);
        self
    }

    /// `infer_time_ms <= total_time_ms` for a snapshot taken in one tick.
    pub fn is_consistent(&self) -> bool {
        self.infer_time_ms <= self.total_time_ms
    }

    /// Clamp negative or non-finite engine values to zero.
    ///
    /// An inconsistent infer/total pair is a data-quality condition: it is
    /// logged and kept as reported.
    pub fn sanitized(mut self) -> Self {
        let raw = (self.total_time_ms, self.infer_time_ms, self.fps);
        self.total_time_ms = non_negative(self.total_time_ms);
        self.infer_time_ms = non_negative(self.infer_time_ms);
        self.fps = non_negative(self.fps);
        self.cpu_usage_percent = non_negative(self.cpu_usage_percent);
        if raw != (self.total_time_ms, self.infer_time_ms, self.fps) {
            log::warn!(
                "DetectSummary: clamped invalid engine values total={} infer={} fps={}",
                raw.0,
                raw.1,
                raw.2
            );
        }
        if !self.is_consistent() {
            log::warn!(
                "DetectSummary: infer time {:.1}ms exceeds total time {:.1}ms",
                self.infer_time_ms,
                self.total_time_ms
            );
        }
        self
    }
}

fn non_negative(value: f32) -> f32 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}
