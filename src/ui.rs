use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::detect::DetectSummary;
use crate::frame::Frame;

const PLACEHOLDER: &str = "--";
const EMPTY_LOG_TEXT: &str = "Detect_Info: 0 target";

/// Display-side boundary implemented by the surrounding application.
///
/// Called only from the consumer thread.
pub trait UiSink {
    /// Takes ownership of the frame; it is released when the sink drops it.
    fn show_frame(&self, frame: Frame);

    fn show_status(&self, text: &str);

    fn show_error(&self, text: &str);

    fn update_metrics(&self, summary: &DetectSummary);

    /// Replace the metrics display with the "no data" placeholder.
    fn clear_metrics(&self);

    fn update_connection_state(&self, connected: bool);

    fn switch_to_preview_view(&self);

    fn switch_to_result_view(&self);
}

/// Display strings for one metrics snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricsText {
    pub total: String,
    pub infer: String,
    pub fps: String,
    pub cpu: String,
    pub log: String,
}

impl MetricsText {
    pub fn from_summary(summary: &DetectSummary) -> Self {
        let log = summary.log_text.trim();
        Self {
            total: format!("{:.0}ms", summary.total_time_ms),
            infer: format!("{:.0}ms", summary.infer_time_ms),
            fps: format!("{:.1}", summary.fps),
            cpu: format!("{:.1}%", summary.cpu_usage_percent),
            log: if log.is_empty() {
                EMPTY_LOG_TEXT.to_string()
            } else {
                log.to_string()
            },
        }
    }

    pub fn placeholder() -> Self {
        Self {
            total: PLACEHOLDER.to_string(),
            infer: PLACEHOLDER.to_string(),
            fps: PLACEHOLDER.to_string(),
            cpu: PLACEHOLDER.to_string(),
            log: PLACEHOLDER.to_string(),
        }
    }
}

impl fmt::Display for MetricsText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total={} infer={} fps={} cpu={} | {}",
            self.total, self.infer, self.fps, self.cpu, self.log
        )
    }
}

// ----------------------------------------------------------------------------
// LogUi
// ----------------------------------------------------------------------------

/// Headless sink that reports everything through the log facade.
#[derive(Default)]
pub struct LogUi {
    frames: AtomicU64,
}

impl LogUi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_shown(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

impl UiSink for LogUi {
    fn show_frame(&self, frame: Frame) {
        let shown = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!(
            "ui: frame #{} {}x{} with {} boxes ({}ms old)",
            shown,
            frame.width,
            frame.height,
            frame.boxes.len(),
            frame.age().as_millis()
        );
    }

    fn show_status(&self, text: &str) {
        log::info!("ui: {}", text);
    }

    fn show_error(&self, text: &str) {
        log::error!("ui: {}", text);
    }

    fn update_metrics(&self, summary: &DetectSummary) {
        log::info!("ui: {}", MetricsText::from_summary(summary));
    }

    fn clear_metrics(&self) {
        log::info!("ui: {}", MetricsText::placeholder());
    }

    fn update_connection_state(&self, connected: bool) {
        log::info!(
            "ui: stream {}",
            if connected { "connected" } else { "disconnected" }
        );
    }

    fn switch_to_preview_view(&self) {
        log::debug!("ui: preview view");
    }

    fn switch_to_result_view(&self) {
        log::debug!("ui: result view");
    }
}

// ----------------------------------------------------------------------------
// RecordingUi
// ----------------------------------------------------------------------------

/// What a `RecordingUi` saw. Frames are recorded by shape and dropped.
#[derive(Clone, Debug, PartialEq)]
pub enum UiEvent {
    Frame { width: u32, height: u32, boxes: usize },
    Status(String),
    Error(String),
    Metrics(DetectSummary),
    MetricsCleared,
    Connection(bool),
    PreviewView,
    ResultView,
}

/// Sink that records every call. Clones share the same record.
#[derive(Clone, Default)]
pub struct RecordingUi {
    events: Arc<Mutex<Vec<UiEvent>>>,
}

impl RecordingUi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<UiEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    pub fn count(&self, matches: impl Fn(&UiEvent) -> bool) -> usize {
        self.events().iter().filter(|event| matches(event)).count()
    }

    fn push(&self, event: UiEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}

impl UiSink for RecordingUi {
    fn show_frame(&self, frame: Frame) {
        self.push(UiEvent::Frame {
            width: frame.width,
            height: frame.height,
            boxes: frame.boxes.len(),
        });
    }

    fn show_status(&self, text: &str) {
        self.push(UiEvent::Status(text.to_string()));
    }

    fn show_error(&self, text: &str) {
        self.push(UiEvent::Error(text.to_string()));
    }

    fn update_metrics(&self, summary: &DetectSummary) {
        self.push(UiEvent::Metrics(summary.clone()));
    }

    fn clear_metrics(&self) {
        self.push(UiEvent::MetricsCleared);
    }

    fn update_connection_state(&self, connected: bool) {
        self.push(UiEvent::Connection(connected));
    }

    fn switch_to_preview_view(&self) {
        self.push(UiEvent::PreviewView);
    }

    fn switch_to_result_view(&self) {
        self.push(UiEvent::ResultView);
    }
}
