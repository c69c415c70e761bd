//! Detection session core
//!
//! Session coordination and frame delivery for a live visual-detection client.
//! Model inference, capture and decode live in an external engine reached
//! through the `InferenceEngine` trait; this crate decides which source is
//! active, hands engine frames to a single display consumer, and polls
//! inference and CPU metrics while detection runs.
//!
//! # Module Structure
//!
//! - `frame`: `Frame` ownership and the latest-wins `FrameChannel`
//! - `detect`: detection boxes and `DetectSummary`
//! - `config`: inference parameters and session configuration loading
//! - `engine`: engine boundary, `EngineSink`, and the synthetic `StubEngine`
//! - `metrics`: `MetricsPoller`, CPU sampling, `SummaryCache`
//! - `session`: the `DetectionSession` state machine
//! - `controller`: `SessionController`, the consumer-thread façade
//! - `ui`: display boundary (`UiSink`) and metrics formatting
//! - `media`: local video file checks

pub mod config;
pub mod controller;
pub mod detect;
pub mod engine;
pub mod frame;
pub mod media;
pub mod metrics;
pub mod session;
pub mod ui;

pub use config::{CameraFacing, DeviceType, InferenceConfig, InputSize, SessionConfig, Tunables};
pub use controller::SessionController;
pub use detect::{DetectSummary, DetectionBox};
pub use engine::{
    EngineCall, EngineEvent, EngineSink, InferenceEngine, StreamRequest, StreamSource, StubEngine,
    SurfaceHandle,
};
pub use frame::{ChannelStats, Frame, FrameChannel, PushOutcome};
pub use metrics::{
    cpu_percent, CpuSampler, MetricsPoller, ProcessCpuSampler, SummaryCache, METRICS_INTERVAL,
};
pub use session::{DetectionSession, ModeRequest, RequestOutcome, SessionState, StreamStats};
pub use ui::{LogUi, MetricsText, RecordingUi, UiEvent, UiSink};
