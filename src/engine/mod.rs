//! Inference engine boundary.
//!
//! The engine owns model execution, camera capture and video decode. This crate
//! reaches it only through `InferenceEngine`, an injected dependency, and hears
//! back from it only through `EngineSink`, which turns engine callbacks into
//! messages on the display thread's queue.

mod sink;
pub mod stub;

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::config::{CameraFacing, DeviceType, InputSize};
use crate::detect::DetectSummary;
use crate::frame::Frame;

pub use sink::EngineSink;
pub use stub::{EngineCall, StubEngine};

/// Opaque handle to the display surface the engine renders camera preview into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SurfaceHandle(pub u64);

/// Where a streamed detection reads from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamSource {
    VideoFile(PathBuf),
    Network(String),
}

impl StreamSource {
    pub fn describe(&self) -> String {
        match self {
            Self::VideoFile(path) => path.display().to_string(),
            Self::Network(url) => url.clone(),
        }
    }
}

/// Parameters for `InferenceEngine::start_streamed_detect`.
#[derive(Clone, Debug)]
pub struct StreamRequest {
    pub source: StreamSource,
    pub input_size: u32,
    pub assets_dir: PathBuf,
    pub model_id: u32,
    pub device: DeviceType,
}

/// Non-frame events an engine reports while streaming.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    /// A video file reached its end.
    Finished,
    /// The engine stopped the stream on its own.
    StreamStopped,
    Error(String),
    ConnectionChanged(bool),
}

/// Operations the session needs from the inference engine.
///
/// Implementations are shared between the display thread and short-lived
/// worker threads, so every method takes `&self`.
pub trait InferenceEngine: Send + Sync {
    /// Engine identifier for logs.
    fn name(&self) -> &'static str;

    fn load_model(
        &self,
        assets_dir: &Path,
        model_id: u32,
        device: DeviceType,
        input_size: InputSize,
    ) -> Result<()>;

    fn open_camera(&self, facing: CameraFacing) -> Result<()>;

    fn close_camera(&self) -> Result<()>;

    fn set_output_surface(&self, surface: SurfaceHandle) -> Result<()>;

    fn set_threshold(&self, threshold: f32);

    fn set_nms(&self, nms_threshold: f32);

    fn set_track_enabled(&self, enabled: bool);

    fn set_shader_enabled(&self, enabled: bool);

    fn set_detect_enabled(&self, enabled: bool);

    /// Synchronous one-shot inference. Consumes the input image.
    fn detect_image(&self, image: Frame, input_size: u32) -> Result<Frame>;

    /// Start decoding and detecting `request.source` on engine-owned threads.
    ///
    /// Frames and events must be reported through `sink`.
    fn start_streamed_detect(&self, request: StreamRequest, sink: EngineSink) -> Result<()>;

    /// Stop the current stream. Must be safe to call when nothing is streaming.
    fn stop_stream(&self);

    /// Latest inference metrics, if the engine has any.
    fn detect_summary(&self) -> Option<DetectSummary>;
}
