//! Synthetic inference engine.
//!
//! `StubEngine` stands in for the native engine: it records every boundary
//! call, keeps a rolling `DetectSummary`, and serves synthetic streams.
//!
//! - Threaded mode (`StubEngine::new`): each stream runs on its own thread and
//!   produces frames with random boxes. Video files finish after a bounded
//!   number of frames; `stub://` network streams run until stopped.
//! - Manual mode (`StubEngine::manual`): no threads. The sink handed to
//!   `start_streamed_detect` is kept so the caller can drive it directly.

use anyhow::{anyhow, bail, Result};
use rand::Rng;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{EngineSink, InferenceEngine, StreamRequest, StreamSource, SurfaceHandle};
use crate::config::{CameraFacing, DeviceType, InputSize};
use crate::detect::{DetectSummary, DetectionBox};
use crate::frame::Frame;

const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_VIDEO_FRAMES: u64 = 50;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const MAX_SYNTHETIC_BOXES: usize = 3;

/// One recorded boundary call.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineCall {
    LoadModel {
        model_id: u32,
        device: DeviceType,
        input_size: InputSize,
    },
    OpenCamera(CameraFacing),
    CloseCamera,
    SetOutputSurface(SurfaceHandle),
    SetThreshold(f32),
    SetNms(f32),
    SetTrackEnabled(bool),
    SetShaderEnabled(bool),
    SetDetectEnabled(bool),
    DetectImage { input_size: u32 },
    StartStream(StreamSource),
    StopStream,
}

#[derive(Clone, Debug)]
struct StubSettings {
    threaded: bool,
    frame_interval: Duration,
    video_frames: u64,
    width: u32,
    height: u32,
}

#[derive(Default)]
struct StubState {
    calls: Vec<EngineCall>,
    camera_open: bool,
    detect_enabled: bool,
    streaming: bool,
    summary: Option<DetectSummary>,
    fail_model_load: bool,
    fail_stream_start: Option<String>,
    fail_image: Option<String>,
    manual_sink: Option<EngineSink>,
}

struct StreamWorker {
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

pub struct StubEngine {
    settings: StubSettings,
    state: Arc<Mutex<StubState>>,
    worker: Mutex<Option<StreamWorker>>,
}

impl StubEngine {
    /// Threaded synthetic engine.
    pub fn new() -> Self {
        Self::with_settings(StubSettings {
            threaded: true,
            frame_interval: DEFAULT_FRAME_INTERVAL,
            video_frames: DEFAULT_VIDEO_FRAMES,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
        })
    }

    /// Engine that never spawns threads; streams are driven through `stream_sink()`.
    pub fn manual() -> Self {
        Self::with_settings(StubSettings {
            threaded: false,
            frame_interval: DEFAULT_FRAME_INTERVAL,
            video_frames: DEFAULT_VIDEO_FRAMES,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
        })
    }

    fn with_settings(settings: StubSettings) -> Self {
        Self {
            settings,
            state: Arc::new(Mutex::new(StubState::default())),
            worker: Mutex::new(None),
        }
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.settings.frame_interval = interval;
        self
    }

    pub fn with_video_frames(mut self, frames: u64) -> Self {
        self.settings.video_frames = frames;
        self
    }

    pub fn with_frame_size(mut self, width: u32, height: u32) -> Self {
        self.settings.width = width;
        self.settings.height = height;
        self
    }

    pub fn fail_model_load(&self, fail: bool) {
        self.lock().fail_model_load = fail;
    }

    pub fn fail_next_stream_start(&self, message: impl Into<String>) {
        self.lock().fail_stream_start = Some(message.into());
    }

    pub fn fail_next_image(&self, message: impl Into<String>) {
        self.lock().fail_image = Some(message.into());
    }

    pub fn set_summary(&self, summary: Option<DetectSummary>) {
        self.lock().summary = summary;
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn count_calls(&self, matches: impl Fn(&EngineCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|call| matches(call)).count()
    }

    /// Sink of the current stream (manual mode only).
    pub fn stream_sink(&self) -> Option<EngineSink> {
        self.lock().manual_sink.clone()
    }

    pub fn is_camera_open(&self) -> bool {
        self.lock().camera_open
    }

    pub fn is_streaming(&self) -> bool {
        self.lock().streaming
    }

    pub fn detect_enabled(&self) -> bool {
        self.lock().detect_enabled
    }

    fn record(&self, call: EngineCall) {
        self.lock().calls.push(call);
    }

    fn lock(&self) -> MutexGuard<'_, StubState> {
        lock_state(&self.state)
    }

    fn spawn_worker(&self, request: StreamRequest, sink: EngineSink) -> Result<()> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);
        let state = Arc::clone(&self.state);
        let settings = self.settings.clone();
        let join = std::thread::Builder::new()
            .name("stub-stream".to_string())
            .spawn(move || run_stream(request, sink, stop_thread, state, settings))
            .map_err(|e| anyhow!("failed to spawn stream thread: {}", e))?;

        let mut worker = self.worker.lock().unwrap_or_else(|p| p.into_inner());
        *worker = Some(StreamWorker { stop, join });
        Ok(())
    }
}

impl Default for StubEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StubEngine {
    fn drop(&mut self) {
        stop_worker(&self.worker);
    }
}

impl InferenceEngine for StubEngine {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn load_model(
        &self,
        _assets_dir: &Path,
        model_id: u32,
        device: DeviceType,
        input_size: InputSize,
    ) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(EngineCall::LoadModel {
            model_id,
            device,
            input_size,
        });
        if state.fail_model_load {
            bail!("model {} failed to load on {:?}", model_id, device);
        }
        Ok(())
    }

    fn open_camera(&self, facing: CameraFacing) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(EngineCall::OpenCamera(facing));
        state.camera_open = true;
        Ok(())
    }

    fn close_camera(&self) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(EngineCall::CloseCamera);
        state.camera_open = false;
        Ok(())
    }

    fn set_output_surface(&self, surface: SurfaceHandle) -> Result<()> {
        self.record(EngineCall::SetOutputSurface(surface));
        Ok(())
    }

    fn set_threshold(&self, threshold: f32) {
        self.record(EngineCall::SetThreshold(threshold));
    }

    fn set_nms(&self, nms_threshold: f32) {
        self.record(EngineCall::SetNms(nms_threshold));
    }

    fn set_track_enabled(&self, enabled: bool) {
        self.record(EngineCall::SetTrackEnabled(enabled));
    }

    fn set_shader_enabled(&self, enabled: bool) {
        self.record(EngineCall::SetShaderEnabled(enabled));
    }

    fn set_detect_enabled(&self, enabled: bool) {
        let mut state = self.lock();
        state.calls.push(EngineCall::SetDetectEnabled(enabled));
        state.detect_enabled = enabled;
    }

    fn detect_image(&self, image: Frame, input_size: u32) -> Result<Frame> {
        let started = Instant::now();
        {
            let mut state = self.lock();
            state.calls.push(EngineCall::DetectImage { input_size });
            if let Some(message) = state.fail_image.take() {
                bail!(message);
            }
        }

        let mut result = Frame::try_alloc(image.width, image.height, 3)?;
        let len = result.byte_len().min(image.byte_len());
        result.pixels_mut()[..len].copy_from_slice(&image.pixels()[..len]);
        let boxes = synthetic_boxes(&mut rand::thread_rng(), image.width, image.height);
        let count = boxes.len();
        drop(image);

        let total_ms = started.elapsed().as_secs_f32() * 1000.0;
        self.lock().summary = Some(DetectSummary::new(
            total_ms,
            total_ms,
            0.0,
            format!("Detect_Info: {} target", count),
        ));
        Ok(result.with_boxes(boxes))
    }

    fn start_streamed_detect(&self, request: StreamRequest, sink: EngineSink) -> Result<()> {
        {
            let mut state = self.lock();
            state.calls.push(EngineCall::StartStream(request.source.clone()));
            if let Some(message) = state.fail_stream_start.take() {
                bail!(message);
            }
            if state.streaming {
                bail!("stream already running");
            }
            if let StreamSource::Network(url) = &request.source {
                if !url.starts_with("stub://") {
                    bail!("stub engine only serves stub:// network streams, got {}", url);
                }
            }
            state.streaming = true;
            if !self.settings.threaded {
                state.manual_sink = Some(sink);
                return Ok(());
            }
        }

        log::info!(
            "StubEngine: streaming {} at {}px",
            request.source.describe(),
            request.input_size
        );
        if let Err(err) = self.spawn_worker(request, sink) {
            self.lock().streaming = false;
            return Err(err);
        }
        Ok(())
    }

    fn stop_stream(&self) {
        {
            let mut state = self.lock();
            state.calls.push(EngineCall::StopStream);
            state.manual_sink = None;
        }
        stop_worker(&self.worker);
        self.lock().streaming = false;
    }

    fn detect_summary(&self) -> Option<DetectSummary> {
        self.lock().summary.clone()
    }
}

fn lock_state(state: &Mutex<StubState>) -> MutexGuard<'_, StubState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn stop_worker(worker: &Mutex<Option<StreamWorker>>) {
    let taken = worker.lock().unwrap_or_else(|p| p.into_inner()).take();
    let Some(worker) = taken else {
        return;
    };
    worker.stop.store(true, Ordering::SeqCst);
    // A sink callback can end up stopping the stream from the worker itself.
    if worker.join.thread().id() == std::thread::current().id() {
        return;
    }
    if worker.join.join().is_err() {
        log::error!("StubEngine: stream thread panicked");
    }
}

fn run_stream(
    request: StreamRequest,
    sink: EngineSink,
    stop: Arc<AtomicBool>,
    state: Arc<Mutex<StubState>>,
    settings: StubSettings,
) {
    let network = matches!(request.source, StreamSource::Network(_));
    let mut rng = rand::thread_rng();
    let started = Instant::now();
    let mut frames: u64 = 0;

    if network {
        sink.on_connection_changed(true);
    }

    while !stop.load(Ordering::SeqCst) {
        std::thread::sleep(settings.frame_interval);
        if stop.load(Ordering::SeqCst) {
            break;
        }
        if !network && frames >= settings.video_frames {
            lock_state(&state).streaming = false;
            sink.on_finish();
            return;
        }

        let tick = Instant::now();
        // Network streams only detect when enabled; video detection always runs.
        let detecting = !network || lock_state(&state).detect_enabled;
        let mut frame = match Frame::try_alloc(settings.width, settings.height, 3) {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("StubEngine: dropping frame: {}", err);
                continue;
            }
        };
        fill_synthetic_pixels(frame.pixels_mut(), frames);
        if detecting {
            let boxes = synthetic_boxes(&mut rng, settings.width, settings.height);
            let count = boxes.len();
            frame = frame.with_boxes(boxes);

            let infer_ms: f32 = rng.gen_range(5.0..20.0);
            let overhead_ms: f32 = rng.gen_range(1.0..4.0);
            let total_ms = infer_ms + tick.elapsed().as_secs_f32() * 1000.0 + overhead_ms;
            let elapsed = started.elapsed().as_secs_f32();
            let fps = if elapsed > 0.0 {
                (frames + 1) as f32 / elapsed
            } else {
                0.0
            };
            lock_state(&state).summary = Some(DetectSummary::new(
                total_ms,
                infer_ms,
                fps,
                format!("Detect_Info: {} target", count),
            ));
        }
        frames += 1;
        sink.on_frame(frame);
    }

    if network {
        sink.on_connection_changed(false);
    }
}

fn fill_synthetic_pixels(pixels: &mut [u8], frame_index: u64) {
    for (i, pixel) in pixels.iter_mut().enumerate() {
        *pixel = ((i as u64 + frame_index) % 256) as u8;
    }
}

fn synthetic_boxes(rng: &mut impl Rng, width: u32, height: u32) -> Vec<DetectionBox> {
    let width = width.max(4) as f32;
    let height = height.max(4) as f32;
    let count = rng.gen_range(0..=MAX_SYNTHETIC_BOXES);
    (0..count)
        .map(|_| {
            let left = rng.gen_range(0.0..width / 2.0);
            let top = rng.gen_range(0.0..height / 2.0);
            let right = left + rng.gen_range(1.0..width / 2.0);
            let bottom = top + rng.gen_range(1.0..height / 2.0);
            DetectionBox::new(left, top, right, bottom)
                .with_class(rng.gen_range(0..80), rng.gen_range(0.3..0.99))
        })
        .collect()
}
