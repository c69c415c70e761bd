//! Detection session state machine.
//!
//! `DetectionSession` is the single source of truth for which source is
//! active. Every mode change goes through `request()` (or one of the
//! engine-driven exits below), and each transition performs its engine side
//! effects before the state is committed. A failed engine call leaves the
//! session in the nearest safe state (`CameraPreview` or `Idle`), never in a
//! detecting state with a dead engine.
//!
//! Each change of source bumps the session epoch. Sinks and image jobs carry
//! the epoch they started under, so late output from a retired source is
//! dropped instead of reaching the display.

use anyhow::{anyhow, bail, Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{InferenceConfig, Tunables};
use crate::controller::Message;
use crate::detect::DetectSummary;
use crate::engine::{EngineSink, InferenceEngine, StreamRequest, StreamSource, SurfaceHandle};
use crate::frame::{ChannelStats, Frame, FrameChannel};
use crate::media;
use crate::metrics::{CpuSampler, MetricsPoller, SummaryCache};
use crate::ui::UiSink;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SessionState {
    #[default]
    Idle,
    CameraPreview,
    CameraDetect,
    ImageDetect,
    VideoDetect,
    NetworkPreview,
    NetworkDetect,
}

impl SessionState {
    /// States in which the engine runs continuous detection and the poller ticks.
    pub fn is_detecting(self) -> bool {
        matches!(
            self,
            Self::CameraDetect | Self::VideoDetect | Self::NetworkDetect
        )
    }

    pub fn is_camera(self) -> bool {
        matches!(self, Self::CameraPreview | Self::CameraDetect)
    }

    pub fn is_network(self) -> bool {
        matches!(self, Self::NetworkPreview | Self::NetworkDetect)
    }

    /// States backed by an engine stream (video file or network).
    pub fn is_streaming(self) -> bool {
        matches!(
            self,
            Self::VideoDetect | Self::NetworkPreview | Self::NetworkDetect
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::CameraPreview => "camera preview",
            Self::CameraDetect => "camera detection",
            Self::ImageDetect => "image detection",
            Self::VideoDetect => "video detection",
            Self::NetworkPreview => "network preview",
            Self::NetworkDetect => "network detection",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A mode change asked for by the UI layer.
///
/// Requests name the target mode. Asking for the mode already active is a
/// benign no-op; `CameraPreview` from `CameraDetect` and `NetworkPreview` from
/// `NetworkDetect` switch detection off.
#[derive(Debug)]
pub enum ModeRequest {
    /// The display surface became available or changed.
    SurfaceReady(SurfaceHandle),
    /// The display surface went away; the camera cannot stay open without it.
    SurfaceDestroyed,
    CameraPreview,
    CameraDetect,
    ImageDetect { image: Frame },
    VideoDetect { path: PathBuf },
    NetworkPreview { url: String },
    NetworkDetect,
    Idle,
}

impl ModeRequest {
    /// Video request for a file that passed the media checks.
    pub fn video(path: impl AsRef<Path>) -> Result<Self> {
        let path = media::validate_video_file(path.as_ref())?;
        Ok(Self::VideoDetect { path })
    }

    pub fn network(url: impl Into<String>) -> Result<Self> {
        let url = url.into().trim().to_string();
        if url.is_empty() {
            bail!("stream URL is empty");
        }
        Ok(Self::NetworkPreview { url })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SurfaceReady(_) => "surface ready",
            Self::SurfaceDestroyed => "surface destroyed",
            Self::CameraPreview => "camera preview",
            Self::CameraDetect => "camera detection",
            Self::ImageDetect { .. } => "image detection",
            Self::VideoDetect { .. } => "video detection",
            Self::NetworkPreview { .. } => "network preview",
            Self::NetworkDetect => "network detection",
            Self::Idle => "stop",
        }
    }
}

/// Result of a mode request that did not hit an engine failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestOutcome {
    Applied(String),
    /// Already in the requested mode; nothing changed.
    AlreadyActive(String),
    /// A conflicting operation is in flight; nothing changed.
    Busy(String),
    /// Not legal from the current state; nothing changed.
    Invalid(String),
}

impl RequestOutcome {
    pub fn message(&self) -> &str {
        match self {
            Self::Applied(msg) | Self::AlreadyActive(msg) | Self::Busy(msg) | Self::Invalid(msg) => {
                msg
            }
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

/// One-shot inference handed to a worker thread.
pub(crate) struct ImageJob {
    pub epoch: u64,
    pub image: Frame,
    pub input_size: u32,
}

pub(crate) enum Step {
    Done(RequestOutcome),
    Image {
        outcome: RequestOutcome,
        job: ImageJob,
    },
}

/// Delivery figures for one finished stream.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamStats {
    pub source: StreamSource,
    pub frames: u64,
    pub duration: Duration,
    pub fps: f32,
}

/// `frames * 1000 / duration_ms`, 0 for an empty duration.
pub fn stream_fps(frames: u64, duration: Duration) -> f32 {
    let ms = duration.as_millis();
    if ms == 0 {
        return 0.0;
    }
    (frames as f64 * 1000.0 / ms as f64) as f32
}

struct ActiveStream {
    source: StreamSource,
    started: Instant,
    pushed_before: u64,
}

pub struct DetectionSession {
    state: SessionState,
    config: InferenceConfig,
    engine: Arc<dyn InferenceEngine>,
    channel: Arc<FrameChannel>,
    poller: MetricsPoller,
    epoch: Arc<AtomicU64>,
    surface: Option<SurfaceHandle>,
    stream: Option<ActiveStream>,
    last_stream: Option<StreamStats>,
    tx: Sender<Message>,
}

impl DetectionSession {
    pub(crate) fn new(
        engine: Arc<dyn InferenceEngine>,
        sampler: Box<dyn CpuSampler>,
        tx: Sender<Message>,
    ) -> Self {
        Self {
            state: SessionState::Idle,
            config: InferenceConfig::default(),
            engine,
            channel: Arc::new(FrameChannel::new()),
            poller: MetricsPoller::new(sampler),
            epoch: Arc::new(AtomicU64::new(0)),
            surface: None,
            stream: None,
            last_stream: None,
            tx,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch() == epoch
    }

    pub fn surface(&self) -> Option<SurfaceHandle> {
        self.surface
    }

    pub fn poller(&self) -> &MetricsPoller {
        &self.poller
    }

    pub fn channel_stats(&self) -> ChannelStats {
        self.channel.stats()
    }

    /// Figures for the most recently ended stream.
    pub fn last_stream_stats(&self) -> Option<&StreamStats> {
        self.last_stream.as_ref()
    }

    pub(crate) fn channel(&self) -> &Arc<FrameChannel> {
        &self.channel
    }

    pub(crate) fn engine(&self) -> &Arc<dyn InferenceEngine> {
        &self.engine
    }

    pub(crate) fn set_config(&mut self, config: InferenceConfig) {
        self.config = config;
    }

    /// Validate and push all four tunables. Legal in every state.
    pub(crate) fn update_tunables(&mut self, tunables: Tunables) -> Result<()> {
        self.config.set_tunables(tunables)?;
        self.config.push_tunables(self.engine.as_ref());
        Ok(())
    }

    /// Sink bound to the current epoch.
    pub(crate) fn sink(&self) -> EngineSink {
        EngineSink::new(
            self.epoch(),
            Arc::clone(&self.epoch),
            Arc::clone(&self.channel),
            self.tx.clone(),
        )
    }

    pub(crate) fn next_metrics_tick(&self) -> Option<Instant> {
        self.poller.next_due()
    }

    pub(crate) fn metrics_due(&self, now: Instant) -> bool {
        self.poller.is_due(now)
    }

    pub(crate) fn tick_metrics(
        &mut self,
        now: Instant,
        cache: &SummaryCache,
        ui: &dyn UiSink,
    ) -> Option<DetectSummary> {
        let detecting = self.state.is_detecting();
        self.poller
            .tick(now, cache, self.engine.as_ref(), detecting, ui)
    }

    pub(crate) fn last_cpu_percent(&self) -> f32 {
        self.poller.last_cpu_percent()
    }

    pub(crate) fn request(&mut self, request: ModeRequest, now: Instant) -> Result<Step> {
        log::debug!(
            "DetectionSession: {} requested while in {}",
            request.name(),
            self.state
        );
        let outcome = match request {
            ModeRequest::SurfaceReady(surface) => self.surface_ready(surface)?,
            ModeRequest::SurfaceDestroyed => self.surface_destroyed(),
            ModeRequest::CameraPreview => self.camera_preview()?,
            ModeRequest::CameraDetect => self.camera_detect(now),
            ModeRequest::ImageDetect { image } => return Ok(self.image_detect(image)),
            ModeRequest::VideoDetect { path } => self.video_detect(path, now)?,
            ModeRequest::NetworkPreview { url } => self.network_preview(url)?,
            ModeRequest::NetworkDetect => self.network_detect(now),
            ModeRequest::Idle => {
                if self.teardown() {
                    RequestOutcome::Applied("session stopped".to_string())
                } else {
                    RequestOutcome::AlreadyActive("session already idle".to_string())
                }
            }
        };
        Ok(Step::Done(outcome))
    }

    fn surface_ready(&mut self, surface: SurfaceHandle) -> Result<RequestOutcome> {
        self.surface = Some(surface);
        match self.state {
            SessionState::Idle => {
                self.open_camera_preview()?;
                Ok(RequestOutcome::Applied("camera preview started".to_string()))
            }
            SessionState::CameraPreview | SessionState::CameraDetect => {
                self.engine
                    .set_output_surface(surface)
                    .context("failed to rebind display surface")?;
                Ok(RequestOutcome::AlreadyActive(
                    "display surface updated".to_string(),
                ))
            }
            _ => Ok(RequestOutcome::AlreadyActive(format!(
                "display surface saved while {} runs",
                self.state
            ))),
        }
    }

    fn surface_destroyed(&mut self) -> RequestOutcome {
        self.surface = None;
        match self.state {
            SessionState::CameraPreview | SessionState::CameraDetect => {
                self.release_camera();
                self.enter_idle();
                RequestOutcome::Applied("camera closed".to_string())
            }
            // Image, video and network end in idle instead of reopening the camera.
            _ => RequestOutcome::AlreadyActive("display surface released".to_string()),
        }
    }

    fn camera_preview(&mut self) -> Result<RequestOutcome> {
        match self.state {
            SessionState::Idle => {
                if self.surface.is_none() {
                    return Ok(RequestOutcome::Invalid(
                        "no display surface for the camera yet".to_string(),
                    ));
                }
                self.open_camera_preview()?;
                Ok(RequestOutcome::Applied("camera preview started".to_string()))
            }
            SessionState::CameraPreview => Ok(RequestOutcome::AlreadyActive(
                "camera preview already active".to_string(),
            )),
            SessionState::CameraDetect => {
                self.engine.set_detect_enabled(false);
                self.stop_poller();
                self.transition(SessionState::CameraPreview);
                Ok(RequestOutcome::Applied("camera detection stopped".to_string()))
            }
            busy => Ok(busy_outcome(busy)),
        }
    }

    fn camera_detect(&mut self, now: Instant) -> RequestOutcome {
        match self.state {
            SessionState::CameraPreview => {
                self.engine.set_detect_enabled(true);
                self.poller.start(now);
                self.transition(SessionState::CameraDetect);
                RequestOutcome::Applied("camera detection started".to_string())
            }
            SessionState::CameraDetect => {
                RequestOutcome::AlreadyActive("camera detection already running".to_string())
            }
            SessionState::Idle => RequestOutcome::Invalid("camera is not open".to_string()),
            busy => busy_outcome(busy),
        }
    }

    fn image_detect(&mut self, image: Frame) -> Step {
        match self.state {
            SessionState::CameraPreview | SessionState::CameraDetect => {
                self.release_camera();
                let epoch = self.start_source();
                self.transition(SessionState::ImageDetect);
                Step::Image {
                    outcome: RequestOutcome::Applied("running image detection".to_string()),
                    job: ImageJob {
                        epoch,
                        image,
                        input_size: self.config.input_size.pixels(),
                    },
                }
            }
            SessionState::Idle => {
                Step::Done(RequestOutcome::Invalid("camera is not open".to_string()))
            }
            busy => Step::Done(busy_outcome(busy)),
        }
    }

    fn video_detect(&mut self, path: PathBuf, now: Instant) -> Result<RequestOutcome> {
        match self.state {
            SessionState::CameraPreview | SessionState::CameraDetect => {}
            SessionState::Idle => {
                return Ok(RequestOutcome::Invalid("camera is not open".to_string()));
            }
            busy => return Ok(busy_outcome(busy)),
        }

        self.release_camera();
        let source = StreamSource::VideoFile(path);
        if let Err(err) = self.start_stream(source.clone()) {
            let err = err.context(format!("failed to start video detection on {}", source.describe()));
            if let Err(restore) = self.restore_camera() {
                log::error!("DetectionSession: camera restore failed: {:#}", restore);
            }
            return Err(err);
        }
        self.poller.start(now);
        self.transition(SessionState::VideoDetect);
        Ok(RequestOutcome::Applied(format!(
            "video detection started: {}",
            source.describe()
        )))
    }

    fn network_preview(&mut self, url: String) -> Result<RequestOutcome> {
        let from = self.state;
        match from {
            SessionState::Idle | SessionState::CameraPreview => {}
            SessionState::NetworkPreview => {
                return Ok(RequestOutcome::AlreadyActive("already streaming".to_string()));
            }
            SessionState::NetworkDetect => {
                self.engine.set_detect_enabled(false);
                self.stop_poller();
                self.transition(SessionState::NetworkPreview);
                return Ok(RequestOutcome::Applied(
                    "network detection stopped".to_string(),
                ));
            }
            busy => return Ok(busy_outcome(busy)),
        }

        if from.is_camera() {
            self.release_camera();
        }
        self.engine.set_detect_enabled(false);
        if let Err(err) = self.start_stream(StreamSource::Network(url.clone())) {
            let err = err.context(format!("failed to connect to {}", url));
            if from.is_camera() {
                if let Err(restore) = self.restore_camera() {
                    log::error!("DetectionSession: camera restore failed: {:#}", restore);
                }
            } else {
                self.enter_idle();
            }
            return Err(err);
        }
        self.transition(SessionState::NetworkPreview);
        Ok(RequestOutcome::Applied(format!("connecting to {}", url)))
    }

    fn network_detect(&mut self, now: Instant) -> RequestOutcome {
        match self.state {
            SessionState::NetworkPreview => {
                self.engine.set_detect_enabled(true);
                self.poller.start(now);
                self.transition(SessionState::NetworkDetect);
                RequestOutcome::Applied("network detection started".to_string())
            }
            SessionState::NetworkDetect => {
                RequestOutcome::AlreadyActive("network detection already running".to_string())
            }
            SessionState::ImageDetect | SessionState::VideoDetect => busy_outcome(self.state),
            _ => RequestOutcome::Invalid("no network stream connected".to_string()),
        }
    }

    /// One-shot inference for `epoch` is done; bring the camera back.
    ///
    /// Returns false when the job was superseded.
    pub(crate) fn finish_image(&mut self, epoch: u64) -> Result<bool> {
        if !self.is_current(epoch) || self.state != SessionState::ImageDetect {
            log::debug!(
                "DetectionSession: ignoring image result from epoch {} (now {} in {})",
                epoch,
                self.epoch(),
                self.state
            );
            return Ok(false);
        }
        self.restore_camera()?;
        Ok(true)
    }

    /// The engine ended the current stream (finished, stopped or failed).
    ///
    /// Video falls back to camera preview, network falls back to idle.
    /// Returns the state the session settled in.
    pub(crate) fn end_stream(&mut self) -> Result<SessionState> {
        match self.state {
            SessionState::VideoDetect => {
                self.stop_stream();
                self.stop_poller();
                self.restore_camera()?;
            }
            SessionState::NetworkPreview | SessionState::NetworkDetect => {
                if self.state.is_detecting() {
                    self.engine.set_detect_enabled(false);
                }
                self.stop_stream();
                self.enter_idle();
            }
            _ => {}
        }
        Ok(self.state)
    }

    /// Stop whatever is active and return to `Idle`.
    ///
    /// Returns false, with no side effects, when already idle.
    pub fn teardown(&mut self) -> bool {
        let from = self.state;
        if from == SessionState::Idle {
            return false;
        }
        if from.is_detecting() {
            self.engine.set_detect_enabled(false);
        }
        if from.is_camera() {
            self.close_camera();
        }
        if from.is_streaming() {
            self.stop_stream();
        }
        self.enter_idle();
        true
    }

    // ------------------------------------------------------------------------
    // Side effects
    // ------------------------------------------------------------------------

    fn open_camera_preview(&mut self) -> Result<()> {
        let surface = self
            .surface
            .ok_or_else(|| anyhow!("no display surface for the camera"))?;
        self.engine.set_detect_enabled(false);
        self.engine
            .set_output_surface(surface)
            .context("failed to bind display surface")?;
        self.engine
            .open_camera(self.config.camera_facing)
            .context("failed to open camera")?;
        self.start_source();
        self.transition(SessionState::CameraPreview);
        Ok(())
    }

    /// Reopen the camera after image/video; fall back to idle if that fails.
    fn restore_camera(&mut self) -> Result<()> {
        if self.surface.is_none() {
            log::info!("DetectionSession: no display surface, not reopening the camera");
            self.enter_idle();
            return Ok(());
        }
        if let Err(err) = self.open_camera_preview() {
            self.enter_idle();
            return Err(err);
        }
        Ok(())
    }

    fn release_camera(&mut self) {
        if self.state == SessionState::CameraDetect {
            self.engine.set_detect_enabled(false);
            self.stop_poller();
        }
        self.close_camera();
    }

    fn close_camera(&mut self) {
        if let Err(err) = self.engine.close_camera() {
            log::warn!("DetectionSession: close camera failed: {:#}", err);
        }
    }

    fn start_stream(&mut self, source: StreamSource) -> Result<()> {
        self.start_source();
        let request = StreamRequest {
            source: source.clone(),
            input_size: self.config.input_size.pixels(),
            assets_dir: self.config.assets_dir.clone(),
            model_id: self.config.model_id,
            device: self.config.device,
        };
        self.engine.start_streamed_detect(request, self.sink())?;
        self.stream = Some(ActiveStream {
            source,
            started: Instant::now(),
            pushed_before: self.channel.stats().pushed,
        });
        Ok(())
    }

    fn stop_stream(&mut self) {
        self.engine.stop_stream();
        // Retire the sink before anything else can be pushed.
        self.advance_epoch();
        self.record_stream_stats();
    }

    fn record_stream_stats(&mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        let frames = self
            .channel
            .stats()
            .pushed
            .saturating_sub(stream.pushed_before);
        let duration = stream.started.elapsed();
        let stats = StreamStats {
            fps: stream_fps(frames, duration),
            source: stream.source,
            frames,
            duration,
        };
        log::info!(
            "DetectionSession: {} delivered {} frames in {}ms ({:.1} fps)",
            stats.source.describe(),
            stats.frames,
            stats.duration.as_millis(),
            stats.fps
        );
        self.last_stream = Some(stats);
    }

    fn stop_poller(&mut self) {
        self.poller.stop();
        self.poller.reset();
    }

    /// New source: retire old sinks and drop anything they left behind.
    fn start_source(&mut self) -> u64 {
        let epoch = self.advance_epoch();
        self.channel.open();
        epoch
    }

    fn enter_idle(&mut self) {
        self.stop_poller();
        self.advance_epoch();
        self.channel.close();
        self.record_stream_stats();
        self.transition(SessionState::Idle);
    }

    fn advance_epoch(&self) -> u64 {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.channel.fence(epoch);
        epoch
    }

    fn transition(&mut self, to: SessionState) {
        if self.state != to {
            log::info!("DetectionSession: {} -> {}", self.state, to);
        }
        self.state = to;
    }
}

impl Drop for DetectionSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn busy_outcome(state: SessionState) -> RequestOutcome {
    RequestOutcome::Busy(format!("busy: {} in progress", state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineCall, StubEngine};
    use crate::metrics::ProcessCpuSampler;
    use rand::Rng;
    use std::sync::mpsc;

    fn session() -> (DetectionSession, Arc<StubEngine>, mpsc::Receiver<Message>) {
        let stub = Arc::new(StubEngine::manual());
        let engine: Arc<dyn InferenceEngine> = stub.clone();
        let (tx, rx) = mpsc::channel();
        let session = DetectionSession::new(engine, Box::new(ProcessCpuSampler::new()), tx);
        (session, stub, rx)
    }

    fn outcome(step: Step) -> RequestOutcome {
        match step {
            Step::Done(outcome) => outcome,
            Step::Image { outcome, .. } => outcome,
        }
    }

    fn request(session: &mut DetectionSession, req: ModeRequest) -> RequestOutcome {
        outcome(session.request(req, Instant::now()).unwrap())
    }

    fn camera_preview(session: &mut DetectionSession) {
        let result = request(session, ModeRequest::SurfaceReady(SurfaceHandle(1)));
        assert!(result.is_applied());
        assert_eq!(session.state(), SessionState::CameraPreview);
    }

    #[test]
    fn camera_detect_toggle_controls_poller() {
        let (mut session, stub, _rx) = session();
        camera_preview(&mut session);
        assert!(stub.is_camera_open());

        assert!(request(&mut session, ModeRequest::CameraDetect).is_applied());
        assert!(session.poller().is_running());
        assert!(stub.detect_enabled());

        assert!(request(&mut session, ModeRequest::CameraPreview).is_applied());
        assert!(!session.poller().is_running());
        assert!(!stub.detect_enabled());
        assert!(stub.is_camera_open());
    }

    #[test]
    fn repeated_requests_are_benign() {
        let (mut session, _stub, _rx) = session();
        camera_preview(&mut session);
        assert!(matches!(
            request(&mut session, ModeRequest::CameraPreview),
            RequestOutcome::AlreadyActive(_)
        ));

        request(&mut session, ModeRequest::Idle);
        request(&mut session, ModeRequest::SurfaceReady(SurfaceHandle(2)));
        request(&mut session, ModeRequest::Idle);
        assert!(request(&mut session, ModeRequest::network("stub://cam").unwrap()).is_applied());
        assert_eq!(
            request(&mut session, ModeRequest::network("stub://cam").unwrap()),
            RequestOutcome::AlreadyActive("already streaming".to_string())
        );
    }

    #[test]
    fn idle_rejects_detect_toggles() {
        let (mut session, stub, _rx) = session();
        assert!(matches!(
            request(&mut session, ModeRequest::CameraDetect),
            RequestOutcome::Invalid(_)
        ));
        assert!(matches!(
            request(&mut session, ModeRequest::NetworkDetect),
            RequestOutcome::Invalid(_)
        ));
        assert!(matches!(
            request(&mut session, ModeRequest::CameraPreview),
            RequestOutcome::Invalid(_)
        ));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(stub.calls().is_empty());
    }

    #[test]
    fn teardown_when_idle_has_no_side_effects() {
        let (mut session, stub, _rx) = session();
        let epoch = session.epoch();
        assert!(!session.teardown());
        assert!(!session.teardown());
        assert_eq!(session.epoch(), epoch);
        assert!(stub.calls().is_empty());
    }

    #[test]
    fn video_start_failure_restores_camera() {
        let (mut session, stub, _rx) = session();
        camera_preview(&mut session);
        request(&mut session, ModeRequest::CameraDetect);
        stub.fail_next_stream_start("no decoder");

        let result = session.request(
            ModeRequest::VideoDetect {
                path: PathBuf::from("clip.mp4"),
            },
            Instant::now(),
        );
        assert!(result.is_err());
        assert_eq!(session.state(), SessionState::CameraPreview);
        assert!(stub.is_camera_open());
        assert!(!session.poller().is_running());
    }

    #[test]
    fn network_start_failure_from_idle_stays_idle() {
        let (mut session, stub, _rx) = session();
        let result = session.request(
            ModeRequest::NetworkPreview {
                url: "rtsp://10.0.0.1/live".to_string(),
            },
            Instant::now(),
        );
        assert!(result.is_err());
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!stub.is_streaming());
    }

    #[test]
    fn stale_image_result_is_ignored() {
        let (mut session, _stub, _rx) = session();
        camera_preview(&mut session);
        let step = session
            .request(
                ModeRequest::ImageDetect {
                    image: Frame::new(vec![0; 12], 2, 2),
                },
                Instant::now(),
            )
            .unwrap();
        let Step::Image { job, .. } = step else {
            panic!("expected an image job");
        };
        session.teardown();
        assert!(!session.finish_image(job.epoch).unwrap());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn surface_destroyed_closes_camera_and_forgets_surface() {
        let (mut session, stub, _rx) = session();
        camera_preview(&mut session);
        request(&mut session, ModeRequest::CameraDetect);
        let epoch = session.epoch();

        assert!(request(&mut session, ModeRequest::SurfaceDestroyed).is_applied());
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!stub.is_camera_open());
        assert!(!stub.detect_enabled());
        assert!(!session.poller().is_running());
        assert!(session.surface().is_none());
        assert!(session.epoch() > epoch);

        stub.clear_calls();
        assert!(matches!(
            request(&mut session, ModeRequest::CameraPreview),
            RequestOutcome::Invalid(_)
        ));
        assert!(stub.calls().is_empty());
        assert!(matches!(
            request(&mut session, ModeRequest::SurfaceDestroyed),
            RequestOutcome::AlreadyActive(_)
        ));
    }

    #[test]
    fn video_ending_without_surface_goes_idle() {
        let (mut session, stub, _rx) = session();
        camera_preview(&mut session);
        request(
            &mut session,
            ModeRequest::VideoDetect {
                path: PathBuf::from("clip.mp4"),
            },
        );
        assert!(matches!(
            request(&mut session, ModeRequest::SurfaceDestroyed),
            RequestOutcome::AlreadyActive(_)
        ));
        assert_eq!(session.state(), SessionState::VideoDetect);

        assert_eq!(session.end_stream().unwrap(), SessionState::Idle);
        assert!(!stub.is_camera_open());
        assert!(!stub.is_streaming());
    }

    #[test]
    fn stream_fps_handles_zero_duration() {
        assert_eq!(stream_fps(10, Duration::ZERO), 0.0);
        assert_eq!(stream_fps(30, Duration::from_millis(1500)), 20.0);
    }

    #[test]
    fn random_sequences_keep_sources_exclusive() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let (mut session, stub, _rx) = session();
            let mut pending_image: Option<u64> = None;
            for _ in 0..40 {
                let req = match rng.gen_range(0..10) {
                    0 => ModeRequest::SurfaceReady(SurfaceHandle(rng.gen_range(1..4))),
                    1 => ModeRequest::CameraPreview,
                    2 => ModeRequest::CameraDetect,
                    3 => ModeRequest::ImageDetect {
                        image: Frame::new(vec![1; 12], 2, 2),
                    },
                    4 => ModeRequest::VideoDetect {
                        path: PathBuf::from("clip.mp4"),
                    },
                    5 => ModeRequest::NetworkPreview {
                        url: "stub://net".to_string(),
                    },
                    6 => ModeRequest::NetworkDetect,
                    7 => ModeRequest::Idle,
                    8 => ModeRequest::SurfaceDestroyed,
                    _ => {
                        if let Some(epoch) = pending_image.take() {
                            session.finish_image(epoch).unwrap();
                        } else if session.state().is_streaming() {
                            session.end_stream().unwrap();
                        }
                        check_exclusive(&session, &stub);
                        continue;
                    }
                };
                let before = session.state();
                match session.request(req, Instant::now()).unwrap() {
                    Step::Image { job, .. } => pending_image = Some(job.epoch),
                    Step::Done(RequestOutcome::Busy(_)) | Step::Done(RequestOutcome::Invalid(_)) => {
                        assert_eq!(session.state(), before);
                    }
                    Step::Done(_) => {}
                }
                check_exclusive(&session, &stub);
            }
        }
    }

    fn check_exclusive(session: &DetectionSession, stub: &StubEngine) {
        let state = session.state();
        let active_sources =
            usize::from(stub.is_camera_open()) + usize::from(stub.is_streaming());
        assert!(active_sources <= 1, "camera and stream both active in {}", state);
        assert_eq!(stub.is_camera_open(), state.is_camera(), "camera in {}", state);
        assert_eq!(stub.is_streaming(), state.is_streaming(), "stream in {}", state);
        assert_eq!(session.poller().is_running(), state.is_detecting(), "poller in {}", state);
    }

    #[test]
    fn tunable_updates_push_all_four() {
        let (mut session, stub, _rx) = session();
        session
            .update_tunables(Tunables {
                threshold: 0.5,
                nms_threshold: 0.4,
                track_enabled: true,
                shader_enabled: false,
            })
            .unwrap();
        assert_eq!(
            stub.calls(),
            vec![
                EngineCall::SetThreshold(0.5),
                EngineCall::SetNms(0.4),
                EngineCall::SetTrackEnabled(true),
                EngineCall::SetShaderEnabled(false),
            ]
        );
        assert!(session
            .update_tunables(Tunables {
                threshold: -0.1,
                ..Tunables::default()
            })
            .is_err());
        assert_eq!(stub.calls().len(), 4);
    }
}
