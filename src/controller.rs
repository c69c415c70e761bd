//! Session controller: the façade the UI layer and the engine talk to.
//!
//! All engine output arrives as `Message`s on one queue and is handled by
//! whichever thread owns the controller (the consumer thread). Frames bypass
//! the queue through the `FrameChannel`; only the render request is queued.
//! Session state, the summary cache and every `UiSink` call are touched from
//! the consumer thread alone.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{InferenceConfig, Tunables};
use crate::detect::DetectSummary;
use crate::engine::{EngineEvent, EngineSink, InferenceEngine};
use crate::frame::{ChannelStats, Frame, PushOutcome};
use crate::metrics::{CpuSampler, SummaryCache};
use crate::session::{DetectionSession, ImageJob, ModeRequest, RequestOutcome, SessionState, Step};
use crate::ui::UiSink;

/// Upper bound on how long `run` blocks waiting for a message.
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Work queued for the consumer thread.
#[derive(Debug)]
pub(crate) enum Message {
    /// A frame is pending in the channel.
    Render,
    Engine { epoch: u64, event: EngineEvent },
    ImageDone {
        epoch: u64,
        result: std::result::Result<Frame, String>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum View {
    Unset,
    Preview,
    Result,
}

pub struct SessionController {
    ui: Box<dyn UiSink>,
    session: DetectionSession,
    cache: SummaryCache,
    tx: Sender<Message>,
    rx: Receiver<Message>,
    initialized: bool,
    /// Tunables set before `initialize`; they win over the config's.
    early_tunables: Option<Tunables>,
    view: View,
}

impl SessionController {
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        ui: Box<dyn UiSink>,
        sampler: Box<dyn CpuSampler>,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        let session = DetectionSession::new(engine, sampler, tx.clone());
        Self {
            ui,
            session,
            cache: SummaryCache::new(),
            tx,
            rx,
            initialized: false,
            early_tunables: None,
            view: View::Unset,
        }
    }

    /// Load the model and push the initial tunables.
    ///
    /// Tunables already set through `update_params` are kept; the config's
    /// own tunables apply otherwise.
    pub fn initialize(&mut self, mut config: InferenceConfig) -> Result<()> {
        if let Some(tunables) = self.early_tunables {
            config.set_tunables(tunables)?;
        }
        let engine = Arc::clone(self.session.engine());
        log::info!(
            "SessionController: loading model {} on {:?} at {}px via {} engine",
            config.model_id,
            config.device,
            config.input_size.pixels(),
            engine.name()
        );
        if let Err(err) = engine.load_model(
            &config.assets_dir,
            config.model_id,
            config.device,
            config.input_size,
        ) {
            let err = err.context(format!("failed to load model {}", config.model_id));
            self.ui.show_error(&format!("{:#}", err));
            return Err(err);
        }
        config.push_tunables(engine.as_ref());
        self.session.set_config(config);
        self.early_tunables = None;
        self.initialized = true;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Ask for a mode change.
    ///
    /// Busy, repeated and illegal requests come back as `Ok` outcomes and are
    /// reported to the UI as status (or error, for `Invalid`). `Err` means the
    /// engine failed; the session has already fallen back to a safe state.
    pub fn request_mode(&mut self, request: ModeRequest) -> Result<RequestOutcome> {
        if !self.initialized && !matches!(request, ModeRequest::Idle) {
            let outcome = RequestOutcome::Invalid("engine not initialized".to_string());
            self.ui.show_error(outcome.message());
            return Ok(outcome);
        }

        let from = self.session.state();
        let step = match self.session.request(request, Instant::now()) {
            Ok(step) => step,
            Err(err) => {
                self.after_failure(from);
                self.ui.show_error(&format!("{:#}", err));
                return Err(err);
            }
        };

        let outcome = match step {
            Step::Done(outcome) => outcome,
            Step::Image { outcome, job } => {
                self.spawn_image_job(job);
                outcome
            }
        };

        match &outcome {
            RequestOutcome::Applied(_) => {
                self.after_transition(from, self.session.state());
                self.ui.show_status(outcome.message());
            }
            RequestOutcome::AlreadyActive(_) => {
                // An image result stays up until the camera is asked for again.
                if self.session.state().is_camera() {
                    self.set_view(View::Preview);
                }
                self.ui.show_status(outcome.message());
            }
            RequestOutcome::Busy(_) => self.ui.show_status(outcome.message()),
            RequestOutcome::Invalid(_) => self.ui.show_error(outcome.message()),
        }
        Ok(outcome)
    }

    /// Replace all four tunables; the engine receives the full set.
    pub fn update_params(
        &mut self,
        threshold: f32,
        nms_threshold: f32,
        track_enabled: bool,
        shader_enabled: bool,
    ) -> Result<()> {
        let tunables = Tunables {
            threshold,
            nms_threshold,
            track_enabled,
            shader_enabled,
        };
        if let Err(err) = self.session.update_tunables(tunables) {
            self.ui.show_error(&format!("{:#}", err));
            return Err(err);
        }
        if !self.initialized {
            self.early_tunables = Some(tunables);
        }
        Ok(())
    }

    /// Frame produced for the current mode.
    pub fn on_engine_frame(&self, frame: Frame) {
        if self.session.channel().push(frame) == PushOutcome::RenderRequested {
            self.enqueue(Message::Render);
        }
    }

    pub fn on_engine_error(&mut self, message: impl Into<String>) {
        let epoch = self.session.epoch();
        self.handle_engine_event(epoch, EngineEvent::Error(message.into()));
    }

    pub fn on_engine_finished(&mut self) {
        let epoch = self.session.epoch();
        self.handle_engine_event(epoch, EngineEvent::Finished);
    }

    pub fn on_engine_stream_stopped(&mut self) {
        let epoch = self.session.epoch();
        self.handle_engine_event(epoch, EngineEvent::StreamStopped);
    }

    pub fn on_engine_connection_changed(&mut self, connected: bool) {
        let epoch = self.session.epoch();
        self.handle_engine_event(epoch, EngineEvent::ConnectionChanged(connected));
    }

    /// Stop everything. No-op when already idle.
    pub fn teardown(&mut self) {
        let from = self.session.state();
        if !self.session.teardown() {
            return;
        }
        self.cache.clear();
        self.ui.clear_metrics();
        if from.is_network() {
            self.ui.update_connection_state(false);
        }
        self.ui.show_status("session stopped");
    }

    /// Handle everything queued, then run the metrics tick if it is due.
    ///
    /// Returns the number of messages handled.
    pub fn pump(&mut self, now: Instant) -> usize {
        let mut handled = 0;
        while let Ok(message) = self.rx.try_recv() {
            self.handle(message);
            handled += 1;
        }
        if self.session.metrics_due(now) {
            self.session.tick_metrics(now, &self.cache, self.ui.as_ref());
        }
        handled
    }

    /// Consumer loop: block on the queue, pump, repeat until `shutdown` is set
    /// or `deadline` passes. Returns the number of messages handled.
    pub fn run(&mut self, shutdown: &AtomicBool, deadline: Option<Instant>) -> usize {
        let mut handled = 0;
        loop {
            let now = Instant::now();
            if shutdown.load(Ordering::SeqCst) || deadline.is_some_and(|d| now >= d) {
                break;
            }
            let mut wait = IDLE_WAIT;
            if let Some(due) = self.session.next_metrics_tick() {
                wait = wait.min(due.saturating_duration_since(now));
            }
            if let Some(deadline) = deadline {
                wait = wait.min(deadline.saturating_duration_since(now));
            }
            match self.rx.recv_timeout(wait) {
                Ok(message) => {
                    self.handle(message);
                    handled += 1;
                }
                Err(RecvTimeoutError::Timeout) => {}
                // Unreachable while we hold `tx`.
                Err(RecvTimeoutError::Disconnected) => break,
            }
            handled += self.pump(Instant::now());
        }
        handled
    }

    /// Sink bound to the current mode, for engines that report outside a stream.
    pub fn sink(&self) -> EngineSink {
        self.session.sink()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn session(&self) -> &DetectionSession {
        &self.session
    }

    pub fn channel_stats(&self) -> ChannelStats {
        self.session.channel_stats()
    }

    pub fn latest_summary(&self) -> Option<DetectSummary> {
        self.cache.latest()
    }

    // ------------------------------------------------------------------------
    // Consumer-thread handlers
    // ------------------------------------------------------------------------

    fn handle(&mut self, message: Message) {
        match message {
            Message::Render => self.render(),
            Message::Engine { epoch, event } => self.handle_engine_event(epoch, event),
            Message::ImageDone { epoch, result } => self.finish_image(epoch, result),
        }
    }

    fn render(&mut self) {
        if let Some(frame) = self.session.channel().begin_render() {
            self.ui.show_frame(frame);
        }
    }

    fn handle_engine_event(&mut self, epoch: u64, event: EngineEvent) {
        if !self.session.is_current(epoch) {
            log::debug!(
                "SessionController: ignoring {:?} from retired epoch {}",
                event,
                epoch
            );
            return;
        }
        let state = self.session.state();
        match event {
            EngineEvent::ConnectionChanged(connected) => {
                if state.is_network() {
                    self.ui.update_connection_state(connected);
                }
            }
            EngineEvent::Finished | EngineEvent::StreamStopped if state.is_streaming() => {
                let label = if event == EngineEvent::Finished {
                    "finished"
                } else {
                    "stopped"
                };
                match state {
                    SessionState::VideoDetect => {
                        let restored = self.session.end_stream();
                        self.cache.clear();
                        self.ui.clear_metrics();
                        self.set_view(View::Preview);
                        match restored {
                            Ok(_) => self.ui.show_status(&format!("video {}", label)),
                            Err(err) => self.ui.show_error(&format!("{:#}", err)),
                        }
                    }
                    _ => {
                        let _ = self.session.end_stream();
                        self.cache.clear();
                        self.ui.clear_metrics();
                        self.ui.update_connection_state(false);
                        self.ui.show_status(&format!("network stream {}", label));
                    }
                }
            }
            EngineEvent::Finished | EngineEvent::StreamStopped => {
                log::debug!("SessionController: {:?} while {}, ignored", event, state);
            }
            EngineEvent::Error(message) => self.fail_current_mode(state, &message),
        }
    }

    fn fail_current_mode(&mut self, state: SessionState, message: &str) {
        log::warn!("SessionController: engine error during {}: {}", state, message);
        match state {
            SessionState::VideoDetect => {
                let restored = self.session.end_stream();
                self.cache.clear();
                self.ui.clear_metrics();
                self.ui
                    .show_error(&format!("video detection failed: {}", message));
                self.set_view(View::Preview);
                if let Err(err) = restored {
                    log::error!("SessionController: camera restore failed: {:#}", err);
                }
            }
            SessionState::NetworkPreview | SessionState::NetworkDetect => {
                let _ = self.session.end_stream();
                self.cache.clear();
                self.ui.clear_metrics();
                self.ui.update_connection_state(false);
                self.ui
                    .show_error(&format!("network stream failed: {}", message));
            }
            SessionState::CameraPreview | SessionState::CameraDetect => {
                self.session.teardown();
                self.cache.clear();
                self.ui.clear_metrics();
                self.ui.show_error(&format!("camera failed: {}", message));
            }
            SessionState::ImageDetect | SessionState::Idle => {
                self.ui.show_error(message);
            }
        }
    }

    fn finish_image(&mut self, epoch: u64, result: std::result::Result<Frame, String>) {
        let restored = match self.session.finish_image(epoch) {
            Ok(false) => return,
            Ok(true) => Ok(()),
            Err(err) => Err(err),
        };

        match result {
            Ok(frame) => {
                self.ui.show_frame(frame);
                let engine = Arc::clone(self.session.engine());
                if let Some(summary) = engine.detect_summary() {
                    let summary = summary
                        .sanitized()
                        .with_cpu_usage(self.session.last_cpu_percent());
                    self.cache.update(summary.clone());
                    self.ui.update_metrics(&summary);
                }
                self.ui.show_status("image detection finished");
            }
            Err(message) => {
                self.ui
                    .show_error(&format!("image detection failed: {}", message));
                self.set_view(View::Preview);
            }
        }
        if let Err(err) = restored {
            self.ui.show_error(&format!("{:#}", err));
        }
    }

    fn spawn_image_job(&mut self, job: ImageJob) {
        let ImageJob {
            epoch,
            image,
            input_size,
        } = job;
        let engine = Arc::clone(self.session.engine());
        let tx = self.tx.clone();
        let spawned = std::thread::Builder::new()
            .name("image-detect".to_string())
            .spawn(move || {
                let result = engine
                    .detect_image(image, input_size)
                    .map_err(|err| format!("{:#}", err));
                if tx.send(Message::ImageDone { epoch, result }).is_err() {
                    log::debug!("image-detect: controller gone, dropping result");
                }
            });
        if let Err(err) = spawned {
            let err = anyhow!("failed to spawn image worker: {}", err);
            log::error!("SessionController: {:#}", err);
            self.enqueue(Message::ImageDone {
                epoch,
                result: Err(err.to_string()),
            });
        }
    }

    /// View bookkeeping after an applied transition.
    fn after_transition(&mut self, from: SessionState, to: SessionState) {
        match to {
            SessionState::CameraPreview | SessionState::CameraDetect => {
                self.set_view(View::Preview);
                if from == SessionState::CameraDetect && to == SessionState::CameraPreview {
                    self.cache.clear();
                    self.ui.clear_metrics();
                }
            }
            SessionState::ImageDetect
            | SessionState::VideoDetect
            | SessionState::NetworkPreview => {
                self.set_view(View::Result);
                if from == SessionState::NetworkDetect {
                    self.cache.clear();
                    self.ui.clear_metrics();
                }
            }
            SessionState::NetworkDetect => self.set_view(View::Result),
            SessionState::Idle => {
                self.cache.clear();
                self.ui.clear_metrics();
                if from.is_network() {
                    self.ui.update_connection_state(false);
                }
            }
        }
    }

    fn after_failure(&mut self, from: SessionState) {
        if from.is_detecting() && !self.session.state().is_detecting() {
            self.cache.clear();
            self.ui.clear_metrics();
        }
    }

    fn enqueue(&self, message: Message) {
        if self.tx.send(message).is_err() {
            log::debug!("SessionController: queue closed, dropping message");
        }
    }

    fn set_view(&mut self, view: View) {
        if self.view == view {
            return;
        }
        self.view = view;
        match view {
            View::Preview => self.ui.switch_to_preview_view(),
            View::Result => self.ui.switch_to_result_view(),
            View::Unset => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{StubEngine, SurfaceHandle};
    use crate::metrics::ProcessCpuSampler;
    use crate::ui::{RecordingUi, UiEvent};

    fn controller() -> (SessionController, Arc<StubEngine>, RecordingUi) {
        let stub = Arc::new(StubEngine::manual());
        let ui = RecordingUi::new();
        let mut controller = SessionController::new(
            stub.clone(),
            Box::new(ui.clone()),
            Box::new(ProcessCpuSampler::new()),
        );
        controller.initialize(InferenceConfig::default()).unwrap();
        (controller, stub, ui)
    }

    #[test]
    fn requests_before_initialize_are_invalid() {
        let stub = Arc::new(StubEngine::manual());
        let ui = RecordingUi::new();
        let mut controller = SessionController::new(
            stub.clone(),
            Box::new(ui.clone()),
            Box::new(ProcessCpuSampler::new()),
        );
        let outcome = controller
            .request_mode(ModeRequest::SurfaceReady(SurfaceHandle(1)))
            .unwrap();
        assert!(matches!(outcome, RequestOutcome::Invalid(_)));
        assert!(stub.calls().is_empty());
        assert_eq!(ui.count(|e| matches!(e, UiEvent::Error(_))), 1);
    }

    #[test]
    fn model_load_failure_is_shown() {
        let stub = Arc::new(StubEngine::manual());
        stub.fail_model_load(true);
        let ui = RecordingUi::new();
        let mut controller = SessionController::new(
            stub.clone(),
            Box::new(ui.clone()),
            Box::new(ProcessCpuSampler::new()),
        );
        assert!(controller.initialize(InferenceConfig::default()).is_err());
        assert!(!controller.is_initialized());
        assert_eq!(ui.count(|e| matches!(e, UiEvent::Error(_))), 1);
    }

    #[test]
    fn stale_sink_frames_never_render() {
        let (mut controller, _stub, ui) = controller();
        controller
            .request_mode(ModeRequest::SurfaceReady(SurfaceHandle(1)))
            .unwrap();
        let old_sink = controller.sink();
        controller.teardown();
        controller
            .request_mode(ModeRequest::CameraPreview)
            .unwrap();

        old_sink.on_frame(Frame::new(vec![0; 12], 2, 2));
        old_sink.on_error("late");
        controller.pump(Instant::now());

        assert_eq!(ui.count(|e| matches!(e, UiEvent::Frame { .. })), 0);
        assert_eq!(ui.count(|e| matches!(e, UiEvent::Error(_))), 0);
        assert_eq!(controller.state(), SessionState::CameraPreview);
    }

    #[test]
    fn connection_changes_only_forwarded_for_network() {
        let (mut controller, _stub, ui) = controller();
        controller
            .request_mode(ModeRequest::SurfaceReady(SurfaceHandle(1)))
            .unwrap();
        controller.on_engine_connection_changed(true);
        assert_eq!(ui.count(|e| matches!(e, UiEvent::Connection(_))), 0);

        controller
            .request_mode(ModeRequest::network("stub://lobby").unwrap())
            .unwrap();
        controller.on_engine_connection_changed(true);
        assert_eq!(ui.count(|e| *e == UiEvent::Connection(true)), 1);
    }

    #[test]
    fn tunables_set_before_initialize_survive_it() {
        let stub = Arc::new(StubEngine::manual());
        let mut controller = SessionController::new(
            stub.clone(),
            Box::new(RecordingUi::new()),
            Box::new(ProcessCpuSampler::new()),
        );
        controller.update_params(0.7, 0.3, true, true).unwrap();
        stub.clear_calls();
        controller.initialize(InferenceConfig::default()).unwrap();

        let tunables = controller.session().config().tunables();
        assert_eq!(tunables.threshold, 0.7);
        assert_eq!(tunables.nms_threshold, 0.3);
        assert!(tunables.track_enabled && tunables.shader_enabled);
        assert_eq!(
            stub.count_calls(|c| *c == crate::engine::EngineCall::SetThreshold(0.7)),
            1
        );
        assert_eq!(
            stub.count_calls(|c| *c == crate::engine::EngineCall::SetThreshold(0.45)),
            0
        );
    }

    #[test]
    fn teardown_twice_is_silent() {
        let (mut controller, _stub, ui) = controller();
        controller
            .request_mode(ModeRequest::SurfaceReady(SurfaceHandle(1)))
            .unwrap();
        controller.teardown();
        let after_first = ui.events().len();
        controller.teardown();
        assert_eq!(ui.events().len(), after_first);
    }
}
