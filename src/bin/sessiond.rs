//! sessiond - headless detection session driver
//!
//! Runs one detection mode against the synthetic engine and reports frames,
//! status and metrics through the log:
//! 1. Loads `SessionConfig` (file + environment)
//! 2. Initializes the engine and pushes the tunables
//! 3. Enters the requested mode and pumps the session until Ctrl-C or `--seconds`

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use detect_session::{
    EngineSink, Frame, LogUi, ModeRequest, ProcessCpuSampler, SessionConfig, SessionController,
    StubEngine, SurfaceHandle,
};

const DEFAULT_NETWORK_URL: &str = "stub://sessiond";
const PREVIEW_SURFACE: SurfaceHandle = SurfaceHandle(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    Camera,
    Image,
    Video,
    Network,
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[arg(long, value_enum, default_value_t = Mode::Camera)]
    mode: Mode,
    /// Image or video file, or stream URL for network mode.
    #[arg(long)]
    source: Option<String>,
    /// Enable detection (camera and network modes).
    #[arg(long)]
    detect: bool,
    /// Run time in seconds.
    #[arg(long, default_value_t = 10)]
    seconds: u64,
    #[arg(long)]
    threshold: Option<f32>,
    #[arg(long)]
    nms: Option<f32>,
    /// Synthetic frame interval in milliseconds.
    #[arg(long, default_value_t = 66)]
    frame_interval_ms: u64,
    /// Image dimensions for image mode.
    #[arg(long, default_value_t = 640)]
    width: u32,
    #[arg(long, default_value_t = 480)]
    height: u32,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if args.frame_interval_ms == 0 {
        return Err(anyhow!("frame interval must be >= 1ms"));
    }
    let config = SessionConfig::load()?;
    let frame_interval = Duration::from_millis(args.frame_interval_ms);

    let engine = Arc::new(StubEngine::new().with_frame_interval(frame_interval));
    let mut controller = SessionController::new(
        engine,
        Box::new(LogUi::new()),
        Box::new(ProcessCpuSampler::new()),
    );
    controller.initialize(config.inference.clone())?;

    if args.threshold.is_some() || args.nms.is_some() {
        let tunables = config.inference.tunables();
        controller.update_params(
            args.threshold.unwrap_or(tunables.threshold),
            args.nms.unwrap_or(tunables.nms_threshold),
            tunables.track_enabled,
            tunables.shader_enabled,
        )?;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("failed to install Ctrl-C handler: {}", e))?;

    if args.mode != Mode::Network {
        controller.request_mode(ModeRequest::SurfaceReady(PREVIEW_SURFACE))?;
    }

    let mut feeder = None;
    match args.mode {
        Mode::Camera => {
            if args.detect {
                controller.request_mode(ModeRequest::CameraDetect)?;
            }
            feeder = Some(spawn_camera_feeder(
                controller.sink(),
                frame_interval,
                Arc::clone(&shutdown),
            )?);
        }
        Mode::Image => {
            let image = load_image(args.source.as_deref(), args.width, args.height)?;
            controller.request_mode(ModeRequest::ImageDetect { image })?;
        }
        Mode::Video => {
            let source = args
                .source
                .as_deref()
                .ok_or_else(|| anyhow!("--source <video file> is required for video mode"))?;
            controller.request_mode(ModeRequest::video(source)?)?;
        }
        Mode::Network => {
            let url = args
                .source
                .clone()
                .or_else(|| config.stream_url.clone())
                .unwrap_or_else(|| DEFAULT_NETWORK_URL.to_string());
            controller.request_mode(ModeRequest::network(url)?)?;
            if args.detect {
                controller.request_mode(ModeRequest::NetworkDetect)?;
            }
        }
    }

    log::info!(
        "sessiond running {:?} for {}s (Ctrl-C to stop)",
        args.mode,
        args.seconds
    );
    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    let handled = controller.run(&shutdown, Some(deadline));
    controller.teardown();
    shutdown.store(true, Ordering::SeqCst);
    if let Some(feeder) = feeder {
        if feeder.join().is_err() {
            log::error!("camera feeder thread panicked");
        }
    }

    let stats = controller.channel_stats();
    log::info!(
        "sessiond done: {} messages, {} frames pushed, {} presented, {} superseded, {} discarded",
        handled,
        stats.pushed,
        stats.presented,
        stats.superseded,
        stats.discarded
    );
    if let Some(stream) = controller.session().last_stream_stats() {
        log::info!(
            "last stream {}: {} frames, {:.1} fps",
            stream.source.describe(),
            stream.frames,
            stream.fps
        );
    }
    Ok(())
}

fn load_image(source: Option<&str>, width: u32, height: u32) -> Result<Frame> {
    let mut frame = Frame::try_alloc(width, height, 3)?;
    if let Some(path) = source {
        let path = PathBuf::from(path);
        let bytes = std::fs::read(&path)
            .with_context(|| format!("failed to read image {}", path.display()))?;
        let len = bytes.len().min(frame.byte_len());
        frame.pixels_mut()[..len].copy_from_slice(&bytes[..len]);
    }
    Ok(frame)
}

/// Stands in for camera capture: pushes synthetic frames while the sink is current.
fn spawn_camera_feeder(
    sink: EngineSink,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) -> Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("camera-feeder".to_string())
        .spawn(move || {
            let mut tick: u8 = 0;
            while !shutdown.load(Ordering::SeqCst) && sink.is_current() {
                std::thread::sleep(interval);
                match Frame::try_alloc(320, 240, 3) {
                    Ok(mut frame) => {
                        frame.pixels_mut().fill(tick);
                        sink.on_frame(frame);
                    }
                    Err(err) => log::warn!("camera-feeder: dropping frame: {}", err),
                }
                tick = tick.wrapping_add(1);
            }
        })
        .map_err(|e| anyhow!("failed to spawn camera feeder: {}", e))
}
