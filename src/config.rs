use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::engine::InferenceEngine;

const DEFAULT_ASSETS_DIR: &str = "assets";
const DEFAULT_MODEL_ID: u32 = 0;
const DEFAULT_INPUT_SIZE_INDEX: u32 = 0;
const DEFAULT_THRESHOLD: f32 = 0.45;
const DEFAULT_NMS_THRESHOLD: f32 = 0.65;

// ----------------------------------------------------------------------------
// Inference parameters
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Cpu,
    Gpu,
}

impl FromStr for DeviceType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cpu" | "0" => Ok(Self::Cpu),
            "gpu" | "1" => Ok(Self::Gpu),
            other => Err(anyhow!("unknown device type '{}' (expected cpu or gpu)", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraFacing {
    Front,
    #[default]
    Back,
}

impl FromStr for CameraFacing {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "front" | "0" => Ok(Self::Front),
            "back" | "1" => Ok(Self::Back),
            other => Err(anyhow!("unknown camera facing '{}' (expected front or back)", other)),
        }
    }
}

/// Model input resolution, selected by index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InputSize {
    #[default]
    S320,
    S640,
    S1280,
}

impl InputSize {
    /// Unknown indices fall back to 320.
    pub fn from_index(index: u32) -> Self {
        match index {
            1 => Self::S640,
            2 => Self::S1280,
            _ => Self::S320,
        }
    }

    pub fn index(self) -> u32 {
        match self {
            Self::S320 => 0,
            Self::S640 => 1,
            Self::S1280 => 2,
        }
    }

    pub fn pixels(self) -> u32 {
        match self {
            Self::S320 => 320,
            Self::S640 => 640,
            Self::S1280 => 1280,
        }
    }
}

/// The four runtime tunables. Always sent to the engine together.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Tunables {
    pub threshold: f32,
    pub nms_threshold: f32,
    pub track_enabled: bool,
    pub shader_enabled: bool,
}

impl Tunables {
    pub fn validate(&self) -> Result<()> {
        validate_unit("threshold", self.threshold)?;
        validate_unit("nms threshold", self.nms_threshold)?;
        Ok(())
    }
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            nms_threshold: DEFAULT_NMS_THRESHOLD,
            track_enabled: false,
            shader_enabled: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct InferenceConfig {
    pub model_id: u32,
    pub input_size: InputSize,
    pub device: DeviceType,
    pub assets_dir: PathBuf,
    pub camera_facing: CameraFacing,
    tunables: Tunables,
}

impl InferenceConfig {
    pub fn new(model_id: u32, input_size: InputSize, device: DeviceType) -> Self {
        Self {
            model_id,
            input_size,
            device,
            assets_dir: PathBuf::from(DEFAULT_ASSETS_DIR),
            camera_facing: CameraFacing::default(),
            tunables: Tunables::default(),
        }
    }

    pub fn with_tunables(mut self, tunables: Tunables) -> Result<Self> {
        tunables.validate()?;
        self.tunables = tunables;
        Ok(self)
    }

    pub fn tunables(&self) -> Tunables {
        self.tunables
    }

    /// Replace all four tunables. Rejected values leave the config unchanged.
    pub fn set_tunables(&mut self, tunables: Tunables) -> Result<()> {
        tunables.validate()?;
        self.tunables = tunables;
        Ok(())
    }

    /// Send the full tunable set to the engine.
    pub fn push_tunables(&self, engine: &dyn InferenceEngine) {
        let t = self.tunables;
        engine.set_threshold(t.threshold);
        engine.set_nms(t.nms_threshold);
        engine.set_track_enabled(t.track_enabled);
        engine.set_shader_enabled(t.shader_enabled);
        log::debug!(
            "InferenceConfig: pushed threshold={:.2} nms={:.2} track={} shader={}",
            t.threshold,
            t.nms_threshold,
            t.track_enabled,
            t.shader_enabled
        );
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self::new(
            DEFAULT_MODEL_ID,
            InputSize::from_index(DEFAULT_INPUT_SIZE_INDEX),
            DeviceType::default(),
        )
    }
}

// ----------------------------------------------------------------------------
// Session configuration file + environment
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct SessionConfigFile {
    assets_dir: Option<PathBuf>,
    model: Option<ModelConfigFile>,
    params: Option<ParamsConfigFile>,
    camera: Option<CameraConfigFile>,
    network: Option<NetworkConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    id: Option<u32>,
    input_size_index: Option<u32>,
    device: Option<DeviceType>,
}

#[derive(Debug, Deserialize, Default)]
struct ParamsConfigFile {
    threshold: Option<f32>,
    nms_threshold: Option<f32>,
    track: Option<bool>,
    shader: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    facing: Option<CameraFacing>,
}

#[derive(Debug, Deserialize, Default)]
struct NetworkConfigFile {
    url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub inference: InferenceConfig,
    pub input_size_index: u32,
    pub stream_url: Option<String>,
}

impl SessionConfig {
    /// Load from `DETECT_CONFIG` (if set), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("DETECT_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?);
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SessionConfigFile) -> Self {
        let model = file.model.unwrap_or_default();
        let params = file.params.unwrap_or_default();
        let input_size_index = model.input_size_index.unwrap_or(DEFAULT_INPUT_SIZE_INDEX);

        let mut inference = InferenceConfig::new(
            model.id.unwrap_or(DEFAULT_MODEL_ID),
            InputSize::from_index(input_size_index),
            model.device.unwrap_or_default(),
        );
        inference.assets_dir = file
            .assets_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ASSETS_DIR));
        inference.camera_facing = file
            .camera
            .and_then(|camera| camera.facing)
            .unwrap_or_default();
        // Range checks happen in validate(); stash raw values until then.
        inference.tunables = Tunables {
            threshold: params.threshold.unwrap_or(DEFAULT_THRESHOLD),
            nms_threshold: params.nms_threshold.unwrap_or(DEFAULT_NMS_THRESHOLD),
            track_enabled: params.track.unwrap_or(false),
            shader_enabled: params.shader.unwrap_or(false),
        };

        Self {
            inference,
            input_size_index,
            stream_url: file.network.and_then(|network| network.url),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(value) = env_value("DETECT_MODEL_ID") {
            self.inference.model_id = value
                .parse()
                .map_err(|_| anyhow!("DETECT_MODEL_ID must be a non-negative integer"))?;
        }
        if let Some(value) = env_value("DETECT_INPUT_SIZE_INDEX") {
            self.input_size_index = value
                .parse()
                .map_err(|_| anyhow!("DETECT_INPUT_SIZE_INDEX must be 0, 1 or 2"))?;
            self.inference.input_size = InputSize::from_index(self.input_size_index);
        }
        if let Some(value) = env_value("DETECT_DEVICE") {
            self.inference.device = value.parse()?;
        }
        if let Some(value) = env_value("DETECT_CAMERA_FACING") {
            self.inference.camera_facing = value.parse()?;
        }
        if let Some(value) = env_value("DETECT_ASSETS_DIR") {
            self.inference.assets_dir = PathBuf::from(value);
        }
        if let Some(value) = env_value("DETECT_THRESHOLD") {
            self.inference.tunables.threshold = value
                .parse()
                .map_err(|_| anyhow!("DETECT_THRESHOLD must be a number in [0, 1]"))?;
        }
        if let Some(value) = env_value("DETECT_NMS_THRESHOLD") {
            self.inference.tunables.nms_threshold = value
                .parse()
                .map_err(|_| anyhow!("DETECT_NMS_THRESHOLD must be a number in [0, 1]"))?;
        }
        if let Some(value) = env_value("DETECT_STREAM_URL") {
            self.stream_url = Some(value);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.input_size_index > 2 {
            bail!(
                "input size index {} out of range (0=320, 1=640, 2=1280)",
                self.input_size_index
            );
        }
        self.inference.tunables.validate()?;
        if let Some(url) = &self.stream_url {
            if url.trim().is_empty() {
                self.stream_url = None;
            }
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<SessionConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn validate_unit(name: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        bail!("{} must be within [0, 1], got {}", name, value);
    }
    Ok(())
}
