use std::sync::Mutex;

use tempfile::NamedTempFile;

use detect_session::config::{CameraFacing, DeviceType, InputSize, SessionConfig};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "DETECT_CONFIG",
        "DETECT_MODEL_ID",
        "DETECT_INPUT_SIZE_INDEX",
        "DETECT_DEVICE",
        "DETECT_THRESHOLD",
        "DETECT_NMS_THRESHOLD",
        "DETECT_ASSETS_DIR",
        "DETECT_STREAM_URL",
        "DETECT_CAMERA_FACING",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = SessionConfig::load().expect("load defaults");
    let tunables = cfg.inference.tunables();
    assert_eq!(cfg.inference.model_id, 0);
    assert_eq!(cfg.inference.input_size, InputSize::S320);
    assert_eq!(cfg.inference.device, DeviceType::Cpu);
    assert_eq!(cfg.inference.camera_facing, CameraFacing::Back);
    assert_eq!(tunables.threshold, 0.45);
    assert_eq!(tunables.nms_threshold, 0.65);
    assert!(cfg.stream_url.is_none());
}

#[test]
fn loads_toml_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
        assets_dir = "/opt/models"

        [model]
        id = 3
        input_size_index = 1
        device = "gpu"

        [params]
        threshold = 0.3
        nms_threshold = 0.5
        track = true

        [camera]
        facing = "front"

        [network]
        url = "rtsp://192.168.1.10:554/stream"
    "#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");

    std::env::set_var("DETECT_CONFIG", file.path());
    std::env::set_var("DETECT_THRESHOLD", "0.6");
    std::env::set_var("DETECT_DEVICE", "cpu");

    let cfg = SessionConfig::load().expect("load config");
    let tunables = cfg.inference.tunables();
    assert_eq!(cfg.inference.model_id, 3);
    assert_eq!(cfg.inference.input_size.pixels(), 640);
    assert_eq!(cfg.inference.device, DeviceType::Cpu);
    assert_eq!(cfg.inference.camera_facing, CameraFacing::Front);
    assert_eq!(cfg.inference.assets_dir.to_str(), Some("/opt/models"));
    assert_eq!(tunables.threshold, 0.6);
    assert_eq!(tunables.nms_threshold, 0.5);
    assert!(tunables.track_enabled);
    assert!(!tunables.shader_enabled);
    assert_eq!(
        cfg.stream_url.as_deref(),
        Some("rtsp://192.168.1.10:554/stream")
    );

    clear_env();
}

#[test]
fn loads_json_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "model": { "id": 1, "input_size_index": 2 },
        "params": { "shader": true }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    let cfg = SessionConfig::load_from(file.path()).expect("load config");
    assert_eq!(cfg.inference.model_id, 1);
    assert_eq!(cfg.inference.input_size, InputSize::S1280);
    assert!(cfg.inference.tunables().shader_enabled);
}

#[test]
fn rejects_out_of_range_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("DETECT_NMS_THRESHOLD", "1.5");
    assert!(SessionConfig::load().is_err());
    clear_env();

    std::env::set_var("DETECT_INPUT_SIZE_INDEX", "7");
    assert!(SessionConfig::load().is_err());
    clear_env();

    std::env::set_var("DETECT_DEVICE", "tpu");
    assert!(SessionConfig::load().is_err());
    clear_env();
}

#[test]
fn blank_stream_url_is_dropped() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, br#"{ "network": { "url": "  " } }"#)
        .expect("write config");
    let cfg = SessionConfig::load_from(file.path()).expect("load config");
    assert!(cfg.stream_url.is_none());
}
