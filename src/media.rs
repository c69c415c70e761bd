//! Video file acceptance.
//!
//! Local video files are checked here before a request reaches the session:
//! the extension must be a known container and the file must exist and be
//! readable. Decoding is left to the engine.

use anyhow::{anyhow, bail, Context, Result};
use std::fs::File;
use std::path::{Path, PathBuf};

pub const VIDEO_EXTENSIONS: [&str; 4] = ["mp4", "avi", "mov", "mkv"];

/// Case-insensitive extension check.
pub fn has_video_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            VIDEO_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

pub fn validate_video_file(path: &Path) -> Result<PathBuf> {
    if path.as_os_str().is_empty() {
        bail!("video path is empty");
    }
    if path.to_string_lossy().contains("://") {
        bail!(
            "video detection only supports local files, got {}",
            path.display()
        );
    }
    if !has_video_extension(path) {
        bail!(
            "unsupported video file {} (expected .mp4, .avi, .mov or .mkv)",
            path.display()
        );
    }
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("video file {} not found", path.display()))?;
    if !metadata.is_file() {
        return Err(anyhow!("{} is not a regular file", path.display()));
    }
    File::open(path).with_context(|| format!("video file {} is not readable", path.display()))?;
    Ok(path.to_path_buf())
}
