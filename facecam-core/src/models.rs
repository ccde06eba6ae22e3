//! Haar cascade lookup and download.
//!
//! OpenCV ships the frontal face cascade with most installs; when it cannot
//! be found it is fetched once into the project's models directory.

use anyhow::{Context, Result};
use log::{debug, info};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::config::{AppPaths, FaceCamConfig};

pub struct ModelInfo {
    pub name: &'static str,
    pub url: &'static str,
    pub size_kb: u32,
}

pub const CASCADE: ModelInfo = ModelInfo {
    name: "haarcascade_frontalface_default.xml",
    url: "https://raw.githubusercontent.com/opencv/opencv/4.x/data/haarcascades/haarcascade_frontalface_default.xml",
    size_kb: 909,
};

const SYSTEM_CASCADE_DIRS: [&str; 4] = [
    "/usr/share/opencv4/haarcascades",
    "/usr/local/share/opencv4/haarcascades",
    "/usr/share/opencv/haarcascades",
    "/opt/homebrew/share/opencv4/haarcascades",
];

/// Directories searched for the cascade, most specific first.
pub fn cascade_search_dirs(paths: &AppPaths) -> Vec<PathBuf> {
    let mut dirs = vec![paths.models_dir.clone()];
    if let Some(data_dir) = dirs::data_dir() {
        dirs.push(data_dir.join("facecam").join("models"));
    }
    dirs.extend(SYSTEM_CASCADE_DIRS.iter().map(PathBuf::from));
    dirs
}

pub fn locate_cascade(config: &FaceCamConfig, paths: &AppPaths) -> Option<PathBuf> {
    if let Some(ref explicit) = config.paths.cascade_file {
        let path = paths.root.join(explicit);
        if path.exists() {
            return Some(path);
        }
        debug!("Configured cascade {:?} not found, searching", path);
    }

    cascade_search_dirs(paths)
        .into_iter()
        .map(|dir| dir.join(CASCADE.name))
        .find(|path| path.exists())
}

pub type ProgressCallback = Box<dyn Fn(f64) + Send>;

/// Download the cascade into `dest_dir` and return its path.
pub fn download_cascade(dest_dir: &Path, progress: Option<ProgressCallback>) -> Result<PathBuf> {
    fs::create_dir_all(dest_dir)
        .with_context(|| format!("Failed to create models directory {:?}", dest_dir))?;
    let final_path = dest_dir.join(CASCADE.name);

    info!("Downloading {} from {}", CASCADE.name, CASCADE.url);
    let response = ureq::get(CASCADE.url)
        .call()
        .with_context(|| format!("Failed to download {}", CASCADE.name))?;

    let limit = max_download_bytes();
    let content_length = response
        .header("content-length")
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(CASCADE.size_kb as usize * 1024);

    let data = read_capped(response.into_reader(), content_length, limit, progress.as_deref())?;

    if !looks_like_cascade(&data) {
        anyhow::bail!("Downloaded {} is not a cascade file", CASCADE.name);
    }

    let tmp_path = dest_dir.join(format!("{}.part", CASCADE.name));
    let mut file = File::create(&tmp_path)
        .with_context(|| format!("Failed to create {:?}", tmp_path))?;
    file.write_all(&data)
        .with_context(|| format!("Failed to write {:?}", tmp_path))?;
    fs::rename(&tmp_path, &final_path)
        .with_context(|| format!("Failed to move cascade to {:?}", final_path))?;

    info!("Saved cascade to {:?} ({} bytes)", final_path, data.len());
    Ok(final_path)
}

/// Largest body accepted for the cascade, whatever the server claims.
fn max_download_bytes() -> usize {
    4 * CASCADE.size_kb as usize * 1024
}

fn read_capped(
    mut reader: impl Read,
    expected: usize,
    limit: usize,
    progress: Option<&(dyn Fn(f64) + Send)>,
) -> Result<Vec<u8>> {
    let expected = expected.clamp(1, limit);
    let mut data = Vec::with_capacity(expected);
    let mut buffer = [0u8; 8192];

    loop {
        let n = reader.read(&mut buffer).context("Download interrupted")?;
        if n == 0 {
            break;
        }
        if data.len() + n > limit {
            anyhow::bail!("Download exceeded {} bytes", limit);
        }
        data.extend_from_slice(&buffer[..n]);
        if let Some(p) = progress {
            p((data.len() as f64 / expected as f64).min(1.0));
        }
    }
    Ok(data)
}

fn looks_like_cascade(data: &[u8]) -> bool {
    let text = String::from_utf8_lossy(data);
    text.contains("<opencv_storage>") || text.contains("<cascade")
}
