use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::recognizer::AcceptanceBand;

pub const CONFIG_FILE_NAME: &str = "facecam.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FaceCamConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub recognition: RecognitionConfig,
    #[serde(default)]
    pub version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_dataset_dir")]
    pub dataset_dir: PathBuf,
    #[serde(default = "default_recognizers_dir")]
    pub recognizers_dir: PathBuf,
    #[serde(default = "default_label_file")]
    pub label_file: String,
    #[serde(default = "default_model_file")]
    pub model_file: String,
    #[serde(default = "default_stylesheet")]
    pub stylesheet: PathBuf,
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,
    #[serde(default)]
    pub cascade_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    #[serde(default)]
    pub device_id: i32,
    #[serde(default = "default_frame_width")]
    pub frame_width: u32,
    #[serde(default = "default_frame_height")]
    pub frame_height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    #[serde(default = "default_live_params")]
    pub live: DetectionParams,
    #[serde(default = "default_training_params")]
    pub training: DetectionParams,
}

/// Cascade tuning passed straight to `detectMultiScale`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionParams {
    pub scale_factor: f64,
    pub min_neighbors: i32,
    /// Smallest face (width, height) in pixels; `None` lets the cascade decide.
    #[serde(default)]
    pub min_size: Option<(i32, i32)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionConfig {
    #[serde(default = "default_radius")]
    pub radius: i32,
    #[serde(default = "default_neighbors")]
    pub neighbors: i32,
    #[serde(default = "default_grid")]
    pub grid_x: i32,
    #[serde(default = "default_grid")]
    pub grid_y: i32,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_max_confidence")]
    pub max_confidence: f64,
}

fn default_dataset_dir() -> PathBuf { PathBuf::from("dataset") }
fn default_recognizers_dir() -> PathBuf { PathBuf::from("recognizers") }
fn default_label_file() -> String { "face_labels.json".to_string() }
fn default_model_file() -> String { "face_trainer.yml".to_string() }
fn default_stylesheet() -> PathBuf { PathBuf::from("stylesheet/stylesheet.css") }
fn default_models_dir() -> PathBuf { PathBuf::from("models") }
fn default_frame_width() -> u32 { 640 }
fn default_frame_height() -> u32 { 480 }
fn default_fps() -> u32 { 30 }
fn default_live_params() -> DetectionParams {
    DetectionParams { scale_factor: 1.3, min_neighbors: 5, min_size: Some((60, 60)) }
}
fn default_training_params() -> DetectionParams {
    DetectionParams { scale_factor: 1.5, min_neighbors: 5, min_size: None }
}
fn default_radius() -> i32 { 1 }
fn default_neighbors() -> i32 { 8 }
fn default_grid() -> i32 { 8 }
fn default_min_confidence() -> f64 { 60.0 }
fn default_max_confidence() -> f64 { 99.0 }

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            root: None,
            dataset_dir: default_dataset_dir(),
            recognizers_dir: default_recognizers_dir(),
            label_file: default_label_file(),
            model_file: default_model_file(),
            stylesheet: default_stylesheet(),
            models_dir: default_models_dir(),
            cascade_file: None,
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            frame_width: default_frame_width(),
            frame_height: default_frame_height(),
            fps: default_fps(),
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            live: default_live_params(),
            training: default_training_params(),
        }
    }
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            radius: default_radius(),
            neighbors: default_neighbors(),
            grid_x: default_grid(),
            grid_y: default_grid(),
            min_confidence: default_min_confidence(),
            max_confidence: default_max_confidence(),
        }
    }
}

impl RecognitionConfig {
    pub fn band(&self) -> AcceptanceBand {
        AcceptanceBand::new(self.min_confidence, self.max_confidence)
    }
}

/// Fully resolved locations handed to every component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub root: PathBuf,
    pub dataset_dir: PathBuf,
    pub recognizers_dir: PathBuf,
    pub label_index: PathBuf,
    pub model_file: PathBuf,
    pub stylesheet: PathBuf,
    pub models_dir: PathBuf,
}

impl FaceCamConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {:?}", path))?;
            let config: FaceCamConfig = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config {:?}", path))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Project config first, then the user's config directory, then defaults.
    pub fn discover(root: &Path) -> Self {
        let mut candidates = vec![root.join(CONFIG_FILE_NAME)];
        if let Some(config_dir) = dirs::config_dir() {
            candidates.push(config_dir.join("facecam").join("config.json"));
        }

        for path in candidates {
            if !path.exists() {
                continue;
            }
            match Self::load(&path) {
                Ok(config) => {
                    info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => warn!("Ignoring config {:?}: {:#}", path, e),
            }
        }

        Self::default()
    }

    pub fn paths(&self, fallback_root: &Path) -> AppPaths {
        let root = self
            .paths
            .root
            .clone()
            .unwrap_or_else(|| fallback_root.to_path_buf());
        let recognizers_dir = root.join(&self.paths.recognizers_dir);

        AppPaths {
            dataset_dir: root.join(&self.paths.dataset_dir),
            label_index: recognizers_dir.join(&self.paths.label_file),
            model_file: recognizers_dir.join(&self.paths.model_file),
            stylesheet: root.join(&self.paths.stylesheet),
            models_dir: root.join(&self.paths.models_dir),
            recognizers_dir,
            root,
        }
    }
}

/// The working directory, or its parent when launched from inside `src`.
pub fn detect_project_root(cwd: &Path) -> PathBuf {
    match cwd.file_name() {
        Some(name) if name == "src" => cwd.parent().unwrap_or(cwd).to_path_buf(),
        _ => cwd.to_path_buf(),
    }
}

/// Resolve root and config together from the process working directory.
pub fn load_from_cwd() -> Result<(FaceCamConfig, AppPaths)> {
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    let root = detect_project_root(&cwd);
    let config = FaceCamConfig::discover(&root);
    let paths = config.paths(&root);
    Ok((config, paths))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = FaceCamConfig::load(&dir.path().join("nope.json")).unwrap();

        assert_eq!(config.camera.device_id, 0);
        assert_eq!(config.detection.live.scale_factor, 1.3);
        assert_eq!(config.detection.live.min_size, Some((60, 60)));
        assert_eq!(config.detection.training.scale_factor, 1.5);
        assert_eq!(config.detection.training.min_size, None);
        assert_eq!(config.recognition.min_confidence, 60.0);
        assert_eq!(config.recognition.max_confidence, 99.0);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            r#"{ "camera": { "device_id": 2 }, "recognition": { "max_confidence": 80.0 } }"#,
        )
        .unwrap();

        let config = FaceCamConfig::load(&path).unwrap();
        assert_eq!(config.camera.device_id, 2);
        assert_eq!(config.camera.frame_width, 640);
        assert_eq!(config.recognition.max_confidence, 80.0);
        assert_eq!(config.recognition.min_confidence, 60.0);
        assert_eq!(config.recognition.grid_x, 8);
        assert_eq!(config.paths.label_file, "face_labels.json");
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "{ not json").unwrap();

        assert!(FaceCamConfig::load(&path).is_err());
    }

    #[test]
    fn discover_prefers_project_config() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{ "camera": { "device_id": 4 } }"#,
        )
        .unwrap();

        let config = FaceCamConfig::discover(dir.path());
        assert_eq!(config.camera.device_id, 4);
    }

    #[test]
    fn paths_resolve_against_root() {
        let config = FaceCamConfig::default();
        let paths = config.paths(Path::new("/work/facecam"));

        assert_eq!(paths.dataset_dir, PathBuf::from("/work/facecam/dataset"));
        assert_eq!(
            paths.label_index,
            PathBuf::from("/work/facecam/recognizers/face_labels.json")
        );
        assert_eq!(
            paths.model_file,
            PathBuf::from("/work/facecam/recognizers/face_trainer.yml")
        );
        assert_eq!(
            paths.stylesheet,
            PathBuf::from("/work/facecam/stylesheet/stylesheet.css")
        );
    }

    #[test]
    fn explicit_root_and_absolute_dirs_win() {
        let mut config = FaceCamConfig::default();
        config.paths.root = Some(PathBuf::from("/srv/faces"));
        config.paths.dataset_dir = PathBuf::from("/mnt/images");

        let paths = config.paths(Path::new("/ignored"));
        assert_eq!(paths.root, PathBuf::from("/srv/faces"));
        assert_eq!(paths.dataset_dir, PathBuf::from("/mnt/images"));
        assert_eq!(paths.recognizers_dir, PathBuf::from("/srv/faces/recognizers"));
    }

    #[test]
    fn project_root_strips_src() {
        assert_eq!(
            detect_project_root(Path::new("/home/me/facecam/src")),
            PathBuf::from("/home/me/facecam")
        );
        assert_eq!(
            detect_project_root(Path::new("/home/me/facecam")),
            PathBuf::from("/home/me/facecam")
        );
    }

    #[test]
    fn band_comes_from_recognition_section() {
        let band = RecognitionConfig::default().band();
        assert!(band.accepts(60.0));
        assert!(band.accepts(99.0));
        assert!(!band.accepts(100.0));
    }
}
