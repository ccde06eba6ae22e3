use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaceCamError {
    #[error("camera {device_id} unavailable: {reason}")]
    CameraUnavailable { device_id: i32, reason: String },

    #[error("invalid label {0:?}")]
    InvalidLabel(String),

    #[error("empty frame")]
    EmptyFrame,

    #[error("model file missing: {0}")]
    ModelMissing(PathBuf),

    #[error("label index {path} is corrupt: {reason}")]
    CorruptLabelIndex { path: PathBuf, reason: String },

    #[error("no faces found in dataset {0}")]
    EmptyTrainingSet(PathBuf),
}
