//! Face detection, recognition and dataset collection on top of OpenCV.
//!
//! The GUI in the `facecam` crate and the `facecam-train` binary share
//! everything here.

pub mod camera;
pub mod capture;
pub mod config;
pub mod dataset;
pub mod error;
pub mod face;
pub mod labels;
pub mod models;
pub mod recognizer;
pub mod trainer;

pub use config::{AppPaths, FaceCamConfig};
pub use error::FaceCamError;
