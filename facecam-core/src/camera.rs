use anyhow::{Context, Result};
use log::{debug, info};
use opencv::core::Mat;
use opencv::imgproc;
use opencv::prelude::*;
use opencv::videoio::{self, VideoCapture};
use std::fs;

use crate::config::CameraConfig;
use crate::error::FaceCamError;

#[cfg(target_os = "linux")]
const CAPTURE_BACKEND: i32 = videoio::CAP_V4L2;
#[cfg(not(target_os = "linux"))]
const CAPTURE_BACKEND: i32 = videoio::CAP_ANY;

/// Anything that yields BGR frames one at a time.
pub trait FrameSource {
    fn read(&mut self) -> Result<Mat>;
}

/// RGB pixels ready for the display widget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraFrame {
    pub rgb_data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl CameraFrame {
    pub fn from_bgr(mat: &Mat) -> Result<Self> {
        if mat.empty() {
            return Err(FaceCamError::EmptyFrame.into());
        }

        let mut rgb_mat = Mat::default();
        imgproc::cvt_color(mat, &mut rgb_mat, imgproc::COLOR_BGR2RGB, 0)
            .context("Color conversion failed")?;

        let width = rgb_mat.cols() as u32;
        let height = rgb_mat.rows() as u32;
        let rgb_data = rgb_mat
            .data_bytes()
            .context("Failed to get frame data")?
            .to_vec();

        Ok(Self { rgb_data, width, height })
    }

    pub fn stride(&self) -> usize {
        self.width as usize * 3
    }
}

pub struct Camera {
    device_id: i32,
    cap: VideoCapture,
}

impl Camera {
    pub fn open(config: &CameraConfig) -> Result<Self> {
        let device_id = config.device_id;
        let unavailable = |reason: String| FaceCamError::CameraUnavailable { device_id, reason };

        let mut cap = VideoCapture::new(device_id, CAPTURE_BACKEND)
            .map_err(|e| unavailable(e.to_string()))?;

        if !cap.is_opened().unwrap_or(false) {
            return Err(unavailable("device did not open".to_string()).into());
        }

        cap.set(videoio::CAP_PROP_FRAME_WIDTH, config.frame_width as f64).ok();
        cap.set(videoio::CAP_PROP_FRAME_HEIGHT, config.frame_height as f64).ok();
        cap.set(videoio::CAP_PROP_FPS, config.fps as f64).ok();

        let mut camera = Self { device_id, cap };
        camera
            .read()
            .map_err(|e| unavailable(format!("no frames: {:#}", e)))?;

        info!("Opened camera {} ({})", device_id, camera_name(device_id));
        Ok(camera)
    }
}

impl FrameSource for Camera {
    fn read(&mut self) -> Result<Mat> {
        let mut frame = Mat::default();
        self.cap
            .read(&mut frame)
            .context("Failed to read frame")?;

        if frame.empty() {
            return Err(FaceCamError::EmptyFrame.into());
        }
        Ok(frame)
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        debug!("Releasing camera {}", self.device_id);
        let _ = self.cap.release();
    }
}

pub fn camera_name(device_id: i32) -> String {
    let path = format!("/sys/class/video4linux/video{}/name", device_id);
    fs::read_to_string(&path)
        .map(|name| name.trim().to_string())
        .unwrap_or_else(|_| format!("video{}", device_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, CV_8UC3};

    #[test]
    fn frame_from_bgr_swaps_channels() {
        let mat = Mat::new_rows_cols_with_default(2, 3, CV_8UC3, Scalar::new(10.0, 20.0, 30.0, 0.0))
            .unwrap();

        let frame = CameraFrame::from_bgr(&mat).unwrap();
        assert_eq!(frame.width, 3);
        assert_eq!(frame.height, 2);
        assert_eq!(frame.stride(), 9);
        assert_eq!(frame.rgb_data.len(), 18);
        assert_eq!(&frame.rgb_data[..3], &[30, 20, 10]);
    }

    #[test]
    fn empty_mat_is_rejected() {
        let err = CameraFrame::from_bgr(&Mat::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FaceCamError>(),
            Some(FaceCamError::EmptyFrame)
        ));
    }

    #[test]
    fn unknown_device_name_falls_back() {
        assert_eq!(camera_name(9999), "video9999");
    }
}
