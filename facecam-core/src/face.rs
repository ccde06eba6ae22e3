use anyhow::{Context, Result};
use log::{debug, info};
use opencv::core::{Mat, Rect, Scalar, Size, Vector};
use opencv::imgproc;
use opencv::objdetect::{self, CascadeClassifier};
use opencv::prelude::*;
use std::path::Path;

use crate::config::DetectionParams;
use crate::error::FaceCamError;

const DETECTION_COLOR: (f64, f64, f64) = (255.0, 255.0, 255.0);
const LINE_THICKNESS: i32 = 2;

/// Axis-aligned face box in frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceRegion {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl FaceRegion {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    pub fn to_rect(self) -> Rect {
        Rect::new(self.x, self.y, self.width, self.height)
    }

    /// Intersect with a `cols` x `rows` image; `None` if nothing is left.
    pub fn clamp(self, cols: i32, rows: i32) -> Option<Self> {
        let x0 = self.x.max(0);
        let y0 = self.y.max(0);
        let x1 = (self.x + self.width).min(cols);
        let y1 = (self.y + self.height).min(rows);

        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Self::new(x0, y0, x1 - x0, y1 - y0))
    }
}

impl From<Rect> for FaceRegion {
    fn from(rect: Rect) -> Self {
        Self::new(rect.x, rect.y, rect.width, rect.height)
    }
}

pub trait Detector {
    /// Find faces in an 8-bit grayscale image.
    fn detect(&mut self, gray: &Mat, params: &DetectionParams) -> Result<Vec<FaceRegion>>;
}

impl<D: Detector> Detector for Option<D> {
    fn detect(&mut self, gray: &Mat, params: &DetectionParams) -> Result<Vec<FaceRegion>> {
        match self {
            Some(detector) => detector.detect(gray, params),
            None => Ok(Vec::new()),
        }
    }
}

pub struct HaarDetector {
    classifier: CascadeClassifier,
}

impl HaarDetector {
    pub fn new(cascade_path: &Path) -> Result<Self> {
        if !cascade_path.exists() {
            return Err(FaceCamError::ModelMissing(cascade_path.to_path_buf()).into());
        }

        let path_str = cascade_path
            .to_str()
            .with_context(|| format!("Non UTF-8 cascade path {:?}", cascade_path))?;
        let classifier = CascadeClassifier::new(path_str)
            .with_context(|| format!("Failed to load cascade {:?}", cascade_path))?;

        if classifier.empty()? {
            anyhow::bail!("Cascade {:?} loaded but is empty", cascade_path);
        }

        info!("Loaded face cascade from {:?}", cascade_path);
        Ok(Self { classifier })
    }
}

impl Detector for HaarDetector {
    fn detect(&mut self, gray: &Mat, params: &DetectionParams) -> Result<Vec<FaceRegion>> {
        let mut faces = Vector::<Rect>::new();
        let min_size = params
            .min_size
            .map(|(w, h)| Size::new(w, h))
            .unwrap_or_default();

        self.classifier.detect_multi_scale(
            gray,
            &mut faces,
            params.scale_factor,
            params.min_neighbors,
            objdetect::CASCADE_SCALE_IMAGE,
            min_size,
            Size::default(),
        )?;

        debug!("Detected {} face(s)", faces.len());
        Ok(faces.iter().map(FaceRegion::from).collect())
    }
}

pub fn to_gray(frame: &Mat) -> Result<Mat> {
    if frame.channels() == 1 {
        return Ok(frame.try_clone()?);
    }
    let mut gray = Mat::default();
    imgproc::cvt_color(frame, &mut gray, imgproc::COLOR_BGR2GRAY, 0)?;
    Ok(gray)
}

pub fn equalize(gray: &Mat) -> Result<Mat> {
    let mut equalized = Mat::default();
    imgproc::equalize_hist(gray, &mut equalized)?;
    Ok(equalized)
}

/// Copy of the region of `image`, clamped to its bounds.
pub fn crop(image: &Mat, region: FaceRegion) -> Result<Option<Mat>> {
    let Some(region) = region.clamp(image.cols(), image.rows()) else {
        return Ok(None);
    };
    let roi = Mat::roi(image, region.to_rect())?;
    Ok(Some(roi.try_clone()?))
}

pub fn draw_detection(frame: &mut Mat, region: FaceRegion) -> Result<()> {
    let (b, g, r) = DETECTION_COLOR;
    imgproc::rectangle(
        frame,
        region.to_rect(),
        Scalar::new(b, g, r, 0.0),
        LINE_THICKNESS,
        imgproc::LINE_8,
        0,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{CV_8UC1, CV_8UC3};

    struct FixedDetector(Vec<FaceRegion>);

    impl Detector for FixedDetector {
        fn detect(&mut self, _gray: &Mat, _params: &DetectionParams) -> Result<Vec<FaceRegion>> {
            Ok(self.0.clone())
        }
    }

    fn params() -> DetectionParams {
        DetectionParams { scale_factor: 1.3, min_neighbors: 5, min_size: None }
    }

    #[test]
    fn clamp_trims_to_image() {
        let region = FaceRegion::new(-10, 5, 50, 100);
        assert_eq!(region.clamp(30, 40), Some(FaceRegion::new(0, 5, 30, 35)));
    }

    #[test]
    fn clamp_outside_image_is_none() {
        assert_eq!(FaceRegion::new(50, 50, 10, 10).clamp(40, 40), None);
        assert_eq!(FaceRegion::new(0, 0, 0, 10).clamp(40, 40), None);
    }

    #[test]
    fn missing_detector_finds_nothing() {
        let gray = Mat::new_rows_cols_with_default(4, 4, CV_8UC1, Scalar::all(0.0)).unwrap();
        let mut detector: Option<FixedDetector> = None;
        assert!(detector.detect(&gray, &params()).unwrap().is_empty());

        let mut detector = Some(FixedDetector(vec![FaceRegion::new(0, 0, 2, 2)]));
        assert_eq!(detector.detect(&gray, &params()).unwrap().len(), 1);
    }

    #[test]
    fn missing_cascade_is_model_missing() {
        let err = HaarDetector::new(Path::new("/nonexistent/cascade.xml"))
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<FaceCamError>(),
            Some(FaceCamError::ModelMissing(_))
        ));
    }

    #[test]
    fn gray_and_crop() {
        let frame =
            Mat::new_rows_cols_with_default(20, 30, CV_8UC3, Scalar::all(100.0)).unwrap();
        let gray = to_gray(&frame).unwrap();
        assert_eq!(gray.channels(), 1);
        assert_eq!((gray.cols(), gray.rows()), (30, 20));

        let face = crop(&gray, FaceRegion::new(25, 15, 10, 10)).unwrap().unwrap();
        assert_eq!((face.cols(), face.rows()), (5, 5));
        assert!(crop(&gray, FaceRegion::new(40, 0, 5, 5)).unwrap().is_none());
    }

    #[test]
    fn drawing_marks_the_frame() {
        let mut frame =
            Mat::new_rows_cols_with_default(20, 20, CV_8UC3, Scalar::all(0.0)).unwrap();
        let before = frame.data_bytes().unwrap().to_vec();

        draw_detection(&mut frame, FaceRegion::new(2, 2, 10, 10)).unwrap();
        assert_ne!(frame.data_bytes().unwrap(), before.as_slice());
    }
}
