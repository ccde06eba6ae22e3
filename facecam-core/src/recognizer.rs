use anyhow::{Context, Result};
use log::{info, warn};
use opencv::core::{Mat, Point, Scalar, Vector};
use opencv::face::{FaceRecognizerTrait, FaceRecognizerTraitConst, LBPHFaceRecognizer};
use opencv::imgproc;
use opencv::prelude::*;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use crate::config::{AppPaths, RecognitionConfig};
use crate::error::FaceCamError;
use crate::face::FaceRegion;
use crate::labels::LabelIndex;

const RECOGNITION_COLOR: (f64, f64, f64) = (255.0, 0.0, 0.0);
const TEXT_COLOR: (f64, f64, f64) = (255.0, 255.0, 255.0);
const UNKNOWN: &str = "Unknown";

/// Recognizer output. `confidence` is a distance: lower is a closer match.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: i32,
    pub confidence: f64,
}

pub trait FaceModel {
    fn train(&mut self, faces: &[Mat], labels: &[i32]) -> Result<()>;
    fn predict(&self, face: &Mat) -> Result<Prediction>;
    fn read(&mut self, path: &Path) -> Result<()>;
    fn write(&self, path: &Path) -> Result<()>;
}

pub struct LbphModel {
    inner: opencv::core::Ptr<LBPHFaceRecognizer>,
}

impl LbphModel {
    pub fn new(config: &RecognitionConfig) -> Result<Self> {
        let inner = LBPHFaceRecognizer::create(
            config.radius,
            config.neighbors,
            config.grid_x,
            config.grid_y,
            f64::MAX,
        )
        .context("Failed to create LBPH recognizer")?;
        Ok(Self { inner })
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .with_context(|| format!("Non UTF-8 path {:?}", path))
}

impl FaceModel for LbphModel {
    fn train(&mut self, faces: &[Mat], labels: &[i32]) -> Result<()> {
        let faces: Vector<Mat> = faces.iter().cloned().collect();
        let labels = Vector::<i32>::from_slice(labels);
        FaceRecognizerTrait::train(&mut self.inner, &faces, &labels)
            .context("LBPH training failed")?;
        Ok(())
    }

    fn predict(&self, face: &Mat) -> Result<Prediction> {
        let mut label = -1;
        let mut confidence = f64::MAX;
        FaceRecognizerTraitConst::predict(&self.inner, face, &mut label, &mut confidence)?;
        Ok(Prediction { label, confidence })
    }

    fn read(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(FaceCamError::ModelMissing(path.to_path_buf()).into());
        }
        FaceRecognizerTrait::read(&mut self.inner, path_str(path)?)
            .with_context(|| format!("Failed to read model {:?}", path))?;
        if FaceRecognizerTraitConst::empty(&self.inner)? {
            anyhow::bail!("Model {:?} holds no training data", path);
        }
        Ok(())
    }

    fn write(&self, path: &Path) -> Result<()> {
        FaceRecognizerTraitConst::write(&self.inner, path_str(path)?)
            .with_context(|| format!("Failed to write model {:?}", path))?;
        Ok(())
    }
}

/// Inclusive confidence range in which a prediction is trusted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcceptanceBand {
    pub min: f64,
    pub max: f64,
}

impl AcceptanceBand {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn accepts(&self, confidence: f64) -> bool {
        self.min <= confidence && confidence <= self.max
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Known(String),
    Unknown,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Known(name) => f.write_str(name),
            Identity::Unknown => f.write_str(UNKNOWN),
        }
    }
}

pub fn classify(
    prediction: Prediction,
    band: AcceptanceBand,
    names: &HashMap<i32, String>,
) -> Identity {
    if !band.accepts(prediction.confidence) {
        return Identity::Unknown;
    }
    match names.get(&prediction.label) {
        Some(name) => Identity::Known(name.clone()),
        None => {
            warn!("Model predicted label {} missing from label index", prediction.label);
            Identity::Unknown
        }
    }
}

/// A trained model together with the names it was trained on.
pub struct Recognition<M> {
    model: M,
    names: HashMap<i32, String>,
    band: AcceptanceBand,
}

impl<M: FaceModel> Recognition<M> {
    pub fn load(mut model: M, paths: &AppPaths, band: AcceptanceBand) -> Result<Self> {
        let labels = LabelIndex::load(&paths.label_index)?;
        model.read(&paths.model_file)?;
        info!(
            "Loaded recognizer model {:?} with {} label(s)",
            paths.model_file,
            labels.len()
        );
        Ok(Self {
            model,
            names: labels.names_by_id(),
            band,
        })
    }

    pub fn identify(&self, face: &Mat) -> Result<Identity> {
        let prediction = self.model.predict(face)?;
        Ok(classify(prediction, self.band, &self.names))
    }
}

pub fn draw_identity(frame: &mut Mat, region: FaceRegion, identity: &Identity) -> Result<()> {
    let (tb, tg, tr) = TEXT_COLOR;
    imgproc::put_text(
        frame,
        &identity.to_string(),
        Point::new(region.x, region.y),
        imgproc::FONT_HERSHEY_SIMPLEX,
        1.0,
        Scalar::new(tb, tg, tr, 0.0),
        2,
        imgproc::LINE_AA,
        false,
    )?;

    let (b, g, r) = RECOGNITION_COLOR;
    imgproc::rectangle(
        frame,
        region.to_rect(),
        Scalar::new(b, g, r, 0.0),
        2,
        imgproc::LINE_8,
        0,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{CV_8UC1, CV_8UC3};
    use std::fs;

    #[derive(Default)]
    struct StubModel {
        prediction: Option<Prediction>,
    }

    impl FaceModel for StubModel {
        fn train(&mut self, _faces: &[Mat], _labels: &[i32]) -> Result<()> {
            Ok(())
        }
        fn predict(&self, _face: &Mat) -> Result<Prediction> {
            self.prediction.context("no prediction configured")
        }
        fn read(&mut self, path: &Path) -> Result<()> {
            if !path.exists() {
                return Err(FaceCamError::ModelMissing(path.to_path_buf()).into());
            }
            Ok(())
        }
        fn write(&self, path: &Path) -> Result<()> {
            fs::write(path, "stub")?;
            Ok(())
        }
    }

    fn names() -> HashMap<i32, String> {
        HashMap::from([(0, "alice".to_string()), (1, "bob".to_string())])
    }

    fn predict(label: i32, confidence: f64) -> Identity {
        classify(
            Prediction { label, confidence },
            AcceptanceBand::new(60.0, 99.0),
            &names(),
        )
    }

    #[test]
    fn band_edges_are_inclusive() {
        assert_eq!(predict(0, 60.0), Identity::Known("alice".into()));
        assert_eq!(predict(1, 99.0), Identity::Known("bob".into()));
        assert_eq!(predict(0, 75.5), Identity::Known("alice".into()));
    }

    #[test]
    fn one_unit_outside_is_unknown() {
        assert_eq!(predict(0, 59.0), Identity::Unknown);
        assert_eq!(predict(0, 100.0), Identity::Unknown);
        assert_eq!(predict(0, 0.0), Identity::Unknown);
    }

    #[test]
    fn unlisted_label_is_unknown() {
        assert_eq!(predict(7, 70.0), Identity::Unknown);
    }

    #[test]
    fn identity_display() {
        assert_eq!(Identity::Known("alice".into()).to_string(), "alice");
        assert_eq!(Identity::Unknown.to_string(), "Unknown");
    }

    fn paths_in(root: &Path) -> AppPaths {
        crate::config::FaceCamConfig::default().paths(root)
    }

    #[test]
    fn load_needs_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());
        let band = AcceptanceBand::new(60.0, 99.0);

        assert!(Recognition::load(StubModel::default(), &paths, band).is_err());

        let mut labels = LabelIndex::new();
        labels.id_for("alice");
        labels.save(&paths.label_index).unwrap();
        let err = Recognition::load(StubModel::default(), &paths, band)
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<FaceCamError>(),
            Some(FaceCamError::ModelMissing(p)) if *p == paths.model_file
        ));

        fs::write(&paths.model_file, "model").unwrap();
        let model = StubModel {
            prediction: Some(Prediction { label: 0, confidence: 70.0 }),
        };
        let recognition = Recognition::load(model, &paths, band).unwrap();
        let face = Mat::new_rows_cols_with_default(8, 8, CV_8UC1, Scalar::all(0.0)).unwrap();
        assert_eq!(
            recognition.identify(&face).unwrap(),
            Identity::Known("alice".into())
        );
    }

    #[test]
    fn lbph_read_of_missing_file_fails() {
        let mut model = LbphModel::new(&RecognitionConfig::default()).unwrap();
        assert!(model.read(Path::new("/nonexistent/face_trainer.yml")).is_err());
    }

    #[test]
    fn identity_overlay_draws() {
        let mut frame =
            Mat::new_rows_cols_with_default(60, 120, CV_8UC3, Scalar::all(0.0)).unwrap();
        let before = frame.data_bytes().unwrap().to_vec();

        draw_identity(&mut frame, FaceRegion::new(10, 30, 40, 20), &Identity::Unknown).unwrap();
        assert_ne!(frame.data_bytes().unwrap(), before.as_slice());
    }
}
