use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use opencv::core::Mat;
use opencv::imgcodecs;
use opencv::prelude::*;
use std::fs;
use std::path::Path;

use crate::config::{AppPaths, DetectionParams, FaceCamConfig};
use crate::dataset::Dataset;
use crate::error::FaceCamError;
use crate::face::{self, Detector, HaarDetector};
use crate::labels::LabelIndex;
use crate::models;
use crate::recognizer::{FaceModel, LbphModel};

#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub labels: usize,
    pub images: usize,
    pub samples: usize,
    pub skipped: usize,
    pub finished_at: DateTime<Utc>,
}

pub struct Trainer<D, M> {
    detector: D,
    model: M,
    params: DetectionParams,
}

impl<D: Detector, M: FaceModel> Trainer<D, M> {
    pub fn new(detector: D, model: M, params: DetectionParams) -> Self {
        Self { detector, model, params }
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Rebuild the label index and model from every image in `dataset`.
    ///
    /// The label index is always rewritten. The model file is only written
    /// when at least one face was found.
    pub fn run(&mut self, dataset: &Dataset, paths: &AppPaths) -> Result<TrainingReport> {
        fs::create_dir_all(&paths.recognizers_dir)
            .with_context(|| format!("Failed to create {:?}", paths.recognizers_dir))?;

        let mut labels = LabelIndex::new();
        let mut faces: Vec<Mat> = Vec::new();
        let mut ids: Vec<i32> = Vec::new();
        let mut images = 0;
        let mut skipped = 0;

        for label in dataset.labels()? {
            for path in dataset.entries(&label)? {
                let id = labels.id_for(&label);
                images += 1;

                match self.samples_from(&path) {
                    Ok(found) => {
                        debug!("{:?}: {} face(s)", path, found.len());
                        ids.extend(std::iter::repeat(id).take(found.len()));
                        faces.extend(found);
                    }
                    Err(e) => {
                        warn!("Skipping {:?}: {:#}", path, e);
                        skipped += 1;
                    }
                }
            }
        }

        labels.save(&paths.label_index)?;
        info!("Wrote {} label(s) to {:?}", labels.len(), paths.label_index);

        if faces.is_empty() {
            return Err(FaceCamError::EmptyTrainingSet(dataset.root().to_path_buf()).into());
        }

        self.model.train(&faces, &ids)?;
        self.model.write(&paths.model_file)?;
        info!(
            "Trained on {} face(s) from {} image(s), model saved to {:?}",
            faces.len(),
            images,
            paths.model_file
        );

        Ok(TrainingReport {
            labels: labels.len(),
            images,
            samples: faces.len(),
            skipped,
            finished_at: Utc::now(),
        })
    }

    fn samples_from(&mut self, path: &Path) -> Result<Vec<Mat>> {
        let path_str = path
            .to_str()
            .with_context(|| format!("Non UTF-8 path {:?}", path))?;
        let gray = imgcodecs::imread(path_str, imgcodecs::IMREAD_GRAYSCALE)?;
        if gray.empty() {
            anyhow::bail!("could not decode image");
        }

        let mut samples = Vec::new();
        for region in self.detector.detect(&gray, &self.params)? {
            if let Some(face) = face::crop(&gray, region)? {
                samples.push(face);
            }
        }
        Ok(samples)
    }
}

/// Train with the OpenCV detector and LBPH model described by `config`.
pub fn train_with_config(config: &FaceCamConfig, paths: &AppPaths) -> Result<TrainingReport> {
    let cascade = models::locate_cascade(config, paths)
        .ok_or_else(|| FaceCamError::ModelMissing(paths.models_dir.join(models::CASCADE.name)))?;
    let detector = HaarDetector::new(&cascade)?;
    let model = LbphModel::new(&config.recognition)?;

    let dataset = Dataset::new(&paths.dataset_dir);
    Trainer::new(detector, model, config.detection.training).run(&dataset, paths)
}
