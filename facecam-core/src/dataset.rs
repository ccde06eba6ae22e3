use anyhow::{Context, Result};
use log::{debug, info, warn};
use opencv::core::{Mat, Vector};
use opencv::imgcodecs;
use opencv::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::FaceCamError;

const COUNTER_FILE: &str = ".counter";
const IMAGE_EXTENSION: &str = "jpg";
const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// Turn free-form user input into a directory-safe label.
pub fn sanitize_label(name: &str) -> Result<String> {
    let label = name.trim().replace(' ', "_").to_lowercase();

    let invalid = label.is_empty()
        || label == "."
        || label == ".."
        || label.starts_with('.')
        || label.contains(|c: char| c == '/' || c == '\\');
    if invalid {
        return Err(FaceCamError::InvalidLabel(name.to_string()).into());
    }
    Ok(label)
}

pub fn is_image_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .map_or(true, |n| n.starts_with('.'));
    if hidden {
        return false;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

fn numeric_stem(path: &Path) -> Option<u64> {
    path.file_stem()?.to_str()?.parse().ok()
}

/// Labeled training images stored as `<root>/<label>/<n>.jpg`.
#[derive(Debug)]
pub struct Dataset {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl Dataset {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn label_dir(&self, label: &str) -> PathBuf {
        self.root.join(label)
    }

    /// Write `frame` as the next image for `name`; returns the new file.
    pub fn save(&self, name: &str, frame: &Mat) -> Result<PathBuf> {
        let label = sanitize_label(name)?;
        if frame.empty() {
            return Err(FaceCamError::EmptyFrame.into());
        }

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("Dataset lock poisoned"))?;

        let dir = self.label_dir(&label);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create dataset directory {:?}", dir))?;

        let index = self.next_index(&label)?;
        let path = dir.join(format!("{}.{}", index, IMAGE_EXTENSION));
        let path_str = path
            .to_str()
            .with_context(|| format!("Non UTF-8 dataset path {:?}", path))?;

        let written = imgcodecs::imwrite(path_str, frame, &Vector::new())
            .with_context(|| format!("Failed to encode {:?}", path))?;
        if !written {
            anyhow::bail!("Image writer refused {:?}", path);
        }

        self.store_counter(&label, index)?;
        info!("Saved {:?}", path);
        Ok(path)
    }

    /// One past the highest index ever issued for `label`.
    pub fn next_index(&self, label: &str) -> Result<u64> {
        let dir = self.label_dir(label);
        let counter = self.load_counter(label)?;
        let highest_file = self
            .entries(label)?
            .iter()
            .filter_map(|p| numeric_stem(p))
            .max()
            .unwrap_or(0);

        let next = counter.max(highest_file) + 1;
        debug!("Next index for {:?} is {}", dir, next);
        Ok(next)
    }

    fn load_counter(&self, label: &str) -> Result<u64> {
        let path = self.label_dir(label).join(COUNTER_FILE);
        if !path.exists() {
            return Ok(0);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        match content.trim().parse() {
            Ok(counter) => Ok(counter),
            Err(e) => {
                warn!("Ignoring unreadable counter {:?} ({:?}): {}", path, content.trim(), e);
                Ok(0)
            }
        }
    }

    fn store_counter(&self, label: &str, index: u64) -> Result<()> {
        let dir = self.label_dir(label);
        let tmp = dir.join(format!("{}.tmp", COUNTER_FILE));
        let path = dir.join(COUNTER_FILE);
        fs::write(&tmp, index.to_string())
            .with_context(|| format!("Failed to write {:?}", tmp))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace {:?}", path))?;
        Ok(())
    }

    /// Label directories, sorted by name.
    pub fn labels(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut labels = Vec::new();
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("Failed to list {:?}", self.root))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                labels.push(name);
            }
        }
        labels.sort();
        Ok(labels)
    }

    /// Image files for `label`, numbered files first in index order.
    pub fn entries(&self, label: &str) -> Result<Vec<PathBuf>> {
        let dir = self.label_dir(label);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = fs::read_dir(&dir)
            .with_context(|| format!("Failed to list {:?}", dir))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && is_image_file(path))
            .collect();

        files.sort_by(|a, b| {
            let key = |p: &PathBuf| (numeric_stem(p).unwrap_or(u64::MAX), p.clone());
            key(a).cmp(&key(b))
        });
        Ok(files)
    }

    pub fn summary(&self) -> Result<Vec<(String, usize)>> {
        self.labels()?
            .into_iter()
            .map(|label| {
                let count = self.entries(&label)?.len();
                Ok((label, count))
            })
            .collect()
    }
}
