//! Person name to dense recognizer id mapping.
//!
//! Ids are handed out in first-seen order and always form `0..len`.
//! On disk the mapping is a pretty-printed JSON object with sorted keys.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use crate::error::FaceCamError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelIndex {
    ids: BTreeMap<String, i32>,
}

impl LabelIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing id for `name`, or the next free one.
    pub fn id_for(&mut self, name: &str) -> i32 {
        if let Some(id) = self.ids.get(name) {
            return *id;
        }
        let id = self.ids.len() as i32;
        self.ids.insert(name.to_string(), id);
        id
    }

    pub fn get(&self, name: &str) -> Option<i32> {
        self.ids.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn names_by_id(&self) -> HashMap<i32, String> {
        self.ids
            .iter()
            .map(|(name, id)| (*id, name.clone()))
            .collect()
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(FaceCamError::ModelMissing(path.to_path_buf()).into());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read label index {:?}", path))?;
        let ids: BTreeMap<String, i32> =
            serde_json::from_str(&content).map_err(|e| FaceCamError::CorruptLabelIndex {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let mut seen: Vec<i32> = ids.values().copied().collect();
        seen.sort_unstable();
        let contiguous = seen.iter().enumerate().all(|(i, id)| *id == i as i32);
        if !contiguous {
            return Err(FaceCamError::CorruptLabelIndex {
                path: path.to_path_buf(),
                reason: format!("ids {:?} are not 0..{}", seen, seen.len()),
            }
            .into());
        }

        Ok(Self { ids })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }

        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.ids.serialize(&mut ser)?;

        fs::write(path, &buf)
            .with_context(|| format!("Failed to write label index {:?}", path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_follow_first_seen_order() {
        let mut index = LabelIndex::new();
        assert_eq!(index.id_for("zoe"), 0);
        assert_eq!(index.id_for("adam"), 1);
        assert_eq!(index.id_for("zoe"), 0);
        assert_eq!(index.len(), 2);
        assert_eq!(index.get("adam"), Some(1));
        assert_eq!(index.get("nobody"), None);
        assert_eq!(index.names_by_id()[&0], "zoe");
    }

    #[test]
    fn saved_file_is_sorted_and_indented() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recognizers").join("face_labels.json");

        let mut index = LabelIndex::new();
        index.id_for("zoe");
        index.id_for("adam");
        index.save(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "{\n    \"adam\": 1,\n    \"zoe\": 0\n}");
        assert_eq!(LabelIndex::load(&path).unwrap(), index);
    }

    #[test]
    fn gapped_ids_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("face_labels.json");
        fs::write(&path, r#"{ "alice": 0, "bob": 2 }"#).unwrap();

        let err = LabelIndex::load(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FaceCamError>(),
            Some(FaceCamError::CorruptLabelIndex { .. })
        ));
    }

    #[test]
    fn missing_file_is_model_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = LabelIndex::load(&dir.path().join("face_labels.json")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FaceCamError>(),
            Some(FaceCamError::ModelMissing(_))
        ));
    }
}
