//! Model persistence
//!
//! Stores a trained isolation forest as JSON so a restart can skip the
//! bootstrap phase. The previous file is kept as `<name>.bak`.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::models::IsolationForest;

/// Version of the on-disk format
const STORAGE_VERSION: u32 = 1;

/// On-disk envelope around the model
#[derive(Debug, Serialize, Deserialize)]
struct StoredModel {
    version: u32,
    saved_at: DateTime<Utc>,
    model: IsolationForest,
}

/// Saves and loads the trained model
#[derive(Debug, Clone)]
pub struct ModelStore {
    path: PathBuf,
}

impl ModelStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".bak");
        self.path.with_file_name(name)
    }

    /// Save a trained model, rotating the previous file to the backup slot
    pub fn save(&self, model: &IsolationForest) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        if self.path.exists() {
            fs::rename(&self.path, self.backup_path())
                .with_context(|| format!("Failed to back up {}", self.path.display()))?;
        }

        let stored = StoredModel {
            version: STORAGE_VERSION,
            saved_at: Utc::now(),
            model: model.clone(),
        };

        let file = File::create(&self.path)
            .with_context(|| format!("Failed to create {}", self.path.display()))?;
        serde_json::to_writer(BufWriter::new(file), &stored)
            .with_context(|| format!("Failed to write model to {}", self.path.display()))?;

        info!("Saved anomaly model to {}", self.path.display());
        Ok(())
    }

    /// Load the stored model, falling back to the backup if the main file is unreadable
    pub fn load(&self) -> anyhow::Result<Option<IsolationForest>> {
        if !self.path.exists() {
            debug!("No stored model at {}", self.path.display());
            return Ok(None);
        }

        match Self::read(&self.path) {
            Ok(model) => {
                info!("Loaded anomaly model from {}", self.path.display());
                Ok(Some(model))
            }
            Err(e) => {
                warn!("Failed to load model from {}: {:#}", self.path.display(), e);
                let backup = self.backup_path();
                if !backup.exists() {
                    return Err(e);
                }
                let model = Self::read(&backup)?;
                info!("Loaded anomaly model from backup {}", backup.display());
                Ok(Some(model))
            }
        }
    }

    fn read(path: &Path) -> anyhow::Result<IsolationForest> {
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let stored: StoredModel = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        if stored.version != STORAGE_VERSION {
            anyhow::bail!(
                "Unsupported model format version {} (expected {})",
                stored.version,
                STORAGE_VERSION
            );
        }
        Ok(stored.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::features::FeatureVector;
    use crate::ml::models::OutlierModel;
    use tempfile::TempDir;

    fn trained_forest() -> IsolationForest {
        let data: Vec<FeatureVector> = (0..40)
            .map(|i| FeatureVector::new([(i * 13 % 50) as f32, 443.0, (i * 7 % 30) as f32, 1.0, i as f32]))
            .collect();
        let mut forest = IsolationForest::default();
        forest.fit(&data);
        forest
    }

    #[test]
    fn test_load_missing_is_none() {
        let temp = TempDir::new().unwrap();
        let store = ModelStore::new(temp.path().join("model.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_model_save_load() {
        let temp = TempDir::new().unwrap();
        let store = ModelStore::new(temp.path().join("nested").join("model.json"));
        let forest = trained_forest();

        store.save(&forest).unwrap();
        let loaded = store.load().unwrap().unwrap();

        let probe = FeatureVector::new([12.0, 443.0, 9.0, 1.0, 3.0]);
        assert_eq!(loaded.score(&probe), forest.score(&probe));
        assert_eq!(loaded.threshold(), forest.threshold());
        assert_eq!(loaded.trained_on(), 40);
    }

    #[test]
    fn test_corrupt_file_falls_back_to_backup() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("model.json");
        let store = ModelStore::new(&path);

        store.save(&trained_forest()).unwrap();
        // Second save moves the first file to the backup slot
        store.save(&trained_forest()).unwrap();
        fs::write(&path, b"not json").unwrap();

        let loaded = store.load().unwrap();
        assert!(loaded.is_some());
    }

    #[test]
    fn test_corrupt_file_without_backup_errors() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("model.json");
        fs::write(&path, b"{}").unwrap();

        assert!(ModelStore::new(&path).load().is_err());
    }
}
