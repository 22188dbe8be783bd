//! Ownership of the loaded model for the whole run.
//!
//! The training controller borrows the model mutably for each epoch and the
//! validation evaluator borrows it immutably between epochs; neither owns it.

use std::path::{Path, PathBuf};

use crate::engine::{EngineError, ModelEngine};

/// Loaded model plus the directory it came from.
#[derive(Debug)]
pub struct ModelLifecycle<E> {
    model: E,
    dir: PathBuf,
}

impl<E: ModelEngine> ModelLifecycle<E> {
    /// Load the artifact in `dir` for the given tag set.
    pub fn load(dir: &Path, tags: &[String]) -> Result<Self, EngineError> {
        if !dir.is_dir() {
            return Err(EngineError::MissingModelDir {
                path: dir.to_path_buf(),
            });
        }
        tracing::info!("Loading model from {}", dir.display());
        let model = E::load(dir, tags)?;
        Ok(Self::from_model(model, dir))
    }

    /// Wrap an already loaded model.
    pub fn from_model(model: E, dir: &Path) -> Self {
        Self {
            model,
            dir: dir.to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Restore variables when a checkpoint is configured; returns whether it did.
    pub fn restore(&mut self, path: Option<&Path>) -> Result<bool, EngineError> {
        let Some(path) = path else {
            return Ok(false);
        };
        tracing::info!("Restoring model from {}", path.display());
        self.model.restore(path)?;
        Ok(true)
    }

    /// Persist variables when a destination is configured; returns whether it did.
    pub fn save(&self, path: Option<&Path>) -> Result<bool, EngineError> {
        let Some(path) = path else {
            return Ok(false);
        };
        tracing::info!("Saving model to {}", path.display());
        self.model.save(path)?;
        Ok(true)
    }

    pub fn model(&self) -> &E {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut E {
        &mut self.model
    }

    pub fn into_model(self) -> E {
        self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SoftmaxPatchModel;
    use crate::engine::saved_model::{
        GraphDef, InputDef, MetaGraph, SAVED_MODEL_FILE, SavedModel,
    };
    use crate::raster::PatchSize;
    use tempfile::tempdir;

    fn write_model(dir: &Path) {
        let saved = SavedModel {
            meta_graphs: vec![MetaGraph {
                tags: vec!["serve".to_string()],
                graph: GraphDef {
                    inputs: vec![InputDef {
                        name: "x".to_string(),
                        bands: 2,
                        patch: PatchSize::new(2, 2),
                    }],
                    label: "y".to_string(),
                    classes: 3,
                    learning_rate: Default::default(),
                    placeholders: Vec::new(),
                    names: Default::default(),
                    seed: 0,
                },
            }],
        };
        std::fs::write(
            dir.join(SAVED_MODEL_FILE),
            serde_json::to_string(&saved).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn missing_directory_fails_to_load() {
        let dir = tempdir().unwrap();
        let err = ModelLifecycle::<SoftmaxPatchModel>::load(&dir.path().join("absent"), &[])
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingModelDir { .. }));
    }

    #[test]
    fn restore_and_save_are_skipped_without_paths() {
        let dir = tempdir().unwrap();
        write_model(dir.path());
        let mut lifecycle = ModelLifecycle::<SoftmaxPatchModel>::load(dir.path(), &[]).unwrap();
        assert!(!lifecycle.restore(None).unwrap());
        assert!(!lifecycle.save(None).unwrap());
        assert_eq!(lifecycle.dir(), dir.path());
    }

    #[test]
    fn saved_variables_restore_into_a_fresh_load() {
        let dir = tempdir().unwrap();
        write_model(dir.path());
        let checkpoint = dir.path().join("ckpt").join("variables.json");
        let lifecycle = ModelLifecycle::<SoftmaxPatchModel>::load(dir.path(), &[]).unwrap();
        assert!(lifecycle.save(Some(&checkpoint)).unwrap());
        assert!(checkpoint.is_file());

        let mut fresh = ModelLifecycle::<SoftmaxPatchModel>::load(dir.path(), &[]).unwrap();
        assert!(fresh.restore(Some(&checkpoint)).unwrap());
        assert_eq!(fresh.model().variables(), lifecycle.model().variables());
    }
}
