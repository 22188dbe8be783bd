//! On-disk layout of a saved model directory.
//!
//! ```text
//! model_dir/
//!   saved_model.json        meta graphs, one per tag set
//!   variables/variables.json optional initial variable values
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::EngineError;
use crate::raster::PatchSize;

pub const SAVED_MODEL_FILE: &str = "saved_model.json";
pub const VARIABLES_DIR: &str = "variables";
pub const VARIABLES_FILE: &str = "variables.json";
/// Tag set used when none is requested.
pub const DEFAULT_TAG: &str = "serve";

/// Parsed `saved_model.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedModel {
    pub meta_graphs: Vec<MetaGraph>,
}

/// A graph definition exported under a tag set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaGraph {
    pub tags: Vec<String>,
    pub graph: GraphDef,
}

/// Declaration of a linear patch classifier graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDef {
    /// Image placeholders, concatenated in this order to build features.
    pub inputs: Vec<InputDef>,
    /// Placeholder receiving the reference class of each sample.
    pub label: String,
    pub classes: usize,
    #[serde(default)]
    pub learning_rate: LearningRateDef,
    /// Extra scalar placeholders the graph accepts.
    #[serde(default)]
    pub placeholders: Vec<ScalarDef>,
    #[serde(default)]
    pub names: NodeNames,
    #[serde(default)]
    pub seed: u64,
}

impl GraphDef {
    /// Length of the feature vector built from all inputs.
    pub fn feature_len(&self) -> usize {
        self.inputs
            .iter()
            .map(|input| input.bands * input.patch.pixels())
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDef {
    pub name: String,
    pub bands: usize,
    pub patch: PatchSize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningRateDef {
    pub name: String,
    pub default: f32,
}

impl Default for LearningRateDef {
    fn default() -> Self {
        Self {
            name: "lr".to_string(),
            default: 0.0002,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    Int,
    Float,
    Bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarDef {
    pub name: String,
    pub dtype: ScalarType,
}

/// Names of the graph's nodes and output tensors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeNames {
    pub optimizer: String,
    pub loss: String,
    pub logits: String,
    pub prediction: String,
}

impl Default for NodeNames {
    fn default() -> Self {
        Self {
            optimizer: "optimizer".to_string(),
            loss: "loss".to_string(),
            logits: "logits".to_string(),
            prediction: "prediction".to_string(),
        }
    }
}

/// Variable values of the linear classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variables {
    pub classes: usize,
    pub features: usize,
    /// Row-major `classes x features` weights.
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
}

impl Variables {
    pub fn zeros(classes: usize, features: usize) -> Self {
        Self {
            classes,
            features,
            weights: vec![0.0; classes * features],
            bias: vec![0.0; classes],
        }
    }

    /// Check the values against the graph dimensions.
    pub fn check(&self, classes: usize, features: usize) -> Result<(), String> {
        if self.classes != classes || self.features != features {
            return Err(format!(
                "variables are {}x{}, graph expects {}x{}",
                self.classes, self.features, classes, features
            ));
        }
        if self.weights.len() != classes * features {
            return Err("weights length mismatch".to_string());
        }
        if self.bias.len() != classes {
            return Err("bias length mismatch".to_string());
        }
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path).map_err(|source| EngineError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| EngineError::Malformed {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn write(&self, path: &Path) -> Result<(), EngineError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| EngineError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self).map_err(EngineError::Serialize)?;
        std::fs::write(path, json).map_err(|source| EngineError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl SavedModel {
    pub fn read(dir: &Path) -> Result<Self, EngineError> {
        if !dir.is_dir() {
            return Err(EngineError::MissingModelDir {
                path: dir.to_path_buf(),
            });
        }
        let path = dir.join(SAVED_MODEL_FILE);
        let text = std::fs::read_to_string(&path).map_err(|source| EngineError::Read {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| EngineError::Malformed { path, source })
    }

    /// Pick the meta graph exported under exactly `tags` (`serve` when empty).
    pub fn select(&self, tags: &[String]) -> Result<&MetaGraph, EngineError> {
        let mut wanted: Vec<&str> = if tags.is_empty() {
            vec![DEFAULT_TAG]
        } else {
            tags.iter().map(String::as_str).collect()
        };
        wanted.sort_unstable();
        wanted.dedup();
        self.meta_graphs
            .iter()
            .find(|meta| {
                let mut have: Vec<&str> = meta.tags.iter().map(String::as_str).collect();
                have.sort_unstable();
                have.dedup();
                have == wanted
            })
            .ok_or_else(|| EngineError::UnknownTagSet {
                tags: wanted.iter().map(|tag| tag.to_string()).collect(),
            })
    }
}

/// Default location of the variables shipped with a model directory.
pub fn variables_path(dir: &Path) -> PathBuf {
    dir.join(VARIABLES_DIR).join(VARIABLES_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(tags: &[&str]) -> MetaGraph {
        MetaGraph {
            tags: tags.iter().map(|tag| tag.to_string()).collect(),
            graph: GraphDef {
                inputs: vec![InputDef {
                    name: "x".to_string(),
                    bands: 4,
                    patch: PatchSize::new(16, 16),
                }],
                label: "y".to_string(),
                classes: 8,
                learning_rate: LearningRateDef::default(),
                placeholders: Vec::new(),
                names: NodeNames::default(),
                seed: 0,
            },
        }
    }

    #[test]
    fn select_matches_tag_sets_regardless_of_order() {
        let model = SavedModel {
            meta_graphs: vec![meta(&["serve"]), meta(&["train", "gpu"])],
        };
        assert_eq!(model.select(&[]).unwrap().tags, vec!["serve"]);
        let tags = vec!["gpu".to_string(), "train".to_string()];
        assert_eq!(model.select(&tags).unwrap().tags, vec!["train", "gpu"]);
        assert!(matches!(
            model.select(&["eval".to_string()]),
            Err(EngineError::UnknownTagSet { .. })
        ));
    }

    #[test]
    fn graph_defaults_fill_missing_fields() {
        let json = r#"{
            "inputs": [{"name": "x", "bands": 2, "patch": {"width": 3, "height": 3}}],
            "label": "y",
            "classes": 2
        }"#;
        let graph: GraphDef = serde_json::from_str(json).unwrap();
        assert_eq!(graph.feature_len(), 18);
        assert_eq!(graph.learning_rate.name, "lr");
        assert_eq!(graph.names.optimizer, "optimizer");
    }

    #[test]
    fn variables_check_reports_shape_mismatch() {
        let vars = Variables::zeros(2, 3);
        assert!(vars.check(2, 3).is_ok());
        assert!(vars.check(3, 3).is_err());
    }

    #[test]
    fn read_fails_on_missing_directory() {
        let err = SavedModel::read(Path::new("/nonexistent/model")).unwrap_err();
        assert!(matches!(err, EngineError::MissingModelDir { .. }));
    }
}
