//! Run configuration loaded from a TOML file.
//!
//! Keys mirror the parameter keys of the training application
//! (`training.batchsize`, `training.source1.il`, `validation.mode`, ...), so
//! error messages can name the exact key an operator has to fix.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::de::Error as SerdeDeError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod source_count;

pub use source_count::{NSOURCES_ENV, SourceCount};

/// Errors raised while loading or checking a run configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config at {path}: {source}")]
    ParseToml {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Missing mandatory parameter {key}")]
    MissingValue { key: String },
    #[error("Parameter {key} must be at least {min}, got {value}")]
    BelowMinimum { key: String, min: usize, value: usize },
    #[error("Invalid source count \"{value}\" in {}: expected an integer >= 1", NSOURCES_ENV)]
    InvalidSourceCount { value: String },
}

/// Complete description of a training run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
}

/// Model artifact input/output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Saved model directory (mandatory).
    #[serde(default)]
    pub dir: PathBuf,
    #[serde(default)]
    pub restorefrom: Option<PathBuf>,
    #[serde(default)]
    pub saveto: Option<PathBuf>,
    #[serde(default)]
    pub tagsets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_batch_size")]
    pub batchsize: usize,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default)]
    pub userplaceholders: Vec<String>,
    #[serde(default)]
    pub targetnodes: Vec<String>,
    #[serde(default)]
    pub outputtensors: Vec<String>,
    #[serde(default)]
    pub usestreaming: bool,
    /// `source<N>` tables.
    #[serde(flatten)]
    pub sources: BTreeMap<String, TrainingSourceParams>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batchsize: default_batch_size(),
            epochs: default_epochs(),
            userplaceholders: Vec::new(),
            targetnodes: Vec::new(),
            outputtensors: Vec::new(),
            usestreaming: false,
            sources: BTreeMap::new(),
        }
    }
}

/// Training side of one source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingSourceParams {
    #[serde(default)]
    pub il: Vec<PathBuf>,
    #[serde(default)]
    pub placeholder: Option<String>,
    #[serde(default)]
    pub patchsizex: Option<usize>,
    #[serde(default)]
    pub patchsizey: Option<usize>,
}

/// Metrics computed during validation cycles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    #[default]
    None,
    #[serde(rename = "class", alias = "classification")]
    Classification,
    Rmse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default)]
    pub mode: ValidationMode,
    /// Validate every `step` epochs.
    #[serde(default = "default_step")]
    pub step: usize,
    #[serde(default)]
    pub userplaceholders: Vec<String>,
    #[serde(default)]
    pub usestreaming: bool,
    #[serde(flatten)]
    pub sources: BTreeMap<String, ValidationSourceParams>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            mode: ValidationMode::None,
            step: default_step(),
            userplaceholders: Vec::new(),
            usestreaming: false,
            sources: BTreeMap::new(),
        }
    }
}

impl ValidationConfig {
    pub fn enabled(&self) -> bool {
        self.mode != ValidationMode::None
    }
}

/// Validation side of one source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationSourceParams {
    #[serde(default)]
    pub il: Vec<PathBuf>,
    /// Input placeholder (same as training) or output tensor to score.
    #[serde(default)]
    pub name: Option<String>,
}

fn default_batch_size() -> usize {
    100
}

fn default_epochs() -> usize {
    100
}

fn default_step() -> usize {
    10
}

impl RunConfig {
    /// Load a run file; relative paths resolve against its directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let text = String::from_utf8(bytes).map_err(|source| ConfigError::ParseToml {
            path: path.to_path_buf(),
            source: SerdeDeError::custom(source),
        })?;
        let mut config = Self::from_toml_str(&text).map_err(|source| ConfigError::ParseToml {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Enforce mandatory values and minimums.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.dir.as_os_str().is_empty() {
            return Err(missing("model.dir"));
        }
        if self.training.targetnodes.is_empty() {
            return Err(missing("training.targetnodes"));
        }
        at_least("training.batchsize", self.training.batchsize, 1)?;
        at_least("training.epochs", self.training.epochs, 1)?;
        at_least("validation.step", self.validation.step, 1)?;
        Ok(())
    }

    fn resolve_paths(&mut self, base: &Path) {
        let join = |path: &mut PathBuf| {
            if path.is_relative() && !path.as_os_str().is_empty() {
                *path = base.join(&*path);
            }
        };
        join(&mut self.model.dir);
        if let Some(path) = self.model.restorefrom.as_mut() {
            join(path);
        }
        if let Some(path) = self.model.saveto.as_mut() {
            join(path);
        }
        for params in self.training.sources.values_mut() {
            params.il.iter_mut().for_each(join);
        }
        for params in self.validation.sources.values_mut() {
            params.il.iter_mut().for_each(join);
        }
    }
}

fn missing(key: &str) -> ConfigError {
    ConfigError::MissingValue {
        key: key.to_string(),
    }
}

fn at_least(key: &str, value: usize, min: usize) -> Result<(), ConfigError> {
    if value < min {
        return Err(ConfigError::BelowMinimum {
            key: key.to_string(),
            min,
            value,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const RUN: &str = r#"
        [model]
        dir = "model"
        saveto = "/abs/out.json"

        [training]
        epochs = 25
        targetnodes = ["optimizer"]
        userplaceholders = ["lr=0.01"]

        [training.source1]
        il = ["a.png", "b.png"]
        placeholder = "x"
        patchsizex = 16
        patchsizey = 16

        [training.source2]
        il = ["labels.png"]
        placeholder = "y"
        patchsizex = 1
        patchsizey = 1

        [validation]
        mode = "class"

        [validation.source1]
        il = ["c.png"]
        name = "x"

        [validation.source2]
        il = ["labels_val.png"]
        name = "prediction"
    "#;

    #[test]
    fn parses_sections_and_applies_defaults() {
        let config = RunConfig::from_toml_str(RUN).unwrap();
        assert_eq!(config.training.batchsize, 100);
        assert_eq!(config.training.epochs, 25);
        assert_eq!(config.validation.step, 10);
        assert_eq!(config.validation.mode, ValidationMode::Classification);
        assert!(config.validation.enabled());
        assert_eq!(config.training.sources.len(), 2);
        let source = &config.training.sources["source1"];
        assert_eq!(source.placeholder.as_deref(), Some("x"));
        assert_eq!(source.patchsizex, Some(16));
        assert_eq!(
            config.validation.sources["source2"].name.as_deref(),
            Some("prediction")
        );
    }

    #[test]
    fn validation_mode_names() {
        for (text, mode) in [
            ("none", ValidationMode::None),
            ("class", ValidationMode::Classification),
            ("classification", ValidationMode::Classification),
            ("rmse", ValidationMode::Rmse),
        ] {
            let config = RunConfig::from_toml_str(&format!(
                "[model]\ndir = \"m\"\n[validation]\nmode = \"{text}\"\n"
            ))
            .unwrap();
            assert_eq!(config.validation.mode, mode);
        }
    }

    #[test]
    fn load_resolves_relative_paths_against_run_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(&path, RUN).unwrap();
        let config = RunConfig::load(&path).unwrap();
        assert_eq!(config.model.dir, dir.path().join("model"));
        assert_eq!(config.model.saveto, Some(PathBuf::from("/abs/out.json")));
        assert_eq!(
            config.training.sources["source1"].il,
            vec![dir.path().join("a.png"), dir.path().join("b.png")]
        );
        assert_eq!(
            config.validation.sources["source1"].il,
            vec![dir.path().join("c.png")]
        );
    }

    #[test]
    fn validate_rejects_missing_mandatory_values() {
        let mut config = RunConfig::from_toml_str(RUN).unwrap();
        config.training.targetnodes.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingValue { key }) if key == "training.targetnodes"
        ));

        let mut config = RunConfig::from_toml_str(RUN).unwrap();
        config.model.dir = PathBuf::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingValue { key }) if key == "model.dir"
        ));
    }

    #[test]
    fn validate_enforces_minimums() {
        let mut config = RunConfig::from_toml_str(RUN).unwrap();
        config.validation.step = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BelowMinimum { key, .. }) if key == "validation.step"
        ));
        let mut config = RunConfig::from_toml_str(RUN).unwrap();
        config.training.batchsize = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[model\n").unwrap();
        assert!(matches!(
            RunConfig::load(&path),
            Err(ConfigError::ParseToml { .. })
        ));
    }
}
