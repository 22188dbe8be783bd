//! Training run: model lifecycle, source resolution, epoch loop and
//! periodic validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ConfigError, RunConfig, SourceCount, ValidationMode};
use crate::engine::{EngineError, ModelEngine};
use crate::lifecycle::ModelLifecycle;
use crate::placeholders::PlaceholderError;
use crate::raster::RasterLoader;
use crate::registry::{RegistryError, SourceRegistry};
use crate::training::{TrainingController, TrainingSettings};
use crate::validation::{ValidationError, ValidationEvaluator, ValidationReport, ValidationSettings};

/// Every fatal condition of a run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Placeholder(#[from] PlaceholderError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Validation mode \"{0}\" is not implemented")]
    NotImplemented(&'static str),
    #[error("Failed to write run summary {path}: {source}")]
    WriteSummary {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to serialize run summary: {0}")]
    SerializeSummary(serde_json::Error),
}

/// Outcome of one training epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub samples: usize,
    pub batches: usize,
    /// Surfaced output tensors and their mean value over the epoch.
    pub outputs: Vec<(String, f32)>,
}

/// Everything a run produced, in chronological order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub restored_from: Option<PathBuf>,
    pub epochs: Vec<EpochReport>,
    pub validations: Vec<ValidationReport>,
    pub saved_to: Option<PathBuf>,
}

impl RunSummary {
    pub fn write_json(&self, path: &Path) -> Result<(), RunError> {
        let json = serde_json::to_string_pretty(self).map_err(RunError::SerializeSummary)?;
        std::fs::write(path, json).map_err(|source| RunError::WriteSummary {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Validation fires after epoch `epoch` iff it is a multiple of `cadence`.
pub fn validation_due(epoch: usize, cadence: usize) -> bool {
    cadence > 0 && epoch % cadence == 0
}

/// Drives a complete run from a checked configuration.
#[derive(Debug)]
pub struct Orchestrator<'a, L> {
    config: &'a RunConfig,
    count: SourceCount,
    loader: &'a L,
}

impl<'a, L: RasterLoader> Orchestrator<'a, L> {
    pub fn new(config: &'a RunConfig, count: SourceCount, loader: &'a L) -> Result<Self, RunError> {
        config.validate()?;
        Ok(Self {
            config,
            count,
            loader,
        })
    }

    /// Load the model, then train and validate it.
    pub fn run<E: ModelEngine>(&self) -> Result<RunSummary, RunError> {
        let model = &self.config.model;
        let mut lifecycle = ModelLifecycle::<E>::load(&model.dir, &model.tagsets)?;
        self.execute(&mut lifecycle)
    }

    /// Run on an already loaded model.
    pub fn execute<E: ModelEngine>(
        &self,
        lifecycle: &mut ModelLifecycle<E>,
    ) -> Result<RunSummary, RunError> {
        let config = self.config;
        let mut summary = RunSummary::default();
        if lifecycle.restore(config.model.restorefrom.as_deref())? {
            summary.restored_from = config.model.restorefrom.clone();
        }

        let registry = SourceRegistry::with_count(self.count);
        let sources = registry.resolve(&config.training, &config.validation, self.loader)?;

        let training = TrainingController::new(
            TrainingSettings::from_config(&config.training)?,
            &sources.training,
        );
        let evaluator = match config.validation.mode {
            ValidationMode::None => None,
            ValidationMode::Rmse => return Err(RunError::NotImplemented("rmse")),
            ValidationMode::Classification => Some(ValidationEvaluator::new(
                ValidationSettings::from_config(&config.training, &config.validation)?,
                &sources.inputs,
                &sources.targets,
            )),
        };

        let epochs = training.settings().epochs;
        for epoch in 1..=epochs {
            let outcome = training.run_epoch(lifecycle.model_mut(), epoch)?;
            summary.epochs.push(EpochReport {
                epoch,
                samples: outcome.samples,
                batches: outcome.batches,
                outputs: outcome.outputs,
            });
            if let Some(evaluator) = &evaluator
                && validation_due(epoch, evaluator.settings().cadence)
            {
                let reports = evaluator.run_cycle(lifecycle.model(), epoch)?;
                summary.validations.extend(reports);
            }
        }

        if lifecycle.save(config.model.saveto.as_deref())? {
            summary.saved_to = config.model.saveto.clone();
        }
        Ok(summary)
    }
}
