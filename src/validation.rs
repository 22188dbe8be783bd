//! Periodic scoring of the model against learning and held-out data.
//!
//! A validation cycle runs two inference passes. The first binds the
//! Input-role sources to their training data, the second to their held-out
//! data. Each Target-role source is ground truth for the output tensor of the
//! same name, and every pass yields one confusion matrix per target.

use std::fmt;

use ndarray::s;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{TrainingConfig, ValidationConfig};
use crate::engine::{EngineError, InferenceRequest, ModelEngine, OutputTensor, TensorFeed};
use crate::metrics::{ClassificationMetrics, ConfusionAccumulator, ConfusionMatrix, render_report};
use crate::placeholders::{PlaceholderBinding, PlaceholderError, parse_expressions};
use crate::raster::{BatchPlan, PatchSize, RasterError, RasterStack};
use crate::registry::EvaluationSources;

/// Errors raised during a validation pass.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Raster(#[from] RasterError),
    #[error("Model produced no output for target \"{0}\"")]
    MissingOutput(String),
    #[error("Output \"{name}\" has shape {actual:?}, expected {expected:?}")]
    OutputShape {
        name: String,
        expected: [usize; 4],
        actual: [usize; 4],
    },
}

/// Which data the Input-role sources are bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSplit {
    Learning,
    Validation,
}

impl fmt::Display for DataSplit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSplit::Learning => f.write_str("learning data"),
            DataSplit::Validation => f.write_str("validation data"),
        }
    }
}

/// Validation parameters, fixed before the first epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationSettings {
    /// Validate after every `cadence` epochs.
    pub cadence: usize,
    pub batch_size: usize,
    /// Streaming policy of the pass on learning data.
    pub learning_streaming: bool,
    /// Streaming policy of the pass on held-out data.
    pub validation_streaming: bool,
    pub placeholders: Vec<PlaceholderBinding>,
}

impl ValidationSettings {
    pub fn from_config(
        training: &TrainingConfig,
        validation: &ValidationConfig,
    ) -> Result<Self, PlaceholderError> {
        Ok(Self {
            cadence: validation.step.max(1),
            batch_size: training.batchsize.max(1),
            learning_streaming: training.usestreaming,
            validation_streaming: validation.usestreaming,
            placeholders: parse_expressions(&validation.userplaceholders)?,
        })
    }

    fn streaming(&self, split: DataSplit) -> bool {
        match split {
            DataSplit::Learning => self.learning_streaming,
            DataSplit::Validation => self.validation_streaming,
        }
    }
}

/// Scores of one target for one pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetReport {
    pub name: String,
    /// Class labels, in matrix index order.
    pub labels: Vec<i64>,
    pub confusion: ConfusionMatrix,
    pub metrics: ClassificationMetrics,
}

/// Scores of every target for one pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub epoch: usize,
    pub split: DataSplit,
    pub targets: Vec<TargetReport>,
}

/// Runs classification validation cycles.
#[derive(Debug, Clone)]
pub struct ValidationEvaluator<'a> {
    settings: ValidationSettings,
    inputs: &'a EvaluationSources,
    targets: &'a EvaluationSources,
}

impl<'a> ValidationEvaluator<'a> {
    pub fn new(
        settings: ValidationSettings,
        inputs: &'a EvaluationSources,
        targets: &'a EvaluationSources,
    ) -> Self {
        Self {
            settings,
            inputs,
            targets,
        }
    }

    pub fn settings(&self) -> &ValidationSettings {
        &self.settings
    }

    /// Score on learning data, then on held-out data.
    pub fn run_cycle<E: ModelEngine>(
        &self,
        model: &E,
        epoch: usize,
    ) -> Result<Vec<ValidationReport>, ValidationError> {
        [DataSplit::Learning, DataSplit::Validation]
            .into_iter()
            .map(|split| self.evaluate(model, epoch, split))
            .collect()
    }

    /// One inference pass and the confusion matrix of every target.
    pub fn evaluate<E: ModelEngine>(
        &self,
        model: &E,
        epoch: usize,
        split: DataSplit,
    ) -> Result<ValidationReport, ValidationError> {
        tracing::info!("Validation on {} (epoch #{})", split, epoch);
        let feeds = feeds(self.inputs, split);
        let request = InferenceRequest {
            feeds,
            placeholders: &self.settings.placeholders,
            outputs: &self.targets.names,
            batch_size: self.settings.batch_size,
            streaming: self.settings.streaming(split),
        };
        let outputs = model.infer(&request)?;

        let mut targets = Vec::with_capacity(self.targets.len());
        for (index, name) in self.targets.names.iter().enumerate() {
            let output = outputs
                .iter()
                .find(|output| output.name == *name)
                .ok_or_else(|| ValidationError::MissingOutput(name.clone()))?;
            let reference = match split {
                DataSplit::Learning => &self.targets.learning[index],
                DataSplit::Validation => &self.targets.validation[index],
            };
            let patch = self.targets.patch_sizes[index];
            let accumulator = self.accumulate(output, reference, patch)?;
            let (confusion, labels) = accumulator.finish();
            let metrics = ClassificationMetrics::compute(&confusion);
            tracing::info!("Metrics for target \"{}\" on {}:", name, split);
            for line in render_report(&confusion, &labels, &metrics) {
                tracing::info!("{}", line);
            }
            targets.push(TargetReport {
                name: name.clone(),
                labels: labels.iter().map(|(label, _)| label).collect(),
                confusion,
                metrics,
            });
        }
        Ok(ValidationReport {
            epoch,
            split,
            targets,
        })
    }

    /// Compare band 0 of the reference with the single channel output,
    /// reading the reference one batch window at a time.
    fn accumulate(
        &self,
        output: &OutputTensor,
        reference: &RasterStack,
        patch: PatchSize,
    ) -> Result<ConfusionAccumulator, ValidationError> {
        let samples = reference.sample_count(patch)?;
        let expected = [samples, patch.height, patch.width, 1];
        let (n, rows, cols, channels) = output.values.dim();
        let actual = [n, rows, cols, channels];
        if actual != expected {
            return Err(ValidationError::OutputShape {
                name: output.name.clone(),
                expected,
                actual,
            });
        }
        let mut accumulator = ConfusionAccumulator::new();
        for range in BatchPlan::new(samples, self.settings.batch_size).batches() {
            let window = reference.read_batch(range.clone(), patch);
            let produced = output.values.slice(s![range, .., .., 0]);
            let truth = window.slice(s![.., .., .., 0]);
            for (&truth, &produced) in truth.iter().zip(produced.iter()) {
                accumulator.add(truth, produced);
            }
        }
        Ok(accumulator)
    }
}

fn feeds<'a>(sources: &'a EvaluationSources, split: DataSplit) -> Vec<TensorFeed<'a>> {
    let data = match split {
        DataSplit::Learning => &sources.learning,
        DataSplit::Validation => &sources.validation,
    };
    sources
        .names
        .iter()
        .zip(&sources.patch_sizes)
        .zip(data)
        .map(|((name, patch), source)| TensorFeed {
            name: name.as_str(),
            patch: *patch,
            source: source.as_ref(),
        })
        .collect()
}
