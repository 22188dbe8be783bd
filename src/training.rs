//! Epoch driver for the training pass.

use crate::config::TrainingConfig;
use crate::engine::{EngineError, ModelEngine, TensorFeed, TrainingRequest, TrainingSummary};
use crate::placeholders::{PlaceholderBinding, PlaceholderError, parse_expressions};
use crate::registry::SourceSet;

/// Immutable training parameters, fixed before the first epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSettings {
    pub batch_size: usize,
    pub epochs: usize,
    pub streaming: bool,
    pub placeholders: Vec<PlaceholderBinding>,
    pub target_nodes: Vec<String>,
    pub output_tensors: Vec<String>,
}

impl TrainingSettings {
    pub fn from_config(config: &TrainingConfig) -> Result<Self, PlaceholderError> {
        Ok(Self {
            batch_size: config.batchsize.max(1),
            epochs: config.epochs,
            streaming: config.usestreaming,
            placeholders: parse_expressions(&config.userplaceholders)?,
            target_nodes: config.targetnodes.clone(),
            output_tensors: config.outputtensors.clone(),
        })
    }
}

/// Runs one full training pass per epoch over the registry's training sources.
#[derive(Debug, Clone)]
pub struct TrainingController<'a> {
    settings: TrainingSettings,
    sources: &'a SourceSet,
}

impl<'a> TrainingController<'a> {
    pub fn new(settings: TrainingSettings, sources: &'a SourceSet) -> Self {
        Self { settings, sources }
    }

    pub fn settings(&self) -> &TrainingSettings {
        &self.settings
    }

    /// Epochs are numbered from 1. Any engine error aborts the run.
    pub fn run_epoch<E: ModelEngine>(
        &self,
        model: &mut E,
        epoch: usize,
    ) -> Result<TrainingSummary, EngineError> {
        tracing::info!("Training epoch #{}/{}", epoch, self.settings.epochs);
        let request = TrainingRequest {
            feeds: self.feeds(),
            placeholders: &self.settings.placeholders,
            target_nodes: &self.settings.target_nodes,
            output_tensors: &self.settings.output_tensors,
            batch_size: self.settings.batch_size,
            streaming: self.settings.streaming,
        };
        let summary = model.train(&request)?;
        tracing::debug!(
            "Epoch {} processed {} samples in {} batches",
            epoch,
            summary.samples,
            summary.batches
        );
        for (name, value) in &summary.outputs {
            tracing::info!("  {} = {:.6}", name, value);
        }
        Ok(summary)
    }

    fn feeds(&self) -> Vec<TensorFeed<'a>> {
        let sources = self.sources;
        sources
            .names
            .iter()
            .zip(&sources.patch_sizes)
            .zip(&sources.sources)
            .map(|((name, patch), source)| TensorFeed {
                name: name.as_str(),
                patch: *patch,
                source: source.as_ref(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_parse_placeholders_in_order() {
        let config = TrainingConfig {
            batchsize: 32,
            epochs: 5,
            userplaceholders: vec!["lr=0.01".into(), "is_training=true".into()],
            targetnodes: vec!["optimizer".into()],
            outputtensors: vec!["loss".into()],
            usestreaming: true,
            ..TrainingConfig::default()
        };
        let settings = TrainingSettings::from_config(&config).unwrap();
        assert_eq!(settings.batch_size, 32);
        assert_eq!(settings.epochs, 5);
        assert!(settings.streaming);
        let names: Vec<_> = settings
            .placeholders
            .iter()
            .map(|binding| binding.name.as_str())
            .collect();
        assert_eq!(names, vec!["lr", "is_training"]);
    }

    #[test]
    fn malformed_placeholder_is_a_parse_error() {
        let config = TrainingConfig {
            userplaceholders: vec!["bad=".into()],
            ..TrainingConfig::default()
        };
        assert!(matches!(
            TrainingSettings::from_config(&config),
            Err(PlaceholderError::EmptyValue { .. })
        ));
    }
}
