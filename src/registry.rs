//! Source bundle registry.
//!
//! Each declared bundle groups one data source with the model names it is
//! bound to and its patch footprint. Resolution loads every bundle in
//! declaration order and splits them into positionally aligned lists: the
//! training feeds, the Input-role sources scored on learning and validation
//! data, and the Target-role ground truth for both splits.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::config::{SourceCount, TrainingConfig, ValidationConfig};
use crate::raster::{PatchSize, RasterError, RasterLoader, RasterStack};

/// Errors raised while resolving source bundles.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Missing mandatory parameter {key}")]
    MissingValue { key: String },
    #[error("Invalid value for parameter {key}: {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("No validation data given for {key} while validation is enabled")]
    MissingValidationData { key: String },
    #[error("Failed to load {key}: {source}")]
    Load { key: String, source: RasterError },
    #[error("Section {section} is configured but only {declared} sources are declared")]
    UndeclaredSource { section: String, declared: usize },
}

/// Role of a bundle during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceRole {
    /// Feeds the model during scoring.
    Input,
    /// Ground truth compared against the output tensor of the same name.
    Target,
}

impl SourceRole {
    /// Same name on both sides means input. A blank validation name falls
    /// back to the training name.
    pub fn classify(training_name: &str, validation_name: &str) -> Self {
        let validation_name = validation_name.trim();
        if validation_name.is_empty() || validation_name == training_name {
            SourceRole::Input
        } else {
            SourceRole::Target
        }
    }
}

/// Parameter keys of one declared bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceKeys {
    /// Table name (`source<N>`) under `[training]` and `[validation]`.
    pub section: String,
    pub training_images: String,
    pub validation_images: String,
    pub training_placeholder: String,
    pub validation_name: String,
    pub patch_size_x: String,
    pub patch_size_y: String,
}

impl SourceKeys {
    fn new(number: usize) -> Self {
        let section = format!("source{number}");
        Self {
            training_images: format!("training.{section}.il"),
            validation_images: format!("validation.{section}.il"),
            training_placeholder: format!("training.{section}.placeholder"),
            validation_name: format!("validation.{section}.name"),
            patch_size_x: format!("training.{section}.patchsizex"),
            patch_size_y: format!("training.{section}.patchsizey"),
            section,
        }
    }
}

/// One bundle after resolution.
#[derive(Debug, Clone)]
pub struct ResolvedBundle {
    pub keys: SourceKeys,
    pub training: Arc<RasterStack>,
    pub validation: Option<Arc<RasterStack>>,
    pub training_name: String,
    pub validation_name: String,
    pub patch: PatchSize,
    /// `None` when validation is disabled.
    pub role: Option<SourceRole>,
}

/// Sources bound for training, aligned with their names and footprints.
#[derive(Debug, Clone, Default)]
pub struct SourceSet {
    pub names: Vec<String>,
    pub patch_sizes: Vec<PatchSize>,
    pub sources: Vec<Arc<RasterStack>>,
}

impl SourceSet {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Sources of one validation role, for both data splits.
#[derive(Debug, Clone, Default)]
pub struct EvaluationSources {
    pub names: Vec<String>,
    pub patch_sizes: Vec<PatchSize>,
    /// Training data of each source.
    pub learning: Vec<Arc<RasterStack>>,
    /// Held-out data of each source.
    pub validation: Vec<Arc<RasterStack>>,
}

impl EvaluationSources {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    fn push(&mut self, bundle: &ResolvedBundle, name: &str, validation: Arc<RasterStack>) {
        self.names.push(name.to_string());
        self.patch_sizes.push(bundle.patch);
        self.learning.push(Arc::clone(&bundle.training));
        self.validation.push(validation);
    }
}

/// Result of [`SourceRegistry::resolve`].
#[derive(Debug, Clone, Default)]
pub struct ResolvedSources {
    pub bundles: Vec<ResolvedBundle>,
    pub training: SourceSet,
    pub inputs: EvaluationSources,
    pub targets: EvaluationSources,
}

/// Declared bundles, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    keys: Vec<SourceKeys>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare one bundle per source plus the implicit extra one.
    pub fn with_count(count: SourceCount) -> Self {
        let mut registry = Self::new();
        for _ in 0..count.declared_bundles() {
            registry.add_source();
        }
        registry
    }

    /// Append a bundle and return the keys that populate it.
    pub fn add_source(&mut self) -> &SourceKeys {
        let number = self.keys.len() + 1;
        self.keys.push(SourceKeys::new(number));
        &self.keys[number - 1]
    }

    pub fn keys(&self) -> &[SourceKeys] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Load and classify every bundle.
    ///
    /// Validation data is only required, and roles only computed, when the
    /// validation mode is not `none`.
    pub fn resolve<L: RasterLoader>(
        &self,
        training: &TrainingConfig,
        validation: &ValidationConfig,
        loader: &L,
    ) -> Result<ResolvedSources, RegistryError> {
        self.check_sections(training.sources.keys())?;
        self.check_sections(validation.sources.keys())?;

        let mut resolved = ResolvedSources::default();
        for keys in &self.keys {
            let bundle = self.resolve_bundle(keys, training, validation, loader)?;
            resolved.training.names.push(bundle.training_name.clone());
            resolved.training.patch_sizes.push(bundle.patch);
            resolved.training.sources.push(Arc::clone(&bundle.training));
            if let (Some(role), Some(data)) = (bundle.role, bundle.validation.clone()) {
                match role {
                    SourceRole::Input => {
                        resolved.inputs.push(&bundle, &bundle.training_name, data)
                    }
                    SourceRole::Target => {
                        resolved.targets.push(&bundle, &bundle.validation_name, data)
                    }
                }
            }
            resolved.bundles.push(bundle);
        }
        Ok(resolved)
    }

    fn check_sections<'a, I: Iterator<Item = &'a String>>(
        &self,
        sections: I,
    ) -> Result<(), RegistryError> {
        for section in sections {
            if !self.keys.iter().any(|keys| keys.section == *section) {
                return Err(RegistryError::UndeclaredSource {
                    section: section.clone(),
                    declared: self.keys.len(),
                });
            }
        }
        Ok(())
    }

    fn resolve_bundle<L: RasterLoader>(
        &self,
        keys: &SourceKeys,
        training: &TrainingConfig,
        validation: &ValidationConfig,
        loader: &L,
    ) -> Result<ResolvedBundle, RegistryError> {
        let params = training
            .sources
            .get(&keys.section)
            .ok_or_else(|| missing(&keys.training_images))?;
        let training_data = load(loader, &keys.training_images, &params.il)?;
        let training_name = params
            .placeholder
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| missing(&keys.training_placeholder))?
            .to_string();
        let patch = PatchSize::new(
            positive(&keys.patch_size_x, params.patchsizex)?,
            positive(&keys.patch_size_y, params.patchsizey)?,
        );

        tracing::info!("New source:");
        tracing::info!("Patch size               : {}", patch);
        tracing::info!("Placeholder (training)   : {}", training_name);

        let mut bundle = ResolvedBundle {
            keys: keys.clone(),
            training: Arc::new(training_data),
            validation: None,
            validation_name: training_name.clone(),
            training_name,
            patch,
            role: None,
        };
        if !validation.enabled() {
            return Ok(bundle);
        }

        let params = validation.sources.get(&keys.section);
        let images = params.map(|params| params.il.as_slice()).unwrap_or_default();
        if images.is_empty() {
            return Err(RegistryError::MissingValidationData {
                key: keys.validation_images.clone(),
            });
        }
        let validation_data = load(loader, &keys.validation_images, images)?;
        let name = params
            .and_then(|params| params.name.as_deref())
            .map(str::trim)
            .unwrap_or_default();
        let role = SourceRole::classify(&bundle.training_name, name);
        match role {
            SourceRole::Input => {
                tracing::info!("Placeholder (validation) : {}", bundle.training_name);
            }
            SourceRole::Target => {
                bundle.validation_name = name.to_string();
                tracing::info!("Tensor name (validation) : {}", bundle.validation_name);
            }
        }
        bundle.validation = Some(Arc::new(validation_data));
        bundle.role = Some(role);
        Ok(bundle)
    }
}

fn load<L: RasterLoader>(
    loader: &L,
    key: &str,
    paths: &[PathBuf],
) -> Result<RasterStack, RegistryError> {
    if paths.is_empty() {
        return Err(missing(key));
    }
    loader.load(paths).map_err(|source| RegistryError::Load {
        key: key.to_string(),
        source,
    })
}

fn positive(key: &str, value: Option<usize>) -> Result<usize, RegistryError> {
    match value {
        None => Err(missing(key)),
        Some(0) => Err(RegistryError::InvalidValue {
            key: key.to_string(),
            reason: "must be at least 1".to_string(),
        }),
        Some(value) => Ok(value),
    }
}

fn missing(key: &str) -> RegistryError {
    RegistryError::MissingValue {
        key: key.to_string(),
    }
}
