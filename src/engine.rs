//! Contract with the tensor engine that owns the trainable model.
//!
//! The orchestrator never looks inside the model: it loads an artifact,
//! optionally restores or saves variables, and runs blocking training or
//! inference passes with named feeds. Every call may fail fatally; errors
//! carry the engine's own diagnostic.

use std::path::{Path, PathBuf};

use ndarray::Array4;
use thiserror::Error;

use crate::placeholders::PlaceholderBinding;
use crate::raster::{PatchSize, RasterError, RasterStack};

pub mod saved_model;
mod softmax;

pub use softmax::SoftmaxPatchModel;

/// Errors surfaced by a model engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Model directory {path} does not exist")]
    MissingModelDir { path: PathBuf },
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Malformed model artifact {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Failed to serialize variables: {0}")]
    Serialize(serde_json::Error),
    #[error("No meta graph matches tag set {tags:?}")]
    UnknownTagSet { tags: Vec<String> },
    #[error("Checkpoint {path} does not match the model: {reason}")]
    CheckpointMismatch { path: PathBuf, reason: String },
    #[error("Unknown placeholder \"{0}\"")]
    UnknownPlaceholder(String),
    #[error("Placeholder \"{name}\" expects {expected}, got {actual}")]
    PlaceholderType {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("Unknown node \"{0}\"")]
    UnknownNode(String),
    #[error("Unknown tensor \"{0}\"")]
    UnknownTensor(String),
    #[error("No feed bound to placeholder \"{0}\"")]
    MissingFeed(String),
    #[error("Feed \"{name}\" is invalid: {reason}")]
    InvalidFeed { name: String, reason: String },
    #[error(transparent)]
    Raster(#[from] RasterError),
}

/// A raster source bound to a named model input (or reference output).
#[derive(Debug, Clone, Copy)]
pub struct TensorFeed<'a> {
    pub name: &'a str,
    pub patch: PatchSize,
    pub source: &'a RasterStack,
}

/// One full training pass over the bound sources.
#[derive(Debug, Clone)]
pub struct TrainingRequest<'a> {
    pub feeds: Vec<TensorFeed<'a>>,
    pub placeholders: &'a [PlaceholderBinding],
    pub target_nodes: &'a [String],
    /// Tensors whose values are reported back after the pass.
    pub output_tensors: &'a [String],
    pub batch_size: usize,
    pub streaming: bool,
}

/// One full inference pass producing the requested output tensors.
#[derive(Debug, Clone)]
pub struct InferenceRequest<'a> {
    pub feeds: Vec<TensorFeed<'a>>,
    pub placeholders: &'a [PlaceholderBinding],
    pub outputs: &'a [String],
    pub batch_size: usize,
    pub streaming: bool,
}

/// Output values laid out `samples x rows x cols x channels`.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTensor {
    pub name: String,
    pub values: Array4<f32>,
}

/// Result of a training pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingSummary {
    pub samples: usize,
    pub batches: usize,
    /// Mean value of each surfaced output tensor over the pass.
    pub outputs: Vec<(String, f32)>,
}

/// Model engine driven by the orchestrator.
pub trait ModelEngine {
    /// Load the model artifact stored in `dir` for the given tag set.
    fn load(dir: &Path, tags: &[String]) -> Result<Self, EngineError>
    where
        Self: Sized;

    /// Replace variable values with the ones saved at `path`.
    fn restore(&mut self, path: &Path) -> Result<(), EngineError>;

    /// Persist the current variable values to `path`.
    fn save(&self, path: &Path) -> Result<(), EngineError>;

    fn train(&mut self, request: &TrainingRequest<'_>) -> Result<TrainingSummary, EngineError>;

    fn infer(&self, request: &InferenceRequest<'_>) -> Result<Vec<OutputTensor>, EngineError>;
}
