//! Training and periodic validation of saved patch classifiers on raster
//! sources.
/// Application directory resolution.
pub mod app_dirs;
/// Run configuration files.
pub mod config;
/// Model engine contract and the bundled softmax engine.
pub mod engine;
/// Ownership of the loaded model across the run.
pub mod lifecycle;
/// Logging initialization.
pub mod logging;
/// Confusion matrices and classification metrics.
pub mod metrics;
/// Epoch loop and cadence-driven validation.
pub mod orchestrator;
/// `name=value` placeholder expressions.
pub mod placeholders;
/// Multi-band raster stacks and patch batching.
pub mod raster;
/// Source bundle registry.
pub mod registry;
/// Training controller.
pub mod training;
/// Validation evaluator.
pub mod validation;

pub use config::{RunConfig, SourceCount};
pub use engine::{ModelEngine, SoftmaxPatchModel};
pub use orchestrator::{Orchestrator, RunError, RunSummary, validation_due};
pub use raster::{ImageLoader, RasterLoader, RasterStack};
