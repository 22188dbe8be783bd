//! Linear softmax classifier over concatenated input patches.
//!
//! This is the engine shipped with the binary. It understands the graph
//! layout of [`super::saved_model`] and trains with mini-batch gradient
//! descent when the optimizer node is targeted.

use std::path::Path;

use ndarray::{Array1, Array2, Array4, Axis, concatenate};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use super::saved_model::{GraphDef, SavedModel, ScalarType, Variables, variables_path};
use super::{
    EngineError, InferenceRequest, ModelEngine, OutputTensor, TensorFeed, TrainingRequest,
    TrainingSummary,
};
use crate::placeholders::{PlaceholderBinding, PlaceholderValue};
use crate::raster::{BatchPlan, common_sample_count};

/// Saved model loaded for training and scoring.
#[derive(Debug, Clone)]
pub struct SoftmaxPatchModel {
    graph: GraphDef,
    weights: Array2<f32>,
    bias: Array1<f32>,
    rng: StdRng,
}

/// Feeds ordered like the graph inputs, plus the optional label feed.
struct BoundFeeds<'a> {
    inputs: Vec<TensorFeed<'a>>,
    label: Option<TensorFeed<'a>>,
}

/// Sums over the forward passes of one training call.
#[derive(Debug, Default)]
struct EpochTotals {
    loss: f32,
    predicted: f32,
    logits: f32,
    logit_values: usize,
}

impl SoftmaxPatchModel {
    /// Current variable values.
    pub fn variables(&self) -> Variables {
        Variables {
            classes: self.graph.classes,
            features: self.graph.feature_len(),
            weights: self.weights.iter().copied().collect(),
            bias: self.bias.to_vec(),
        }
    }

    fn set_variables(&mut self, variables: Variables) -> Result<(), String> {
        let classes = self.graph.classes;
        let features = self.graph.feature_len();
        variables.check(classes, features)?;
        self.weights = Array2::from_shape_vec((classes, features), variables.weights)
            .map_err(|err| err.to_string())?;
        self.bias = Array1::from(variables.bias);
        Ok(())
    }

    /// Validate placeholder bindings and return the effective learning rate.
    fn learning_rate(&self, bindings: &[PlaceholderBinding]) -> Result<f32, EngineError> {
        let mut lr = self.graph.learning_rate.default;
        for binding in bindings {
            if binding.name == self.graph.learning_rate.name {
                lr = binding
                    .value
                    .as_float()
                    .ok_or_else(|| EngineError::PlaceholderType {
                        name: binding.name.clone(),
                        expected: "float scalar",
                        actual: binding.value.type_label(),
                    })?;
                continue;
            }
            let Some(def) = self
                .graph
                .placeholders
                .iter()
                .find(|def| def.name == binding.name)
            else {
                return Err(EngineError::UnknownPlaceholder(binding.name.clone()));
            };
            let matches = matches!(
                (def.dtype, &binding.value),
                (ScalarType::Int, PlaceholderValue::Int(_))
                    | (ScalarType::Float, PlaceholderValue::Float(_))
                    | (ScalarType::Bool, PlaceholderValue::Bool(_))
            );
            if !matches {
                return Err(EngineError::PlaceholderType {
                    name: binding.name.clone(),
                    expected: match def.dtype {
                        ScalarType::Int => "int scalar",
                        ScalarType::Float => "float scalar",
                        ScalarType::Bool => "bool scalar",
                    },
                    actual: binding.value.type_label(),
                });
            }
        }
        Ok(lr)
    }

    fn bind<'a>(
        &self,
        feeds: &[TensorFeed<'a>],
        with_label: bool,
    ) -> Result<BoundFeeds<'a>, EngineError> {
        for feed in feeds {
            let known = feed.name == self.graph.label
                || self.graph.inputs.iter().any(|input| input.name == feed.name);
            if !known {
                return Err(EngineError::UnknownPlaceholder(feed.name.to_string()));
            }
        }
        let mut inputs = Vec::with_capacity(self.graph.inputs.len());
        for input in &self.graph.inputs {
            // Later feeds of the same name take precedence.
            let feed = feeds
                .iter()
                .rev()
                .find(|feed| feed.name == input.name)
                .copied()
                .ok_or_else(|| EngineError::MissingFeed(input.name.clone()))?;
            if feed.patch != input.patch {
                return Err(invalid(
                    feed.name,
                    format!("patch size {} differs from {}", feed.patch, input.patch),
                ));
            }
            if feed.source.bands() != input.bands {
                return Err(invalid(
                    feed.name,
                    format!("{} bands given, {} expected", feed.source.bands(), input.bands),
                ));
            }
            inputs.push(feed);
        }
        let label = if with_label {
            let feed = feeds
                .iter()
                .rev()
                .find(|feed| feed.name == self.graph.label)
                .copied()
                .ok_or_else(|| EngineError::MissingFeed(self.graph.label.clone()))?;
            if feed.patch.pixels() != 1 {
                return Err(invalid(
                    feed.name,
                    format!("label patches must be [1, 1], got {}", feed.patch),
                ));
            }
            Some(feed)
        } else {
            None
        };
        Ok(BoundFeeds { inputs, label })
    }

    fn sample_count(&self, bound: &BoundFeeds<'_>) -> Result<usize, EngineError> {
        let feeds = bound
            .inputs
            .iter()
            .chain(bound.label.iter())
            .map(|feed| (feed.name, feed.source, feed.patch));
        Ok(common_sample_count(feeds)?)
    }

    /// Flattened features for a range of samples (`samples x features`).
    fn features(
        &self,
        bound: &BoundFeeds<'_>,
        samples: std::ops::Range<usize>,
    ) -> Result<Array2<f32>, EngineError> {
        let count = samples.len();
        let mut parts = Vec::with_capacity(bound.inputs.len());
        for feed in &bound.inputs {
            let batch = feed.source.read_batch(samples.clone(), feed.patch);
            let width = batch.len() / count.max(1);
            let flat = batch
                .into_shape_with_order((count, width))
                .map_err(crate::raster::RasterError::from)?;
            parts.push(flat);
        }
        let views: Vec<_> = parts.iter().map(|part| part.view()).collect();
        Ok(concatenate(Axis(1), &views).map_err(crate::raster::RasterError::from)?)
    }

    fn labels(
        &self,
        feed: &TensorFeed<'_>,
        samples: std::ops::Range<usize>,
    ) -> Result<Vec<usize>, EngineError> {
        let batch = feed.source.read_batch(samples, feed.patch);
        let classes = self.graph.classes;
        batch
            .outer_iter()
            .map(|sample| {
                let value = sample[[0, 0, 0]].round();
                if value < 0.0 || value as usize >= classes {
                    Err(invalid(
                        feed.name,
                        format!("label {value} outside of 0..{classes}"),
                    ))
                } else {
                    Ok(value as usize)
                }
            })
            .collect()
    }

    /// Raw class scores, `features . W^T + b`.
    fn logits(&self, features: &Array2<f32>) -> Array2<f32> {
        features.dot(&self.weights.t()) + &self.bias
    }

    /// One forward pass and, when `update` is set, one gradient step.
    fn step(
        &mut self,
        features: &Array2<f32>,
        labels: &[usize],
        lr: f32,
        update: bool,
        totals: &mut EpochTotals,
    ) {
        let logits = self.logits(features);
        totals.logits += logits.sum();
        totals.logit_values += logits.len();
        totals.predicted += predictions(&logits).sum();
        let mut probs = logits;
        softmax_rows(&mut probs);
        for (mut row, &label) in probs.outer_iter_mut().zip(labels) {
            totals.loss -= row[label].max(1e-12).ln();
            row[label] -= 1.0;
        }
        if update && !labels.is_empty() {
            let scale = lr / labels.len() as f32;
            let grad_w = probs.t().dot(features);
            let grad_b = probs.sum_axis(Axis(0));
            self.weights.scaled_add(-scale, &grad_w);
            self.bias.scaled_add(-scale, &grad_b);
        }
    }
}

impl ModelEngine for SoftmaxPatchModel {
    fn load(dir: &Path, tags: &[String]) -> Result<Self, EngineError> {
        let saved = SavedModel::read(dir)?;
        let meta = saved.select(tags)?;
        let graph = meta.graph.clone();
        if graph.classes == 0 || graph.inputs.is_empty() {
            return Err(EngineError::CheckpointMismatch {
                path: dir.to_path_buf(),
                reason: "graph declares no inputs or no classes".to_string(),
            });
        }
        let features = graph.feature_len();
        let mut model = Self {
            weights: Array2::zeros((graph.classes, features)),
            bias: Array1::zeros(graph.classes),
            rng: StdRng::seed_from_u64(graph.seed),
            graph,
        };
        let shipped = variables_path(dir);
        if shipped.is_file() {
            model.restore(&shipped)?;
        }
        tracing::debug!(
            "Loaded graph with {} inputs, {} features, {} classes",
            model.graph.inputs.len(),
            features,
            model.graph.classes
        );
        Ok(model)
    }

    fn restore(&mut self, path: &Path) -> Result<(), EngineError> {
        let variables = Variables::read(path)?;
        self.set_variables(variables)
            .map_err(|reason| EngineError::CheckpointMismatch {
                path: path.to_path_buf(),
                reason,
            })
    }

    fn save(&self, path: &Path) -> Result<(), EngineError> {
        self.variables().write(path)
    }

    fn train(&mut self, request: &TrainingRequest<'_>) -> Result<TrainingSummary, EngineError> {
        let lr = self.learning_rate(request.placeholders)?;
        let names = self.graph.names.clone();
        let mut update = false;
        for node in request.target_nodes {
            if *node == names.optimizer {
                update = true;
            } else if *node != names.loss && *node != names.logits && *node != names.prediction {
                return Err(EngineError::UnknownNode(node.clone()));
            }
        }
        for tensor in request.output_tensors {
            if *tensor != names.loss && *tensor != names.logits && *tensor != names.prediction {
                return Err(EngineError::UnknownTensor(tensor.clone()));
            }
        }
        let bound = self.bind(&request.feeds, true)?;
        let Some(label_feed) = bound.label else {
            return Err(EngineError::MissingFeed(self.graph.label.clone()));
        };
        let samples = self.sample_count(&bound)?;
        let plan = BatchPlan::new(samples, request.batch_size);

        let mut totals = EpochTotals::default();
        if request.streaming {
            for range in plan.batches() {
                let features = self.features(&bound, range.clone())?;
                let labels = self.labels(&label_feed, range)?;
                self.step(&features, &labels, lr, update, &mut totals);
            }
        } else {
            let features = self.features(&bound, 0..samples)?;
            let labels = self.labels(&label_feed, 0..samples)?;
            let mut order: Vec<usize> = (0..samples).collect();
            order.shuffle(&mut self.rng);
            for chunk in order.chunks(request.batch_size.max(1)) {
                let batch = features.select(Axis(0), chunk);
                let batch_labels: Vec<usize> = chunk.iter().map(|&index| labels[index]).collect();
                self.step(&batch, &batch_labels, lr, update, &mut totals);
            }
        }

        let mut outputs = Vec::with_capacity(request.output_tensors.len());
        for tensor in request.output_tensors {
            let value = if *tensor == names.loss {
                totals.loss / samples as f32
            } else if *tensor == names.prediction {
                totals.predicted / samples as f32
            } else {
                totals.logits / totals.logit_values.max(1) as f32
            };
            outputs.push((tensor.clone(), value));
        }
        Ok(TrainingSummary {
            samples,
            batches: plan.len(),
            outputs,
        })
    }

    fn infer(&self, request: &InferenceRequest<'_>) -> Result<Vec<OutputTensor>, EngineError> {
        self.learning_rate(request.placeholders)?;
        let names = &self.graph.names;
        for output in request.outputs {
            if *output == names.loss {
                return Err(EngineError::MissingFeed(self.graph.label.clone()));
            }
            if *output != names.logits && *output != names.prediction {
                return Err(EngineError::UnknownTensor(output.clone()));
            }
        }
        let bound = self.bind(&request.feeds, false)?;
        let samples = self.sample_count(&bound)?;
        let classes = self.graph.classes;

        let logits = if request.streaming {
            let plan = BatchPlan::new(samples, request.batch_size);
            let mut parts = Vec::with_capacity(plan.len());
            for range in plan.batches() {
                parts.push(self.logits(&self.features(&bound, range)?));
            }
            let views: Vec<_> = parts.iter().map(|part| part.view()).collect();
            concatenate(Axis(0), &views).map_err(crate::raster::RasterError::from)?
        } else {
            self.logits(&self.features(&bound, 0..samples)?)
        };

        let mut tensors = Vec::with_capacity(request.outputs.len());
        for output in request.outputs {
            let values = if *output == names.prediction {
                let predicted = predictions(&logits);
                Array4::from_shape_fn((samples, 1, 1, 1), |(sample, _, _, _)| predicted[sample])
            } else {
                Array4::from_shape_fn((samples, 1, 1, classes), |(sample, _, _, class)| {
                    logits[[sample, class]]
                })
            };
            tensors.push(OutputTensor {
                name: output.clone(),
                values,
            });
        }
        Ok(tensors)
    }
}

fn invalid(name: &str, reason: String) -> EngineError {
    EngineError::InvalidFeed {
        name: name.to_string(),
        reason,
    }
}

fn softmax_rows(logits: &mut Array2<f32>) {
    for mut row in logits.outer_iter_mut() {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|value| (value - max).exp());
        let sum = row.sum();
        if sum > 0.0 {
            row.mapv_inplace(|value| value / sum);
        }
    }
}

/// Index of the highest score of each row, as `f32` class values.
fn predictions(logits: &Array2<f32>) -> Array1<f32> {
    logits
        .outer_iter()
        .map(|row| argmax(row.iter().copied()) as f32)
        .collect()
}

fn argmax<I: Iterator<Item = f32>>(values: I) -> usize {
    let mut best = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (idx, value) in values.enumerate() {
        if value > best_val {
            best_val = value;
            best = idx;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::saved_model::{InputDef, MetaGraph, SAVED_MODEL_FILE};
    use crate::raster::{PatchSize, RasterStack};
    use tempfile::tempdir;

    fn write_model(dir: &Path) {
        let saved = SavedModel {
            meta_graphs: vec![MetaGraph {
                tags: vec!["serve".to_string()],
                graph: GraphDef {
                    inputs: vec![InputDef {
                        name: "x".to_string(),
                        bands: 1,
                        patch: PatchSize::new(1, 1),
                    }],
                    label: "y".to_string(),
                    classes: 2,
                    learning_rate: Default::default(),
                    placeholders: vec![crate::engine::saved_model::ScalarDef {
                        name: "is_training".to_string(),
                        dtype: ScalarType::Bool,
                    }],
                    names: Default::default(),
                    seed: 7,
                },
            }],
        };
        std::fs::write(
            dir.join(SAVED_MODEL_FILE),
            serde_json::to_string(&saved).unwrap(),
        )
        .unwrap();
    }

    /// Separable data: negative values are class 0, positive class 1.
    fn dataset() -> (RasterStack, RasterStack) {
        let values = [-2.0, -1.5, -1.0, -0.5, 0.5, 1.0, 1.5, 2.0];
        let x: Vec<Vec<f32>> = values.iter().map(|&v| vec![v]).collect();
        let y: Vec<Vec<f32>> = values
            .iter()
            .map(|&v| vec![if v > 0.0 { 1.0 } else { 0.0 }])
            .collect();
        (
            RasterStack::from_samples(1, PatchSize::new(1, 1), &x).unwrap(),
            RasterStack::from_samples(1, PatchSize::new(1, 1), &y).unwrap(),
        )
    }

    fn training_request<'a>(
        x: &'a RasterStack,
        y: &'a RasterStack,
        placeholders: &'a [PlaceholderBinding],
        targets: &'a [String],
        outputs: &'a [String],
        streaming: bool,
    ) -> TrainingRequest<'a> {
        TrainingRequest {
            feeds: vec![
                TensorFeed {
                    name: "x",
                    patch: PatchSize::new(1, 1),
                    source: x,
                },
                TensorFeed {
                    name: "y",
                    patch: PatchSize::new(1, 1),
                    source: y,
                },
            ],
            placeholders,
            target_nodes: targets,
            output_tensors: outputs,
            batch_size: 4,
            streaming,
        }
    }

    #[test]
    fn training_separates_linear_classes() {
        let dir = tempdir().unwrap();
        write_model(dir.path());
        let mut model = SoftmaxPatchModel::load(dir.path(), &[]).unwrap();
        let (x, y) = dataset();
        let placeholders = crate::placeholders::parse_expressions(&["lr=0.5"]).unwrap();
        let targets = vec!["optimizer".to_string()];
        let outputs = vec!["loss".to_string()];
        let mut losses = Vec::new();
        for epoch in 0..30 {
            let request =
                training_request(&x, &y, &placeholders, &targets, &outputs, epoch % 2 == 0);
            let summary = model.train(&request).unwrap();
            assert_eq!(summary.samples, 8);
            assert_eq!(summary.batches, 2);
            losses.push(summary.outputs[0].1);
        }
        assert!(losses.last().unwrap() < losses.first().unwrap());

        let requested = vec!["prediction".to_string()];
        let outputs = model
            .infer(&InferenceRequest {
                feeds: vec![TensorFeed {
                    name: "x",
                    patch: PatchSize::new(1, 1),
                    source: &x,
                }],
                placeholders: &[],
                outputs: &requested,
                batch_size: 3,
                streaming: true,
            })
            .unwrap();
        let predicted: Vec<f32> = outputs[0].values.iter().copied().collect();
        assert_eq!(predicted, vec![0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn zero_weights_give_zero_logits_and_class_zero() {
        let dir = tempdir().unwrap();
        write_model(dir.path());
        let mut model = SoftmaxPatchModel::load(dir.path(), &[]).unwrap();
        let (x, y) = dataset();

        let requested = vec!["logits".to_string(), "prediction".to_string()];
        for streaming in [false, true] {
            let outputs = model
                .infer(&InferenceRequest {
                    feeds: vec![TensorFeed {
                        name: "x",
                        patch: PatchSize::new(1, 1),
                        source: &x,
                    }],
                    placeholders: &[],
                    outputs: &requested,
                    batch_size: 3,
                    streaming,
                })
                .unwrap();
            assert_eq!(outputs[0].values.shape(), &[8, 1, 1, 2]);
            assert!(outputs[0].values.iter().all(|&value| value == 0.0));
            assert_eq!(outputs[1].values.shape(), &[8, 1, 1, 1]);
            assert!(outputs[1].values.iter().all(|&value| value == 0.0));
        }

        // Forward only, so every batch sees the zero weights.
        let targets = vec!["loss".to_string()];
        for streaming in [false, true] {
            let summary = model
                .train(&training_request(&x, &y, &[], &targets, &requested, streaming))
                .unwrap();
            assert_eq!(
                summary.outputs,
                vec![("logits".to_string(), 0.0), ("prediction".to_string(), 0.0)]
            );
        }
    }

    #[test]
    fn surfaced_prediction_is_the_mean_predicted_class() {
        let dir = tempdir().unwrap();
        write_model(dir.path());
        let mut model = SoftmaxPatchModel::load(dir.path(), &[]).unwrap();
        let mut variables = model.variables();
        // Class 1 whenever the single feature is positive.
        variables.weights = vec![-1.0, 1.0];
        let ckpt = dir.path().join("signed.json");
        variables.write(&ckpt).unwrap();
        model.restore(&ckpt).unwrap();

        let (x, y) = dataset();
        let targets = vec!["loss".to_string()];
        let outputs = vec!["prediction".to_string(), "logits".to_string()];
        let summary = model
            .train(&training_request(&x, &y, &[], &targets, &outputs, true))
            .unwrap();
        assert_eq!(summary.outputs[0], ("prediction".to_string(), 0.5));
        // Logits are (-v, v) per sample, so they cancel out.
        assert_eq!(summary.outputs[1], ("logits".to_string(), 0.0));
    }

    #[test]
    fn forward_only_targets_leave_variables_untouched() {
        let dir = tempdir().unwrap();
        write_model(dir.path());
        let mut model = SoftmaxPatchModel::load(dir.path(), &[]).unwrap();
        let before = model.variables();
        let (x, y) = dataset();
        let targets = vec!["loss".to_string()];
        model
            .train(&training_request(&x, &y, &[], &targets, &[], false))
            .unwrap();
        assert_eq!(model.variables(), before);
    }

    #[test]
    fn unknown_names_and_bad_types_are_engine_errors() {
        let dir = tempdir().unwrap();
        write_model(dir.path());
        let mut model = SoftmaxPatchModel::load(dir.path(), &[]).unwrap();
        let (x, y) = dataset();

        let targets = vec!["adam".to_string()];
        let err = model
            .train(&training_request(&x, &y, &[], &targets, &[], false))
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownNode(name) if name == "adam"));

        let targets = vec!["optimizer".to_string()];
        let placeholders = crate::placeholders::parse_expressions(&["is_training=1"]).unwrap();
        let err = model
            .train(&training_request(&x, &y, &placeholders, &targets, &[], false))
            .unwrap_err();
        assert!(matches!(err, EngineError::PlaceholderType { .. }));

        let placeholders = crate::placeholders::parse_expressions(&["dropout=0.2"]).unwrap();
        let err = model
            .train(&training_request(&x, &y, &placeholders, &targets, &[], false))
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownPlaceholder(name) if name == "dropout"));
    }

    #[test]
    fn save_then_restore_round_trips_variables() {
        let dir = tempdir().unwrap();
        write_model(dir.path());
        let mut model = SoftmaxPatchModel::load(dir.path(), &[]).unwrap();
        let (x, y) = dataset();
        let targets = vec!["optimizer".to_string()];
        model
            .train(&training_request(&x, &y, &[], &targets, &[], true))
            .unwrap();
        let ckpt = dir.path().join("ckpt").join("vars.json");
        model.save(&ckpt).unwrap();

        let mut fresh = SoftmaxPatchModel::load(dir.path(), &[]).unwrap();
        assert_ne!(fresh.variables(), model.variables());
        fresh.restore(&ckpt).unwrap();
        assert_eq!(fresh.variables(), model.variables());
    }

    #[test]
    fn restore_rejects_mismatched_checkpoint() {
        let dir = tempdir().unwrap();
        write_model(dir.path());
        let mut model = SoftmaxPatchModel::load(dir.path(), &[]).unwrap();
        let ckpt = dir.path().join("other.json");
        Variables::zeros(3, 1).write(&ckpt).unwrap();
        assert!(matches!(
            model.restore(&ckpt),
            Err(EngineError::CheckpointMismatch { .. })
        ));
    }
}
