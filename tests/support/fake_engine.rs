use std::cell::RefCell;
use std::path::{Path, PathBuf};

use ndarray::Array4;
use rastertrain::engine::{
    EngineError, InferenceRequest, ModelEngine, OutputTensor, TrainingRequest, TrainingSummary,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Restore(PathBuf),
    Save(PathBuf),
    Train {
        feeds: Vec<String>,
        placeholders: Vec<String>,
        batch_size: usize,
        streaming: bool,
    },
    Infer {
        feeds: Vec<String>,
        outputs: Vec<String>,
        streaming: bool,
    },
}

/// Engine predicting the first input value of each sample as its class.
#[derive(Debug, Default)]
pub struct RecordingEngine {
    calls: RefCell<Vec<Call>>,
    /// Training fails on this (1-based) training call.
    fail_on_train: Option<usize>,
}

impl RecordingEngine {
    pub fn failing_on_train(call: usize) -> Self {
        Self {
            fail_on_train: Some(call),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn train_count(&self) -> usize {
        self.count(|call| matches!(call, Call::Train { .. }))
    }

    pub fn infer_count(&self) -> usize {
        self.count(|call| matches!(call, Call::Infer { .. }))
    }

    fn count(&self, filter: impl Fn(&Call) -> bool) -> usize {
        self.calls.borrow().iter().filter(|call| filter(call)).count()
    }
}

impl ModelEngine for RecordingEngine {
    fn load(_dir: &Path, _tags: &[String]) -> Result<Self, EngineError> {
        Ok(Self::default())
    }

    fn restore(&mut self, path: &Path) -> Result<(), EngineError> {
        self.calls.borrow_mut().push(Call::Restore(path.to_path_buf()));
        Ok(())
    }

    fn save(&self, path: &Path) -> Result<(), EngineError> {
        self.calls.borrow_mut().push(Call::Save(path.to_path_buf()));
        Ok(())
    }

    fn train(&mut self, request: &TrainingRequest<'_>) -> Result<TrainingSummary, EngineError> {
        self.calls.borrow_mut().push(Call::Train {
            feeds: request.feeds.iter().map(|feed| feed.name.to_string()).collect(),
            placeholders: request
                .placeholders
                .iter()
                .map(|binding| binding.name.clone())
                .collect(),
            batch_size: request.batch_size,
            streaming: request.streaming,
        });
        if Some(self.train_count()) == self.fail_on_train {
            return Err(EngineError::UnknownNode("exploding".to_string()));
        }
        let samples = request.feeds[0].source.rows();
        Ok(TrainingSummary {
            samples,
            batches: samples.div_ceil(request.batch_size),
            outputs: request
                .output_tensors
                .iter()
                .map(|name| (name.clone(), 0.25))
                .collect(),
        })
    }

    fn infer(&self, request: &InferenceRequest<'_>) -> Result<Vec<OutputTensor>, EngineError> {
        self.calls.borrow_mut().push(Call::Infer {
            feeds: request.feeds.iter().map(|feed| feed.name.to_string()).collect(),
            outputs: request.outputs.to_vec(),
            streaming: request.streaming,
        });
        let feed = request.feeds[0];
        let samples = feed.source.rows() / feed.patch.height;
        let batch = feed.source.read_batch(0..samples, feed.patch);
        Ok(request
            .outputs
            .iter()
            .map(|name| OutputTensor {
                name: name.clone(),
                values: Array4::from_shape_fn((samples, 1, 1, 1), |(sample, _, _, _)| {
                    batch[[sample, 0, 0, 0]]
                }),
            })
            .collect())
    }
}
