//! Classification metrics derived from confusion matrices.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Confusion matrix for a `K`-class classifier.
pub struct ConfusionMatrix {
    /// Number of classes.
    pub n_classes: usize,
    /// Row-major `KxK` counts (`truth * K + predicted`).
    pub counts: Vec<u64>,
}

impl ConfusionMatrix {
    /// Create an empty `KxK` confusion matrix.
    pub fn new(n_classes: usize) -> Self {
        Self {
            n_classes,
            counts: vec![0; n_classes * n_classes],
        }
    }

    pub fn add_count(&mut self, truth: usize, predicted: usize, count: u64) {
        if truth >= self.n_classes || predicted >= self.n_classes {
            return;
        }
        let idx = truth * self.n_classes + predicted;
        self.counts[idx] = self.counts[idx].saturating_add(count);
    }

    pub fn get(&self, truth: usize, predicted: usize) -> u64 {
        self.counts[truth * self.n_classes + predicted]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Sum of the diagonal (correctly classified samples).
    pub fn trace(&self) -> u64 {
        (0..self.n_classes).map(|class| self.get(class, class)).sum()
    }

    fn row_sum(&self, truth: usize) -> u64 {
        (0..self.n_classes).map(|j| self.get(truth, j)).sum()
    }

    fn col_sum(&self, predicted: usize) -> u64 {
        (0..self.n_classes).map(|i| self.get(i, predicted)).sum()
    }
}

/// Mapping from label values to matrix indices, ordered by label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelIndexMap {
    indices: BTreeMap<i64, usize>,
}

impl LabelIndexMap {
    pub fn from_labels<I: IntoIterator<Item = i64>>(labels: I) -> Self {
        let sorted: std::collections::BTreeSet<i64> = labels.into_iter().collect();
        Self {
            indices: sorted
                .into_iter()
                .enumerate()
                .map(|(index, label)| (label, index))
                .collect(),
        }
    }

    pub fn index_of(&self, label: i64) -> Option<usize> {
        self.indices.get(&label).copied()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Iterate `(label, index)` pairs in label order.
    pub fn iter(&self) -> impl Iterator<Item = (i64, usize)> + '_ {
        self.indices.iter().map(|(&label, &index)| (label, index))
    }
}

/// Collects reference/predicted label pairs for one target.
///
/// Labels are discovered on the fly; the matrix is only sized once every
/// pair has been seen.
#[derive(Debug, Clone, Default)]
pub struct ConfusionAccumulator {
    pairs: BTreeMap<(i64, i64), u64>,
}

impl ConfusionAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one pixel; values are rounded to the nearest label.
    pub fn add(&mut self, reference: f32, predicted: f32) {
        let key = (reference.round() as i64, predicted.round() as i64);
        *self.pairs.entry(key).or_insert(0) += 1;
    }

    pub fn samples(&self) -> u64 {
        self.pairs.values().sum()
    }

    /// Build the square matrix over the union of reference and predicted labels.
    pub fn finish(self) -> (ConfusionMatrix, LabelIndexMap) {
        let labels = LabelIndexMap::from_labels(
            self.pairs
                .keys()
                .flat_map(|&(reference, predicted)| [reference, predicted]),
        );
        let mut matrix = ConfusionMatrix::new(labels.len());
        for ((reference, predicted), count) in self.pairs {
            let truth = labels.index_of(reference);
            let pred = labels.index_of(predicted);
            if let (Some(truth), Some(pred)) = (truth, pred) {
                matrix.add_count(truth, pred, count);
            }
        }
        (matrix, labels)
    }
}

/// Per-class and aggregate scores for one confusion matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationMetrics {
    /// `TP / (TP + FP)` per class index.
    pub precision: Vec<f64>,
    /// `TP / (TP + FN)` per class index.
    pub recall: Vec<f64>,
    /// Harmonic mean of precision and recall per class index.
    pub f_score: Vec<f64>,
    pub overall_accuracy: f64,
    pub kappa: f64,
}

impl ClassificationMetrics {
    pub fn compute(cm: &ConfusionMatrix) -> Self {
        let k = cm.n_classes;
        let mut precision = Vec::with_capacity(k);
        let mut recall = Vec::with_capacity(k);
        let mut f_score = Vec::with_capacity(k);
        for class_idx in 0..k {
            let tp = cm.get(class_idx, class_idx) as f64;
            let predicted = cm.col_sum(class_idx) as f64;
            let actual = cm.row_sum(class_idx) as f64;
            let p = ratio(tp, predicted);
            let r = ratio(tp, actual);
            precision.push(p);
            recall.push(r);
            f_score.push(ratio(2.0 * p * r, p + r));
        }

        let total = cm.total() as f64;
        let overall_accuracy = ratio(cm.trace() as f64, total);
        let expected = if total == 0.0 {
            0.0
        } else {
            (0..k)
                .map(|c| cm.row_sum(c) as f64 * cm.col_sum(c) as f64)
                .sum::<f64>()
                / (total * total)
        };
        let kappa = if (1.0 - expected).abs() < f64::EPSILON {
            if total > 0.0 && overall_accuracy == 1.0 {
                1.0
            } else {
                0.0
            }
        } else {
            (overall_accuracy - expected) / (1.0 - expected)
        };

        Self {
            precision,
            recall,
            f_score,
            overall_accuracy,
            kappa,
        }
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

/// Render per-class scores, aggregates and the raw matrix as log lines.
pub fn render_report(
    cm: &ConfusionMatrix,
    labels: &LabelIndexMap,
    metrics: &ClassificationMetrics,
) -> Vec<String> {
    let mut lines = Vec::new();
    for (label, index) in labels.iter() {
        lines.push(format!(
            "Precision of class [{label}] vs all: {:.4}",
            metrics.precision[index]
        ));
        lines.push(format!(
            "Recall of class [{label}] vs all: {:.4}",
            metrics.recall[index]
        ));
        lines.push(format!(
            "F-score of class [{label}] vs all: {:.4}",
            metrics.f_score[index]
        ));
    }
    lines.push(format!(
        "Precision of the different classes: {}",
        format_scores(&metrics.precision)
    ));
    lines.push(format!(
        "Recall of the different classes: {}",
        format_scores(&metrics.recall)
    ));
    lines.push(format!(
        "F-score of the different classes: {}",
        format_scores(&metrics.f_score)
    ));
    lines.push(format!("Kappa index: {:.4}", metrics.kappa));
    lines.push(format!(
        "Overall accuracy index: {:.4}",
        metrics.overall_accuracy
    ));
    lines.push("Confusion matrix (rows=reference, cols=produced):".to_string());
    let mut header = format!("{:>8}", "");
    for (label, _) in labels.iter() {
        header.push_str(&format!("{label:>8}"));
    }
    lines.push(header);
    for (label, truth) in labels.iter() {
        let mut row = format!("{label:>8}");
        for pred in 0..cm.n_classes {
            row.push_str(&format!("{:>8}", cm.get(truth, pred)));
        }
        lines.push(row);
    }
    lines
}

fn format_scores(scores: &[f64]) -> String {
    let joined = scores
        .iter()
        .map(|score| format!("{score:.4}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("[{joined}]")
}
