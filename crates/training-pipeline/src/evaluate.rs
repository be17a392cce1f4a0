use nalgebra::DMatrix;

use trading_core::{ClassMetrics, TestMetrics};

use crate::network::{cross_entropy, Mlp};

/// Hard predictions: argmax per row.
pub fn predict(model: &Mlp, x: &DMatrix<f64>) -> Vec<usize> {
    let probs = model.forward(x);
    probs
        .row_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
                .map(|(i, _)| i)
                .unwrap_or(0)
        })
        .collect()
}

pub fn loss_and_accuracy(model: &Mlp, x: &DMatrix<f64>, y: &[usize]) -> (f64, f64) {
    if y.is_empty() {
        return (0.0, 0.0);
    }
    let probs = model.forward(x);
    let loss = cross_entropy(&probs, y);
    let correct = probs
        .row_iter()
        .zip(y)
        .filter(|(row, &class)| {
            let predicted = row
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
                .map(|(i, _)| i)
                .unwrap_or(0);
            predicted == class
        })
        .count();
    (loss, correct as f64 / y.len() as f64)
}

pub fn confusion_matrix(predictions: &[usize], y: &[usize], classes: usize) -> Vec<Vec<u64>> {
    let mut matrix = vec![vec![0u64; classes]; classes];
    for (&pred, &actual) in predictions.iter().zip(y) {
        matrix[actual][pred] += 1;
    }
    matrix
}

/// Full test-split evaluation: accuracy, loss, per-class precision/recall/
/// F1, macro averages and the confusion matrix.
pub fn dataset_metrics(
    model: &Mlp,
    x: &DMatrix<f64>,
    y: &[usize],
    class_names: &[String],
) -> TestMetrics {
    if y.is_empty() {
        return TestMetrics::default();
    }
    let predictions = predict(model, x);
    let (loss, accuracy) = loss_and_accuracy(model, x, y);
    let matrix = confusion_matrix(&predictions, y, class_names.len());

    let mut per_class = Vec::with_capacity(class_names.len());
    for (c, name) in class_names.iter().enumerate() {
        let tp = matrix[c][c] as f64;
        let fp: f64 = (0..class_names.len())
            .filter(|&a| a != c)
            .map(|a| matrix[a][c] as f64)
            .sum();
        let fn_: f64 = (0..class_names.len())
            .filter(|&p| p != c)
            .map(|p| matrix[c][p] as f64)
            .sum();
        let support = matrix[c].iter().sum::<u64>() as usize;

        let precision = if tp + fp > 0.0 { tp / (tp + fp) } else { 0.0 };
        let recall = if tp + fn_ > 0.0 { tp / (tp + fn_) } else { 0.0 };
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        per_class.push(ClassMetrics {
            label: name.clone(),
            precision,
            recall,
            f1,
            support,
        });
    }

    // Macro averages over classes that actually occur in the split.
    let present: Vec<&ClassMetrics> = per_class.iter().filter(|c| c.support > 0).collect();
    let denom = present.len().max(1) as f64;
    let precision = present.iter().map(|c| c.precision).sum::<f64>() / denom;
    let recall = present.iter().map(|c| c.recall).sum::<f64>() / denom;
    let f1 = present.iter().map(|c| c.f1).sum::<f64>() / denom;

    TestMetrics {
        accuracy,
        loss,
        precision,
        recall,
        f1,
        confusion_matrix: matrix,
        per_class,
    }
}
