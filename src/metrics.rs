//! Evaluation metrics for trained classifiers.
//!
//! Each metric is computed independently; `evaluate` replaces a failing
//! metric with a zero/empty fallback and logs a warning instead of failing
//! the whole evaluation.

use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MetricError {
    #[error("no samples to evaluate")]
    Empty,

    #[error("metric is undefined when only one class is present")]
    SingleClass,

    #[error("{truth} true labels but {predicted} predictions")]
    LengthMismatch { truth: usize, predicted: usize },
}

fn check_lengths(truth: usize, predicted: usize) -> Result<(), MetricError> {
    if truth != predicted {
        return Err(MetricError::LengthMismatch { truth, predicted });
    }
    if truth == 0 {
        return Err(MetricError::Empty);
    }
    Ok(())
}

fn ratio(num: f64, den: f64) -> f64 {
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

pub fn accuracy(truth: &[usize], predicted: &[usize]) -> Result<f64, MetricError> {
    check_lengths(truth.len(), predicted.len())?;
    let hits = truth.iter().zip(predicted).filter(|(t, p)| t == p).count();
    Ok(hits as f64 / truth.len() as f64)
}

/// Rows are true classes, columns predicted classes
pub fn confusion_matrix(truth: &[usize], predicted: &[usize], n_classes: usize) -> Result<Vec<Vec<usize>>, MetricError> {
    check_lengths(truth.len(), predicted.len())?;
    let size = truth.iter().chain(predicted).map(|c| c + 1).max().unwrap_or(0).max(n_classes);
    let mut matrix = vec![vec![0usize; size]; size];
    for (&t, &p) in truth.iter().zip(predicted) {
        matrix[t][p] += 1;
    }
    Ok(matrix)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClassScores {
    pub precision: f64,
    pub recall: f64,
    #[serde(rename = "f1-score")]
    pub f1: f64,
    pub support: usize,
}

pub fn per_class_scores(truth: &[usize], predicted: &[usize], n_classes: usize) -> Result<Vec<ClassScores>, MetricError> {
    let matrix = confusion_matrix(truth, predicted, n_classes)?;
    let size = matrix.len();
    Ok((0..size)
        .map(|c| {
            let tp = matrix[c][c] as f64;
            let predicted_c: usize = (0..size).map(|r| matrix[r][c]).sum();
            let support: usize = matrix[c].iter().sum();
            let precision = ratio(tp, predicted_c as f64);
            let recall = ratio(tp, support as f64);
            ClassScores { precision, recall, f1: ratio(2.0 * precision * recall, precision + recall), support }
        })
        .collect())
}

fn weighted(scores: &[ClassScores]) -> ClassScores {
    let total: usize = scores.iter().map(|s| s.support).sum();
    let avg = |f: fn(&ClassScores) -> f64| ratio(scores.iter().map(|s| f(s) * s.support as f64).sum(), total as f64);
    ClassScores { precision: avg(|s| s.precision), recall: avg(|s| s.recall), f1: avg(|s| s.f1), support: total }
}

fn macro_average(scores: &[ClassScores]) -> ClassScores {
    let n = scores.len() as f64;
    let avg = |f: fn(&ClassScores) -> f64| ratio(scores.iter().map(f).sum(), n);
    ClassScores {
        precision: avg(|s| s.precision),
        recall: avg(|s| s.recall),
        f1: avg(|s| s.f1),
        support: scores.iter().map(|s| s.support).sum(),
    }
}

/// Support-weighted precision, recall and F1
pub fn precision_recall_f1(truth: &[usize], predicted: &[usize], n_classes: usize) -> Result<(f64, f64, f64), MetricError> {
    let w = weighted(&per_class_scores(truth, predicted, n_classes)?);
    Ok((w.precision, w.recall, w.f1))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationReport {
    #[serde(flatten)]
    pub classes: BTreeMap<String, ClassScores>,
    pub accuracy: f64,
    #[serde(rename = "macro avg")]
    pub macro_avg: ClassScores,
    #[serde(rename = "weighted avg")]
    pub weighted_avg: ClassScores,
}

/// Per-class scores keyed by label, plus accuracy and averages
pub fn classification_report(
    truth: &[usize],
    predicted: &[usize],
    labels: &[String],
) -> Result<ClassificationReport, MetricError> {
    let scores = per_class_scores(truth, predicted, labels.len())?;
    let classes = scores
        .iter()
        .enumerate()
        .map(|(i, s)| (labels.get(i).cloned().unwrap_or_else(|| i.to_string()), *s))
        .collect();
    Ok(ClassificationReport {
        classes,
        accuracy: accuracy(truth, predicted)?,
        macro_avg: macro_average(&scores),
        weighted_avg: weighted(&scores),
    })
}

/// Area under the ROC curve of one score column against a binary target,
/// from the rank-sum statistic (ties share their average rank)
fn binary_auc(positive: &[bool], scores: &[f64]) -> Option<f64> {
    let n_pos = positive.iter().filter(|p| **p).count();
    let n_neg = positive.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return None;
    }
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut ranks = vec![0.0; scores.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start;
        while end + 1 < order.len() && scores[order[end + 1]] == scores[order[start]] {
            end += 1;
        }
        let rank = (start + end) as f64 / 2.0 + 1.0;
        for &i in &order[start..=end] {
            ranks[i] = rank;
        }
        start = end + 1;
    }
    let rank_sum: f64 = ranks.iter().zip(positive).filter(|(_, p)| **p).map(|(r, _)| r).sum();
    let u = rank_sum - (n_pos * (n_pos + 1)) as f64 / 2.0;
    Some(u / (n_pos * n_neg) as f64)
}

/// Binary AUC on the positive-class column, or the one-vs-rest macro
/// average over the classes with both positives and negatives.
pub fn roc_auc(truth: &[usize], probabilities: &[Vec<f64>], n_classes: usize) -> Result<f64, MetricError> {
    check_lengths(truth.len(), probabilities.len())?;
    let column = |c: usize| probabilities.iter().map(|p| p.get(c).copied().unwrap_or(0.0)).collect::<Vec<_>>();
    if n_classes <= 2 {
        let positive: Vec<bool> = truth.iter().map(|t| *t == 1).collect();
        return binary_auc(&positive, &column(1)).ok_or(MetricError::SingleClass);
    }
    let aucs: Vec<f64> = (0..n_classes)
        .filter_map(|c| {
            let positive: Vec<bool> = truth.iter().map(|t| *t == c).collect();
            binary_auc(&positive, &column(c))
        })
        .collect();
    if aucs.is_empty() {
        return Err(MetricError::SingleClass);
    }
    Ok(aucs.iter().sum::<f64>() / aucs.len() as f64)
}

/// Everything computed for a finished model on the test rows
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationReport {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub confusion_matrix: Vec<Vec<usize>>,
    pub classification_report: Option<ClassificationReport>,
    pub roc_auc: Option<f64>,
}

/// Number of progress stages `evaluate` reports
pub const EVALUATION_STAGES: usize = 6;

fn or_fallback<T>(metric: &str, result: Result<T, MetricError>, fallback: T) -> T {
    result.unwrap_or_else(|e| {
        warn!(metric, error = %e, "Metric computation failed; using fallback");
        fallback
    })
}

/// Computes every metric, calling `on_stage(n)` after each of the
/// `EVALUATION_STAGES` stages.
pub fn evaluate(
    truth: &[usize],
    predicted: &[usize],
    probabilities: &[Vec<f64>],
    labels: &[String],
    mut on_stage: impl FnMut(usize),
) -> EvaluationReport {
    let n_classes = labels.len();

    let accuracy = or_fallback("accuracy", accuracy(truth, predicted), 0.0);
    on_stage(1);
    let (precision, recall, f1_score) =
        or_fallback("precision_recall_f1", precision_recall_f1(truth, predicted, n_classes), (0.0, 0.0, 0.0));
    on_stage(2);
    on_stage(3);
    on_stage(4);
    let confusion_matrix = or_fallback("confusion_matrix", confusion_matrix(truth, predicted, n_classes), Vec::new());
    on_stage(5);
    let classification_report = classification_report(truth, predicted, labels)
        .map_err(|e| warn!(metric = "classification_report", error = %e, "Metric computation failed; using fallback"))
        .ok();
    let roc_auc = roc_auc(truth, probabilities, n_classes)
        .map_err(|e| warn!(metric = "roc_auc", error = %e, "Metric computation failed; using fallback"))
        .ok();
    on_stage(6);

    EvaluationReport {
        accuracy,
        precision,
        recall,
        f1_score,
        confusion_matrix,
        classification_report,
        roc_auc,
    }
}
