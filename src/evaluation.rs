//! Classification metrics, stratified k-fold splitting and cross-validation.
//!
//! Binary only: class `1` is the positive (fraud) class throughout.

use crate::forest::{ForestError, ForestParams, RandomForestClassifier};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Metric used to score cross-validation folds and to rank trained models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScoringMetric {
    #[default]
    F1,
    RocAuc,
}

impl ScoringMetric {
    /// Score predictions. An undefined ROC-AUC (single class) scores 0.0.
    pub fn score(&self, y_true: &[u8], y_pred: &[u8], y_proba: &[f64]) -> f64 {
        match self {
            ScoringMetric::F1 => f1(y_true, y_pred),
            ScoringMetric::RocAuc => roc_auc(y_true, y_proba).unwrap_or(0.0),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScoringMetric::F1 => "f1",
            ScoringMetric::RocAuc => "roc_auc",
        }
    }
}

/// 2x2 confusion matrix, rows are true classes, columns predicted classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub true_negative: usize,
    pub false_positive: usize,
    pub false_negative: usize,
    pub true_positive: usize,
}

impl ConfusionMatrix {
    pub fn from_predictions(y_true: &[u8], y_pred: &[u8]) -> Self {
        let mut matrix = Self::default();
        for (&truth, &pred) in y_true.iter().zip(y_pred) {
            match (truth, pred) {
                (1, 1) => matrix.true_positive += 1,
                (1, _) => matrix.false_negative += 1,
                (_, 1) => matrix.false_positive += 1,
                _ => matrix.true_negative += 1,
            }
        }
        matrix
    }

    /// `[[tn, fp], [fn, tp]]`
    pub fn as_rows(&self) -> [[usize; 2]; 2] {
        [
            [self.true_negative, self.false_positive],
            [self.false_negative, self.true_positive],
        ]
    }
}

pub fn accuracy(y_true: &[u8], y_pred: &[u8]) -> f64 {
    if y_true.is_empty() {
        return 0.0;
    }
    let correct = y_true.iter().zip(y_pred).filter(|(t, p)| t == p).count();
    correct as f64 / y_true.len() as f64
}

/// Precision of the positive class; 0.0 when nothing was predicted positive.
pub fn precision(y_true: &[u8], y_pred: &[u8]) -> f64 {
    let cm = ConfusionMatrix::from_predictions(y_true, y_pred);
    ratio(cm.true_positive, cm.true_positive + cm.false_positive)
}

/// Recall of the positive class; 0.0 when there are no positives.
pub fn recall(y_true: &[u8], y_pred: &[u8]) -> f64 {
    let cm = ConfusionMatrix::from_predictions(y_true, y_pred);
    ratio(cm.true_positive, cm.true_positive + cm.false_negative)
}

pub fn f1(y_true: &[u8], y_pred: &[u8]) -> f64 {
    let cm = ConfusionMatrix::from_predictions(y_true, y_pred);
    ratio(
        2 * cm.true_positive,
        2 * cm.true_positive + cm.false_positive + cm.false_negative,
    )
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Area under the ROC curve via the rank-sum statistic (ties get averaged ranks).
///
/// Returns `None` when `y_true` holds a single class.
pub fn roc_auc(y_true: &[u8], y_score: &[f64]) -> Option<f64> {
    let n_pos = y_true.iter().filter(|&&y| y == 1).count();
    let n_neg = y_true.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..y_true.len()).collect();
    order.sort_by(|&a, &b| y_score[a].total_cmp(&y_score[b]));

    let mut positive_rank_sum = 0.0;
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && y_score[order[end]] == y_score[order[start]] {
            end += 1;
        }
        // 1-based ranks start+1..=end share their mean
        let mean_rank = (start + 1 + end) as f64 / 2.0;
        for &idx in &order[start..end] {
            if y_true[idx] == 1 {
                positive_rank_sum += mean_rank;
            }
        }
        start = end;
    }

    let n_pos = n_pos as f64;
    let n_neg = n_neg as f64;
    Some((positive_rank_sum - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg))
}

/// Held-out evaluation of one trained model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub roc_auc: Option<f64>,
    pub confusion: ConfusionMatrix,
}

impl EvaluationReport {
    /// Evaluate positive-class probabilities at a decision threshold.
    pub fn from_probabilities(y_true: &[u8], y_proba: &[f64], threshold: f64) -> Self {
        let y_pred: Vec<u8> = y_proba.iter().map(|&p| u8::from(p >= threshold)).collect();
        Self {
            accuracy: accuracy(y_true, &y_pred),
            precision: precision(y_true, &y_pred),
            recall: recall(y_true, &y_pred),
            f1: f1(y_true, &y_pred),
            roc_auc: roc_auc(y_true, y_proba),
            confusion: ConfusionMatrix::from_predictions(y_true, &y_pred),
        }
    }

    /// Value of the selection metric; an undefined ROC-AUC scores 0.0.
    pub fn score(&self, metric: ScoringMetric) -> f64 {
        match metric {
            ScoringMetric::F1 => self.f1,
            ScoringMetric::RocAuc => self.roc_auc.unwrap_or(0.0),
        }
    }

    /// Metrics as tracking-store key/value pairs, each key prefixed.
    pub fn as_metrics(&self, prefix: &str) -> Vec<(String, f64)> {
        let mut metrics = vec![
            (format!("{prefix}accuracy"), self.accuracy),
            (format!("{prefix}precision"), self.precision),
            (format!("{prefix}recall"), self.recall),
            (format!("{prefix}f1"), self.f1),
        ];
        if let Some(auc) = self.roc_auc {
            metrics.push((format!("{prefix}roc_auc"), auc));
        }
        metrics
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FoldError {
    #[error("n_splits must be at least 2, got {0}")]
    TooFewSplits(usize),
    #[error("cannot split {n_samples} samples into {n_splits} folds")]
    TooManySplits { n_splits: usize, n_samples: usize },
}

/// One train/validation partition, as row indices.
#[derive(Debug, Clone)]
pub struct Fold {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// K-fold splitter that keeps the class ratio of every fold close to the whole.
#[derive(Debug, Clone)]
pub struct StratifiedKFold {
    n_splits: usize,
    random_state: Option<u64>,
}

impl StratifiedKFold {
    pub fn new(n_splits: usize) -> Self {
        Self {
            n_splits,
            random_state: None,
        }
    }

    /// Shuffle each class before distributing it across folds.
    pub fn with_random_state(mut self, random_state: u64) -> Self {
        self.random_state = Some(random_state);
        self
    }

    pub fn n_splits(&self) -> usize {
        self.n_splits
    }

    pub fn split(&self, y: &[u8]) -> Result<Vec<Fold>, FoldError> {
        if self.n_splits < 2 {
            return Err(FoldError::TooFewSplits(self.n_splits));
        }
        if self.n_splits > y.len() {
            return Err(FoldError::TooManySplits {
                n_splits: self.n_splits,
                n_samples: y.len(),
            });
        }

        let mut by_class: [Vec<usize>; 2] = [Vec::new(), Vec::new()];
        for (idx, &label) in y.iter().enumerate() {
            by_class[usize::from(label == 1)].push(idx);
        }

        if let Some(seed) = self.random_state {
            let mut rng = StdRng::seed_from_u64(seed);
            for indices in by_class.iter_mut() {
                indices.shuffle(&mut rng);
            }
        }

        // leftovers of one class continue round-robin where the previous class stopped
        let mut fold_members: Vec<Vec<usize>> = vec![Vec::new(); self.n_splits];
        let mut offset = 0;
        for indices in &by_class {
            let fold_size = indices.len() / self.n_splits;
            let remainder = indices.len() % self.n_splits;
            let mut start = 0;
            for i in 0..self.n_splits {
                let size = if i < remainder { fold_size + 1 } else { fold_size };
                fold_members[(offset + i) % self.n_splits]
                    .extend_from_slice(&indices[start..start + size]);
                start += size;
            }
            offset = (offset + remainder) % self.n_splits;
        }

        Ok((0..self.n_splits)
            .map(|i| {
                let test = fold_members[i].clone();
                let train = fold_members
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .flat_map(|(_, members)| members.iter().copied())
                    .collect();
                Fold { train, test }
            })
            .collect())
    }
}

/// Per-fold cross-validation scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvSummary {
    pub scores: Vec<f64>,
}

impl CvSummary {
    pub fn mean(&self) -> f64 {
        if self.scores.is_empty() {
            return 0.0;
        }
        self.scores.iter().sum::<f64>() / self.scores.len() as f64
    }

    /// Population standard deviation
    pub fn std(&self) -> f64 {
        if self.scores.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        let variance = self
            .scores
            .iter()
            .map(|s| (s - mean).powi(2))
            .sum::<f64>()
            / self.scores.len() as f64;
        variance.sqrt()
    }

    pub fn min(&self) -> f64 {
        self.scores.iter().copied().fold(f64::INFINITY, f64::min)
    }

    pub fn max(&self) -> f64 {
        self.scores.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn as_metrics(&self) -> Vec<(String, f64)> {
        vec![
            ("cv_score_mean".to_string(), self.mean()),
            ("cv_score_std".to_string(), self.std()),
            ("cv_score_min".to_string(), self.min()),
            ("cv_score_max".to_string(), self.max()),
        ]
    }
}

#[derive(Debug, Error)]
pub enum CrossValidationError {
    #[error(transparent)]
    Fold(#[from] FoldError),
    #[error("fold {fold}: {source}")]
    Fit {
        fold: usize,
        #[source]
        source: ForestError,
    },
}

/// Fit a fresh forest on every fold's training rows and score its held-out rows.
pub fn cross_validate(
    params: &ForestParams,
    random_state: u64,
    x: &[Vec<f64>],
    y: &[u8],
    folds: &StratifiedKFold,
    metric: ScoringMetric,
) -> Result<CvSummary, CrossValidationError> {
    let mut scores = Vec::with_capacity(folds.n_splits());

    for (i, fold) in folds.split(y)?.into_iter().enumerate() {
        let x_train: Vec<Vec<f64>> = fold.train.iter().map(|&idx| x[idx].clone()).collect();
        let y_train: Vec<u8> = fold.train.iter().map(|&idx| y[idx]).collect();
        let x_test: Vec<Vec<f64>> = fold.test.iter().map(|&idx| x[idx].clone()).collect();
        let y_test: Vec<u8> = fold.test.iter().map(|&idx| y[idx]).collect();

        let model = RandomForestClassifier::fit(params, random_state, &x_train, &y_train)
            .map_err(|source| CrossValidationError::Fit { fold: i, source })?;
        let proba = model
            .predict_proba_batch(&x_test)
            .map_err(|source| CrossValidationError::Fit { fold: i, source })?;
        let pred: Vec<u8> = proba.iter().map(|&p| u8::from(p >= 0.5)).collect();

        let score = metric.score(&y_test, &pred, &proba);
        tracing::debug!(fold = i, score = score, metric = metric.as_str(), "Fold scored");
        scores.push(score);
    }

    Ok(CvSummary { scores })
}
