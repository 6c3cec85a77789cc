//! Binary accept/reject classifier boundary over transformed offer tables.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::offer::Table;

/// Probability at or above which a prediction counts as positive.
pub const DECISION_THRESHOLD: f64 = 0.5;

pub const F1_SCORE: &str = "f1_score";
pub const ROC_AUC: &str = "roc_auc";

#[derive(Debug, Error, PartialEq)]
pub enum ClassifierError {
    #[error("missing column: {0}")]
    MissingColumn(String),
    #[error("column {column} row {row_index} is not numeric: '{value}'")]
    NonNumericCell {
        column: String,
        row_index: usize,
        value: String,
    },
    #[error("target column {column} row {row_index} is not a 0/1 label: '{value}'")]
    InvalidLabel {
        column: String,
        row_index: usize,
        value: String,
    },
    #[error("empty input")]
    EmptyInput,
    #[error("length mismatch: {left} vs {right}")]
    LengthMismatch { left: usize, right: usize },
    #[error("target has a single class; both classes are required")]
    SingleClass,
    #[error("expected {expected} features, got {found}")]
    FeatureCountMismatch { expected: usize, found: usize },
    #[error("score at index {0} is not finite")]
    NonFiniteScore(usize),
    #[error("estimator has not been trained")]
    NotTrained,
}

/// Opaque probabilistic binary estimator.
pub trait Estimator {
    fn fit(&mut self, x: &[Vec<f64>], y: &[bool]) -> Result<(), ClassifierError>;
    fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<f64>, ClassifierError>;
}

pub trait Classifier {
    fn train(&mut self, table: &Table) -> Result<(), ClassifierError>;
    fn evaluate(&self, table: &Table) -> Result<BTreeMap<String, f64>, ClassifierError>;
    fn predict(&self, table: &Table) -> Result<Vec<f64>, ClassifierError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub features: Vec<String>,
    pub target: String,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            features: [
                "driver_distance",
                "is_peak_hour",
                "actual_idle_time_minutes",
                "pickup_to_trip_ratio",
                "total_commitment_distance",
                "historical_bookings",
                "peak_distance_penalty",
            ]
            .iter()
            .map(|name| name.to_string())
            .collect(),
            target: "is_completed".to_string(),
        }
    }
}

/// Binds an [`Estimator`] to named feature and target columns.
#[derive(Debug, Clone)]
pub struct TableClassifier<E> {
    estimator: E,
    config: ClassifierConfig,
}

impl<E: Estimator> TableClassifier<E> {
    pub fn new(estimator: E, config: ClassifierConfig) -> Self {
        Self { estimator, config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }
}

impl<E: Estimator> Classifier for TableClassifier<E> {
    fn train(&mut self, table: &Table) -> Result<(), ClassifierError> {
        let x = feature_matrix(table, &self.config.features)?;
        let y = target_labels(table, &self.config.target)?;
        self.estimator.fit(&x, &y)?;
        info!(
            component = "classifier",
            event = "classifier.train.finish",
            rows = x.len(),
            features = self.config.features.len(),
            target = %self.config.target
        );
        Ok(())
    }

    fn evaluate(&self, table: &Table) -> Result<BTreeMap<String, f64>, ClassifierError> {
        let y_true = target_labels(table, &self.config.target)?;
        let y_proba = self.predict(table)?;
        let y_pred: Vec<bool> = y_proba.iter().map(|p| *p >= DECISION_THRESHOLD).collect();

        let f1 = f1_score(&y_true, &y_pred)?;
        let roc_auc = roc_auc_score(&y_true, &y_proba)?;
        info!(
            component = "classifier",
            event = "classifier.evaluate.finish",
            rows = y_true.len(),
            f1_score = f1,
            roc_auc
        );

        Ok(BTreeMap::from([
            (F1_SCORE.to_string(), f1),
            (ROC_AUC.to_string(), roc_auc),
        ]))
    }

    fn predict(&self, table: &Table) -> Result<Vec<f64>, ClassifierError> {
        let x = feature_matrix(table, &self.config.features)?;
        self.estimator.predict_proba(&x)
    }
}

/// Row-major matrix of the named columns. Every cell must be a finite number.
pub fn feature_matrix(table: &Table, features: &[String]) -> Result<Vec<Vec<f64>>, ClassifierError> {
    let indices = features
        .iter()
        .map(|name| {
            table
                .column_index(name)
                .ok_or_else(|| ClassifierError::MissingColumn(name.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut matrix = Vec::with_capacity(table.len());
    for (row_index, record) in table.rows.iter().enumerate() {
        let mut values = Vec::with_capacity(indices.len());
        for (name, idx) in features.iter().zip(&indices) {
            let raw = record.get(*idx).map(String::as_str).unwrap_or_default();
            let value = raw
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| ClassifierError::NonNumericCell {
                    column: name.clone(),
                    row_index,
                    value: raw.to_string(),
                })?;
            values.push(value);
        }
        matrix.push(values);
    }
    Ok(matrix)
}

pub fn target_labels(table: &Table, target: &str) -> Result<Vec<bool>, ClassifierError> {
    let cells = table
        .column(target)
        .ok_or_else(|| ClassifierError::MissingColumn(target.to_string()))?;
    cells
        .into_iter()
        .enumerate()
        .map(|(row_index, raw)| {
            let trimmed = raw.trim();
            match trimmed.to_ascii_lowercase().as_str() {
                "1" | "1.0" | "true" => Ok(true),
                "0" | "0.0" | "false" => Ok(false),
                _ => Err(ClassifierError::InvalidLabel {
                    column: target.to_string(),
                    row_index,
                    value: raw.to_string(),
                }),
            }
        })
        .collect()
}

/// F1 of the positive class. Defined as 0 when there are no true or
/// predicted positives.
pub fn f1_score(y_true: &[bool], y_pred: &[bool]) -> Result<f64, ClassifierError> {
    check_lengths(y_true.len(), y_pred.len())?;
    let mut tp = 0u64;
    let mut fp = 0u64;
    let mut fn_ = 0u64;
    for (truth, pred) in y_true.iter().zip(y_pred) {
        match (*truth, *pred) {
            (true, true) => tp += 1,
            (false, true) => fp += 1,
            (true, false) => fn_ += 1,
            (false, false) => {}
        }
    }
    let denom = 2 * tp + fp + fn_;
    if denom == 0 {
        return Ok(0.0);
    }
    Ok(2.0 * tp as f64 / denom as f64)
}

/// Area under the ROC curve via the rank-sum statistic, with tied scores
/// sharing their average rank.
pub fn roc_auc_score(y_true: &[bool], scores: &[f64]) -> Result<f64, ClassifierError> {
    check_lengths(y_true.len(), scores.len())?;
    if let Some(idx) = scores.iter().position(|s| !s.is_finite()) {
        return Err(ClassifierError::NonFiniteScore(idx));
    }

    let positives = y_true.iter().filter(|y| **y).count();
    let negatives = y_true.len() - positives;
    if positives == 0 || negatives == 0 {
        return Err(ClassifierError::SingleClass);
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|a, b| scores[*a].total_cmp(&scores[*b]));

    let mut positive_rank_sum = 0.0;
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && scores[order[end]] == scores[order[start]] {
            end += 1;
        }
        // 1-based ranks start+1..=end share their mean.
        let average_rank = (start + 1 + end) as f64 / 2.0;
        for &idx in &order[start..end] {
            if y_true[idx] {
                positive_rank_sum += average_rank;
            }
        }
        start = end;
    }

    let p = positives as f64;
    let n = negatives as f64;
    Ok((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * n))
}

fn check_lengths(left: usize, right: usize) -> Result<(), ClassifierError> {
    if left == 0 || right == 0 {
        return Err(ClassifierError::EmptyInput);
    }
    if left != right {
        return Err(ClassifierError::LengthMismatch { left, right });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticRegressionConfig {
    pub learning_rate: f64,
    pub epochs: usize,
    pub l2_penalty: f64,
}

impl Default for LogisticRegressionConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            epochs: 500,
            l2_penalty: 1e-4,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct LogisticModel {
    means: Vec<f64>,
    scales: Vec<f64>,
    weights: Vec<f64>,
    bias: f64,
}

impl LogisticModel {
    fn probability(&self, row: &[f64]) -> f64 {
        let z = row
            .iter()
            .zip(&self.means)
            .zip(&self.scales)
            .zip(&self.weights)
            .map(|(((x, mean), scale), w)| w * (x - mean) / scale)
            .sum::<f64>()
            + self.bias;
        sigmoid(z)
    }
}

/// L2-regularized logistic regression fitted by full-batch gradient descent
/// on standardized features.
#[derive(Debug, Clone, Default)]
pub struct LogisticRegression {
    config: LogisticRegressionConfig,
    model: Option<LogisticModel>,
}

impl LogisticRegression {
    pub fn new(config: LogisticRegressionConfig) -> Self {
        Self {
            config,
            model: None,
        }
    }

    pub fn weights(&self) -> Option<&[f64]> {
        self.model.as_ref().map(|model| model.weights.as_slice())
    }
}

impl Estimator for LogisticRegression {
    fn fit(&mut self, x: &[Vec<f64>], y: &[bool]) -> Result<(), ClassifierError> {
        check_lengths(x.len(), y.len())?;
        let width = x[0].len();
        if let Some(row) = x.iter().find(|row| row.len() != width) {
            return Err(ClassifierError::FeatureCountMismatch {
                expected: width,
                found: row.len(),
            });
        }
        if y.iter().all(|v| *v) || y.iter().all(|v| !*v) {
            return Err(ClassifierError::SingleClass);
        }

        let rows = x.len() as f64;
        let (means, scales) = column_moments(x, width, rows);

        let standardized: Vec<Vec<f64>> = x
            .iter()
            .map(|row| {
                row.iter()
                    .zip(&means)
                    .zip(&scales)
                    .map(|((value, mean), scale)| (value - mean) / scale)
                    .collect()
            })
            .collect();

        let mut weights = vec![0.0; width];
        let mut bias = 0.0;
        for _ in 0..self.config.epochs {
            let mut grad_w = vec![0.0; width];
            let mut grad_b = 0.0;
            for (row, label) in standardized.iter().zip(y) {
                let z = row.iter().zip(&weights).map(|(v, w)| v * w).sum::<f64>() + bias;
                let err = sigmoid(z) - if *label { 1.0 } else { 0.0 };
                for (g, v) in grad_w.iter_mut().zip(row) {
                    *g += err * v;
                }
                grad_b += err;
            }
            for (w, g) in weights.iter_mut().zip(&grad_w) {
                *w -= self.config.learning_rate * (g / rows + self.config.l2_penalty * *w);
            }
            bias -= self.config.learning_rate * grad_b / rows;
        }

        self.model = Some(LogisticModel {
            means,
            scales,
            weights,
            bias,
        });
        Ok(())
    }

    fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<f64>, ClassifierError> {
        let model = self.model.as_ref().ok_or(ClassifierError::NotTrained)?;
        x.iter()
            .map(|row| {
                if row.len() != model.weights.len() {
                    return Err(ClassifierError::FeatureCountMismatch {
                        expected: model.weights.len(),
                        found: row.len(),
                    });
                }
                Ok(model.probability(row))
            })
            .collect()
    }
}

/// Relative variance below which a column is treated as constant.
const CONSTANT_COLUMN_TOLERANCE: f64 = 1e-12;

/// Per-column centre and scale for standardization. A constant column is
/// centred on its own value with scale 1, so it standardizes to exactly 0 and
/// never picks up weight.
fn column_moments(x: &[Vec<f64>], width: usize, rows: f64) -> (Vec<f64>, Vec<f64>) {
    let mut sums = vec![0.0; width];
    for row in x {
        for (sum, value) in sums.iter_mut().zip(row) {
            *sum += value;
        }
    }
    let mut means: Vec<f64> = sums.iter().map(|sum| sum / rows).collect();

    let mut variances = vec![0.0; width];
    for row in x {
        for ((variance, value), mean) in variances.iter_mut().zip(row).zip(&means) {
            *variance += (value - mean).powi(2) / rows;
        }
    }

    let mut scales = vec![1.0; width];
    for (col, variance) in variances.iter().enumerate() {
        let magnitude = means[col].powi(2).max(1.0);
        if *variance <= CONSTANT_COLUMN_TOLERANCE * magnitude {
            means[col] = x[0][col];
        } else {
            scales[col] = variance.sqrt();
        }
    }
    (means, scales)
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}
