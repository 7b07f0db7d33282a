//! RandomForest classifier for binary fraud labels.
//!
//! CART trees grown on weighted Gini impurity. Each tree sees a bootstrap
//! sample (expressed as per-sample draw counts rather than duplicated rows)
//! and considers `sqrt(n_features)` randomly drawn features per split.
//! Leaves keep the weighted fraction of positive samples, so the forest's
//! probability is the mean of its trees' leaf fractions.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Values closer than this are treated as equal when placing thresholds.
const FEATURE_THRESHOLD: f64 = 1e-7;

/// Node impurity at or below this is considered pure.
const IMPURITY_EPSILON: f64 = 1e-12;

/// How samples of each class are weighted while growing trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClassWeight {
    /// Every sample weighs 1
    #[default]
    None,
    /// `n_samples / (n_classes * class_count)` over the whole training set
    Balanced,
    /// Same formula recomputed on each tree's bootstrap sample
    BalancedSubsample,
}

impl ClassWeight {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassWeight::None => "none",
            ClassWeight::Balanced => "balanced",
            ClassWeight::BalancedSubsample => "balanced_subsample",
        }
    }
}

/// Hyperparameters of one forest configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_estimators: usize,
    /// `None` grows trees until leaves are pure or too small to split
    #[serde(default)]
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    #[serde(default)]
    pub class_weight: ClassWeight,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            class_weight: ClassWeight::None,
        }
    }
}

impl ForestParams {
    fn validate(&self) -> Result<(), ForestError> {
        if self.n_estimators == 0 {
            return Err(ForestError::InvalidParams("n_estimators must be >= 1".into()));
        }
        if self.max_depth == Some(0) {
            return Err(ForestError::InvalidParams("max_depth must be >= 1".into()));
        }
        if self.min_samples_split < 2 {
            return Err(ForestError::InvalidParams(
                "min_samples_split must be >= 2".into(),
            ));
        }
        if self.min_samples_leaf == 0 {
            return Err(ForestError::InvalidParams(
                "min_samples_leaf must be >= 1".into(),
            ));
        }
        Ok(())
    }

    /// Hyperparameters as string pairs for tracking and introspection.
    pub fn as_params(&self) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("n_estimators".to_string(), self.n_estimators.to_string());
        params.insert(
            "max_depth".to_string(),
            self.max_depth
                .map_or_else(|| "None".to_string(), |d| d.to_string()),
        );
        params.insert(
            "min_samples_split".to_string(),
            self.min_samples_split.to_string(),
        );
        params.insert(
            "min_samples_leaf".to_string(),
            self.min_samples_leaf.to_string(),
        );
        params.insert(
            "class_weight".to_string(),
            self.class_weight.as_str().to_string(),
        );
        params
    }
}

#[derive(Debug, Error)]
pub enum ForestError {
    #[error("training set is empty")]
    EmptyTrainingSet,
    #[error("feature rows ({rows}) and labels ({labels}) differ in length")]
    LengthMismatch { rows: usize, labels: usize },
    #[error("row {row} has {found} features, expected {expected}")]
    RaggedRow {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("label {label} at row {row} is not 0 or 1")]
    InvalidLabel { row: usize, label: u8 },
    #[error("invalid hyperparameters: {0}")]
    InvalidParams(String),
    #[error("input has {found} features, model expects {expected}")]
    WidthMismatch { expected: usize, found: usize },
    #[error("model file I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("model encoding: {0}")]
    Codec(#[from] bincode::Error),
    #[error("model file holds no trees")]
    EmptyModel,
    #[error("model file is inconsistent: {0}")]
    CorruptModel(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        /// Weighted fraction of positive samples that reached this leaf
        proba: f64,
    },
}

/// One CART tree stored as a flat node arena; node 0 is the root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTree {
    nodes: Vec<Node>,
}

impl DecisionTree {
    fn leaf_proba(&self, row: &[f64]) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { proba } => return *proba,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if row[*feature] <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }

    /// Children are stored after their parent, so a walk from the root
    /// always moves forward and terminates.
    fn validate(&self, n_features: usize) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("tree has no nodes".into());
        }
        let len = self.nodes.len();
        for (idx, node) in self.nodes.iter().enumerate() {
            match node {
                Node::Split {
                    feature,
                    left,
                    right,
                    ..
                } => {
                    if *feature >= n_features {
                        return Err(format!(
                            "node {idx} splits on feature {feature} of {n_features}"
                        ));
                    }
                    for child in [*left, *right] {
                        if child <= idx || child >= len {
                            return Err(format!(
                                "node {idx} points to child {child} outside ({idx}, {len})"
                            ));
                        }
                    }
                }
                Node::Leaf { proba } => {
                    if !(0.0..=1.0).contains(proba) {
                        return Err(format!("leaf {idx} has probability {proba}"));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn depth(&self) -> usize {
        let mut max_depth = 0;
        let mut stack = vec![(0usize, 0usize)];
        while let Some((idx, depth)) = stack.pop() {
            max_depth = max_depth.max(depth);
            if let Node::Split { left, right, .. } = &self.nodes[idx] {
                stack.push((*left, depth + 1));
                stack.push((*right, depth + 1));
            }
        }
        max_depth
    }
}

/// Weighted class totals of the samples in a node.
#[derive(Debug, Clone, Copy)]
struct NodeStats {
    negative: f64,
    positive: f64,
    count: usize,
}

impl NodeStats {
    fn total(&self) -> f64 {
        self.negative + self.positive
    }

    fn proba(&self) -> f64 {
        let total = self.total();
        if total > 0.0 {
            self.positive / total
        } else {
            0.0
        }
    }

    fn impurity(&self) -> f64 {
        gini(self.negative, self.positive)
    }
}

fn gini(negative: f64, positive: f64) -> f64 {
    let total = negative + positive;
    if total <= 0.0 {
        return 0.0;
    }
    let p0 = negative / total;
    let p1 = positive / total;
    1.0 - p0 * p0 - p1 * p1
}

#[derive(Debug, Clone, Copy)]
struct SplitCandidate {
    feature: usize,
    threshold: f64,
    /// Parent impurity minus the weighted child impurity
    improvement: f64,
}

struct Frame {
    node: usize,
    start: usize,
    end: usize,
    depth: usize,
}

/// Grows one tree over the samples with non-zero weight.
struct TreeBuilder<'a> {
    x: &'a [Vec<f64>],
    y: &'a [u8],
    weights: &'a [f64],
    params: &'a ForestParams,
    max_features: usize,
    rng: StdRng,
    nodes: Vec<Node>,
    importances: Vec<f64>,
}

impl<'a> TreeBuilder<'a> {
    fn grow(mut self, mut samples: Vec<usize>) -> (DecisionTree, Vec<f64>) {
        self.nodes.push(Node::Leaf { proba: 0.0 });
        let mut stack = vec![Frame {
            node: 0,
            start: 0,
            end: samples.len(),
            depth: 0,
        }];

        while let Some(frame) = stack.pop() {
            let node_samples = &mut samples[frame.start..frame.end];
            let stats = self.node_stats(node_samples);
            let leaf = Node::Leaf {
                proba: stats.proba(),
            };

            if self.is_terminal(&stats, frame.depth) {
                self.nodes[frame.node] = leaf;
                continue;
            }

            let Some(split) = self.best_split(node_samples, &stats) else {
                self.nodes[frame.node] = leaf;
                continue;
            };

            let x = self.x;
            let mid = partition(node_samples, |idx| {
                x[idx][split.feature] <= split.threshold
            });

            self.importances[split.feature] += stats.total() * split.improvement;

            let left = self.nodes.len();
            let right = left + 1;
            self.nodes.push(Node::Leaf { proba: 0.0 });
            self.nodes.push(Node::Leaf { proba: 0.0 });
            self.nodes[frame.node] = Node::Split {
                feature: split.feature,
                threshold: split.threshold,
                left,
                right,
            };

            stack.push(Frame {
                node: right,
                start: frame.start + mid,
                end: frame.end,
                depth: frame.depth + 1,
            });
            stack.push(Frame {
                node: left,
                start: frame.start,
                end: frame.start + mid,
                depth: frame.depth + 1,
            });
        }

        (DecisionTree { nodes: self.nodes }, self.importances)
    }

    fn node_stats(&self, samples: &[usize]) -> NodeStats {
        let mut stats = NodeStats {
            negative: 0.0,
            positive: 0.0,
            count: samples.len(),
        };
        for &idx in samples {
            if self.y[idx] == 1 {
                stats.positive += self.weights[idx];
            } else {
                stats.negative += self.weights[idx];
            }
        }
        stats
    }

    fn is_terminal(&self, stats: &NodeStats, depth: usize) -> bool {
        self.params.max_depth.is_some_and(|max| depth >= max)
            || stats.count < self.params.min_samples_split
            || stats.count < 2 * self.params.min_samples_leaf
            || stats.impurity() <= IMPURITY_EPSILON
    }

    /// Best split over a random feature subset. Drawing continues past
    /// `max_features` until a valid split shows up or features run out.
    fn best_split(&mut self, samples: &[usize], stats: &NodeStats) -> Option<SplitCandidate> {
        let n_features = self.x[samples[0]].len();
        let mut features: Vec<usize> = (0..n_features).collect();
        features.shuffle(&mut self.rng);

        let parent_impurity = stats.impurity();
        let total = stats.total();
        let min_leaf = self.params.min_samples_leaf;
        let mut best: Option<SplitCandidate> = None;
        let mut visited = 0;
        let mut column: Vec<(f64, u8, f64)> = Vec::with_capacity(samples.len());

        for feature in features {
            if visited >= self.max_features && best.is_some() {
                break;
            }

            column.clear();
            column.extend(
                samples
                    .iter()
                    .map(|&idx| (self.x[idx][feature], self.y[idx], self.weights[idx])),
            );
            column.sort_by(|a, b| a.0.total_cmp(&b.0));

            let (lowest, highest) = (column[0].0, column[column.len() - 1].0);
            if highest - lowest <= FEATURE_THRESHOLD {
                // constant in this node
                continue;
            }
            visited += 1;

            let mut left_negative = 0.0;
            let mut left_positive = 0.0;
            for i in 0..column.len() - 1 {
                let (value, label, weight) = column[i];
                if label == 1 {
                    left_positive += weight;
                } else {
                    left_negative += weight;
                }

                let left_count = i + 1;
                let right_count = column.len() - left_count;
                if left_count < min_leaf {
                    continue;
                }
                if right_count < min_leaf {
                    break;
                }

                let next = column[i + 1].0;
                if next - value <= FEATURE_THRESHOLD {
                    continue;
                }

                let right_negative = stats.negative - left_negative;
                let right_positive = stats.positive - left_positive;
                let left_weight = left_negative + left_positive;
                let right_weight = right_negative + right_positive;
                let child_impurity = (left_weight * gini(left_negative, left_positive)
                    + right_weight * gini(right_negative, right_positive))
                    / total;
                let improvement = parent_impurity - child_impurity;

                if best.map_or(true, |b| improvement > b.improvement) {
                    let mut threshold = value / 2.0 + next / 2.0;
                    if threshold >= next || !threshold.is_finite() {
                        threshold = value;
                    }
                    best = Some(SplitCandidate {
                        feature,
                        threshold,
                        improvement,
                    });
                }
            }
        }

        best
    }
}

/// Moves indices matching `goes_left` to the front, returns how many matched.
fn partition(samples: &mut [usize], goes_left: impl Fn(usize) -> bool) -> usize {
    let mut boundary = 0;
    for i in 0..samples.len() {
        if goes_left(samples[i]) {
            samples.swap(boundary, i);
            boundary += 1;
        }
    }
    boundary
}

/// Per-class weights `n / (n_present_classes * count_c)` from weighted counts.
fn balanced_weights(negative: f64, positive: f64) -> [f64; 2] {
    let present = f64::from(u8::from(negative > 0.0) + u8::from(positive > 0.0));
    let total = negative + positive;
    let weight = |count: f64| {
        if count > 0.0 {
            total / (present * count)
        } else {
            1.0
        }
    };
    [weight(negative), weight(positive)]
}

/// Bagged ensemble of CART trees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomForestClassifier {
    params: ForestParams,
    random_state: u64,
    n_features: usize,
    trees: Vec<DecisionTree>,
    feature_importances: Vec<f64>,
}

impl RandomForestClassifier {
    /// Fits a forest. Trees are grown in parallel; each tree's randomness is
    /// seeded from `random_state`, so results do not depend on scheduling.
    pub fn fit(
        params: &ForestParams,
        random_state: u64,
        x: &[Vec<f64>],
        y: &[u8],
    ) -> Result<Self, ForestError> {
        params.validate()?;
        let n_features = validate_training_set(x, y)?;
        let n_samples = x.len();
        let max_features = ((n_features as f64).sqrt().floor() as usize).max(1);

        let full_weights = match params.class_weight {
            ClassWeight::Balanced => {
                let positive = y.iter().filter(|&&label| label == 1).count() as f64;
                balanced_weights(n_samples as f64 - positive, positive)
            }
            ClassWeight::None | ClassWeight::BalancedSubsample => [1.0, 1.0],
        };

        let mut master = StdRng::seed_from_u64(random_state);
        let seeds: Vec<u64> = (0..params.n_estimators).map(|_| master.gen()).collect();

        let grown: Vec<(DecisionTree, Vec<f64>)> = seeds
            .par_iter()
            .map(|&seed| {
                let mut rng = StdRng::seed_from_u64(seed);

                let mut draws = vec![0u32; n_samples];
                for _ in 0..n_samples {
                    draws[rng.gen_range(0..n_samples)] += 1;
                }

                let class_weights = if params.class_weight == ClassWeight::BalancedSubsample {
                    let (mut negative, mut positive) = (0.0, 0.0);
                    for (idx, &count) in draws.iter().enumerate() {
                        if y[idx] == 1 {
                            positive += f64::from(count);
                        } else {
                            negative += f64::from(count);
                        }
                    }
                    balanced_weights(negative, positive)
                } else {
                    full_weights
                };

                let weights: Vec<f64> = draws
                    .iter()
                    .zip(y)
                    .map(|(&count, &label)| f64::from(count) * class_weights[usize::from(label)])
                    .collect();
                let samples: Vec<usize> = (0..n_samples).filter(|&idx| draws[idx] > 0).collect();

                TreeBuilder {
                    x,
                    y,
                    weights: &weights,
                    params,
                    max_features,
                    rng,
                    nodes: Vec::new(),
                    importances: vec![0.0; n_features],
                }
                .grow(samples)
            })
            .collect();

        let mut feature_importances = vec![0.0; n_features];
        let mut trees = Vec::with_capacity(grown.len());
        for (tree, importances) in grown {
            let tree_total: f64 = importances.iter().sum();
            if tree_total > 0.0 {
                for (acc, value) in feature_importances.iter_mut().zip(&importances) {
                    *acc += value / tree_total;
                }
            }
            trees.push(tree);
        }
        let forest_total: f64 = feature_importances.iter().sum();
        if forest_total > 0.0 {
            for value in feature_importances.iter_mut() {
                *value /= forest_total;
            }
        }

        debug!(
            trees = trees.len(),
            samples = n_samples,
            features = n_features,
            "Random forest fitted"
        );

        Ok(Self {
            params: params.clone(),
            random_state,
            n_features,
            trees,
            feature_importances,
        })
    }

    /// Positive-class probability for one feature vector.
    pub fn predict_proba(&self, row: &[f64]) -> Result<f64, ForestError> {
        if row.len() != self.n_features {
            return Err(ForestError::WidthMismatch {
                expected: self.n_features,
                found: row.len(),
            });
        }
        let sum: f64 = self.trees.iter().map(|tree| tree.leaf_proba(row)).sum();
        Ok(sum / self.trees.len() as f64)
    }

    pub fn predict_proba_batch(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>, ForestError> {
        rows.par_iter().map(|row| self.predict_proba(row)).collect()
    }

    /// Class label at the 0.5 probability cut.
    pub fn predict(&self, row: &[f64]) -> Result<u8, ForestError> {
        Ok(u8::from(self.predict_proba(row)? >= 0.5))
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn params(&self) -> &ForestParams {
        &self.params
    }

    pub fn random_state(&self) -> u64 {
        self.random_state
    }

    /// Normalized mean impurity decrease per feature; sums to 1 unless no tree split.
    pub fn feature_importances(&self) -> &[f64] {
        &self.feature_importances
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ForestError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    /// Load and check a saved forest; a structurally broken file is an error
    /// here rather than a panic at prediction time.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ForestError> {
        let reader = BufReader::new(File::open(path)?);
        let model: Self = bincode::deserialize_from(reader)?;
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<(), ForestError> {
        if self.trees.is_empty() {
            return Err(ForestError::EmptyModel);
        }
        if self.n_features == 0 {
            return Err(ForestError::CorruptModel("model has no features".into()));
        }
        if self.feature_importances.len() != self.n_features {
            return Err(ForestError::CorruptModel(format!(
                "{} importances for {} features",
                self.feature_importances.len(),
                self.n_features
            )));
        }
        for (i, tree) in self.trees.iter().enumerate() {
            tree.validate(self.n_features)
                .map_err(|reason| ForestError::CorruptModel(format!("tree {i}: {reason}")))?;
        }
        Ok(())
    }
}

fn validate_training_set(x: &[Vec<f64>], y: &[u8]) -> Result<usize, ForestError> {
    if x.is_empty() {
        return Err(ForestError::EmptyTrainingSet);
    }
    if x.len() != y.len() {
        return Err(ForestError::LengthMismatch {
            rows: x.len(),
            labels: y.len(),
        });
    }
    let n_features = x[0].len();
    if n_features == 0 {
        return Err(ForestError::InvalidParams("rows have no features".into()));
    }
    for (row, values) in x.iter().enumerate() {
        if values.len() != n_features {
            return Err(ForestError::RaggedRow {
                row,
                expected: n_features,
                found: values.len(),
            });
        }
    }
    if let Some((row, &label)) = y.iter().enumerate().find(|(_, &label)| label > 1) {
        return Err(ForestError::InvalidLabel { row, label });
    }
    Ok(n_features)
}
