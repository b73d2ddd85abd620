//! Gradient-boosted decision trees behind the classifier adapter surface:
//! a dense row-major f32 feature matrix with [`crate::MISSING_DATA`] as the
//! missing-value sentinel goes in, dense class indices come out, and the
//! model round-trips through a JSON file.
//!
//! Multi-class softmax boosting with second-order leaf weights, row and
//! column subsampling, and sparsity-aware splits that learn a default
//! direction for missing values.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{unremap_label, verify, Error, MISSING_DATA};

/// Dense classes: noise, bathymetry, sea surface.
pub const NUM_CLASSES: usize = 3;

/// L2 regularization on leaf weights.
const LAMBDA: f64 = 1.0;

const MIN_HESSIAN: f64 = 1e-16;

/// Training hyperparameters. The defaults reproduce the reference model's
/// tuned configuration.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TrainParams {
    pub max_depth: usize,
    pub min_child_weight: f64,
    pub gamma: f64,
    pub colsample_bytree: f64,
    pub subsample: f64,
    pub eta: f64,
    pub num_boosting_rounds: usize,
    pub seed: u64,
}

impl Default for TrainParams {
    fn default() -> Self {
        Self {
            max_depth: 4,
            min_child_weight: 4.0,
            gamma: 0.280,
            colsample_bytree: 0.943,
            subsample: 0.360,
            eta: 0.360,
            num_boosting_rounds: 100,
            seed: 0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Node {
    feature: usize,
    threshold: f32,
    /// Side that rows with a missing feature value fall to.
    default_left: bool,
    left: usize,
    right: usize,
    value: f64,
    leaf: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn predict_row(&self, row: &[f32]) -> f64 {
        let mut index = 0;
        loop {
            let node = &self.nodes[index];
            if node.leaf {
                return node.value;
            }
            let v = row[node.feature];
            index = if is_missing(v) {
                if node.default_left {
                    node.left
                } else {
                    node.right
                }
            } else if v < node.threshold {
                node.left
            } else {
                node.right
            };
        }
    }
}

fn is_missing(v: f32) -> bool {
    v == MISSING_DATA || v.is_nan()
}

/// Boosted multi-class model: one regression tree per class per round,
/// argmax of the summed margins at prediction time.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Booster {
    num_class: usize,
    num_features: usize,
    rounds: Vec<Vec<Tree>>,
}

impl Booster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_trained(&self) -> bool {
        !self.rounds.is_empty()
    }

    pub fn load_model(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)
            .map_err(|e| Error::Classifier(format!("{}: {e}", path.display())))?;
        let booster: Booster = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::Classifier(format!("{}: {e}", path.display())))?;
        debug!(
            rounds = booster.rounds.len(),
            features = booster.num_features,
            "loaded model"
        );
        Ok(booster)
    }

    pub fn save_model(&self, path: &Path) -> Result<(), Error> {
        let file = File::create(path)
            .map_err(|e| Error::Classifier(format!("{}: {e}", path.display())))?;
        serde_json::to_writer(BufWriter::new(file), self)
            .map_err(|e| Error::Classifier(format!("{}: {e}", path.display())))?;
        Ok(())
    }

    /// Train for `params.num_boosting_rounds` rounds on a dense
    /// `rows x cols` matrix with dense class labels. Each sample is
    /// weighted by its class's relative frequency. Calling on an
    /// already-trained model continues boosting from the existing margins
    /// (warm start).
    pub fn train(
        &mut self,
        features: &[f32],
        labels: &[u32],
        rows: usize,
        cols: usize,
        params: &TrainParams,
    ) -> Result<(), Error> {
        if rows == 0 || cols == 0 {
            return Err(Error::Classifier("empty training matrix".to_string()));
        }
        if features.len() != rows * cols {
            return Err(Error::Classifier(format!(
                "feature matrix has {} entries, expected {rows} x {cols}",
                features.len()
            )));
        }
        if labels.len() != rows {
            return Err(Error::Classifier(format!(
                "{} labels for {rows} rows",
                labels.len()
            )));
        }
        if let Some(bad) = labels.iter().find(|l| **l as usize >= NUM_CLASSES) {
            return Err(Error::Classifier(format!("label {bad} out of range")));
        }

        if self.is_trained() {
            if self.num_features != cols {
                return Err(Error::Classifier(format!(
                    "model expects {} features, got {cols}",
                    self.num_features
                )));
            }
        } else {
            self.num_class = NUM_CLASSES;
            self.num_features = cols;
        }

        // Per-sample weight is the class's relative frequency
        let mut counts = [0usize; NUM_CLASSES];
        for &l in labels {
            counts[l as usize] += 1;
        }
        let weights: Vec<f64> = labels
            .iter()
            .map(|&l| counts[l as usize] as f64 / rows as f64)
            .collect();

        // Margins carried over from any previously trained rounds
        let mut margins = vec![0.0f64; rows * NUM_CLASSES];
        for round in &self.rounds {
            accumulate_margins(&mut margins, round, features, rows, cols);
        }

        let mut rng = StdRng::seed_from_u64(params.seed);

        for epoch in 0..params.num_boosting_rounds {
            let probabilities = softmax_rows(&margins, rows);

            let mut round = Vec::with_capacity(NUM_CLASSES);
            for class in 0..NUM_CLASSES {
                // Softmax gradients for this class, scaled by sample weight
                let mut grad = vec![0.0f64; rows];
                let mut hess = vec![0.0f64; rows];
                for r in 0..rows {
                    let p = probabilities[r * NUM_CLASSES + class];
                    let y = if labels[r] as usize == class { 1.0 } else { 0.0 };
                    grad[r] = (p - y) * weights[r];
                    hess[r] = (2.0 * p * (1.0 - p)).max(MIN_HESSIAN) * weights[r];
                }

                let row_set = subsample_rows(rows, params.subsample, &mut rng);
                let feature_set = subsample_columns(cols, params.colsample_bytree, &mut rng);

                let mut builder = TreeBuilder {
                    features,
                    cols,
                    grad: &grad,
                    hess: &hess,
                    params,
                    feature_set,
                    nodes: Vec::new(),
                };
                builder.build(row_set, 0);
                round.push(Tree {
                    nodes: builder.nodes,
                });
            }

            accumulate_margins(&mut margins, &round, features, rows, cols);
            self.rounds.push(round);

            if tracing::enabled!(tracing::Level::DEBUG) {
                let errors = (0..rows)
                    .filter(|&r| {
                        argmax(&margins[r * NUM_CLASSES..(r + 1) * NUM_CLASSES])
                            != labels[r] as usize
                    })
                    .count();
                debug!(
                    epoch,
                    merror = errors as f64 / rows as f64,
                    "boosting round"
                );
            }
        }

        Ok(())
    }

    /// Predict dense `rows x 1` class indices mapped back to domain codes.
    /// All boosting rounds are used; the output shape is strict.
    pub fn predict(&self, features: &[f32], rows: usize, cols: usize) -> Result<Vec<u32>, Error> {
        if !self.is_trained() {
            return Err(Error::Classifier("model has not been trained".to_string()));
        }
        if cols != self.num_features {
            return Err(Error::Classifier(format!(
                "model expects {} features, got {cols}",
                self.num_features
            )));
        }
        if features.len() != rows * cols {
            return Err(Error::Classifier(format!(
                "feature matrix has {} entries, expected {rows} x {cols}",
                features.len()
            )));
        }

        let predictions: Vec<u32> = (0..rows)
            .into_par_iter()
            .map(|r| {
                let row = &features[r * cols..(r + 1) * cols];
                let mut scores = [0.0f64; NUM_CLASSES];
                for round in &self.rounds {
                    for (class, tree) in round.iter().enumerate() {
                        scores[class] += tree.predict_row(row);
                    }
                }
                unremap_label(argmax(&scores) as u32)
            })
            .collect();

        verify!(predictions.len() == rows);
        Ok(predictions)
    }
}

fn argmax(scores: &[f64]) -> usize {
    let mut best = 0;
    for (i, s) in scores.iter().enumerate().skip(1) {
        if *s > scores[best] {
            best = i;
        }
    }
    best
}

fn softmax_rows(margins: &[f64], rows: usize) -> Vec<f64> {
    let mut out = vec![0.0; margins.len()];
    for r in 0..rows {
        let m = &margins[r * NUM_CLASSES..(r + 1) * NUM_CLASSES];
        let max = m.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mut sum = 0.0;
        for c in 0..NUM_CLASSES {
            let e = (m[c] - max).exp();
            out[r * NUM_CLASSES + c] = e;
            sum += e;
        }
        for c in 0..NUM_CLASSES {
            out[r * NUM_CLASSES + c] /= sum;
        }
    }
    out
}

fn accumulate_margins(
    margins: &mut [f64],
    round: &[Tree],
    features: &[f32],
    rows: usize,
    cols: usize,
) {
    let updates: Vec<[f64; NUM_CLASSES]> = (0..rows)
        .into_par_iter()
        .map(|r| {
            let row = &features[r * cols..(r + 1) * cols];
            let mut u = [0.0; NUM_CLASSES];
            for (class, tree) in round.iter().enumerate() {
                u[class] = tree.predict_row(row);
            }
            u
        })
        .collect();

    for (r, u) in updates.iter().enumerate() {
        for c in 0..NUM_CLASSES {
            margins[r * NUM_CLASSES + c] += u[c];
        }
    }
}

fn subsample_rows(rows: usize, subsample: f64, rng: &mut StdRng) -> Vec<usize> {
    if subsample >= 1.0 {
        return (0..rows).collect();
    }
    let selected: Vec<usize> = (0..rows).filter(|_| rng.gen::<f64>() < subsample).collect();
    if selected.is_empty() {
        // Tiny inputs can lose every row to the draw
        (0..rows).collect()
    } else {
        selected
    }
}

fn subsample_columns(cols: usize, colsample: f64, rng: &mut StdRng) -> Vec<usize> {
    if colsample >= 1.0 {
        return (0..cols).collect();
    }
    let keep = ((cols as f64 * colsample).ceil() as usize).clamp(1, cols);
    let mut selected: Vec<usize> = (0..cols).collect();
    selected.shuffle(rng);
    selected.truncate(keep);
    selected.sort_unstable();
    selected
}

struct SplitCandidate {
    feature: usize,
    threshold: f32,
    default_left: bool,
    gain: f64,
}

struct TreeBuilder<'a> {
    features: &'a [f32],
    cols: usize,
    grad: &'a [f64],
    hess: &'a [f64],
    params: &'a TrainParams,
    feature_set: Vec<usize>,
    nodes: Vec<Node>,
}

impl TreeBuilder<'_> {
    /// Grow a node over `rows` at `depth`, returning its index.
    fn build(&mut self, rows: Vec<usize>, depth: usize) -> usize {
        let g_total: f64 = rows.iter().map(|&r| self.grad[r]).sum();
        let h_total: f64 = rows.iter().map(|&r| self.hess[r]).sum();

        if depth >= self.params.max_depth {
            return self.push_leaf(g_total, h_total);
        }

        let Some(split) = self.best_split(&rows, g_total, h_total) else {
            return self.push_leaf(g_total, h_total);
        };

        let mut left_rows = Vec::new();
        let mut right_rows = Vec::new();
        for &r in &rows {
            let v = self.features[r * self.cols + split.feature];
            let goes_left = if is_missing(v) {
                split.default_left
            } else {
                v < split.threshold
            };
            if goes_left {
                left_rows.push(r);
            } else {
                right_rows.push(r);
            }
        }

        // A degenerate partition cannot improve on a leaf
        if left_rows.is_empty() || right_rows.is_empty() {
            return self.push_leaf(g_total, h_total);
        }

        let index = self.nodes.len();
        self.nodes.push(Node {
            feature: split.feature,
            threshold: split.threshold,
            default_left: split.default_left,
            left: 0,
            right: 0,
            value: 0.0,
            leaf: false,
        });

        let left = self.build(left_rows, depth + 1);
        let right = self.build(right_rows, depth + 1);
        self.nodes[index].left = left;
        self.nodes[index].right = right;

        index
    }

    fn push_leaf(&mut self, g: f64, h: f64) -> usize {
        let index = self.nodes.len();
        self.nodes.push(Node {
            feature: 0,
            threshold: 0.0,
            default_left: true,
            left: 0,
            right: 0,
            value: -g / (h + LAMBDA) * self.params.eta,
            leaf: true,
        });
        index
    }

    /// Exact greedy split search over the sampled feature set. Missing
    /// values are tried on both sides of every threshold and the better
    /// default direction is kept.
    fn best_split(&self, rows: &[usize], g_total: f64, h_total: f64) -> Option<SplitCandidate> {
        let parent_score = g_total * g_total / (h_total + LAMBDA);
        let mut best: Option<SplitCandidate> = None;

        for &feature in &self.feature_set {
            let mut values: Vec<(f32, f64, f64)> = Vec::with_capacity(rows.len());
            let mut g_missing = 0.0;
            let mut h_missing = 0.0;
            for &r in rows {
                let v = self.features[r * self.cols + feature];
                if is_missing(v) {
                    g_missing += self.grad[r];
                    h_missing += self.hess[r];
                } else {
                    values.push((v, self.grad[r], self.hess[r]));
                }
            }
            if values.len() < 2 {
                continue;
            }
            values.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

            let mut g_left = 0.0;
            let mut h_left = 0.0;
            for i in 0..values.len() - 1 {
                g_left += values[i].1;
                h_left += values[i].2;
                if values[i].0 == values[i + 1].0 {
                    continue;
                }
                let threshold = 0.5 * (values[i].0 + values[i + 1].0);

                for default_left in [false, true] {
                    let (gl, hl) = if default_left {
                        (g_left + g_missing, h_left + h_missing)
                    } else {
                        (g_left, h_left)
                    };
                    let (gr, hr) = (g_total - gl, h_total - hl);

                    if hl < self.params.min_child_weight || hr < self.params.min_child_weight {
                        continue;
                    }

                    let gain = 0.5
                        * (gl * gl / (hl + LAMBDA) + gr * gr / (hr + LAMBDA) - parent_score)
                        - self.params.gamma;

                    if gain > 0.0 && best.as_ref().map_or(true, |b| gain > b.gain) {
                        best = Some(SplitCandidate {
                            feature,
                            threshold,
                            default_left,
                            gain,
                        });
                    }
                }
            }
        }

        best
    }
}
