use super::{check_rows, check_training_set, Classifier, ModelError, Probabilities};
use crate::emotion::{Emotion, NUM_CLASSES};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

const LOG_TARGET: &str = "model::forest";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    Gini,
    Entropy,
}

impl Criterion {
    fn impurity(self, counts: &[usize; NUM_CLASSES], total: usize) -> f64 {
        if total == 0 {
            return 0.0;
        }
        let n = total as f64;
        match self {
            Criterion::Gini => 1.0 - counts.iter().map(|&c| (c as f64 / n).powi(2)).sum::<f64>(),
            Criterion::Entropy => counts
                .iter()
                .filter(|&&c| c > 0)
                .map(|&c| {
                    let p = c as f64 / n;
                    -p * p.log2()
                })
                .sum(),
        }
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Criterion::Gini => "gini",
            Criterion::Entropy => "entropy",
        })
    }
}

/// Features considered at each split.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MaxFeatures {
    Sqrt,
    Log2,
    All,
}

impl MaxFeatures {
    fn count(self, dim: usize) -> usize {
        let k = match self {
            MaxFeatures::Sqrt => (dim as f64).sqrt().floor() as usize,
            MaxFeatures::Log2 => (dim as f64).log2().floor() as usize,
            MaxFeatures::All => dim,
        };
        k.clamp(1, dim.max(1))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ForestParams {
    pub n_estimators: usize,
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub max_features: MaxFeatures,
    pub criterion: Criterion,
    pub bootstrap: bool,
    /// Tree `t` draws from a generator seeded with `seed + t`.
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: MaxFeatures::Sqrt,
            criterion: Criterion::Gini,
            bootstrap: true,
            seed: crate::config::DEFAULT_SEED,
        }
    }
}

impl ForestParams {
    fn validate(&self) -> Result<(), ModelError> {
        if self.n_estimators == 0 {
            return Err(ModelError::InvalidParams("n_estimators must be at least 1".into()));
        }
        if self.max_depth == Some(0) {
            return Err(ModelError::InvalidParams("max_depth must be at least 1".into()));
        }
        if self.min_samples_split < 2 {
            return Err(ModelError::InvalidParams(
                "min_samples_split must be at least 2".into(),
            ));
        }
        if self.min_samples_leaf == 0 {
            return Err(ModelError::InvalidParams("min_samples_leaf must be at least 1".into()));
        }
        Ok(())
    }
}

impl fmt::Display for ForestParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n_estimators={}, max_depth=", self.n_estimators)?;
        match self.max_depth {
            Some(d) => write!(f, "{d}")?,
            None => f.write_str("none")?,
        }
        write!(
            f,
            ", min_samples_split={}, criterion={}",
            self.min_samples_split, self.criterion
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
enum Node {
    Leaf {
        distribution: Probabilities,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// CART tree stored as a node arena; node 0 is the root.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn predict_proba(&self, row: &[f64]) -> &Probabilities {
        let mut at = 0;
        loop {
            match &self.nodes[at] {
                Node::Leaf { distribution } => return distribution,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    at = if row[*feature] <= *threshold { *left } else { *right };
                }
            }
        }
    }
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    impurity: f64,
}

struct TreeBuilder<'a> {
    x: &'a [Vec<f64>],
    y: &'a [usize],
    params: &'a ForestParams,
    dim: usize,
    features_per_split: usize,
    rng: StdRng,
    nodes: Vec<Node>,
}

impl TreeBuilder<'_> {
    fn counts(&self, samples: &[usize]) -> [usize; NUM_CLASSES] {
        let mut counts = [0; NUM_CLASSES];
        for &s in samples {
            counts[self.y[s]] += 1;
        }
        counts
    }

    fn build(&mut self, samples: Vec<usize>, depth: usize) -> usize {
        let counts = self.counts(&samples);
        let n = samples.len();
        let impurity = self.params.criterion.impurity(&counts, n);
        let splittable = n >= self.params.min_samples_split
            && n >= 2 * self.params.min_samples_leaf
            && self.params.max_depth.map_or(true, |d| depth < d)
            && impurity > 0.0;

        if splittable {
            if let Some(split) = self.best_split(&samples, &counts) {
                let (left, right): (Vec<usize>, Vec<usize>) = samples
                    .iter()
                    .partition(|&&s| self.x[s][split.feature] <= split.threshold);
                let at = self.nodes.len();
                self.nodes.push(Node::Leaf {
                    distribution: [0.0; NUM_CLASSES],
                });
                let left = self.build(left, depth + 1);
                let right = self.build(right, depth + 1);
                self.nodes[at] = Node::Split {
                    feature: split.feature,
                    threshold: split.threshold,
                    left,
                    right,
                };
                return at;
            }
        }

        let mut distribution = [0.0; NUM_CLASSES];
        for (d, c) in distribution.iter_mut().zip(counts) {
            *d = c as f64 / n as f64;
        }
        self.nodes.push(Node::Leaf { distribution });
        self.nodes.len() - 1
    }

    fn best_split(&mut self, samples: &[usize], counts: &[usize; NUM_CLASSES]) -> Option<BestSplit> {
        let n = samples.len();
        let min_leaf = self.params.min_samples_leaf;
        let criterion = self.params.criterion;
        let candidates =
            rand::seq::index::sample(&mut self.rng, self.dim, self.features_per_split).into_vec();

        let mut best: Option<BestSplit> = None;
        let mut sorted: Vec<(f64, usize)> = Vec::with_capacity(n);
        for feature in candidates {
            sorted.clear();
            sorted.extend(samples.iter().map(|&s| (self.x[s][feature], self.y[s])));
            sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

            let mut left = [0usize; NUM_CLASSES];
            let mut right = *counts;
            for i in 1..n {
                let class = sorted[i - 1].1;
                left[class] += 1;
                right[class] -= 1;

                let (lo, hi) = (sorted[i - 1].0, sorted[i].0);
                if hi <= lo || i < min_leaf || n - i < min_leaf {
                    continue;
                }
                let weighted = (i as f64 * criterion.impurity(&left, i)
                    + (n - i) as f64 * criterion.impurity(&right, n - i))
                    / n as f64;
                if best.as_ref().map_or(true, |b| weighted < b.impurity) {
                    let mut threshold = lo + (hi - lo) / 2.0;
                    if threshold >= hi {
                        threshold = lo;
                    }
                    best = Some(BestSplit {
                        feature,
                        threshold,
                        impurity: weighted,
                    });
                }
            }
        }
        best
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
struct FittedForest {
    dim: usize,
    trees: Vec<Tree>,
}

/// Bagged CART trees; probabilities are the mean of the leaf class
/// distributions reached in every tree.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RandomForest {
    params: ForestParams,
    fitted: Option<FittedForest>,
}

impl RandomForest {
    pub fn new(params: ForestParams) -> Self {
        Self {
            params,
            fitted: None,
        }
    }

    pub fn params(&self) -> &ForestParams {
        &self.params
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.fitted.as_ref().map(|f| f.dim)
    }

    pub fn tree_count(&self) -> usize {
        self.fitted.as_ref().map_or(0, |f| f.trees.len())
    }

    /// Deepest root-to-leaf path over all trees.
    pub fn max_tree_depth(&self) -> usize {
        fn depth(tree: &Tree, at: usize) -> usize {
            match &tree.nodes[at] {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => 1 + depth(tree, *left).max(depth(tree, *right)),
            }
        }
        self.fitted
            .as_ref()
            .map_or(0, |f| f.trees.iter().map(|t| depth(t, 0)).max().unwrap_or(0))
    }
}

impl Classifier for RandomForest {
    fn fit(&mut self, x: &[Vec<f64>], y: &[Emotion]) -> Result<(), ModelError> {
        self.params.validate()?;
        let dim = check_training_set(x, y)?;
        if dim == 0 {
            return Err(ModelError::InvalidParams("feature vectors are empty".into()));
        }

        let labels: Vec<usize> = y.iter().map(|e| e.index()).collect();
        let n = x.len();
        let params = &self.params;
        let features_per_split = params.max_features.count(dim);

        let trees: Vec<Tree> = (0..params.n_estimators)
            .into_par_iter()
            .map(|t| {
                let mut rng = StdRng::seed_from_u64(params.seed.wrapping_add(t as u64));
                let samples: Vec<usize> = if params.bootstrap {
                    (0..n).map(|_| rng.random_range(0..n)).collect()
                } else {
                    (0..n).collect()
                };
                let mut builder = TreeBuilder {
                    x,
                    y: &labels,
                    params,
                    dim,
                    features_per_split,
                    rng,
                    nodes: Vec::new(),
                };
                builder.build(samples, 0);
                Tree {
                    nodes: builder.nodes,
                }
            })
            .collect();

        tracing::debug!(
            target: LOG_TARGET,
            samples = n,
            trees = trees.len(),
            nodes = trees.iter().map(|t| t.nodes.len()).sum::<usize>(),
            params = %self.params,
            "forest fitted"
        );

        self.fitted = Some(FittedForest { dim, trees });
        Ok(())
    }

    fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<Probabilities>, ModelError> {
        let fitted = self.fitted.as_ref().ok_or(ModelError::NotFitted)?;
        check_rows(x, fitted.dim)?;
        let scale = 1.0 / fitted.trees.len() as f64;
        Ok(x.iter()
            .map(|row| {
                let mut acc = [0.0; NUM_CLASSES];
                for tree in &fitted.trees {
                    for (a, p) in acc.iter_mut().zip(tree.predict_proba(row)) {
                        *a += p;
                    }
                }
                acc.iter_mut().for_each(|a| *a *= scale);
                acc
            })
            .collect())
    }
}
