//! Classical classifiers over scaled feature vectors.
//!
//! Both families implement [`Classifier`]; [`Model`] is the serialisable
//! tagged union stored in artifacts.

mod forest;
mod svm;

use crate::emotion::{Emotion, NUM_CLASSES};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use forest::{Criterion, ForestParams, MaxFeatures, RandomForest};
pub use svm::{Gamma, Kernel, SvmClassifier, SvmParams};

/// Class probabilities in [`Emotion::ALL`] order.
pub type Probabilities = [f64; NUM_CLASSES];

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("model used before fit")]
    NotFitted,

    #[error("training set is empty")]
    EmptyTrainingSet,

    #[error("{rows} feature rows but {labels} labels")]
    LengthMismatch { rows: usize, labels: usize },

    #[error("expected {expected} features, got {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("solver did not converge within {iterations} iterations")]
    NotConverged { iterations: usize },

    #[error("invalid hyperparameters: {0}")]
    InvalidParams(String),
}

/// Common capability of every model family.
pub trait Classifier: Send + Sync {
    fn fit(&mut self, x: &[Vec<f64>], y: &[Emotion]) -> Result<(), ModelError>;

    fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<Probabilities>, ModelError>;

    /// Most probable class per row; ties go to the earlier class.
    fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<Emotion>, ModelError> {
        Ok(self.predict_proba(x)?.iter().map(argmax_class).collect())
    }
}

pub fn argmax_class(probs: &Probabilities) -> Emotion {
    let mut best = 0;
    for (i, p) in probs.iter().enumerate() {
        if *p > probs[best] {
            best = i;
        }
    }
    Emotion::ALL[best]
}

pub(crate) fn check_training_set(x: &[Vec<f64>], y: &[Emotion]) -> Result<usize, ModelError> {
    if x.is_empty() {
        return Err(ModelError::EmptyTrainingSet);
    }
    if x.len() != y.len() {
        return Err(ModelError::LengthMismatch {
            rows: x.len(),
            labels: y.len(),
        });
    }
    let dim = x[0].len();
    if let Some(bad) = x.iter().find(|r| r.len() != dim) {
        return Err(ModelError::DimensionMismatch {
            expected: dim,
            found: bad.len(),
        });
    }
    Ok(dim)
}

pub(crate) fn check_rows(x: &[Vec<f64>], dim: usize) -> Result<(), ModelError> {
    match x.iter().find(|r| r.len() != dim) {
        Some(bad) => Err(ModelError::DimensionMismatch {
            expected: dim,
            found: bad.len(),
        }),
        None => Ok(()),
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    Svm,
    RandomForest,
}

impl ModelFamily {
    pub fn name(self) -> &'static str {
        match self {
            ModelFamily::Svm => "svm",
            ModelFamily::RandomForest => "forest",
        }
    }
}

/// Which trained instance a model is.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    SvmBaseline,
    SvmTuned,
    ForestBaseline,
    ForestTuned,
}

impl ModelVariant {
    pub const ALL: [ModelVariant; 4] = [
        ModelVariant::SvmBaseline,
        ModelVariant::SvmTuned,
        ModelVariant::ForestBaseline,
        ModelVariant::ForestTuned,
    ];

    pub fn new(family: ModelFamily, tuned: bool) -> Self {
        match (family, tuned) {
            (ModelFamily::Svm, false) => ModelVariant::SvmBaseline,
            (ModelFamily::Svm, true) => ModelVariant::SvmTuned,
            (ModelFamily::RandomForest, false) => ModelVariant::ForestBaseline,
            (ModelFamily::RandomForest, true) => ModelVariant::ForestTuned,
        }
    }

    pub fn family(self) -> ModelFamily {
        match self {
            ModelVariant::SvmBaseline | ModelVariant::SvmTuned => ModelFamily::Svm,
            ModelVariant::ForestBaseline | ModelVariant::ForestTuned => ModelFamily::RandomForest,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ModelVariant::SvmBaseline => "svm_baseline",
            ModelVariant::SvmTuned => "svm_tuned",
            ModelVariant::ForestBaseline => "forest_baseline",
            ModelVariant::ForestTuned => "forest_tuned",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.name() == name)
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Hyperparameters of either family.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum ModelParams {
    Svm(SvmParams),
    RandomForest(ForestParams),
}

impl ModelParams {
    pub fn family(&self) -> ModelFamily {
        match self {
            ModelParams::Svm(_) => ModelFamily::Svm,
            ModelParams::RandomForest(_) => ModelFamily::RandomForest,
        }
    }

    /// Unfitted model with these hyperparameters.
    pub fn build(&self) -> Model {
        match self {
            ModelParams::Svm(p) => Model::Svm(SvmClassifier::new(p.clone())),
            ModelParams::RandomForest(p) => Model::RandomForest(RandomForest::new(p.clone())),
        }
    }
}

impl fmt::Display for ModelParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelParams::Svm(p) => write!(f, "svm({p})"),
            ModelParams::RandomForest(p) => write!(f, "forest({p})"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum Model {
    Svm(SvmClassifier),
    RandomForest(RandomForest),
}

impl Model {
    pub fn family(&self) -> ModelFamily {
        match self {
            Model::Svm(_) => ModelFamily::Svm,
            Model::RandomForest(_) => ModelFamily::RandomForest,
        }
    }

    pub fn params(&self) -> ModelParams {
        match self {
            Model::Svm(m) => ModelParams::Svm(m.params().clone()),
            Model::RandomForest(m) => ModelParams::RandomForest(m.params().clone()),
        }
    }

    pub fn is_fitted(&self) -> bool {
        match self {
            Model::Svm(m) => m.is_fitted(),
            Model::RandomForest(m) => m.is_fitted(),
        }
    }

    /// Input dimension learned at fit time.
    pub fn dimension(&self) -> Option<usize> {
        match self {
            Model::Svm(m) => m.dimension(),
            Model::RandomForest(m) => m.dimension(),
        }
    }
}

impl Classifier for Model {
    fn fit(&mut self, x: &[Vec<f64>], y: &[Emotion]) -> Result<(), ModelError> {
        match self {
            Model::Svm(m) => m.fit(x, y),
            Model::RandomForest(m) => m.fit(x, y),
        }
    }

    fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<Probabilities>, ModelError> {
        match self {
            Model::Svm(m) => m.predict_proba(x),
            Model::RandomForest(m) => m.predict_proba(x),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argmax_prefers_first_on_ties() {
        let mut p = [0.0; NUM_CLASSES];
        p[2] = 0.4;
        p[5] = 0.4;
        assert_eq!(argmax_class(&p), Emotion::Happy);
    }

    #[test]
    fn variant_names_round_trip() {
        for v in ModelVariant::ALL {
            assert_eq!(ModelVariant::from_name(v.name()), Some(v));
            assert_eq!(ModelVariant::new(v.family(), v == ModelVariant::SvmTuned || v == ModelVariant::ForestTuned), v);
        }
    }

    #[test]
    fn params_build_matching_family() {
        let p = ModelParams::Svm(SvmParams::default());
        assert_eq!(p.build().family(), ModelFamily::Svm);
        let p = ModelParams::RandomForest(ForestParams::default());
        let m = p.build();
        assert_eq!(m.family(), ModelFamily::RandomForest);
        assert!(!m.is_fitted());
        assert_eq!(m.params(), p);
    }

    #[test]
    fn unfitted_model_refuses_to_predict() {
        let m = ModelParams::Svm(SvmParams::default()).build();
        assert_eq!(
            m.predict(&[vec![0.0; 3]]).unwrap_err(),
            ModelError::NotFitted
        );
    }
}
