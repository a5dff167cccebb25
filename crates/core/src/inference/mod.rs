use crate::artifacts::{ArtifactBundle, ArtifactError, ArtifactStore};
use crate::decode::{decode_file, DecodeError};
use crate::emotion::Emotion;
use crate::features::{ExtractionError, FeatureExtractor};
use crate::model::{argmax_class, Classifier, Model, ModelError, ModelVariant, Probabilities};
use crate::scaler::{ScalerError, StandardScaler};
use serde::Serialize;
use std::path::{Path, PathBuf};

const LOG_TARGET: &str = "inference";

#[derive(thiserror::Error, Debug)]
pub enum InferenceError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("feature extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("scaling failed: {0}")]
    Scaler(#[from] ScalerError),

    #[error("model failed: {0}")]
    Model(#[from] ModelError),

    #[error("bundle has no {0} model")]
    MissingVariant(ModelVariant),
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Prediction {
    pub emotion: Emotion,
    /// Probability of `emotion`.
    pub confidence: f64,
    pub probabilities: Probabilities,
    /// The input was silent or flat.
    pub degenerate: bool,
}

impl Prediction {
    fn from_probabilities(probabilities: Probabilities, degenerate: bool) -> Self {
        let emotion = argmax_class(&probabilities);
        Self {
            emotion,
            confidence: probabilities[emotion.index()],
            probabilities,
            degenerate,
        }
    }

    /// The `k` most probable classes, highest first; ties keep class order.
    pub fn top_k(&self, k: usize) -> Vec<(Emotion, f64)> {
        let mut ranked: Vec<(Emotion, f64)> = Emotion::ALL
            .iter()
            .map(|&e| (e, self.probabilities[e.index()]))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked.truncate(k);
        ranked
    }
}

/// Waveform in, emotion out, replaying the preprocessing fixed at training.
///
/// Batch and live front ends both go through [`InferenceEngine::predict_waveform`].
pub struct InferenceEngine {
    extractor: FeatureExtractor,
    scaler: StandardScaler,
    model: Model,
    variant: ModelVariant,
}

impl InferenceEngine {
    /// Uses the bundle's selected model.
    pub fn from_bundle(bundle: ArtifactBundle) -> Result<Self, InferenceError> {
        let variant = bundle.selected();
        Self::with_variant(bundle, variant)
    }

    pub fn with_variant(mut bundle: ArtifactBundle, variant: ModelVariant) -> Result<Self, InferenceError> {
        let model = bundle
            .models
            .remove(&variant)
            .ok_or(InferenceError::MissingVariant(variant))?;
        let extractor = FeatureExtractor::new(bundle.manifest.feature_config)?;
        Ok(Self {
            extractor,
            scaler: bundle.scaler,
            model,
            variant,
        })
    }

    pub fn load(store: &ArtifactStore) -> Result<Self, InferenceError> {
        Self::from_bundle(store.load()?)
    }

    pub fn variant(&self) -> ModelVariant {
        self.variant
    }

    pub fn predict_waveform(&self, samples: &[f32], sample_rate: u32) -> Result<Prediction, InferenceError> {
        let extraction = self.extractor.extract(samples, sample_rate)?;
        let scaled = self.scaler.transform_one(&extraction.vector)?;
        let probabilities = self
            .model
            .predict_proba(std::slice::from_ref(&scaled))?
            .pop()
            .ok_or(ModelError::NotFitted)?;
        let prediction = Prediction::from_probabilities(probabilities, extraction.degenerate);
        tracing::debug!(
            target: LOG_TARGET,
            emotion = %prediction.emotion,
            confidence = prediction.confidence,
            degenerate = prediction.degenerate,
            "prediction"
        );
        Ok(prediction)
    }

    pub fn predict_file(&self, path: &Path) -> Result<Prediction, InferenceError> {
        let waveform = decode_file(path)?;
        self.predict_waveform(&waveform.samples, waveform.sample_rate)
    }

    /// Predicts each file independently; one failure does not stop the rest.
    pub fn predict_files(&self, paths: &[PathBuf]) -> Vec<(PathBuf, Result<Prediction, InferenceError>)> {
        paths
            .iter()
            .map(|path| {
                let result = self.predict_file(path);
                if let Err(e) = &result {
                    tracing::warn!(target: LOG_TARGET, path = %path.display(), error = %e, "prediction failed");
                }
                (path.clone(), result)
            })
            .collect()
    }
}
