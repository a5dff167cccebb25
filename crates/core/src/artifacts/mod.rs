//! On-disk bundle of everything inference needs: manifest, scaler and the
//! four trained models, one JSON file each.

use crate::config::Seed;
use crate::emotion::Emotion;
use crate::features::FeatureConfig;
use crate::model::{Model, ModelVariant};
use crate::scaler::StandardScaler;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

const LOG_TARGET: &str = "artifacts";

pub const FORMAT_VERSION: u32 = 2;
pub const MANIFEST_FILE: &str = "manifest.json";
pub const SCALER_FILE: &str = "scaler.json";

pub fn model_file_name(variant: ModelVariant) -> String {
    format!("model_{}.json", variant.name())
}

#[derive(thiserror::Error, Debug)]
pub enum ArtifactError {
    #[error("artifact missing: {path}")]
    Missing { path: PathBuf },

    #[error("artifact corrupt: {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("refusing to save inconsistent bundle: {0}")]
    Inconsistent(String),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub format_version: u32,
    /// Fresh per bundle; every scaler and model file carries it too.
    pub bundle_id: String,
    pub feature_dimension: usize,
    pub feature_config: FeatureConfig,
    /// Class names in output order.
    pub classes: Vec<String>,
    pub variants: Vec<ModelVariant>,
    pub selected: ModelVariant,
    pub seed: Seed,
    /// Validation macro-F1 per variant, as recorded at training time.
    #[serde(default)]
    pub validation_f1: BTreeMap<ModelVariant, f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ArtifactBundle {
    pub manifest: Manifest,
    pub scaler: StandardScaler,
    pub models: BTreeMap<ModelVariant, Model>,
}

impl ArtifactBundle {
    pub fn new(
        feature_config: FeatureConfig,
        scaler: StandardScaler,
        models: BTreeMap<ModelVariant, Model>,
        selected: ModelVariant,
        seed: Seed,
        validation_f1: BTreeMap<ModelVariant, f64>,
    ) -> Result<Self, ArtifactError> {
        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            bundle_id: format!("{:016x}", rand::random::<u64>()),
            feature_dimension: feature_config.dimension(),
            feature_config,
            classes: Emotion::ALL.iter().map(|e| e.name().to_owned()).collect(),
            variants: models.keys().copied().collect(),
            selected,
            seed,
            validation_f1,
        };
        let bundle = Self {
            manifest,
            scaler,
            models,
        };
        bundle.check().map_err(ArtifactError::Inconsistent)?;
        Ok(bundle)
    }

    pub fn selected(&self) -> ModelVariant {
        self.manifest.selected
    }

    pub fn feature_config(&self) -> &FeatureConfig {
        &self.manifest.feature_config
    }

    pub fn selected_model(&self) -> Option<&Model> {
        self.models.get(&self.manifest.selected)
    }

    fn check(&self) -> Result<(), String> {
        let dim = self.manifest.feature_dimension;
        if dim != self.manifest.feature_config.dimension() {
            return Err(format!(
                "manifest dimension {dim} disagrees with feature config ({})",
                self.manifest.feature_config.dimension()
            ));
        }
        match self.scaler.dimension() {
            Some(d) if d == dim => {}
            Some(d) => return Err(format!("scaler expects {d} features, manifest says {dim}")),
            None => return Err("scaler is not fitted".into()),
        }
        if !self.models.contains_key(&self.manifest.selected) {
            return Err(format!("selected model {} is absent", self.manifest.selected));
        }
        for (variant, model) in &self.models {
            match model.dimension() {
                Some(d) if d == dim => {}
                Some(d) => return Err(format!("{variant} expects {d} features, manifest says {dim}")),
                None => return Err(format!("{variant} is not fitted")),
            }
            if model.family() != variant.family() {
                return Err(format!("{variant} holds a {} model", model.family().name()));
            }
        }
        Ok(())
    }
}

/// On-disk envelope for scaler and model files.
#[derive(Serialize)]
struct StampedRef<'a, T> {
    bundle_id: &'a str,
    artifact: &'a T,
}

#[derive(Deserialize)]
struct Stamped<T> {
    bundle_id: String,
    artifact: T,
}

/// Directory-backed store. The location is always passed in explicitly.
#[derive(Clone, Debug)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    pub fn scaler_path(&self) -> PathBuf {
        self.dir.join(SCALER_FILE)
    }

    pub fn model_path(&self, variant: ModelVariant) -> PathBuf {
        self.dir.join(model_file_name(variant))
    }

    /// Writes every file through a temp file in the same directory, models
    /// and scaler first and the manifest last. Files left over from an
    /// interrupted save carry a different bundle id and fail [`Self::load`].
    pub fn save(&self, bundle: &ArtifactBundle) -> Result<(), ArtifactError> {
        bundle.check().map_err(ArtifactError::Inconsistent)?;
        std::fs::create_dir_all(&self.dir).map_err(|source| ArtifactError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let bundle_id = bundle.manifest.bundle_id.as_str();
        for (variant, model) in &bundle.models {
            write_json_atomic(
                &self.model_path(*variant),
                &StampedRef {
                    bundle_id,
                    artifact: model,
                },
            )?;
        }
        write_json_atomic(
            &self.scaler_path(),
            &StampedRef {
                bundle_id,
                artifact: &bundle.scaler,
            },
        )?;
        write_json_atomic(&self.manifest_path(), &bundle.manifest)?;

        tracing::info!(
            target: LOG_TARGET,
            dir = %self.dir.display(),
            models = bundle.models.len(),
            selected = %bundle.manifest.selected,
            "artifacts saved"
        );
        Ok(())
    }

    pub fn load(&self) -> Result<ArtifactBundle, ArtifactError> {
        let manifest_path = self.manifest_path();
        let manifest: Manifest = read_json(&manifest_path)?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(ArtifactError::Corrupt {
                path: manifest_path,
                reason: format!(
                    "unsupported format version {} (expected {FORMAT_VERSION})",
                    manifest.format_version
                ),
            });
        }

        let scaler: StandardScaler = read_stamped(&self.scaler_path(), &manifest.bundle_id)?;
        let mut models = BTreeMap::new();
        for &variant in &manifest.variants {
            let model: Model = read_stamped(&self.model_path(variant), &manifest.bundle_id)?;
            models.insert(variant, model);
        }

        let bundle = ArtifactBundle {
            manifest,
            scaler,
            models,
        };
        bundle.check().map_err(|reason| ArtifactError::Corrupt {
            path: manifest_path,
            reason,
        })?;

        tracing::info!(
            target: LOG_TARGET,
            dir = %self.dir.display(),
            selected = %bundle.manifest.selected,
            "artifacts loaded"
        );
        Ok(bundle)
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), ArtifactError> {
    let io_err = |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    serde_json::to_writer(&mut tmp, value).map_err(|e| io_err(e.into()))?;
    tmp.flush().map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ArtifactError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ArtifactError::Missing {
                path: path.to_path_buf(),
            })
        }
        Err(source) => {
            return Err(ArtifactError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&bytes).map_err(|e| ArtifactError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn read_stamped<T: DeserializeOwned>(path: &Path, bundle_id: &str) -> Result<T, ArtifactError> {
    let stamped: Stamped<T> = read_json(path)?;
    if stamped.bundle_id != bundle_id {
        return Err(ArtifactError::Corrupt {
            path: path.to_path_buf(),
            reason: format!(
                "belongs to bundle {}, manifest is bundle {bundle_id}",
                stamped.bundle_id
            ),
        });
    }
    Ok(stamped.artifact)
}


#[cfg(test)]
mod tests {
    use super::test_bundle::fitted_bundle;
    use super::*;
    use crate::model::Classifier;

    #[test]
    fn save_then_load_predicts_identically() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("artifacts"));
        let bundle = fitted_bundle();
        store.save(&bundle).unwrap();

        for variant in ModelVariant::ALL {
            assert!(store.model_path(variant).exists(), "{variant}");
        }
        let loaded = store.load().unwrap();
        assert_eq!(loaded, bundle);

        let probe: Vec<Vec<f64>> = (0..4)
            .map(|i| (0..81).map(|d| ((d * 7 + i) % 11) as f64 - 5.0).collect())
            .collect();
        for variant in ModelVariant::ALL {
            assert_eq!(
                loaded.models[&variant].predict_proba(&probe).unwrap(),
                bundle.models[&variant].predict_proba(&probe).unwrap()
            );
        }
    }

    #[test]
    fn missing_manifest_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        assert!(matches!(store.load(), Err(ArtifactError::Missing { path }) if path.ends_with(MANIFEST_FILE)));
    }

    #[test]
    fn missing_model_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.save(&fitted_bundle()).unwrap();
        std::fs::remove_file(store.model_path(ModelVariant::ForestBaseline)).unwrap();
        assert!(matches!(
            store.load(),
            Err(ArtifactError::Missing { path }) if path.ends_with("model_forest_baseline.json")
        ));
    }

    #[test]
    fn garbage_scaler_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.save(&fitted_bundle()).unwrap();
        std::fs::write(store.scaler_path(), b"{not json").unwrap();
        assert!(matches!(store.load(), Err(ArtifactError::Corrupt { .. })));
    }

    #[test]
    fn unknown_format_version_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let mut bundle = fitted_bundle();
        store.save(&bundle).unwrap();
        bundle.manifest.format_version = 99;
        write_json_atomic(&store.manifest_path(), &bundle.manifest).unwrap();
        let err = store.load().unwrap_err();
        assert!(err.to_string().contains("format version 99"), "{err}");
    }

    #[test]
    fn selected_variant_must_exist() {
        let mut bundle = fitted_bundle();
        bundle.models.remove(&ModelVariant::SvmTuned);
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        assert!(matches!(store.save(&bundle), Err(ArtifactError::Inconsistent(_))));
        assert!(!store.manifest_path().exists());
    }

    #[test]
    fn files_from_an_interrupted_save_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("current"));
        let old = fitted_bundle();
        store.save(&old).unwrap();

        // A retrain that died after writing its models but before the
        // scaler and manifest.
        let newer = ArtifactStore::new(dir.path().join("newer"));
        let new = fitted_bundle();
        assert_ne!(new.manifest.bundle_id, old.manifest.bundle_id);
        newer.save(&new).unwrap();
        for variant in ModelVariant::ALL {
            std::fs::copy(newer.model_path(variant), store.model_path(variant)).unwrap();
        }

        let err = store.load().unwrap_err();
        assert!(
            matches!(&err, ArtifactError::Corrupt { path, reason }
                if path.ends_with(model_file_name(ModelVariant::SvmBaseline))
                    && reason.contains(&old.manifest.bundle_id)),
            "{err}"
        );

        // Completing the save makes the directory consistent again.
        store.save(&new).unwrap();
        assert_eq!(store.load().unwrap(), new);
    }

    #[test]
    fn mismatched_scaler_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("a"));
        let other = ArtifactStore::new(dir.path().join("b"));
        store.save(&fitted_bundle()).unwrap();
        other.save(&fitted_bundle()).unwrap();
        std::fs::copy(other.scaler_path(), store.scaler_path()).unwrap();
        assert!(matches!(
            store.load(),
            Err(ArtifactError::Corrupt { path, .. }) if path.ends_with(SCALER_FILE)
        ));
    }

    #[test]
    fn save_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.save(&fitted_bundle()).unwrap();
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 6, "{names:?}");
        assert!(names.iter().all(|n| n.ends_with(".json")));
    }
}
