//! Batch stages: corpus extraction and the train / evaluate / persist run.

use crate::artifacts::{ArtifactBundle, ArtifactError, ArtifactStore};
use crate::config::{AppConfig, Seed};
use crate::dataset::{split_stratified, DatasetError, FeatureTable, LabeledVector, SplitRatios};
use crate::decode::decode_file;
use crate::emotion::Emotion;
use crate::evaluation::{evaluate, write_comparison_csv, EvaluationError, EvaluationReport};
use crate::features::{ExtractionError, FeatureExtractor};
use crate::model::{ModelFamily, ModelVariant};
use crate::scaler::{ScalerError, StandardScaler};
use crate::training::{ModelTrainer, TrainError};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const LOG_TARGET: &str = "pipeline";

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no .wav files under {0}")]
    NoAudioFiles(PathBuf),

    #[error("feature table has {found} columns, extractor produces {expected}")]
    FeatureDimension { expected: usize, found: usize },

    #[error("feature column {index} is `{found}`, extractor produces `{expected}`")]
    FeatureColumn {
        index: usize,
        expected: String,
        found: String,
    },

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Scaler(#[from] ScalerError),

    #[error(transparent)]
    Train(#[from] TrainError),

    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

/// Per-run extraction counts; skipped files are listed with the reason.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExtractionSummary {
    pub extracted: usize,
    pub skipped: usize,
    pub degenerate: usize,
    pub failures: Vec<(PathBuf, String)>,
}

/// All `.wav` files under `dir`, recursively, in sorted order.
pub fn find_audio_files(dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let entries = std::fs::read_dir(&current).map_err(|source| PipelineError::Io {
            path: current.clone(),
            source,
        })?;
        for entry in entries {
            let path = entry
                .map_err(|source| PipelineError::Io {
                    path: current.clone(),
                    source,
                })?
                .path();
            if path.is_dir() {
                pending.push(path);
            } else if path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("wav"))
            {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

fn extract_one(
    path: &Path,
    root: &Path,
    extractor: &FeatureExtractor,
) -> Result<(LabeledVector, bool), String> {
    let label = Emotion::from_ravdess_filename(path).map_err(|e| e.to_string())?;
    let waveform = decode_file(path).map_err(|e| e.to_string())?;
    let extraction = extractor
        .extract_waveform(&waveform)
        .map_err(|e| e.to_string())?;
    let source_id = path
        .strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/");
    Ok((
        LabeledVector {
            features: extraction.vector,
            label,
            source_id,
        },
        extraction.degenerate,
    ))
}

/// Extracts one labelled vector per RAVDESS clip under `data_dir`.
///
/// Files that cannot be labelled, decoded or extracted are skipped and
/// counted; degenerate clips are kept and counted.
pub fn extract_corpus(
    data_dir: &Path,
    extractor: &FeatureExtractor,
) -> Result<(FeatureTable, ExtractionSummary), PipelineError> {
    let files = find_audio_files(data_dir)?;
    if files.is_empty() {
        return Err(PipelineError::NoAudioFiles(data_dir.to_path_buf()));
    }
    tracing::info!(target: LOG_TARGET, files = files.len(), dir = %data_dir.display(), "extracting features");

    let outcomes: Vec<Result<(LabeledVector, bool), String>> = files
        .par_iter()
        .map(|path| extract_one(path, data_dir, extractor))
        .collect();

    let mut summary = ExtractionSummary::default();
    let mut rows = Vec::with_capacity(files.len());
    for (path, outcome) in files.into_iter().zip(outcomes) {
        match outcome {
            Ok((row, degenerate)) => {
                if degenerate {
                    tracing::warn!(target: LOG_TARGET, path = %path.display(), "degenerate clip kept");
                    summary.degenerate += 1;
                }
                summary.extracted += 1;
                rows.push(row);
            }
            Err(reason) => {
                tracing::warn!(target: LOG_TARGET, path = %path.display(), reason = %reason, "clip skipped");
                summary.skipped += 1;
                summary.failures.push((path, reason));
            }
        }
    }

    tracing::info!(
        target: LOG_TARGET,
        extracted = summary.extracted,
        skipped = summary.skipped,
        degenerate = summary.degenerate,
        "extraction finished"
    );
    let table = FeatureTable::new(extractor.config().feature_names(), rows)?;
    Ok((table, summary))
}

/// Validation and test scores of one trained model.
#[derive(Clone, Debug)]
pub struct VariantReport {
    pub validation: EvaluationReport,
    pub test: EvaluationReport,
}

#[derive(Clone, Debug)]
pub struct TrainingOutcome {
    pub train_size: usize,
    pub validation_size: usize,
    pub test_size: usize,
    pub reports: BTreeMap<ModelVariant, VariantReport>,
    pub selected: ModelVariant,
    pub bundle: ArtifactBundle,
}

/// Highest validation macro-F1; ties keep the earlier variant.
pub fn select_variant(reports: &BTreeMap<ModelVariant, VariantReport>) -> Option<ModelVariant> {
    let mut best: Option<(ModelVariant, f64)> = None;
    for variant in ModelVariant::ALL {
        if let Some(report) = reports.get(&variant) {
            let score = report.validation.macro_f1;
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((variant, score));
            }
        }
    }
    best.map(|(v, _)| v)
}

/// Splits, scales, trains both families, evaluates all four models on
/// validation and test, writes reports, then saves artifacts. Nothing is
/// written to `store` unless every earlier step succeeded.
pub fn train_and_evaluate(
    table: &FeatureTable,
    config: &AppConfig,
    store: &ArtifactStore,
) -> Result<TrainingOutcome, PipelineError> {
    let expected = config.features.dimension();
    if table.dimension() != expected {
        return Err(PipelineError::FeatureDimension {
            expected,
            found: table.dimension(),
        });
    }
    let expected_names = config.features.feature_names();
    if let Some((index, (expected, found))) = expected_names
        .iter()
        .zip(&table.feature_names)
        .enumerate()
        .find(|(_, (e, f))| e != f)
    {
        return Err(PipelineError::FeatureColumn {
            index,
            expected: expected.clone(),
            found: found.clone(),
        });
    }

    let seed: Seed = config.training.seed;
    let split = split_stratified(&table.rows, SplitRatios::default(), seed)?;
    let (train_x, train_y) = split.train.xy();
    let (val_x, val_y) = split.validation.xy();
    let (test_x, test_y) = split.test.xy();

    let mut scaler = StandardScaler::new();
    let train_x = scaler.fit_transform(&train_x)?;
    let val_x = scaler.transform(&val_x)?;
    let test_x = scaler.transform(&test_x)?;

    let trainer = ModelTrainer::new(config.training.clone());
    let mut models = BTreeMap::new();
    for family in [ModelFamily::Svm, ModelFamily::RandomForest] {
        let trained = trainer.train_family(family, &train_x, &train_y)?;
        models.insert(ModelVariant::new(family, false), trained.baseline);
        models.insert(ModelVariant::new(family, true), trained.tuned);
    }

    let mut reports = BTreeMap::new();
    for (variant, model) in &models {
        let report = VariantReport {
            validation: evaluate(model, &val_x, &val_y)?,
            test: evaluate(model, &test_x, &test_y)?,
        };
        tracing::info!(
            target: LOG_TARGET,
            model = %variant,
            validation_f1 = report.validation.macro_f1,
            test_f1 = report.test.macro_f1,
            test_accuracy = report.test.accuracy,
            "model evaluated"
        );
        reports.insert(*variant, report);
    }

    let selected = select_variant(&reports).ok_or(TrainError::NoViableConfiguration {
        family: "any",
    })?;
    tracing::info!(target: LOG_TARGET, selected = %selected, "model selected");

    write_reports(&config.reports_dir, &reports)?;

    let validation_f1 = reports
        .iter()
        .map(|(v, r)| (*v, r.validation.macro_f1))
        .collect();
    let bundle = ArtifactBundle::new(
        config.features.clone(),
        scaler,
        models,
        selected,
        seed,
        validation_f1,
    )?;
    store.save(&bundle)?;

    Ok(TrainingOutcome {
        train_size: split.train.len(),
        validation_size: split.validation.len(),
        test_size: split.test.len(),
        reports,
        selected,
        bundle,
    })
}

fn write_reports(
    dir: &Path,
    reports: &BTreeMap<ModelVariant, VariantReport>,
) -> Result<(), PipelineError> {
    std::fs::create_dir_all(dir).map_err(|source| PipelineError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    for (variant, report) in reports {
        let text = format!(
            "{variant} - validation\n\n{}\n{variant} - test\n\n{}",
            report.validation.classification_report(),
            report.test.classification_report()
        );
        let path = dir.join(format!("classification_report_{variant}.txt"));
        std::fs::write(&path, text).map_err(|source| PipelineError::Io { path, source })?;
        report
            .test
            .confusion
            .write_csv(&dir.join(format!("confusion_matrix_{variant}.csv")))?;
        report
            .test
            .confusion
            .write_png(&dir.join(format!("confusion_matrix_{variant}.png")))?;
    }

    let mut rows: Vec<(String, &str, &EvaluationReport)> = Vec::with_capacity(2 * reports.len());
    for (variant, r) in reports {
        rows.push((variant.to_string(), "validation", &r.validation));
    }
    for (variant, r) in reports {
        rows.push((variant.to_string(), "test", &r.test));
    }
    write_comparison_csv(&dir.join("model_comparison.csv"), &rows)?;
    tracing::info!(target: LOG_TARGET, dir = %dir.display(), "reports written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{FeatureConfig, FEATURE_DIMENSION};
    use crate::inference::InferenceEngine;

    fn write_tone(path: &Path, freq: f32, amplitude: f32) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..8_000 {
            let s = amplitude * (2.0 * std::f32::consts::PI * freq * i as f32 / 16_000.0).sin();
            writer.write_sample((s * i16::MAX as f32) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn corpus_extraction_counts_skips_and_degenerates() {
        let dir = tempfile::tempdir().unwrap();
        let actor = dir.path().join("Actor_01");
        std::fs::create_dir(&actor).unwrap();
        for emotion in Emotion::ALL {
            let name = format!("03-01-{:02}-01-01-01-01.wav", emotion.id());
            write_tone(&actor.join(name), 200.0 + 100.0 * emotion.id() as f32, 0.5);
        }
        write_tone(&actor.join("03-01-01-01-01-02-01.wav"), 300.0, 0.0);
        write_tone(&actor.join("not-a-ravdess-name.wav"), 300.0, 0.5);
        std::fs::write(actor.join("03-01-02-01-01-02-01.wav"), b"garbage").unwrap();
        std::fs::write(actor.join("notes.txt"), b"ignored").unwrap();

        let extractor = FeatureExtractor::new(FeatureConfig::default()).unwrap();
        let (table, summary) = extract_corpus(dir.path(), &extractor).unwrap();

        assert_eq!(summary.extracted, 9);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.degenerate, 1);
        assert_eq!(table.len(), 9);
        assert_eq!(table.dimension(), FEATURE_DIMENSION);
        assert_eq!(table.class_counts()[Emotion::Neutral.index()], 2);
        assert!(table.rows.iter().all(|r| r.source_id.starts_with("Actor_01/")));
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = FeatureExtractor::new(FeatureConfig::default()).unwrap();
        assert!(matches!(
            extract_corpus(dir.path(), &extractor),
            Err(PipelineError::NoAudioFiles(_))
        ));
    }

    fn synthetic_table(per_class: usize) -> FeatureTable {
        let names = FeatureConfig::default().feature_names();
        let rows = Emotion::ALL
            .iter()
            .enumerate()
            .flat_map(|(c, &emotion)| {
                (0..per_class).map(move |i| LabeledVector {
                    features: (0..FEATURE_DIMENSION)
                        .map(|d| {
                            let centre = if d % 8 == c { 5.0 } else { 0.0 };
                            centre + ((i * 13 + d * 7) % 17) as f64 / 17.0
                        })
                        .collect(),
                    label: emotion,
                    source_id: format!("{c}-{i}"),
                })
            })
            .collect();
        FeatureTable::new(names, rows).unwrap()
    }

    fn test_config(root: &Path) -> AppConfig {
        AppConfig {
            artifacts_dir: root.join("artifacts"),
            reports_dir: root.join("reports"),
            ..AppConfig::default()
        }
    }

    #[test]
    fn full_run_writes_reports_and_loadable_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = ArtifactStore::new(&config.artifacts_dir);

        let outcome = train_and_evaluate(&synthetic_table(12), &config, &store).unwrap();
        assert_eq!(outcome.train_size + outcome.validation_size + outcome.test_size, 96);
        assert_eq!(outcome.reports.len(), 4);
        assert_eq!(outcome.bundle.selected(), outcome.selected);

        for variant in ModelVariant::ALL {
            assert!(config
                .reports_dir
                .join(format!("classification_report_{variant}.txt"))
                .exists());
            assert!(config
                .reports_dir
                .join(format!("confusion_matrix_{variant}.png"))
                .exists());
        }
        let comparison =
            std::fs::read_to_string(config.reports_dir.join("model_comparison.csv")).unwrap();
        let lines: Vec<&str> = comparison.lines().collect();
        assert_eq!(lines[0], "model,partition,accuracy,precision,recall,f1");
        assert_eq!(lines.len(), 1 + 2 * ModelVariant::ALL.len());
        for variant in ModelVariant::ALL {
            for (partition, report) in [
                ("validation", &outcome.reports[&variant].validation),
                ("test", &outcome.reports[&variant].test),
            ] {
                let expected = format!("{variant},{partition},");
                let line = lines
                    .iter()
                    .find(|l| l.starts_with(&expected))
                    .unwrap_or_else(|| panic!("no {expected} row"));
                assert!(line.ends_with(&format!(",{:.4}", report.macro_f1)), "{line}");
            }
        }

        let loaded = store.load().unwrap();
        assert_eq!(loaded, outcome.bundle);
        assert!(InferenceEngine::load(&store).is_ok());
    }

    #[test]
    fn wrong_dimension_persists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = ArtifactStore::new(&config.artifacts_dir);
        let table = FeatureTable::new(
            vec!["a".into()],
            vec![LabeledVector {
                features: vec![1.0],
                label: Emotion::Calm,
                source_id: "x".into(),
            }],
        )
        .unwrap();
        assert!(matches!(
            train_and_evaluate(&table, &config, &store),
            Err(PipelineError::FeatureDimension { found: 1, .. })
        ));
        assert!(!config.artifacts_dir.exists());
    }

    #[test]
    fn reordered_columns_persist_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = ArtifactStore::new(&config.artifacts_dir);
        let mut table = synthetic_table(12);
        table.feature_names.swap(0, 13);
        let err = train_and_evaluate(&table, &config, &store).unwrap_err();
        assert!(
            matches!(&err, PipelineError::FeatureColumn { index: 0, found, .. } if *found == table.feature_names[0]),
            "{err}"
        );
        assert!(!config.artifacts_dir.exists());
        assert!(!config.reports_dir.exists());
    }

    #[test]
    fn non_finite_feature_persists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = ArtifactStore::new(&config.artifacts_dir);
        let mut table = synthetic_table(12);
        for row in &mut table.rows {
            row.features[5] = f64::NAN;
        }
        assert!(matches!(
            train_and_evaluate(&table, &config, &store),
            Err(PipelineError::Scaler(ScalerError::NonFinite { feature: 5, .. }))
        ));
        assert!(!config.artifacts_dir.exists());
    }

    #[test]
    fn insufficient_class_persists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = ArtifactStore::new(&config.artifacts_dir);
        let mut table = synthetic_table(12);
        let mut kept_sad = 0;
        table.rows.retain(|r| {
            if r.label != Emotion::Sad {
                return true;
            }
            kept_sad += 1;
            kept_sad <= 2
        });
        assert!(matches!(
            train_and_evaluate(&table, &config, &store),
            Err(PipelineError::Dataset(DatasetError::InsufficientData { .. }))
        ));
        assert!(!config.artifacts_dir.exists());
        assert!(!config.reports_dir.exists());
    }

    #[test]
    fn selection_prefers_first_on_ties() {
        let report = EvaluationReport::from_predictions(&[Emotion::Sad], &[Emotion::Sad]).unwrap();
        let reports: BTreeMap<ModelVariant, VariantReport> = ModelVariant::ALL
            .iter()
            .map(|&v| {
                (
                    v,
                    VariantReport {
                        validation: report.clone(),
                        test: report.clone(),
                    },
                )
            })
            .collect();
        assert_eq!(select_variant(&reports), Some(ModelVariant::SvmBaseline));
    }
}
