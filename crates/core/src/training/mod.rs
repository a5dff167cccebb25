//! Baseline fits and cross-validated grid search for both model families.

use crate::config::{Seed, TrainingConfig};
use crate::emotion::{Emotion, NUM_CLASSES};
use crate::evaluation::EvaluationReport;
use crate::model::{
    Classifier, Criterion, ForestParams, Gamma, Kernel, MaxFeatures, Model, ModelError,
    ModelFamily, ModelParams, SvmParams,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const LOG_TARGET: &str = "training";

pub const SVM_KERNELS: [Kernel; 2] = [Kernel::Rbf, Kernel::Linear];
pub const SVM_C_VALUES: [f64; 4] = [0.1, 1.0, 10.0, 100.0];
pub const SVM_GAMMAS: [Gamma; 3] = [Gamma::Scale, Gamma::Value(0.01), Gamma::Value(0.001)];
pub const FOREST_ESTIMATORS: [usize; 2] = [100, 200];
pub const FOREST_MAX_DEPTHS: [Option<usize>; 3] = [None, Some(10), Some(20)];
pub const FOREST_MIN_SPLITS: [usize; 2] = [2, 5];
pub const FOREST_CRITERIA: [Criterion; 2] = [Criterion::Gini, Criterion::Entropy];

#[derive(thiserror::Error, Debug)]
pub enum TrainError {
    #[error("model fit failed: {0}")]
    Model(#[from] ModelError),

    #[error("every {family} configuration failed during cross-validation")]
    NoViableConfiguration { family: &'static str },

    #[error("{samples} training samples cannot fill {folds} folds")]
    TooFewSamples { samples: usize, folds: usize },

    #[error("{0} labels do not match {1} feature rows")]
    LengthMismatch(usize, usize),

    #[error("parameter grid is empty")]
    EmptyGrid,
}

/// Cross-validation score used to rank configurations.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ScoringMetric {
    #[default]
    MacroF1,
    Accuracy,
}

impl ScoringMetric {
    pub fn name(self) -> &'static str {
        match self {
            ScoringMetric::MacroF1 => "macro-f1",
            ScoringMetric::Accuracy => "accuracy",
        }
    }

    pub fn score(self, truth: &[Emotion], predicted: &[Emotion]) -> f64 {
        match EvaluationReport::from_predictions(truth, predicted) {
            Ok(report) => match self {
                ScoringMetric::MacroF1 => report.macro_f1,
                ScoringMetric::Accuracy => report.accuracy,
            },
            Err(_) => f64::NEG_INFINITY,
        }
    }
}

impl fmt::Display for ScoringMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ScoringMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "macro-f1" | "macro_f1" | "f1" => Ok(ScoringMetric::MacroF1),
            "accuracy" => Ok(ScoringMetric::Accuracy),
            other => Err(format!("unknown scoring metric `{other}` (expected macro-f1 or accuracy)")),
        }
    }
}

pub fn svm_baseline() -> SvmParams {
    SvmParams::default()
}

pub fn forest_baseline(seed: Seed) -> ForestParams {
    ForestParams {
        seed: seed.value(),
        ..ForestParams::default()
    }
}

/// Kernel, then C, then gamma. Linear ignores gamma and appears once per C.
pub fn svm_grid() -> Vec<ModelParams> {
    let mut grid = Vec::new();
    for kernel in SVM_KERNELS {
        for c in SVM_C_VALUES {
            let gammas: &[Gamma] = match kernel {
                Kernel::Rbf => &SVM_GAMMAS,
                Kernel::Linear => &[Gamma::Scale],
            };
            for &gamma in gammas {
                grid.push(ModelParams::Svm(SvmParams {
                    kernel,
                    c,
                    gamma,
                    ..svm_baseline()
                }));
            }
        }
    }
    grid
}

pub fn forest_grid(seed: Seed) -> Vec<ModelParams> {
    let mut grid = Vec::new();
    for n_estimators in FOREST_ESTIMATORS {
        for max_depth in FOREST_MAX_DEPTHS {
            for min_samples_split in FOREST_MIN_SPLITS {
                for criterion in FOREST_CRITERIA {
                    grid.push(ModelParams::RandomForest(ForestParams {
                        n_estimators,
                        max_depth,
                        min_samples_split,
                        criterion,
                        max_features: MaxFeatures::Sqrt,
                        ..forest_baseline(seed)
                    }));
                }
            }
        }
    }
    grid
}

/// Row indices of one cross-validation fold.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fold {
    pub train: Vec<usize>,
    pub held_out: Vec<usize>,
}

/// Stratified k-fold: the i-th sample of each class (in row order) lands in
/// fold `(start + i) % k`, so every fold keeps roughly the class
/// proportions. Each class starts where the previous class in
/// [`Emotion::ALL`] order stopped, so no fold is left without held-out rows
/// even when every class has fewer than `k` samples.
pub fn stratified_folds(y: &[Emotion], k: usize) -> Result<Vec<Fold>, TrainError> {
    if k < 2 || y.len() < k {
        return Err(TrainError::TooFewSamples {
            samples: y.len(),
            folds: k,
        });
    }
    let mut start = [0usize; NUM_CLASSES];
    let mut offset = 0;
    for (slot, count) in start.iter_mut().zip(class_counts_of(y)) {
        *slot = offset;
        offset += count;
    }

    let mut seen = [0usize; NUM_CLASSES];
    let assignment: Vec<usize> = y
        .iter()
        .map(|label| {
            let class = label.index();
            let fold = (start[class] + seen[class]) % k;
            seen[class] += 1;
            fold
        })
        .collect();

    Ok((0..k)
        .map(|fold| {
            let (held_out, train): (Vec<usize>, Vec<usize>) =
                (0..y.len()).partition(|&i| assignment[i] == fold);
            Fold { train, held_out }
        })
        .collect())
}

fn class_counts_of(y: &[Emotion]) -> [usize; NUM_CLASSES] {
    let mut counts = [0usize; NUM_CLASSES];
    for label in y {
        counts[label.index()] += 1;
    }
    counts
}

#[derive(Clone, Debug, PartialEq)]
pub struct CvResult<P> {
    pub params: P,
    pub fold_scores: Vec<f64>,
    pub mean_score: f64,
}

/// Every configuration's cross-validation scores plus the winner.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchResult<P> {
    pub results: Vec<CvResult<P>>,
    pub best_index: usize,
}

impl<P> SearchResult<P> {
    pub fn best(&self) -> &CvResult<P> {
        &self.results[self.best_index]
    }
}

fn subset<T: Clone>(items: &[T], indices: &[usize]) -> Vec<T> {
    indices.iter().map(|&i| items[i].clone()).collect()
}

/// Scores every configuration with k-fold cross-validation on `x`/`y` only.
///
/// Jobs run in parallel but scores are gathered in enumeration order, and
/// the first configuration with the strictly highest mean wins. A fold whose
/// fit or predict fails scores negative infinity.
pub fn cross_validate<P, C, B>(
    x: &[Vec<f64>],
    y: &[Emotion],
    configs: &[P],
    folds: usize,
    scoring: ScoringMetric,
    build: B,
) -> Result<Option<SearchResult<P>>, TrainError>
where
    P: Clone + fmt::Display + Send + Sync,
    C: Classifier,
    B: Fn(&P) -> C + Sync,
{
    if configs.is_empty() {
        return Err(TrainError::EmptyGrid);
    }
    if x.len() != y.len() {
        return Err(TrainError::LengthMismatch(y.len(), x.len()));
    }
    let folds = stratified_folds(y, folds)?;

    let jobs: Vec<(usize, usize)> = (0..configs.len())
        .flat_map(|c| (0..folds.len()).map(move |f| (c, f)))
        .collect();
    let scores: Vec<f64> = jobs
        .par_iter()
        .map(|&(c, f)| {
            let fold = &folds[f];
            let mut model = build(&configs[c]);
            let outcome = model
                .fit(&subset(x, &fold.train), &subset(y, &fold.train))
                .and_then(|()| model.predict(&subset(x, &fold.held_out)));
            match outcome {
                Ok(predicted) => scoring.score(&subset(y, &fold.held_out), &predicted),
                Err(e) => {
                    tracing::warn!(
                        target: LOG_TARGET,
                        config = %configs[c],
                        fold = f,
                        error = %e,
                        "configuration failed; scored as worst"
                    );
                    f64::NEG_INFINITY
                }
            }
        })
        .collect();

    let results: Vec<CvResult<P>> = configs
        .iter()
        .zip(scores.chunks(folds.len()))
        .map(|(params, fold_scores)| CvResult {
            params: params.clone(),
            mean_score: fold_scores.iter().sum::<f64>() / fold_scores.len() as f64,
            fold_scores: fold_scores.to_vec(),
        })
        .collect();

    for r in &results {
        tracing::debug!(
            target: LOG_TARGET,
            config = %r.params,
            mean = r.mean_score,
            folds = ?r.fold_scores,
            "cv result"
        );
    }

    let mut best: Option<usize> = None;
    for (i, r) in results.iter().enumerate() {
        let leading = best.map_or(f64::NEG_INFINITY, |b| results[b].mean_score);
        if r.mean_score > leading {
            best = Some(i);
        }
    }
    Ok(best.map(|best_index| SearchResult {
        results,
        best_index,
    }))
}

/// Baseline and tuned models for one family.
#[derive(Clone, Debug)]
pub struct TrainedFamily {
    pub family: ModelFamily,
    pub baseline: Model,
    pub tuned: Model,
    pub search: SearchResult<ModelParams>,
}

#[derive(Clone, Debug)]
pub struct ModelTrainer {
    config: TrainingConfig,
}

impl ModelTrainer {
    pub fn new(config: TrainingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn baseline_params(&self, family: ModelFamily) -> ModelParams {
        match family {
            ModelFamily::Svm => ModelParams::Svm(svm_baseline()),
            ModelFamily::RandomForest => ModelParams::RandomForest(forest_baseline(self.config.seed)),
        }
    }

    pub fn grid(&self, family: ModelFamily) -> Vec<ModelParams> {
        match family {
            ModelFamily::Svm => svm_grid(),
            ModelFamily::RandomForest => forest_grid(self.config.seed),
        }
    }

    /// Fits the baseline, searches the grid on the same rows, then refits the
    /// winner on all of them. Callers pass the training partition only.
    pub fn train_family(
        &self,
        family: ModelFamily,
        x: &[Vec<f64>],
        y: &[Emotion],
    ) -> Result<TrainedFamily, TrainError> {
        let mut baseline = self.baseline_params(family).build();
        baseline.fit(x, y)?;
        tracing::info!(target: LOG_TARGET, family = family.name(), "baseline fitted");

        let grid = self.grid(family);
        let search = cross_validate(x, y, &grid, self.config.folds, self.config.scoring, |p| {
            p.build()
        })?
        .ok_or(TrainError::NoViableConfiguration {
            family: family.name(),
        })?;

        let best = search.best();
        tracing::info!(
            target: LOG_TARGET,
            family = family.name(),
            configurations = search.results.len(),
            best = %best.params,
            score = best.mean_score,
            scoring = %self.config.scoring,
            "grid search finished"
        );

        let mut tuned = best.params.build();
        tuned.fit(x, y)?;

        Ok(TrainedFamily {
            family,
            baseline,
            tuned,
            search,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{test_data::blobs, Probabilities};
    use std::sync::{Arc, Mutex};

    #[test]
    fn grids_have_expected_sizes_and_order() {
        let svm = svm_grid();
        assert_eq!(svm.len(), 16);
        assert_eq!(
            svm[0],
            ModelParams::Svm(SvmParams {
                kernel: Kernel::Rbf,
                c: 0.1,
                gamma: Gamma::Scale,
                ..SvmParams::default()
            })
        );
        let linear = svm
            .iter()
            .filter(|p| matches!(p, ModelParams::Svm(s) if s.kernel == Kernel::Linear))
            .count();
        assert_eq!(linear, 4);

        let forest = forest_grid(Seed(9));
        assert_eq!(forest.len(), 24);
        match &forest[1] {
            ModelParams::RandomForest(p) => {
                assert_eq!(p.criterion, Criterion::Entropy);
                assert_eq!(p.n_estimators, 100);
                assert_eq!(p.seed, 9);
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn folds_are_stratified_and_partition_rows() {
        let y: Vec<Emotion> = (0..40).map(|i| Emotion::ALL[i % 4]).collect();
        let folds = stratified_folds(&y, 5).unwrap();
        assert_eq!(folds.len(), 5);
        let mut held: Vec<usize> = folds.iter().flat_map(|f| f.held_out.clone()).collect();
        held.sort_unstable();
        assert_eq!(held, (0..40).collect::<Vec<_>>());
        for fold in &folds {
            assert_eq!(fold.held_out.len(), 8);
            assert_eq!(fold.train.len() + fold.held_out.len(), 40);
            for class in &Emotion::ALL[..4] {
                assert_eq!(fold.held_out.iter().filter(|&&i| y[i] == *class).count(), 2);
            }
        }
        assert!(matches!(
            stratified_folds(&y[..3], 5),
            Err(TrainError::TooFewSamples { .. })
        ));
    }

    #[test]
    fn small_classes_still_fill_every_fold() {
        // Four rows per class, five folds: no class alone reaches the last fold.
        let y: Vec<Emotion> = Emotion::ALL
            .iter()
            .flat_map(|&e| std::iter::repeat(e).take(4))
            .collect();
        let folds = stratified_folds(&y, 5).unwrap();
        for (i, fold) in folds.iter().enumerate() {
            assert!(!fold.held_out.is_empty(), "fold {i} has nothing held out");
            assert!(!fold.train.is_empty(), "fold {i} has nothing to train on");
        }
        for class in Emotion::ALL {
            let per_fold: Vec<usize> = folds
                .iter()
                .map(|f| f.held_out.iter().filter(|&&i| y[i] == class).count())
                .collect();
            assert!(per_fold.iter().all(|&n| n <= 1), "{class}: {per_fold:?}");
            assert_eq!(per_fold.iter().sum::<usize>(), 4);
        }
    }

    #[test]
    fn scoring_parses_and_scores() {
        assert_eq!("macro-f1".parse::<ScoringMetric>().unwrap(), ScoringMetric::MacroF1);
        assert_eq!("Accuracy".parse::<ScoringMetric>().unwrap(), ScoringMetric::Accuracy);
        assert!("auc".parse::<ScoringMetric>().is_err());

        let truth = [Emotion::Sad, Emotion::Sad, Emotion::Angry, Emotion::Angry];
        let pred = [Emotion::Sad, Emotion::Angry, Emotion::Angry, Emotion::Angry];
        assert_eq!(ScoringMetric::Accuracy.score(&truth, &pred), 0.75);
    }

    /// Predicts a fixed class and records every row it was fitted on.
    #[derive(Clone)]
    struct Recorder {
        answer: Emotion,
        fails: bool,
        seen: Arc<Mutex<Vec<Vec<f64>>>>,
    }

    impl Classifier for Recorder {
        fn fit(&mut self, x: &[Vec<f64>], _y: &[Emotion]) -> Result<(), ModelError> {
            if self.fails {
                return Err(ModelError::NotConverged { iterations: 0 });
            }
            self.seen.lock().unwrap().extend(x.iter().cloned());
            Ok(())
        }

        fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<Probabilities>, ModelError> {
            let mut p = [0.0; NUM_CLASSES];
            p[self.answer.index()] = 1.0;
            Ok(vec![p; x.len()])
        }
    }

    #[derive(Clone, Debug)]
    struct MockParams {
        answer: Emotion,
        fails: bool,
    }

    impl fmt::Display for MockParams {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "mock({}, fails={})", self.answer, self.fails)
        }
    }

    fn mock_data() -> (Vec<Vec<f64>>, Vec<Emotion>) {
        let y: Vec<Emotion> = (0..20)
            .map(|i| if i % 4 == 0 { Emotion::Calm } else { Emotion::Happy })
            .collect();
        let x = (0..20).map(|i| vec![i as f64]).collect();
        (x, y)
    }

    #[test]
    fn search_only_fits_on_rows_it_was_given() {
        let (x, y) = mock_data();
        let held_back = vec![vec![1000.0], vec![2000.0]];
        let seen = Arc::new(Mutex::new(Vec::new()));
        let configs = vec![MockParams {
            answer: Emotion::Happy,
            fails: false,
        }];
        cross_validate(&x, &y, &configs, 5, ScoringMetric::Accuracy, |p| Recorder {
            answer: p.answer,
            fails: p.fails,
            seen: seen.clone(),
        })
        .unwrap()
        .unwrap();

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|row| x.contains(row)));
        assert!(seen.iter().all(|row| !held_back.contains(row)));
    }

    #[test]
    fn failing_configuration_never_wins_and_ties_keep_first() {
        let (x, y) = mock_data();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let configs = vec![
            MockParams {
                answer: Emotion::Happy,
                fails: true,
            },
            MockParams {
                answer: Emotion::Calm,
                fails: false,
            },
            MockParams {
                answer: Emotion::Happy,
                fails: false,
            },
            MockParams {
                answer: Emotion::Happy,
                fails: false,
            },
        ];
        let search = cross_validate(&x, &y, &configs, 5, ScoringMetric::Accuracy, |p| Recorder {
            answer: p.answer,
            fails: p.fails,
            seen: seen.clone(),
        })
        .unwrap()
        .unwrap();

        assert_eq!(search.results[0].mean_score, f64::NEG_INFINITY);
        assert_eq!(search.results[2].mean_score, search.results[3].mean_score);
        assert_eq!(search.best_index, 2);
        assert!((search.best().mean_score - 0.75).abs() < 1e-12);
    }

    #[test]
    fn all_failing_configurations_yield_none() {
        let (x, y) = mock_data();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let configs = vec![MockParams {
            answer: Emotion::Happy,
            fails: true,
        }];
        let out = cross_validate(&x, &y, &configs, 5, ScoringMetric::MacroF1, |p| Recorder {
            answer: p.answer,
            fails: p.fails,
            seen: seen.clone(),
        })
        .unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn trainer_produces_baseline_and_tuned_models() {
        let classes = [Emotion::Neutral, Emotion::Sad, Emotion::Angry];
        let (x, y) = blobs(10, 6, &classes);
        let trainer = ModelTrainer::new(TrainingConfig::new(Seed(3), 3, ScoringMetric::MacroF1).unwrap());
        let trained = trainer.train_family(ModelFamily::Svm, &x, &y).unwrap();
        assert!(trained.baseline.is_fitted());
        assert!(trained.tuned.is_fitted());
        assert_eq!(trained.tuned.params(), trained.search.best().params);
        assert_eq!(trained.search.results.len(), 16);
    }
}
