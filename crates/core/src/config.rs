use crate::features::FeatureConfig;
use crate::training::ScoringMetric;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_FEATURES_CSV: &str = "features.csv";
pub const DEFAULT_ARTIFACTS_DIR: &str = "artifacts";
pub const DEFAULT_REPORTS_DIR: &str = "reports";
pub const DEFAULT_SEED: u64 = 42;
pub const DEFAULT_CV_FOLDS: usize = 5;
pub const DEFAULT_SEGMENT_MS: u64 = 3000;
pub const DEFAULT_BUFFER_SEGMENTS: usize = 4;
pub const DEFAULT_MIN_PEAK: f32 = 0.01;
pub const ENV_ARTIFACTS_DIR: &str = "EMOTION_ARTIFACTS_DIR";
pub const ENV_REPORTS_DIR: &str = "EMOTION_REPORTS_DIR";
pub const ENV_SEED: &str = "EMOTION_SEED";

/// Seed for every random decision of a run (partitioning, forest sampling).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Seed(pub u64);

impl Seed {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl Default for Seed {
    fn default() -> Self {
        Self(DEFAULT_SEED)
    }
}

/// Length of one live audio segment handed to inference.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentDuration {
    pub millis: u64,
}

impl SegmentDuration {
    pub fn new(millis: u64) -> Result<Self, ConfigError> {
        if millis == 0 {
            return Err(ConfigError::ZeroSegment);
        }
        Ok(Self { millis })
    }

    pub fn from_secs_f64(secs: f64) -> Result<Self, ConfigError> {
        if !secs.is_finite() || secs <= 0.0 {
            return Err(ConfigError::ZeroSegment);
        }
        Self::new((secs * 1000.0).round() as u64)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.millis)
    }

    pub fn frames_for_sample_rate(&self, sample_rate_hz: u32) -> usize {
        let sr = u64::from(sample_rate_hz);
        let frames = self.millis.saturating_mul(sr).saturating_div(1000);
        usize::try_from(frames).unwrap_or(usize::MAX)
    }
}

impl Default for SegmentDuration {
    fn default() -> Self {
        Self {
            millis: DEFAULT_SEGMENT_MS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrainingConfig {
    pub seed: Seed,
    pub folds: usize,
    pub scoring: ScoringMetric,
}

impl TrainingConfig {
    pub fn new(seed: Seed, folds: usize, scoring: ScoringMetric) -> Result<Self, ConfigError> {
        if folds < 2 {
            return Err(ConfigError::TooFewFolds(folds));
        }
        Ok(Self {
            seed,
            folds,
            scoring,
        })
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            seed: Seed::default(),
            folds: DEFAULT_CV_FOLDS,
            scoring: ScoringMetric::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LiveConfig {
    pub segment: SegmentDuration,
    pub buffer_segments: usize,
    /// Segments whose peak amplitude stays below this are skipped as too quiet.
    pub min_peak: f32,
}

impl LiveConfig {
    pub fn new(
        segment: SegmentDuration,
        buffer_segments: usize,
        min_peak: f32,
    ) -> Result<Self, ConfigError> {
        if buffer_segments == 0 {
            return Err(ConfigError::ZeroBuffer);
        }
        Ok(Self {
            segment,
            buffer_segments,
            min_peak,
        })
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            segment: SegmentDuration::default(),
            buffer_segments: DEFAULT_BUFFER_SEGMENTS,
            min_peak: DEFAULT_MIN_PEAK,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub artifacts_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub features: FeatureConfig,
    pub training: TrainingConfig,
    pub live: LiveConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            artifacts_dir: PathBuf::from(DEFAULT_ARTIFACTS_DIR),
            reports_dir: PathBuf::from(DEFAULT_REPORTS_DIR),
            features: FeatureConfig::default(),
            training: TrainingConfig::default(),
            live: LiveConfig::default(),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("segment duration must be > 0 ms")]
    ZeroSegment,
    #[error("segment buffer must hold at least one segment")]
    ZeroBuffer,
    #[error("cross-validation needs at least 2 folds, got {0}")]
    TooFewFolds(usize),
    #[error("invalid seed {0:?}")]
    InvalidSeed(String),
}

pub trait Env {
    fn var(&self, key: &str) -> Option<String>;
}

#[derive(Clone, Debug, Default)]
pub struct StdEnv;

impl Env for StdEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

#[derive(Clone, Debug, Default)]
pub struct MapEnv {
    vars: std::collections::BTreeMap<String, String>,
}

impl MapEnv {
    pub fn with_var(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.to_owned(), value.to_owned());
        self
    }
}

impl Env for MapEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }
}

pub fn resolve_string_with_default(
    cli_value: Option<String>,
    env_key: &str,
    env: &impl Env,
    default: &str,
) -> String {
    match cli_value {
        Some(v) => v,
        None => env.var(env_key).unwrap_or_else(|| default.to_owned()),
    }
}

pub fn resolve_path_with_default(
    cli_value: Option<PathBuf>,
    env_key: &str,
    env: &impl Env,
    default: &str,
) -> PathBuf {
    match cli_value {
        Some(v) => v,
        None => PathBuf::from(resolve_string_with_default(None, env_key, env, default)),
    }
}

pub fn resolve_seed(cli_value: Option<u64>, env: &impl Env) -> Result<Seed, ConfigError> {
    if let Some(v) = cli_value {
        return Ok(Seed(v));
    }
    match env.var(ENV_SEED) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Seed)
            .map_err(|_| ConfigError::InvalidSeed(raw)),
        None => Ok(Seed::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_frames_simple() {
        let s = SegmentDuration::new(3000).expect("nonzero");
        assert_eq!(s.frames_for_sample_rate(22_050), 66_150);
        assert_eq!(s.frames_for_sample_rate(16_000), 48_000);
    }

    #[test]
    fn segment_rejects_zero() {
        assert_eq!(SegmentDuration::new(0), Err(ConfigError::ZeroSegment));
        assert_eq!(
            SegmentDuration::from_secs_f64(-1.0),
            Err(ConfigError::ZeroSegment)
        );
        assert_eq!(SegmentDuration::from_secs_f64(2.5).unwrap().millis, 2500);
    }

    #[test]
    fn training_config_needs_two_folds() {
        let err = TrainingConfig::new(Seed(1), 1, ScoringMetric::MacroF1).unwrap_err();
        assert_eq!(err, ConfigError::TooFewFolds(1));
    }

    #[test]
    fn artifacts_dir_cli_takes_precedence_over_env() {
        let env = MapEnv::default().with_var(ENV_ARTIFACTS_DIR, "/env/artifacts");
        let p = resolve_path_with_default(
            Some(PathBuf::from("/cli/artifacts")),
            ENV_ARTIFACTS_DIR,
            &env,
            DEFAULT_ARTIFACTS_DIR,
        );
        assert_eq!(p, PathBuf::from("/cli/artifacts"));
    }

    #[test]
    fn artifacts_dir_env_used_when_cli_missing() {
        let env = MapEnv::default().with_var(ENV_ARTIFACTS_DIR, "/env/artifacts");
        let p = resolve_path_with_default(None, ENV_ARTIFACTS_DIR, &env, DEFAULT_ARTIFACTS_DIR);
        assert_eq!(p, PathBuf::from("/env/artifacts"));
    }

    #[test]
    fn resolve_string_with_default_default_used_when_both_missing() {
        let env = MapEnv::default();
        let v = resolve_string_with_default(None, ENV_REPORTS_DIR, &env, "def");
        assert_eq!(v, "def");
    }

    #[test]
    fn seed_resolution_order() {
        let env = MapEnv::default().with_var(ENV_SEED, "7");
        assert_eq!(resolve_seed(Some(3), &env).unwrap(), Seed(3));
        assert_eq!(resolve_seed(None, &env).unwrap(), Seed(7));
        assert_eq!(resolve_seed(None, &MapEnv::default()).unwrap(), Seed(42));

        let bad = MapEnv::default().with_var(ENV_SEED, "abc");
        assert!(matches!(
            resolve_seed(None, &bad),
            Err(ConfigError::InvalidSeed(_))
        ));
    }
}
