//! Fixed-length acoustic feature vectors.
//!
//! Every clip, whatever its duration, is reduced to the same ordered vector:
//!
//! | block                    | values |
//! |--------------------------|--------|
//! | MFCC mean                | 13     |
//! | MFCC std                 | 13     |
//! | delta mean               | 13     |
//! | delta std                | 13     |
//! | delta-delta mean         | 13     |
//! | delta-delta std          | 13     |
//! | spectral centroid mean   | 1      |
//! | spectral roll-off mean   | 1      |
//! | zero-crossing rate mean  | 1      |
//!
//! which is 81 values with the default configuration.

mod mfcc;
mod spectral;
mod stft;

use crate::decode::Waveform;
use serde::{Deserialize, Serialize};

pub use mfcc::{delta, hz_to_mel, mel_to_hz, Dct, MelFilterbank};
pub use stft::Stft;

const LOG_TARGET: &str = "features";
const SILENCE_PEAK: f32 = 1e-4;
const FLAT_STD: f64 = 1e-12;

pub const DEFAULT_SAMPLE_RATE: u32 = 22_050;
pub const DEFAULT_CLIP_SECS: f64 = 3.0;
pub const FEATURE_DIMENSION: usize = 81;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FeatureConfig {
    pub sample_rate: u32,
    pub clip_secs: f64,
    pub n_fft: usize,
    pub hop_length: usize,
    pub n_mels: usize,
    pub n_mfcc: usize,
    pub pre_emphasis: f64,
    pub delta_width: usize,
    pub rolloff_percent: f64,
    pub fmin: f64,
    /// Defaults to the Nyquist frequency.
    pub fmax: Option<f64>,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            clip_secs: DEFAULT_CLIP_SECS,
            n_fft: 2048,
            hop_length: 512,
            n_mels: 128,
            n_mfcc: 13,
            pre_emphasis: 0.97,
            delta_width: 9,
            rolloff_percent: 0.85,
            fmin: 0.0,
            fmax: None,
        }
    }
}

impl FeatureConfig {
    pub fn dimension(&self) -> usize {
        self.n_mfcc * 6 + 3
    }

    pub fn fmax(&self) -> f64 {
        self.fmax.unwrap_or(f64::from(self.sample_rate) / 2.0)
    }

    pub fn validate(&self) -> Result<(), ExtractionError> {
        let invalid = |reason: &str| Err(ExtractionError::InvalidConfig(reason.to_owned()));
        if self.sample_rate == 0 {
            return invalid("sample_rate must be > 0");
        }
        if !(self.clip_secs > 0.0) {
            return invalid("clip_secs must be > 0");
        }
        if self.n_fft < 2 || self.hop_length == 0 {
            return invalid("n_fft must be >= 2 and hop_length > 0");
        }
        if self.n_mfcc == 0 || self.n_mfcc > self.n_mels {
            return invalid("n_mfcc must be in 1..=n_mels");
        }
        if self.delta_width < 3 || self.delta_width % 2 == 0 {
            return invalid("delta_width must be odd and >= 3");
        }
        if !(0.0..1.0).contains(&self.pre_emphasis) {
            return invalid("pre_emphasis must be in [0, 1)");
        }
        if !(self.rolloff_percent > 0.0 && self.rolloff_percent < 1.0) {
            return invalid("rolloff_percent must be in (0, 1)");
        }
        if !(self.fmin >= 0.0 && self.fmin < self.fmax()) {
            return invalid("fmin must be >= 0 and below fmax");
        }
        if self.fmax() > f64::from(self.sample_rate) / 2.0 {
            return invalid("fmax must not exceed the Nyquist frequency");
        }
        Ok(())
    }

    /// Column names in vector order.
    pub fn feature_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.dimension());
        for block in ["mfcc", "delta", "delta2"] {
            for stat in ["mean", "std"] {
                names.extend((0..self.n_mfcc).map(|i| format!("{block}_{stat}_{i}")));
            }
        }
        names.push("spectral_centroid_mean".to_owned());
        names.push("spectral_rolloff_mean".to_owned());
        names.push("zero_crossing_rate_mean".to_owned());
        names
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("invalid feature configuration: {0}")]
    InvalidConfig(String),

    #[error("sample rate must be > 0")]
    InvalidSampleRate,

    #[error("waveform contains non-finite samples")]
    NonFiniteInput,

    #[error("transform failed: {0}")]
    Transform(String),

    #[error("feature {index} is not finite")]
    NonFiniteFeature { index: usize },
}

/// Result of extracting one clip.
#[derive(Clone, Debug, PartialEq)]
pub struct Extraction {
    pub vector: Vec<f64>,
    /// Silent or flat input; the vector is valid but carries little signal.
    pub degenerate: bool,
}

#[derive(Clone)]
pub struct FeatureExtractor {
    config: FeatureConfig,
    stft: Stft,
    filterbank: MelFilterbank,
    dct: Dct,
    freqs: Vec<f64>,
}

impl FeatureExtractor {
    pub fn new(config: FeatureConfig) -> Result<Self, ExtractionError> {
        config.validate()?;
        let stft = Stft::new(config.n_fft, config.hop_length);
        let filterbank = MelFilterbank::new(
            config.n_mels,
            config.n_fft,
            config.sample_rate,
            config.fmin,
            config.fmax(),
        );
        let dct = Dct::new(config.n_mels, config.n_mfcc);
        let freqs = stft.bin_frequencies(config.sample_rate);
        Ok(Self {
            config,
            stft,
            filterbank,
            dct,
            freqs,
        })
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    pub fn dimension(&self) -> usize {
        self.config.dimension()
    }

    pub fn extract_waveform(&self, waveform: &Waveform) -> Result<Extraction, ExtractionError> {
        self.extract(&waveform.samples, waveform.sample_rate)
    }

    /// Extracts the feature vector of a clip.
    ///
    /// The clip is first resampled to the configured rate and cut to the
    /// configured duration, so callers may pass audio at any rate.
    pub fn extract(&self, samples: &[f32], sample_rate: u32) -> Result<Extraction, ExtractionError> {
        if sample_rate == 0 {
            return Err(ExtractionError::InvalidSampleRate);
        }
        if samples.iter().any(|s| !s.is_finite()) {
            return Err(ExtractionError::NonFiniteInput);
        }

        let clip = Waveform::new(samples.to_vec(), sample_rate)
            .conform(self.config.sample_rate, self.config.clip_secs);
        let signal: Vec<f64> = clip.samples.iter().map(|&s| f64::from(s)).collect();

        let cepstra = self.mfcc(&signal)?;
        let deltas = delta(&cepstra, self.config.delta_width);
        let deltas2 = delta(&deltas, self.config.delta_width);

        let magnitudes = self.stft.magnitudes(&signal)?;
        let centroid = spectral::spectral_centroid(&magnitudes, &self.freqs);
        let rolloff =
            spectral::spectral_rolloff(&magnitudes, &self.freqs, self.config.rolloff_percent);
        let zcr = spectral::zero_crossing_rate(&signal, self.config.n_fft, self.config.hop_length);

        let mut vector = Vec::with_capacity(self.dimension());
        let mut flat = true;
        for (i, block) in [&cepstra, &deltas, &deltas2].into_iter().enumerate() {
            let (means, stds) = column_mean_std(block, self.config.n_mfcc);
            if i == 0 {
                flat = stds.iter().all(|&s| s < FLAT_STD);
            }
            vector.extend(means);
            vector.extend(stds);
        }
        vector.push(mean(&centroid));
        vector.push(mean(&rolloff));
        vector.push(mean(&zcr));

        if let Some(index) = vector.iter().position(|v| !v.is_finite()) {
            return Err(ExtractionError::NonFiniteFeature { index });
        }

        let degenerate = flat || clip.peak() < SILENCE_PEAK;
        if degenerate {
            tracing::debug!(target: LOG_TARGET, peak = clip.peak(), "degenerate clip");
        }
        Ok(Extraction { vector, degenerate })
    }

    /// MFCC matrix, frames x n_mfcc.
    fn mfcc(&self, signal: &[f64]) -> Result<Vec<Vec<f64>>, ExtractionError> {
        let emphasized = pre_emphasis(signal, self.config.pre_emphasis);
        let magnitudes = self.stft.magnitudes(&emphasized)?;
        let mut mel: Vec<Vec<f64>> = magnitudes
            .iter()
            .map(|frame| {
                let power: Vec<f64> = frame.iter().map(|m| m * m).collect();
                self.filterbank.apply(&power)
            })
            .collect();
        mfcc::power_to_db(&mut mel);
        Ok(mel.iter().map(|frame| self.dct.apply(frame)).collect())
    }
}

fn pre_emphasis(signal: &[f64], coeff: f64) -> Vec<f64> {
    let mut out = Vec::with_capacity(signal.len());
    let mut prev = 0.0;
    for &x in signal {
        out.push(x - coeff * prev);
        prev = x;
    }
    out
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Per-column mean and population standard deviation.
fn column_mean_std(frames: &[Vec<f64>], columns: usize) -> (Vec<f64>, Vec<f64>) {
    let n = frames.len().max(1) as f64;
    let means: Vec<f64> = (0..columns)
        .map(|c| frames.iter().map(|f| f[c]).sum::<f64>() / n)
        .collect();
    let stds = (0..columns)
        .map(|c| {
            let var = frames.iter().map(|f| (f[c] - means[c]).powi(2)).sum::<f64>() / n;
            var.sqrt()
        })
        .collect();
    (means, stds)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> FeatureExtractor {
        FeatureExtractor::new(FeatureConfig::default()).expect("default config is valid")
    }

    fn tone(freq: f32, sample_rate: u32, secs: f32) -> Vec<f32> {
        let n = (sample_rate as f32 * secs) as usize;
        (0..n)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn default_dimension_is_81() {
        let cfg = FeatureConfig::default();
        assert_eq!(cfg.dimension(), FEATURE_DIMENSION);
        assert_eq!(cfg.feature_names().len(), FEATURE_DIMENSION);
        assert_eq!(cfg.feature_names()[0], "mfcc_mean_0");
        assert_eq!(cfg.feature_names()[13], "mfcc_std_0");
        assert_eq!(cfg.feature_names()[80], "zero_crossing_rate_mean");
    }

    #[test]
    fn dimension_is_independent_of_duration() {
        let fx = extractor();
        for secs in [0.0f32, 0.01, 0.5, 1.0, 3.0, 4.5] {
            let clip = tone(440.0, 22_050, secs);
            let out = fx.extract(&clip, 22_050).expect("extracts");
            assert_eq!(out.vector.len(), FEATURE_DIMENSION, "duration {secs}");
        }
    }

    #[test]
    fn other_sample_rates_are_resampled() {
        let fx = extractor();
        let out = fx.extract(&tone(440.0, 16_000, 1.0), 16_000).unwrap();
        assert_eq!(out.vector.len(), FEATURE_DIMENSION);
        assert!(!out.degenerate);
    }

    #[test]
    fn silent_clip_is_deterministic_and_flagged() {
        let fx = extractor();
        let silence = vec![0.0f32; 22_050 * 3];
        let a = fx.extract(&silence, 22_050).unwrap();
        let b = fx.extract(&silence, 22_050).unwrap();
        assert!(a.degenerate);
        assert_eq!(a.vector.len(), FEATURE_DIMENSION);
        let bits_a: Vec<u64> = a.vector.iter().map(|v| v.to_bits()).collect();
        let bits_b: Vec<u64> = b.vector.iter().map(|v| v.to_bits()).collect();
        assert_eq!(bits_a, bits_b);
    }

    #[test]
    fn tone_features_reflect_pitch() {
        let fx = extractor();
        let low = fx.extract(&tone(300.0, 22_050, 1.0), 22_050).unwrap();
        let high = fx.extract(&tone(3000.0, 22_050, 1.0), 22_050).unwrap();
        let centroid = FEATURE_DIMENSION - 3;
        let zcr = FEATURE_DIMENSION - 1;
        assert!(high.vector[centroid] > low.vector[centroid]);
        assert!(high.vector[zcr] > low.vector[zcr]);
    }

    #[test]
    fn rejects_bad_input() {
        let fx = extractor();
        assert_eq!(
            fx.extract(&[0.0, f32::NAN], 22_050).unwrap_err(),
            ExtractionError::NonFiniteInput
        );
        assert_eq!(
            fx.extract(&[0.0; 10], 0).unwrap_err(),
            ExtractionError::InvalidSampleRate
        );
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let cfg = FeatureConfig {
            delta_width: 4,
            ..FeatureConfig::default()
        };
        assert!(matches!(
            FeatureExtractor::new(cfg),
            Err(ExtractionError::InvalidConfig(_))
        ));

        let cfg = FeatureConfig {
            n_mfcc: 200,
            ..FeatureConfig::default()
        };
        assert!(FeatureExtractor::new(cfg).is_err());
    }

    #[test]
    fn pre_emphasis_first_difference() {
        assert_eq!(pre_emphasis(&[1.0, 1.0, 1.0], 0.5), vec![1.0, 0.5, 0.5]);
    }
}
