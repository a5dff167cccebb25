//! Mel filterbank, log compression, cepstral transform and time deltas.

const AMIN: f64 = 1e-10;
const TOP_DB: f64 = 80.0;

/// Slaney-style triangular mel filters, area normalised.
///
/// Each filter is stored as its first non-zero bin plus the weights from
/// there on.
#[derive(Clone, Debug)]
pub struct MelFilterbank {
    filters: Vec<(usize, Vec<f64>)>,
}

impl MelFilterbank {
    pub fn new(n_mels: usize, n_fft: usize, sample_rate: u32, fmin: f64, fmax: f64) -> Self {
        let num_bins = n_fft / 2 + 1;
        let sr = f64::from(sample_rate);
        let fft_freqs: Vec<f64> = (0..num_bins).map(|k| k as f64 * sr / n_fft as f64).collect();

        let mel_min = hz_to_mel(fmin);
        let mel_max = hz_to_mel(fmax);
        let mel_points: Vec<f64> = (0..n_mels + 2)
            .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64))
            .collect();

        let filters = (0..n_mels)
            .map(|m| {
                let (left, centre, right) = (mel_points[m], mel_points[m + 1], mel_points[m + 2]);
                let enorm = 2.0 / (right - left);
                let weights: Vec<f64> = fft_freqs
                    .iter()
                    .map(|&f| {
                        let lower = (f - left) / (centre - left);
                        let upper = (right - f) / (right - centre);
                        lower.min(upper).max(0.0) * enorm
                    })
                    .collect();

                let start = weights.iter().position(|&w| w > 0.0).unwrap_or(0);
                let end = weights
                    .iter()
                    .rposition(|&w| w > 0.0)
                    .map(|i| i + 1)
                    .unwrap_or(start);
                (start, weights[start..end].to_vec())
            })
            .collect();

        Self { filters }
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Applies the filters to one power spectrum.
    pub fn apply(&self, power: &[f64]) -> Vec<f64> {
        self.filters
            .iter()
            .map(|(start, weights)| {
                weights
                    .iter()
                    .zip(&power[*start..])
                    .map(|(w, p)| w * p)
                    .sum()
            })
            .collect()
    }
}

pub fn hz_to_mel(hz: f64) -> f64 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1000.0;
    let min_log_mel = min_log_hz / f_sp;
    let logstep = 6.4f64.ln() / 27.0;

    if hz >= min_log_hz {
        min_log_mel + (hz / min_log_hz).ln() / logstep
    } else {
        hz / f_sp
    }
}

pub fn mel_to_hz(mel: f64) -> f64 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1000.0;
    let min_log_mel = min_log_hz / f_sp;
    let logstep = 6.4f64.ln() / 27.0;

    if mel >= min_log_mel {
        min_log_hz * (logstep * (mel - min_log_mel)).exp()
    } else {
        f_sp * mel
    }
}

/// Converts a power mel spectrogram (frames x bands) to decibels in place,
/// clipping everything more than 80 dB below the global peak.
pub fn power_to_db(mel_frames: &mut [Vec<f64>]) {
    let mut peak = f64::NEG_INFINITY;
    for frame in mel_frames.iter_mut() {
        for v in frame.iter_mut() {
            *v = 10.0 * v.max(AMIN).log10();
            peak = peak.max(*v);
        }
    }
    let floor = peak - TOP_DB;
    for frame in mel_frames.iter_mut() {
        for v in frame.iter_mut() {
            *v = v.max(floor);
        }
    }
}

/// Orthonormal DCT-II truncated to the first `n_out` coefficients.
#[derive(Clone, Debug)]
pub struct Dct {
    basis: Vec<Vec<f64>>,
}

impl Dct {
    pub fn new(n_in: usize, n_out: usize) -> Self {
        let n = n_in as f64;
        let basis = (0..n_out)
            .map(|k| {
                let scale = if k == 0 { (1.0 / n).sqrt() } else { (2.0 / n).sqrt() };
                (0..n_in)
                    .map(|i| {
                        scale
                            * (std::f64::consts::PI * k as f64 * (2.0 * i as f64 + 1.0) / (2.0 * n))
                                .cos()
                    })
                    .collect()
            })
            .collect();
        Self { basis }
    }

    pub fn apply(&self, input: &[f64]) -> Vec<f64> {
        self.basis
            .iter()
            .map(|row| row.iter().zip(input).map(|(b, x)| b * x).sum())
            .collect()
    }
}

/// Regression-based time derivative of a (frames x channels) matrix over a
/// window of `width` frames. Frames past either end repeat the boundary frame.
pub fn delta(frames: &[Vec<f64>], width: usize) -> Vec<Vec<f64>> {
    let n = frames.len();
    if n == 0 {
        return Vec::new();
    }
    let half = (width / 2) as isize;
    let denom: f64 = 2.0 * (1..=half).map(|k| (k * k) as f64).sum::<f64>();
    let channels = frames[0].len();

    (0..n as isize)
        .map(|t| {
            (0..channels)
                .map(|c| {
                    let num: f64 = (1..=half)
                        .map(|k| k as f64 * (frame_at(frames, t + k)[c] - frame_at(frames, t - k)[c]))
                        .sum();
                    num / denom
                })
                .collect()
        })
        .collect()
}

fn frame_at(frames: &[Vec<f64>], t: isize) -> &[f64] {
    let last = frames.len() as isize - 1;
    &frames[t.clamp(0, last) as usize]
}
