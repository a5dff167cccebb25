use super::ExtractionError;
use realfft::{RealFftPlanner, RealToComplex};
use std::sync::Arc;

/// Centered short-time Fourier transform returning one magnitude spectrum
/// per frame.
///
/// The signal is zero padded by `n_fft / 2` on both sides, so a signal of
/// `len` samples always yields `1 + len / hop` frames, including the empty
/// signal.
#[derive(Clone)]
pub struct Stft {
    n_fft: usize,
    hop: usize,
    window: Vec<f64>,
    fft: Arc<dyn RealToComplex<f64>>,
}

impl Stft {
    pub fn new(n_fft: usize, hop: usize) -> Self {
        let mut planner = RealFftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(n_fft);
        Self {
            n_fft,
            hop,
            window: hann_window(n_fft),
            fft,
        }
    }

    pub fn num_bins(&self) -> usize {
        self.n_fft / 2 + 1
    }

    pub fn num_frames(&self, signal_len: usize) -> usize {
        1 + signal_len / self.hop
    }

    pub fn magnitudes(&self, signal: &[f64]) -> Result<Vec<Vec<f64>>, ExtractionError> {
        let pad = self.n_fft / 2;
        let mut padded = vec![0.0f64; signal.len() + 2 * pad];
        padded[pad..pad + signal.len()].copy_from_slice(signal);

        let num_frames = self.num_frames(signal.len());
        let mut frame_buf = self.fft.make_input_vec();
        let mut spectrum = self.fft.make_output_vec();
        let mut scratch = self.fft.make_scratch_vec();
        let mut out = Vec::with_capacity(num_frames);

        for frame_idx in 0..num_frames {
            let start = frame_idx * self.hop;
            for (i, slot) in frame_buf.iter_mut().enumerate() {
                *slot = padded[start + i] * self.window[i];
            }

            self.fft
                .process_with_scratch(&mut frame_buf, &mut spectrum, &mut scratch)
                .map_err(|e| ExtractionError::Transform(format!("FFT failed: {e:?}")))?;

            out.push(spectrum.iter().map(|c| c.norm()).collect());
        }

        Ok(out)
    }

    /// Bin centre frequencies in Hz.
    pub fn bin_frequencies(&self, sample_rate: u32) -> Vec<f64> {
        let sr = f64::from(sample_rate);
        (0..self.num_bins())
            .map(|k| k as f64 * sr / self.n_fft as f64)
            .collect()
    }
}

/// Periodic Hann window.
fn hann_window(size: usize) -> Vec<f64> {
    (0..size)
        .map(|i| {
            let phase = 2.0 * std::f64::consts::PI * i as f64 / size as f64;
            0.5 * (1.0 - phase.cos())
        })
        .collect()
}

/// Splits `signal` into edge-padded centered frames of `frame_len` samples.
pub(crate) fn centered_frames(signal: &[f64], frame_len: usize, hop: usize) -> Vec<Vec<f64>> {
    let pad = frame_len / 2;
    let first = signal.first().copied().unwrap_or(0.0);
    let last = signal.last().copied().unwrap_or(0.0);

    let mut padded = Vec::with_capacity(signal.len() + 2 * pad);
    padded.extend(std::iter::repeat(first).take(pad));
    padded.extend_from_slice(signal);
    padded.extend(std::iter::repeat(last).take(pad));

    let num_frames = 1 + signal.len() / hop;
    (0..num_frames)
        .map(|f| {
            let start = f * hop;
            let end = (start + frame_len).min(padded.len());
            let mut frame = padded[start..end].to_vec();
            frame.resize(frame_len, last);
            frame
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_count_is_centered() {
        let stft = Stft::new(2048, 512);
        assert_eq!(stft.num_frames(0), 1);
        assert_eq!(stft.num_frames(66_150), 130);
        let mags = stft.magnitudes(&[]).unwrap();
        assert_eq!(mags.len(), 1);
        assert_eq!(mags[0].len(), 1025);
        assert!(mags[0].iter().all(|&m| m == 0.0));
    }

    #[test]
    fn sine_peaks_at_its_bin() {
        let sr = 8_000u32;
        let n_fft = 256;
        let stft = Stft::new(n_fft, 64);
        let freq = 1_000.0;
        let signal: Vec<f64> = (0..2_048)
            .map(|i| (2.0 * std::f64::consts::PI * freq * i as f64 / f64::from(sr)).sin())
            .collect();
        let mags = stft.magnitudes(&signal).unwrap();
        let mid = &mags[mags.len() / 2];
        let peak_bin = mid
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        let freqs = stft.bin_frequencies(sr);
        assert!((freqs[peak_bin] - freq).abs() <= f64::from(sr) / n_fft as f64);
    }

    #[test]
    fn centered_frames_pad_with_edges() {
        let frames = centered_frames(&[1.0, 2.0, 3.0, 4.0], 4, 2);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], vec![1.0, 1.0, 1.0, 2.0]);
        assert_eq!(frames[2], vec![3.0, 4.0, 4.0, 4.0]);
    }
}
