use super::stft::centered_frames;

/// Magnitude-weighted mean frequency of each frame. Silent frames give 0 Hz.
pub fn spectral_centroid(magnitudes: &[Vec<f64>], freqs: &[f64]) -> Vec<f64> {
    magnitudes
        .iter()
        .map(|frame| {
            let total: f64 = frame.iter().sum();
            if total <= f64::MIN_POSITIVE {
                return 0.0;
            }
            frame.iter().zip(freqs).map(|(m, f)| m * f).sum::<f64>() / total
        })
        .collect()
}

/// Lowest frequency below which `percent` of the frame's magnitude lies.
pub fn spectral_rolloff(magnitudes: &[Vec<f64>], freqs: &[f64], percent: f64) -> Vec<f64> {
    magnitudes
        .iter()
        .map(|frame| {
            let threshold = percent * frame.iter().sum::<f64>();
            let mut cumulative = 0.0;
            for (m, f) in frame.iter().zip(freqs) {
                cumulative += m;
                if cumulative >= threshold {
                    return *f;
                }
            }
            freqs.last().copied().unwrap_or(0.0)
        })
        .collect()
}

/// Fraction of adjacent sample pairs with a sign change, per centered frame.
///
/// Values within 1e-10 of zero count as positive.
pub fn zero_crossing_rate(signal: &[f64], frame_len: usize, hop: usize) -> Vec<f64> {
    let is_negative = |x: f64| x < -1e-10;
    centered_frames(signal, frame_len, hop)
        .iter()
        .map(|frame| {
            let crossings = frame
                .windows(2)
                .filter(|w| is_negative(w[0]) != is_negative(w[1]))
                .count();
            crossings as f64 / frame_len as f64
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn centroid_of_single_bin_is_that_bin() {
        let freqs = [0.0, 100.0, 200.0, 300.0];
        let c = spectral_centroid(&[vec![0.0, 0.0, 5.0, 0.0], vec![0.0; 4]], &freqs);
        assert_eq!(c, vec![200.0, 0.0]);
    }

    #[test]
    fn rolloff_finds_energy_boundary() {
        let freqs = [0.0, 100.0, 200.0, 300.0];
        let r = spectral_rolloff(&[vec![1.0, 1.0, 1.0, 1.0]], &freqs, 0.85);
        assert_eq!(r, vec![300.0]);
        let r = spectral_rolloff(&[vec![9.0, 1.0, 0.0, 0.0]], &freqs, 0.85);
        assert_eq!(r, vec![0.0]);
    }

    #[test]
    fn zcr_of_alternating_signal_is_high() {
        let signal: Vec<f64> = (0..64).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let zcr = zero_crossing_rate(&signal, 16, 8);
        let middle = zcr[zcr.len() / 2];
        assert!((middle - 15.0 / 16.0).abs() < 1e-12);
    }

    #[test]
    fn zcr_of_silence_is_zero() {
        let zcr = zero_crossing_rate(&[0.0; 100], 16, 8);
        assert!(zcr.iter().all(|&z| z == 0.0));
    }
}
