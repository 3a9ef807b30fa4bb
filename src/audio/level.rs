//! Loudness statistics for one PCM window

use super::{SampleBuffer, MAX_AMPLITUDE};
use serde::Serialize;
use thiserror::Error;

/// Analysis errors (non-fatal, the cycle is dropped)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("Empty buffer cannot be analyzed")]
    EmptyBuffer,

    #[error("Frame count mismatch: expected {expected}, got {actual}")]
    FrameCountMismatch { expected: usize, actual: usize },
}

/// Loudness statistics for one window
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LevelMetrics {
    /// Largest absolute sample (0..=32767)
    pub peak_amplitude: u16,

    /// Root-mean-square of the samples (0..=32767)
    pub rms: u16,

    /// peak_amplitude / 32767, in [0, 1]
    pub normalized_amplitude: f64,

    /// 20 * log10(normalized_amplitude); None on pure silence
    pub decibel_level: Option<f64>,
}

impl LevelMetrics {
    /// Pure silence has no defined decibel level
    pub fn is_silent(&self) -> bool {
        self.decibel_level.is_none()
    }
}

/// Turns raw sample windows into `LevelMetrics`
#[derive(Debug, Clone)]
pub struct LevelAnalyzer {
    expected_frames: usize,
}

impl LevelAnalyzer {
    /// Create an analyzer that accepts windows of exactly `expected_frames`
    pub fn new(expected_frames: usize) -> Self {
        Self { expected_frames }
    }

    pub fn expected_frames(&self) -> usize {
        self.expected_frames
    }

    /// Analyze one window. Callers skip empty polls before getting here.
    pub fn analyze(&self, buffer: &SampleBuffer) -> Result<LevelMetrics, AnalysisError> {
        if buffer.is_empty() {
            return Err(AnalysisError::EmptyBuffer);
        }
        if buffer.len() != self.expected_frames {
            return Err(AnalysisError::FrameCountMismatch {
                expected: self.expected_frames,
                actual: buffer.len(),
            });
        }

        let samples = buffer.samples();
        let peak_amplitude = peak(samples);
        let rms = rms(samples);
        let normalized_amplitude = f64::from(peak_amplitude) / f64::from(MAX_AMPLITUDE);

        Ok(LevelMetrics {
            peak_amplitude,
            rms,
            normalized_amplitude,
            decibel_level: decibels(normalized_amplitude),
        })
    }
}

/// |s| clamped to the positive i16 range (-32768 reads as 32767)
fn magnitude(sample: i16) -> u16 {
    sample.saturating_abs() as u16
}

fn peak(samples: &[i16]) -> u16 {
    samples.iter().map(|&s| magnitude(s)).max().unwrap_or(0)
}

fn rms(samples: &[i16]) -> u16 {
    if samples.is_empty() {
        return 0;
    }

    let sum_squares: u64 = samples
        .iter()
        .map(|&s| {
            let m = u64::from(magnitude(s));
            m * m
        })
        .sum();
    let mean = sum_squares as f64 / samples.len() as f64;

    (mean.sqrt().floor() as u16).min(MAX_AMPLITUDE as u16)
}

/// Decibels relative to full scale. log10(0) has no value, so silence is None.
fn decibels(normalized_amplitude: f64) -> Option<f64> {
    if normalized_amplitude > 0.0 {
        Some(20.0 * normalized_amplitude.log10())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer() -> LevelAnalyzer {
        LevelAnalyzer::new(160)
    }

    #[test]
    fn all_zero_buffer_is_silent() {
        let metrics = analyzer().analyze(&SampleBuffer::new(vec![0; 160])).unwrap();

        assert_eq!(metrics.peak_amplitude, 0);
        assert_eq!(metrics.rms, 0);
        assert_eq!(metrics.normalized_amplitude, 0.0);
        assert!(metrics.decibel_level.is_none());
        assert!(metrics.is_silent());
    }

    #[test]
    fn single_full_scale_sample_is_zero_db() {
        let mut samples = vec![0i16; 160];
        samples[37] = 32767;

        let metrics = analyzer().analyze(&SampleBuffer::new(samples)).unwrap();

        assert_eq!(metrics.peak_amplitude, 32767);
        assert_eq!(metrics.normalized_amplitude, 1.0);
        assert_eq!(metrics.decibel_level, Some(0.0));
        // sqrt(32767^2 / 160) = 2590.4...
        assert_eq!(metrics.rms, 2590);
    }

    #[test]
    fn constant_buffer_rms_equals_peak() {
        for v in [1i16, 1000, -1000, 12345, -32767] {
            let metrics = analyzer().analyze(&SampleBuffer::new(vec![v; 160])).unwrap();

            assert_eq!(metrics.rms, v.unsigned_abs());
            assert_eq!(metrics.rms, metrics.peak_amplitude);
        }
    }

    #[test]
    fn constant_thousand_decibels() {
        let metrics = analyzer().analyze(&SampleBuffer::new(vec![1000; 160])).unwrap();

        let expected = 20.0 * (1000.0f64 / 32767.0).log10();
        let db = metrics.decibel_level.unwrap();
        assert!((db - expected).abs() < 1e-12);
        assert!(db < 0.0);
    }

    #[test]
    fn most_negative_sample_saturates() {
        let metrics = analyzer().analyze(&SampleBuffer::new(vec![i16::MIN; 160])).unwrap();

        assert_eq!(metrics.peak_amplitude, 32767);
        assert_eq!(metrics.rms, 32767);
        assert_eq!(metrics.normalized_amplitude, 1.0);
    }

    #[test]
    fn mixed_signs_use_absolute_values() {
        let mut samples = vec![0i16; 160];
        samples[0] = -500;
        samples[1] = 300;

        let metrics = analyzer().analyze(&SampleBuffer::new(samples)).unwrap();
        assert_eq!(metrics.peak_amplitude, 500);
        assert!(metrics.rms <= metrics.peak_amplitude);
    }

    #[test]
    fn empty_buffer_is_rejected() {
        let err = analyzer().analyze(&SampleBuffer::new(Vec::new())).unwrap_err();
        assert_eq!(err, AnalysisError::EmptyBuffer);
    }

    #[test]
    fn short_buffer_is_integrity_failure() {
        let err = analyzer().analyze(&SampleBuffer::new(vec![100; 80])).unwrap_err();
        assert_eq!(
            err,
            AnalysisError::FrameCountMismatch {
                expected: 160,
                actual: 80
            }
        );
    }
}
