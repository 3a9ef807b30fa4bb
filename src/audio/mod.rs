//! Audio capture and level analysis module

mod capture;
mod file;
mod level;
mod source;

pub use capture::CpalSource;
pub use file::FileSource;
pub use level::{AnalysisError, LevelAnalyzer, LevelMetrics};
pub use source::{PcmRead, PcmSource, SampleBuffer, SourceError};

use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Largest positive value of a signed 16-bit sample
pub const MAX_AMPLITUDE: i16 = i16::MAX;

/// Bytes per frame for mono S16_LE
pub const BYTES_PER_FRAME: usize = 2;

/// Sample encoding accepted from the capture device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SampleFormat {
    /// Signed 16-bit little-endian
    S16Le,
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleFormat::S16Le => f.write_str("S16_LE"),
        }
    }
}

/// Capture device configuration, fixed for the lifetime of a source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceConfig {
    /// Input device name (None = host default input)
    pub device_name: Option<String>,

    /// Channel count (mono only)
    pub channels: u16,

    /// Sample rate in Hz
    pub sample_rate: u32,

    /// Sample encoding
    pub format: SampleFormat,

    /// Frames per non-empty read
    pub period_frames: usize,

    /// Upper bound a single poll may wait for data
    #[serde(skip)]
    pub poll_timeout: Duration,
}

impl DeviceConfig {
    /// Bytes in one full period
    pub fn period_bytes(&self) -> usize {
        self.period_frames * BYTES_PER_FRAME * self.channels as usize
    }

    /// Wall-clock length of one full period
    pub fn period_duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.period_frames as f64 / self.sample_rate as f64)
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            channels: 1,
            sample_rate: 8000,
            format: SampleFormat::S16Le,
            period_frames: 160,
            poll_timeout: Duration::ZERO,
        }
    }
}
