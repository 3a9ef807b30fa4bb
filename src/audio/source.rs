//! PCM source abstraction

use super::{DeviceConfig, BYTES_PER_FRAME};
use thiserror::Error;

/// PCM source errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    /// Device cannot be opened or rejected its configuration. Ends the loop.
    #[error("Device capability failure: {0}")]
    Capability(String),

    /// Transient read error. The cycle is skipped.
    #[error("Device read failure: {0}")]
    Read(String),
}

impl SourceError {
    /// Whether this error must terminate sampling
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::Capability(_))
    }
}

/// One window of signed 16-bit mono samples
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleBuffer {
    samples: Vec<i16>,
}

impl SampleBuffer {
    pub fn new(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    /// Decode raw S16_LE bytes
    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self, SourceError> {
        if bytes.len() % BYTES_PER_FRAME != 0 {
            return Err(SourceError::Read(format!(
                "odd PCM byte count: {}",
                bytes.len()
            )));
        }

        let samples = bytes
            .chunks_exact(BYTES_PER_FRAME)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        Ok(Self { samples })
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Result of a single poll
#[derive(Debug, Clone, PartialEq)]
pub enum PcmRead {
    /// Device had nothing ready
    NoData,

    /// A captured window
    Frames(SampleBuffer),
}

impl PcmRead {
    /// Wrap a buffer, treating zero length as "no data yet"
    pub fn from_buffer(buffer: SampleBuffer) -> Self {
        if buffer.is_empty() {
            PcmRead::NoData
        } else {
            PcmRead::Frames(buffer)
        }
    }
}

/// A capture device polled by the sampling loop.
///
/// `poll` never waits longer than the configured `poll_timeout`.
pub trait PcmSource: Send {
    /// Fetch the next window, or `NoData` if nothing is ready
    fn poll(&mut self) -> Result<PcmRead, SourceError>;

    /// Fixed configuration this source was opened with
    fn config(&self) -> &DeviceConfig;

    /// Release the device. Safe to call more than once.
    fn close(&mut self) {}
}

impl<T: PcmSource + ?Sized> PcmSource for Box<T> {
    fn poll(&mut self) -> Result<PcmRead, SourceError> {
        (**self).poll()
    }

    fn config(&self) -> &DeviceConfig {
        (**self).config()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_le_bytes_decodes_signed_samples() {
        let buffer = SampleBuffer::from_le_bytes(&[0xff, 0x7f, 0x00, 0x80, 0xe8, 0x03]).unwrap();
        assert_eq!(buffer.samples(), &[32767, -32768, 1000]);
    }

    #[test]
    fn from_le_bytes_rejects_odd_length() {
        let err = SampleBuffer::from_le_bytes(&[0x01, 0x02, 0x03]).unwrap_err();
        assert!(matches!(err, SourceError::Read(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn empty_buffer_reads_as_no_data() {
        assert_eq!(PcmRead::from_buffer(SampleBuffer::new(Vec::new())), PcmRead::NoData);

        let read = PcmRead::from_buffer(SampleBuffer::new(vec![0; 4]));
        assert!(matches!(read, PcmRead::Frames(ref b) if b.len() == 4));
    }

    #[test]
    fn only_capability_failures_are_fatal() {
        assert!(SourceError::Capability("gone".to_string()).is_fatal());
        assert!(!SourceError::Read("xrun".to_string()).is_fatal());
    }
}
