//! Raw PCM replay source
//!
//! Reads headerless S16_LE mono data (e.g. `arecord -t raw -f S16_LE`)
//! one period per poll. Useful for probing recorded material and for
//! running the loop on hosts without a capture device.

use super::{DeviceConfig, PcmRead, PcmSource, SampleBuffer, SourceError};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

/// Replays a raw PCM file through the `PcmSource` contract
pub struct FileSource {
    path: PathBuf,
    reader: Option<File>,
    config: DeviceConfig,
    exhausted: bool,
}

impl FileSource {
    /// Open a raw PCM file
    pub fn open(path: impl AsRef<Path>, config: &DeviceConfig) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();
        if config.channels != 1 {
            return Err(SourceError::Capability(format!(
                "unsupported channel count: {}",
                config.channels
            )));
        }

        let reader = File::open(&path)
            .map_err(|e| SourceError::Capability(format!("{}: {}", path.display(), e)))?;

        log::info!(
            "Replaying PCM from {} ({} frames per period)",
            path.display(),
            config.period_frames
        );

        Ok(Self {
            path,
            reader: Some(reader),
            config: config.clone(),
            exhausted: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fill up to one period. Returns the number of bytes read.
    fn read_period(reader: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

impl PcmSource for FileSource {
    fn poll(&mut self) -> Result<PcmRead, SourceError> {
        if self.exhausted {
            return Ok(PcmRead::NoData);
        }

        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| SourceError::Capability("source closed".to_string()))?;

        let mut bytes = vec![0u8; self.config.period_bytes()];
        let filled =
            Self::read_period(reader, &mut bytes).map_err(|e| SourceError::Read(e.to_string()))?;

        if filled < bytes.len() {
            log::info!("End of PCM file {}", self.path.display());
            self.exhausted = true;
        }

        bytes.truncate(filled);
        SampleBuffer::from_le_bytes(&bytes).map(PcmRead::from_buffer)
    }

    fn config(&self) -> &DeviceConfig {
        &self.config
    }

    fn close(&mut self) {
        if self.reader.take().is_some() {
            log::debug!("Closed PCM file {}", self.path.display());
        }
    }
}

impl Drop for FileSource {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_pcm(name: &str, samples: &[i16]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("sounding-{}-{}.raw", name, std::process::id()));
        let mut file = File::create(&path).unwrap();
        for s in samples {
            file.write_all(&s.to_le_bytes()).unwrap();
        }
        path
    }

    fn small_config() -> DeviceConfig {
        DeviceConfig {
            period_frames: 4,
            ..Default::default()
        }
    }

    #[test]
    fn replays_full_periods_then_no_data() {
        let path = write_pcm("full", &[1, 2, 3, 4, -5, -6, -7, -8]);
        let mut source = FileSource::open(&path, &small_config()).unwrap();

        assert_eq!(
            source.poll().unwrap(),
            PcmRead::Frames(SampleBuffer::new(vec![1, 2, 3, 4]))
        );
        assert_eq!(
            source.poll().unwrap(),
            PcmRead::Frames(SampleBuffer::new(vec![-5, -6, -7, -8]))
        );
        assert_eq!(source.poll().unwrap(), PcmRead::NoData);
        assert_eq!(source.poll().unwrap(), PcmRead::NoData);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn trailing_partial_period_is_short_buffer() {
        let path = write_pcm("partial", &[10, 20, 30, 40, 50, 60]);
        let mut source = FileSource::open(&path, &small_config()).unwrap();

        assert!(matches!(source.poll().unwrap(), PcmRead::Frames(ref b) if b.len() == 4));
        assert_eq!(
            source.poll().unwrap(),
            PcmRead::Frames(SampleBuffer::new(vec![50, 60]))
        );
        assert_eq!(source.poll().unwrap(), PcmRead::NoData);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn missing_file_is_capability_failure() {
        let path = std::env::temp_dir().join("sounding-does-not-exist.raw");
        let err = FileSource::open(&path, &DeviceConfig::default()).err().unwrap();
        assert!(err.is_fatal());
    }

    #[test]
    fn stereo_is_rejected() {
        let path = write_pcm("stereo", &[0, 0]);
        let config = DeviceConfig {
            channels: 2,
            ..Default::default()
        };
        let err = FileSource::open(&path, &config).err().unwrap();
        assert!(matches!(err, SourceError::Capability(_)));

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn poll_after_close_is_fatal() {
        let path = write_pcm("closed", &[1, 2, 3, 4]);
        let mut source = FileSource::open(&path, &small_config()).unwrap();
        source.close();
        source.close();

        let err = source.poll().unwrap_err();
        assert!(err.is_fatal());

        let _ = std::fs::remove_file(path);
    }
}
