//! Live capture source backed by cpal, using a dedicated thread

use super::{DeviceConfig, PcmRead, PcmSource, SampleBuffer, SourceError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, Sample, SampleRate, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Periods buffered between the audio callback and the sampling loop
const FRAME_QUEUE_DEPTH: usize = 64;

/// Native sample formats we can capture, most preferred first.
/// Everything is converted to i16 before analysis.
const FORMAT_PREFERENCE: [cpal::SampleFormat; 3] = [
    cpal::SampleFormat::I16,
    cpal::SampleFormat::F32,
    cpal::SampleFormat::U16,
];

/// Messages from the audio callback to the poller
#[derive(Debug)]
enum CaptureEvent {
    /// One full period
    Frames(Vec<i16>),

    /// Transient stream error
    StreamError(String),
}

/// Device loss flag shared with the stream error callback.
///
/// Kept off the frame queue so a full queue cannot swallow it.
#[derive(Clone, Default)]
struct DeviceLoss(Arc<Mutex<Option<String>>>);

impl DeviceLoss {
    /// Record the loss. The first reason wins.
    fn report(&self, reason: impl Into<String>) {
        let mut slot = self.0.lock();
        if slot.is_none() {
            *slot = Some(reason.into());
        }
    }

    fn check(&self) -> Result<(), SourceError> {
        match self.0.lock().as_ref() {
            Some(reason) => Err(SourceError::Capability(reason.clone())),
            None => Ok(()),
        }
    }
}

/// Commands sent to the capture thread
enum CaptureCommand {
    Stop,
}

/// Live capture source.
///
/// The cpal stream is owned by a dedicated thread; this handle only holds
/// channels, so it can move into the sampling loop.
pub struct CpalSource {
    config: DeviceConfig,

    /// Device name reported by the host
    device_name: String,

    /// Command sender to control the capture thread
    command_tx: mpsc::Sender<CaptureCommand>,

    /// Periods produced by the audio callback
    frames_rx: mpsc::Receiver<CaptureEvent>,

    /// Handle to the capture thread
    thread_handle: Option<JoinHandle<()>>,

    /// Periods dropped because the queue was full
    overruns: Arc<AtomicU64>,

    /// Set by the stream when the device disappears
    device_loss: DeviceLoss,

    /// Overrun count already reported
    reported_overruns: u64,
}

impl CpalSource {
    /// Open and start the configured input device.
    ///
    /// Returns `SourceError::Capability` if the device is missing or
    /// rejects the configuration.
    pub fn open(config: &DeviceConfig) -> Result<Self, SourceError> {
        if config.channels != 1 {
            return Err(SourceError::Capability(format!(
                "unsupported channel count: {}",
                config.channels
            )));
        }
        if config.period_frames == 0 {
            return Err(SourceError::Capability("period size must be non-zero".to_string()));
        }

        let (command_tx, command_rx) = mpsc::channel();
        let (frames_tx, frames_rx) = mpsc::sync_channel(FRAME_QUEUE_DEPTH);
        let (ready_tx, ready_rx) = mpsc::channel();
        let overruns = Arc::new(AtomicU64::new(0));
        let device_loss = DeviceLoss::default();

        let thread_config = config.clone();
        let thread_overruns = overruns.clone();
        let thread_loss = device_loss.clone();
        let thread_handle = thread::Builder::new()
            .name("pcm-capture".to_string())
            .spawn(move || {
                run_capture_thread(
                    thread_config,
                    command_rx,
                    frames_tx,
                    ready_tx,
                    thread_overruns,
                    thread_loss,
                )
            })
            .map_err(|e| SourceError::Capability(format!("capture thread: {}", e)))?;

        let device_name = match ready_rx.recv() {
            Ok(Ok(name)) => name,
            Ok(Err(e)) => {
                let _ = thread_handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread_handle.join();
                return Err(SourceError::Capability(
                    "capture thread exited during setup".to_string(),
                ));
            }
        };

        log::info!(
            "Capturing from '{}': {} ch, {} Hz, {}, {} frames per period",
            device_name,
            config.channels,
            config.sample_rate,
            config.format,
            config.period_frames
        );

        Ok(Self {
            config: config.clone(),
            device_name,
            command_tx,
            frames_rx,
            thread_handle: Some(thread_handle),
            overruns,
            device_loss,
            reported_overruns: 0,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Periods dropped because the sampling loop fell behind
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    fn report_overruns(&mut self) {
        let total = self.overruns();
        if total > self.reported_overruns {
            log::warn!(
                "Capture queue overrun: {} period(s) dropped",
                total - self.reported_overruns
            );
            self.reported_overruns = total;
        }
    }

    fn next_event(&self) -> Result<Option<CaptureEvent>, SourceError> {
        let lost = || SourceError::Capability("capture stream closed".to_string());

        if self.config.poll_timeout.is_zero() {
            match self.frames_rx.try_recv() {
                Ok(event) => Ok(Some(event)),
                Err(mpsc::TryRecvError::Empty) => Ok(None),
                Err(mpsc::TryRecvError::Disconnected) => Err(lost()),
            }
        } else {
            match self.frames_rx.recv_timeout(self.config.poll_timeout) {
                Ok(event) => Ok(Some(event)),
                Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
                Err(mpsc::RecvTimeoutError::Disconnected) => Err(lost()),
            }
        }
    }
}

impl PcmSource for CpalSource {
    fn poll(&mut self) -> Result<PcmRead, SourceError> {
        if self.thread_handle.is_none() {
            return Err(SourceError::Capability("source closed".to_string()));
        }
        self.device_loss.check()?;
        self.report_overruns();

        match self.next_event()? {
            None => Ok(PcmRead::NoData),
            Some(CaptureEvent::Frames(samples)) => {
                Ok(PcmRead::from_buffer(SampleBuffer::new(samples)))
            }
            Some(CaptureEvent::StreamError(msg)) => Err(SourceError::Read(msg)),
        }
    }

    fn config(&self) -> &DeviceConfig {
        &self.config
    }

    fn close(&mut self) {
        let _ = self.command_tx.send(CaptureCommand::Stop);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            log::info!("Capture device '{}' closed", self.device_name);
        }
    }
}

impl Drop for CpalSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Regroups callback-sized chunks into fixed periods
struct PeriodChunker {
    period: usize,
    pending: Vec<i16>,
}

impl PeriodChunker {
    fn new(period: usize) -> Self {
        Self {
            period,
            pending: Vec::with_capacity(period * 2),
        }
    }

    /// Append samples and drain every complete period
    fn push(&mut self, data: &[i16]) -> Vec<Vec<i16>> {
        self.pending.extend_from_slice(data);

        let mut periods = Vec::new();
        while self.pending.len() >= self.period {
            let rest = self.pending.split_off(self.period);
            periods.push(std::mem::replace(&mut self.pending, rest));
        }
        periods
    }
}

/// Run the capture stream in its own thread until told to stop
fn run_capture_thread(
    config: DeviceConfig,
    command_rx: mpsc::Receiver<CaptureCommand>,
    frames_tx: mpsc::SyncSender<CaptureEvent>,
    ready_tx: mpsc::Sender<Result<String, SourceError>>,
    overruns: Arc<AtomicU64>,
    device_loss: DeviceLoss,
) {
    let (stream, name) = match open_stream(&config, frames_tx, overruns, device_loss) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(SourceError::Capability(format!(
            "failed to start stream: {}",
            e
        ))));
        return;
    }

    let _ = ready_tx.send(Ok(name));

    // Either Stop or a dropped handle ends capture
    match command_rx.recv() {
        Ok(CaptureCommand::Stop) => log::debug!("Capture thread stopping"),
        Err(_) => log::debug!("Capture command channel disconnected"),
    }

    drop(stream);
}

/// Find the configured input device
fn select_device(config: &DeviceConfig) -> Result<Device, SourceError> {
    let host = cpal::default_host();

    match &config.device_name {
        Some(wanted) => host
            .input_devices()
            .map_err(|e| SourceError::Capability(e.to_string()))?
            .find(|d| d.name().map(|n| &n == wanted).unwrap_or(false))
            .ok_or_else(|| SourceError::Capability(format!("input device not found: {}", wanted))),
        None => host
            .default_input_device()
            .ok_or_else(|| SourceError::Capability("no default input device".to_string())),
    }
}

/// Best native format among the ranges that fit the configured
/// channel count and rate
fn preferred_format<I>(ranges: I, config: &DeviceConfig) -> Option<cpal::SampleFormat>
where
    I: IntoIterator<Item = SupportedStreamConfigRange>,
{
    let usable: Vec<cpal::SampleFormat> = ranges
        .into_iter()
        .filter(|range| {
            range.channels() == config.channels
                && range.min_sample_rate().0 <= config.sample_rate
                && config.sample_rate <= range.max_sample_rate().0
        })
        .map(|range| range.sample_format())
        .collect();

    FORMAT_PREFERENCE
        .into_iter()
        .find(|format| usable.contains(format))
}

/// Pick the native format to capture in, or reject the device
fn select_format(device: &Device, config: &DeviceConfig) -> Result<cpal::SampleFormat, SourceError> {
    let ranges = device
        .supported_input_configs()
        .map_err(|e| SourceError::Capability(format!("failed to query device: {}", e)))?;

    preferred_format(ranges, config).ok_or_else(|| {
        SourceError::Capability(format!(
            "device rejects {} ch / {} Hz in any of i16, f32, u16",
            config.channels, config.sample_rate
        ))
    })
}

fn open_stream(
    config: &DeviceConfig,
    frames_tx: mpsc::SyncSender<CaptureEvent>,
    overruns: Arc<AtomicU64>,
    device_loss: DeviceLoss,
) -> Result<(cpal::Stream, String), SourceError> {
    let device = select_device(config)?;
    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    let format = select_format(&device, config)?;

    let stream_config = StreamConfig {
        channels: config.channels,
        sample_rate: SampleRate(config.sample_rate),
        buffer_size: BufferSize::Default,
    };
    let period = config.period_frames;

    log::debug!("Device '{}' delivers {:?}, converting to {}", name, format, config.format);

    let stream = match format {
        cpal::SampleFormat::I16 => {
            build_stream::<i16>(&device, &stream_config, period, frames_tx, overruns, device_loss)
        }
        cpal::SampleFormat::F32 => {
            build_stream::<f32>(&device, &stream_config, period, frames_tx, overruns, device_loss)
        }
        cpal::SampleFormat::U16 => {
            build_stream::<u16>(&device, &stream_config, period, frames_tx, overruns, device_loss)
        }
        other => {
            return Err(SourceError::Capability(format!(
                "unsupported sample format: {:?}",
                other
            )))
        }
    }
    .map_err(|e| SourceError::Capability(format!("failed to build stream: {}", e)))?;

    Ok((stream, name))
}

fn build_stream<T>(
    device: &Device,
    stream_config: &StreamConfig,
    period_frames: usize,
    frames_tx: mpsc::SyncSender<CaptureEvent>,
    overruns: Arc<AtomicU64>,
    device_loss: DeviceLoss,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample,
    i16: cpal::FromSample<T>,
{
    let error_tx = frames_tx.clone();
    let mut chunker = PeriodChunker::new(period_frames);

    device.build_input_stream(
        stream_config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let samples: Vec<i16> = data.iter().map(|s| i16::from_sample(*s)).collect();

            for period in chunker.push(&samples) {
                match frames_tx.try_send(CaptureEvent::Frames(period)) {
                    Ok(()) => {}
                    Err(mpsc::TrySendError::Full(_)) => {
                        overruns.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(mpsc::TrySendError::Disconnected(_)) => return,
                }
            }
        },
        move |err| {
            log::error!("Audio stream error: {}", err);
            match err {
                cpal::StreamError::DeviceNotAvailable => {
                    device_loss.report("capture device no longer available")
                }
                other => {
                    let _ = error_tx.try_send(CaptureEvent::StreamError(other.to_string()));
                }
            }
        },
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpal::SupportedBufferSize;

    fn range(channels: u16, min: u32, max: u32, format: cpal::SampleFormat) -> SupportedStreamConfigRange {
        SupportedStreamConfigRange::new(
            channels,
            SampleRate(min),
            SampleRate(max),
            SupportedBufferSize::Unknown,
            format,
        )
    }

    /// A source wired to in-memory channels instead of a device
    fn detached_source(queue_depth: usize) -> (CpalSource, mpsc::SyncSender<CaptureEvent>, DeviceLoss) {
        let (command_tx, _command_rx) = mpsc::channel();
        let (frames_tx, frames_rx) = mpsc::sync_channel(queue_depth);
        let device_loss = DeviceLoss::default();

        let source = CpalSource {
            config: DeviceConfig::default(),
            device_name: "detached".to_string(),
            command_tx,
            frames_rx,
            thread_handle: Some(thread::spawn(|| {})),
            overruns: Arc::new(AtomicU64::new(0)),
            device_loss: device_loss.clone(),
            reported_overruns: 0,
        };
        (source, frames_tx, device_loss)
    }

    #[test]
    fn f32_only_device_is_accepted() {
        let config = DeviceConfig::default();
        let ranges = vec![range(1, 8000, 48000, cpal::SampleFormat::F32)];

        assert_eq!(preferred_format(ranges, &config), Some(cpal::SampleFormat::F32));
    }

    #[test]
    fn i16_is_preferred_when_offered() {
        let config = DeviceConfig::default();
        let ranges = vec![
            range(1, 8000, 48000, cpal::SampleFormat::U16),
            range(1, 8000, 48000, cpal::SampleFormat::F32),
            range(1, 8000, 48000, cpal::SampleFormat::I16),
        ];

        assert_eq!(preferred_format(ranges, &config), Some(cpal::SampleFormat::I16));
    }

    #[test]
    fn ranges_outside_rate_or_channels_are_ignored() {
        let config = DeviceConfig::default();
        let ranges = vec![
            range(2, 8000, 48000, cpal::SampleFormat::I16),
            range(1, 44100, 48000, cpal::SampleFormat::F32),
            range(1, 8000, 8000, cpal::SampleFormat::U16),
        ];
        assert_eq!(preferred_format(ranges, &config), Some(cpal::SampleFormat::U16));

        let ranges = vec![range(1, 8000, 48000, cpal::SampleFormat::F64)];
        assert_eq!(preferred_format(ranges, &config), None);
    }

    #[test]
    fn native_samples_convert_to_full_scale_i16() {
        assert_eq!(i16::from_sample(1.0f32), i16::MAX);
        assert_eq!(i16::from_sample(-1.0f32), i16::MIN);
        assert_eq!(i16::from_sample(0.0f32), 0);
        assert_eq!(i16::from_sample(32768u16), 0);
        assert_eq!(i16::from_sample(0u16), i16::MIN);
    }

    #[test]
    fn device_loss_keeps_first_reason() {
        let loss = DeviceLoss::default();
        assert_eq!(loss.check(), Ok(()));

        loss.report("unplugged");
        loss.report("later");

        let err = loss.check().unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err, SourceError::Capability("unplugged".to_string()));
    }

    #[test]
    fn device_loss_is_seen_even_when_frame_queue_is_full() {
        let (mut source, frames_tx, loss) = detached_source(1);
        frames_tx.try_send(CaptureEvent::Frames(vec![0; 160])).unwrap();
        assert!(matches!(
            frames_tx.try_send(CaptureEvent::Frames(vec![0; 160])),
            Err(mpsc::TrySendError::Full(_))
        ));

        loss.report("capture device no longer available");

        let err = source.poll().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn queued_periods_are_delivered_while_device_is_present() {
        let (mut source, frames_tx, _loss) = detached_source(4);
        frames_tx.try_send(CaptureEvent::Frames(vec![5; 160])).unwrap();
        frames_tx.try_send(CaptureEvent::StreamError("xrun".to_string())).unwrap();

        assert!(matches!(source.poll().unwrap(), PcmRead::Frames(ref b) if b.len() == 160));
        assert!(matches!(source.poll(), Err(SourceError::Read(_))));
        assert_eq!(source.poll().unwrap(), PcmRead::NoData);
    }

    #[test]
    fn chunker_waits_for_full_period() {
        let mut chunker = PeriodChunker::new(4);
        assert!(chunker.push(&[1, 2, 3]).is_empty());

        let periods = chunker.push(&[4, 5]);
        assert_eq!(periods, vec![vec![1, 2, 3, 4]]);
    }

    #[test]
    fn chunker_splits_large_callbacks_in_order() {
        let mut chunker = PeriodChunker::new(3);
        let periods = chunker.push(&[1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(periods, vec![vec![1, 2, 3], vec![4, 5, 6]]);

        let periods = chunker.push(&[8, 9]);
        assert_eq!(periods, vec![vec![7, 8, 9]]);
    }

    #[test]
    fn every_emitted_period_has_exact_length() {
        let mut chunker = PeriodChunker::new(160);
        let mut total = 0;
        for size in [37usize, 441, 160, 1, 999] {
            for period in chunker.push(&vec![7i16; size]) {
                assert_eq!(period.len(), 160);
                total += 1;
            }
        }
        assert_eq!(total, (37 + 441 + 160 + 1 + 999) / 160);
    }
}
