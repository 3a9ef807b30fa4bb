//! Sampling loop: poll the source, analyze, emit to every sink
//!
//! One cycle at a time on one thread. The loop only suspends in the
//! bounded device poll and in the fixed inter-sample pause.

use crate::audio::{AnalysisError, LevelAnalyzer, PcmRead, PcmSource, SampleBuffer, SourceError};
use crate::metrics::{CycleReport, MetricNames, MetricSink};
use crate::state::{LoopState, SamplerStats};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Default pause between polls
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(10);

/// Errors that end sampling
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SamplerError {
    #[error("Sampling terminated: {0}")]
    DeviceLost(SourceError),
}

/// Wall clock used to timestamp cycles
pub trait Clock: Send {
    /// Seconds since the Unix epoch
    fn now(&self) -> f64;
}

/// System time clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Fixed-interval pacing. No drift correction: every cycle is followed
/// by the same pause regardless of how long the cycle took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    interval: Duration,
}

impl Pacing {
    pub fn fixed(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn pause(&self) {
        if !self.interval.is_zero() {
            std::thread::sleep(self.interval);
        }
    }
}

impl Default for Pacing {
    fn default() -> Self {
        Self::fixed(DEFAULT_INTERVAL)
    }
}

/// What one cycle did
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Device had nothing ready
    NoData,

    /// Transient read error, cycle skipped
    ReadFailed(SourceError),

    /// Buffer failed integrity checks, nothing emitted
    Dropped(AnalysisError),

    /// Metrics were handed to the sinks
    Emitted {
        report: CycleReport,
        /// Sinks that reported a delivery failure
        failures: usize,
    },
}

struct SinkSlot {
    sink: Box<dyn MetricSink>,
    /// Suppresses repeated warnings while a sink keeps failing
    failing: bool,
}

/// The sampling loop
pub struct Sampler<S: PcmSource> {
    source: S,
    analyzer: LevelAnalyzer,
    sinks: Vec<SinkSlot>,
    names: MetricNames,
    pacing: Pacing,
    clock: Box<dyn Clock>,
    state: LoopState,
    stats: SamplerStats,
    released: bool,
}

impl<S: PcmSource> Sampler<S> {
    /// Wire a source to its sinks. The analyzer expects the source's period size.
    pub fn new(
        source: S,
        sinks: Vec<Box<dyn MetricSink>>,
        names: MetricNames,
        pacing: Pacing,
    ) -> Self {
        let analyzer = LevelAnalyzer::new(source.config().period_frames);
        Self {
            source,
            analyzer,
            sinks: sinks
                .into_iter()
                .map(|sink| SinkSlot {
                    sink,
                    failing: false,
                })
                .collect(),
            names,
            pacing,
            clock: Box::new(SystemClock),
            state: LoopState::Polling,
            stats: SamplerStats::default(),
            released: false,
        }
    }

    /// Replace the timestamp clock
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> SamplerStats {
        self.stats
    }

    pub fn sink_names(&self) -> Vec<&'static str> {
        self.sinks.iter().map(|slot| slot.sink.name()).collect()
    }

    /// Run one poll/analyze/emit cycle without pausing.
    ///
    /// Only a fatal device failure returns `Err`, after which the sampler
    /// is terminated.
    pub fn run_cycle(&mut self) -> Result<CycleOutcome, SourceError> {
        if self.state == LoopState::Terminated {
            return Err(SourceError::Capability("sampler terminated".to_string()));
        }

        let polled = match self.source.poll() {
            Err(e) if e.is_fatal() => {
                self.state = LoopState::Terminated;
                return Err(e);
            }
            polled => polled,
        };

        // Only cycles that survive the poll are counted
        self.stats.cycles += 1;

        match polled {
            Ok(PcmRead::NoData) => {
                self.stats.empty_polls += 1;
                Ok(CycleOutcome::NoData)
            }
            Ok(PcmRead::Frames(buffer)) => Ok(self.process(buffer)),
            Err(e) => {
                self.stats.read_failures += 1;
                log::warn!("{}; skipping cycle", e);
                Ok(CycleOutcome::ReadFailed(e))
            }
        }
    }

    /// Analyze one owned buffer; it is dropped when this returns
    fn process(&mut self, buffer: SampleBuffer) -> CycleOutcome {
        let metrics = match self.analyzer.analyze(&buffer) {
            Ok(metrics) => metrics,
            Err(e) => {
                self.stats.dropped_buffers += 1;
                log::warn!("Dropping buffer: {}", e);
                return CycleOutcome::Dropped(e);
            }
        };

        // One timestamp for every metric in this cycle
        let timestamp = self.clock.now();
        let report = CycleReport::new(metrics, timestamp, &self.names);

        if metrics.is_silent() {
            self.stats.silent_cycles += 1;
            log::trace!("Silent window, dBg omitted");
        }

        let failures = self.dispatch(&report);
        CycleOutcome::Emitted { report, failures }
    }

    fn dispatch(&mut self, report: &CycleReport) -> usize {
        self.stats.events_emitted += report.events.len() as u64;

        let mut failures = 0;
        for slot in &mut self.sinks {
            match slot.sink.emit_cycle(report) {
                Ok(()) => {
                    if slot.failing {
                        log::info!("Sink '{}' recovered", slot.sink.name());
                        slot.failing = false;
                    }
                }
                Err(e) => {
                    failures += 1;
                    if !slot.failing {
                        log::warn!("Sink '{}' delivery failed: {}", slot.sink.name(), e);
                        slot.failing = true;
                    } else {
                        log::debug!("Sink '{}' delivery failed: {}", slot.sink.name(), e);
                    }
                }
            }
        }

        self.stats.sink_failures += failures as u64;
        failures
    }

    /// Run until `shutdown` is set or the device fails.
    ///
    /// The shutdown flag is checked between cycles. The source and every
    /// sink are released before this returns, on every path.
    pub fn run(mut self, shutdown: &AtomicBool) -> Result<SamplerStats, SamplerError> {
        log::info!(
            "Sampling every {:?} into {} sink(s): {}",
            self.pacing.interval(),
            self.sinks.len(),
            self.sink_names().join(", ")
        );

        let result = loop {
            if shutdown.load(Ordering::SeqCst) {
                log::info!("Shutdown requested");
                break Ok(());
            }

            if let Err(e) = self.run_cycle() {
                break Err(e);
            }

            self.pacing.pause();
        };

        self.state = LoopState::Terminated;
        self.release();

        let stats = self.stats;
        log::info!(
            "Sampling stopped after {} cycles ({} analyzed, {} events)",
            stats.cycles,
            stats.analyzed_cycles(),
            stats.events_emitted
        );

        result.map(|()| stats).map_err(|e| {
            log::error!("{}", e);
            SamplerError::DeviceLost(e)
        })
    }

    /// Close the source and every sink exactly once
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        self.source.close();
        for slot in &mut self.sinks {
            slot.sink.close();
        }
    }
}

impl<S: PcmSource> Drop for Sampler<S> {
    fn drop(&mut self) {
        self.release();
    }
}
