//! Metric events and the sinks that deliver them

mod console;
mod graphite;
mod syslog;

pub use console::{ConsoleFormat, ConsoleSink};
pub use graphite::{format_line, ConnectionMode, DeliveryStats, GraphiteSink, GraphiteSinkConfig};
pub use syslog::SyslogSink;

use crate::audio::LevelMetrics;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Default namespace for metric names
pub const DEFAULT_PREFIX: &str = "sounding";

/// Sink delivery errors. Never fatal to the sampling loop.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send error: {0}")]
    SendError(String),

    #[error("Delivery queue full, metric dropped")]
    QueueFull,

    #[error("Sink closed")]
    Closed,

    #[error("Encode error: {0}")]
    EncodeError(String),
}

/// Numeric metric value, kept integral where the source is integral
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
}

impl MetricValue {
    pub fn as_f64(&self) -> f64 {
        match *self {
            MetricValue::Int(v) => v as f64,
            MetricValue::Float(v) => v,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Int(v) => write!(f, "{}", v),
            MetricValue::Float(v) => write!(f, "{}", v),
        }
    }
}

/// One named, timestamped value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricEvent {
    /// Dot-namespaced metric name
    pub name: String,

    pub value: MetricValue,

    /// Seconds since the Unix epoch
    pub timestamp: f64,
}

impl MetricEvent {
    pub fn new(name: impl Into<String>, value: MetricValue, timestamp: f64) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp,
        }
    }

    /// Whole seconds since the epoch
    pub fn unix_seconds(&self) -> i64 {
        self.timestamp.floor() as i64
    }
}

/// Builds namespaced metric names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricNames {
    prefix: String,
}

impl MetricNames {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `<prefix>.<leaf>`, or just the leaf when the prefix is empty
    pub fn name(&self, leaf: &str) -> String {
        if self.prefix.is_empty() {
            leaf.to_string()
        } else {
            format!("{}.{}", self.prefix, leaf)
        }
    }

    pub fn rms(&self) -> String {
        self.name("audio_rms")
    }

    pub fn peak(&self) -> String {
        self.name("audio_max")
    }

    pub fn amplitude(&self) -> String {
        self.name("amplitude")
    }

    pub fn decibels(&self) -> String {
        self.name("dBg")
    }
}

impl Default for MetricNames {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

/// Everything emitted for one analyzed window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    /// Shared by every event in this cycle
    pub timestamp: f64,

    pub metrics: LevelMetrics,

    pub events: Vec<MetricEvent>,
}

impl CycleReport {
    /// Derive the cycle's events. dBg is omitted on silence.
    pub fn new(metrics: LevelMetrics, timestamp: f64, names: &MetricNames) -> Self {
        let mut events = vec![
            MetricEvent::new(names.rms(), MetricValue::Int(metrics.rms.into()), timestamp),
            MetricEvent::new(
                names.peak(),
                MetricValue::Int(metrics.peak_amplitude.into()),
                timestamp,
            ),
            MetricEvent::new(
                names.amplitude(),
                MetricValue::Float(metrics.normalized_amplitude),
                timestamp,
            ),
        ];

        if let Some(db) = metrics.decibel_level {
            events.push(MetricEvent::new(
                names.decibels(),
                MetricValue::Float(db),
                timestamp,
            ));
        }

        Self {
            timestamp,
            metrics,
            events,
        }
    }
}

/// Delivery endpoint for metric events.
///
/// Delivery is best effort. Implementations own their connection
/// lifecycle and must return quickly; errors are reported, never retried
/// by the caller.
pub trait MetricSink: Send {
    /// Short label used in logs
    fn name(&self) -> &'static str;

    /// Deliver one event
    fn emit(&mut self, event: &MetricEvent) -> Result<(), SinkError>;

    /// Deliver a whole cycle. Every event is attempted; the last failure
    /// is returned.
    fn emit_cycle(&mut self, report: &CycleReport) -> Result<(), SinkError> {
        let mut result = Ok(());
        for event in &report.events {
            if let Err(e) = self.emit(event) {
                result = Err(e);
            }
        }
        result
    }

    /// Release connections. Safe to call more than once.
    fn close(&mut self) {}
}
