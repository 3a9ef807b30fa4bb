//! Runtime configuration from the environment
//!
//! A sink exists only when its configuration is present: no
//! `COLLECTD_HOST` means no network sink, no `SYSLOG_HOST` means no
//! syslog sink.

use crate::audio::DeviceConfig;
use crate::metrics::{ConnectionMode, ConsoleFormat, GraphiteSinkConfig, DEFAULT_PREFIX};
use crate::sampler::DEFAULT_INTERVAL;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default carbon plaintext port
pub const DEFAULT_GRAPHITE_PORT: u16 = 2003;

/// Default syslog port
pub const DEFAULT_SYSLOG_PORT: u16 = 514;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Unsupported configuration: {0}")]
    Unsupported(String),
}

/// Remote syslog collector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyslogConfig {
    pub host: String,
    pub port: u16,
}

/// Complete probe configuration
#[derive(Debug, Clone)]
pub struct SoundingConfig {
    /// Capture device parameters
    pub device: DeviceConfig,

    /// Replay this raw PCM file instead of opening a device
    pub pcm_file: Option<PathBuf>,

    /// Metric name prefix
    pub prefix: String,

    /// Pause between polls
    pub interval: Duration,

    /// Network sink (None = disabled)
    pub graphite: Option<GraphiteSinkConfig>,

    /// Syslog sink (None = disabled)
    pub syslog: Option<SyslogConfig>,

    /// Console sink (None = disabled)
    pub console: Option<ConsoleFormat>,
}

impl Default for SoundingConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            pcm_file: None,
            prefix: DEFAULT_PREFIX.to_string(),
            interval: DEFAULT_INTERVAL,
            graphite: None,
            syslog: None,
            console: Some(ConsoleFormat::Text),
        }
    }
}

impl SoundingConfig {
    /// Read the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let channels: u16 = parse_or(&get, "SOUNDING_CHANNELS", defaults.device.channels)?;
        if channels != 1 {
            return Err(ConfigError::Unsupported(format!(
                "SOUNDING_CHANNELS={} (only mono capture is supported)",
                channels
            )));
        }

        let sample_rate: u32 = parse_or(&get, "SOUNDING_RATE", defaults.device.sample_rate)?;
        if sample_rate == 0 {
            return Err(invalid("SOUNDING_RATE", "0", "must be positive"));
        }

        let period_frames: usize =
            parse_or(&get, "SOUNDING_PERIOD_FRAMES", defaults.device.period_frames)?;
        if period_frames == 0 {
            return Err(invalid("SOUNDING_PERIOD_FRAMES", "0", "must be positive"));
        }

        let poll_timeout_ms: u64 = parse_or(&get, "SOUNDING_POLL_TIMEOUT_MS", 0)?;
        let interval_ms: u64 = parse_or(
            &get,
            "SOUNDING_INTERVAL_MS",
            defaults.interval.as_millis() as u64,
        )?;

        let device = DeviceConfig {
            device_name: get("SOUNDING_DEVICE"),
            channels,
            sample_rate,
            period_frames,
            poll_timeout: Duration::from_millis(poll_timeout_ms),
            ..defaults.device
        };

        let graphite = match get("COLLECTD_HOST") {
            Some(host) => Some(GraphiteSinkConfig {
                host,
                port: parse_or(&get, "COLLECTD_PORT", DEFAULT_GRAPHITE_PORT)?,
                mode: parse_mode(get("SOUNDING_GRAPHITE_MODE"))?,
                ..Default::default()
            }),
            None => None,
        };

        let syslog = match get("SYSLOG_HOST") {
            Some(host) => Some(SyslogConfig {
                host,
                port: parse_or(&get, "SYSLOG_PORT", DEFAULT_SYSLOG_PORT)?,
            }),
            None => None,
        };

        let console_enabled = match get("SOUNDING_CONSOLE") {
            Some(v) => parse_bool("SOUNDING_CONSOLE", &v)?,
            None => true,
        };
        let console = if console_enabled {
            Some(parse_console_format(get("SOUNDING_CONSOLE_FORMAT"))?)
        } else {
            None
        };

        Ok(Self {
            device,
            pcm_file: get("SOUNDING_PCM_FILE").map(PathBuf::from),
            prefix: get("SOUNDING_PREFIX").unwrap_or(defaults.prefix),
            interval: Duration::from_millis(interval_ms),
            graphite,
            syslog,
            console,
        })
    }
}

fn invalid(key: &str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| invalid(key, &raw, e.to_string())),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, raw, "expected true or false")),
    }
}

fn parse_mode(raw: Option<String>) -> Result<ConnectionMode, ConfigError> {
    match raw.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None | Some("keepalive") | Some("keep-alive") => Ok(ConnectionMode::KeepAlive),
        Some("per-metric") | Some("permetric") => Ok(ConnectionMode::PerMetric),
        Some(other) => Err(invalid(
            "SOUNDING_GRAPHITE_MODE",
            other,
            "expected keepalive or per-metric",
        )),
    }
}

fn parse_console_format(raw: Option<String>) -> Result<ConsoleFormat, ConfigError> {
    match raw.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None | Some("text") => Ok(ConsoleFormat::Text),
        Some("json") => Ok(ConsoleFormat::Json),
        Some(other) => Err(invalid(
            "SOUNDING_CONSOLE_FORMAT",
            other,
            "expected text or json",
        )),
    }
}
