//! Syslog-style sink: one key=value line per cycle over UDP

use super::{CycleReport, MetricEvent, MetricSink, SinkError};
use crate::audio::DeviceConfig;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

/// facility user (1) * 8 + severity info (6)
const SYSLOG_PRIORITY: u8 = 14;

/// Sends structured lines to a remote syslog collector
pub struct SyslogSink {
    socket: Option<UdpSocket>,
    target: SocketAddr,
    tag: String,
    device: DeviceConfig,
}

impl SyslogSink {
    /// Resolve the collector and open a non-blocking UDP socket
    pub fn connect(
        host: &str,
        port: u16,
        tag: impl Into<String>,
        device: &DeviceConfig,
    ) -> Result<Self, SinkError> {
        let target = (host, port)
            .to_socket_addrs()
            .map_err(|e| SinkError::ConnectionFailed(format!("{}:{}: {}", host, port, e)))?
            .next()
            .ok_or_else(|| SinkError::ConnectionFailed(format!("{}:{}: no address", host, port)))?;

        let bind_addr: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };

        let socket = UdpSocket::bind(bind_addr)
            .and_then(|s| {
                s.connect(target)?;
                s.set_nonblocking(true)?;
                Ok(s)
            })
            .map_err(|e| SinkError::ConnectionFailed(e.to_string()))?;

        log::info!("Syslog sink sending to {}", target);

        Ok(Self {
            socket: Some(socket),
            target,
            tag: tag.into(),
            device: device.clone(),
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    fn header(&self) -> String {
        format!("<{}>{}:", SYSLOG_PRIORITY, self.tag)
    }

    fn format_cycle(&self, report: &CycleReport) -> String {
        let m = &report.metrics;
        let db = match m.decibel_level {
            Some(db) => db.to_string(),
            None => "silence".to_string(),
        };

        format!(
            "{} audio_rms={} audio_max={} amplitude={} dBg={} channels={} rate={} format={} period={}",
            self.header(),
            m.rms,
            m.peak_amplitude,
            m.normalized_amplitude,
            db,
            self.device.channels,
            self.device.sample_rate,
            self.device.format,
            self.device.period_frames
        )
    }

    fn format_event(&self, event: &MetricEvent) -> String {
        format!(
            "{} {}={} ts={}",
            self.header(),
            event.name,
            event.value,
            event.unix_seconds()
        )
    }

    fn send(&self, line: &str) -> Result<(), SinkError> {
        let socket = self.socket.as_ref().ok_or(SinkError::Closed)?;
        socket
            .send(line.as_bytes())
            .map(|_| ())
            .map_err(|e| SinkError::SendError(e.to_string()))
    }
}

impl MetricSink for SyslogSink {
    fn name(&self) -> &'static str {
        "syslog"
    }

    fn emit(&mut self, event: &MetricEvent) -> Result<(), SinkError> {
        let line = self.format_event(event);
        self.send(&line)
    }

    fn emit_cycle(&mut self, report: &CycleReport) -> Result<(), SinkError> {
        let line = self.format_cycle(report);
        self.send(&line)
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            log::debug!("Syslog sink closed");
        }
    }
}
