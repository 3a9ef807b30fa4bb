//! Console sink: metric lines through the log facade

use super::{CycleReport, MetricEvent, MetricSink, SinkError};

/// Log target for metric lines, so they can be filtered separately
const METRIC_TARGET: &str = "sounding::metrics";

/// Console line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsoleFormat {
    /// key=value pairs
    #[default]
    Text,

    /// One JSON object per line
    Json,
}

/// Writes metrics to the process log
#[derive(Debug, Clone, Default)]
pub struct ConsoleSink {
    format: ConsoleFormat,
}

impl ConsoleSink {
    pub fn new(format: ConsoleFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> ConsoleFormat {
        self.format
    }

    fn format_event(&self, event: &MetricEvent) -> Result<String, SinkError> {
        match self.format {
            ConsoleFormat::Text => Ok(format!(
                "{}={} ts={}",
                event.name,
                event.value,
                event.unix_seconds()
            )),
            ConsoleFormat::Json => {
                serde_json::to_string(event).map_err(|e| SinkError::EncodeError(e.to_string()))
            }
        }
    }

    fn format_cycle(&self, report: &CycleReport) -> Result<String, SinkError> {
        match self.format {
            ConsoleFormat::Text => {
                let mut line = report
                    .events
                    .iter()
                    .map(|e| format!("{}={}", e.name, e.value))
                    .collect::<Vec<_>>()
                    .join(" ");
                if report.metrics.is_silent() {
                    line.push_str(" silence=true");
                }
                line.push_str(&format!(" ts={}", report.timestamp.floor() as i64));
                Ok(line)
            }
            ConsoleFormat::Json => {
                serde_json::to_string(report).map_err(|e| SinkError::EncodeError(e.to_string()))
            }
        }
    }
}

impl MetricSink for ConsoleSink {
    fn name(&self) -> &'static str {
        "console"
    }

    fn emit(&mut self, event: &MetricEvent) -> Result<(), SinkError> {
        let line = self.format_event(event)?;
        log::info!(target: METRIC_TARGET, "{}", line);
        Ok(())
    }

    fn emit_cycle(&mut self, report: &CycleReport) -> Result<(), SinkError> {
        let line = self.format_cycle(report)?;
        log::info!(target: METRIC_TARGET, "{}", line);
        Ok(())
    }
}
