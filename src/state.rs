//! Sampling loop state

use serde::Serialize;

/// Loop lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// Running cycles
    #[default]
    Polling,

    /// Stopped after a fatal device failure or shutdown
    Terminated,
}

/// Running totals kept by the sampling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct SamplerStats {
    /// Completed cycles of any kind. A poll that ends sampling is not one.
    pub cycles: u64,

    /// Polls that returned no data
    pub empty_polls: u64,

    /// Transient device read failures
    pub read_failures: u64,

    /// Buffers dropped by the analyzer
    pub dropped_buffers: u64,

    /// Analyzed windows of pure silence (no dBg emitted)
    pub silent_cycles: u64,

    /// Events handed to sinks
    pub events_emitted: u64,

    /// Sink delivery failures
    pub sink_failures: u64,
}

impl SamplerStats {
    /// Cycles that produced metrics
    pub fn analyzed_cycles(&self) -> u64 {
        self.cycles - self.empty_polls - self.read_failures - self.dropped_buffers
    }
}
