//! Sounding audio level probe
//!
//! Continuously samples an audio input, derives loudness metrics from each
//! window and ships them, timestamped, to monitoring sinks.

pub mod audio;
pub mod config;
pub mod metrics;
pub mod sampler;
pub mod state;

use audio::{CpalSource, FileSource, PcmSource, SourceError};
use config::SoundingConfig;
use metrics::{ConsoleSink, GraphiteSink, MetricNames, MetricSink, SyslogSink};
use sampler::{Pacing, Sampler};

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;

/// Exit status when the capture device cannot be used
pub const EXIT_DEVICE_FAILURE: u8 = 1;

/// Exit status for invalid configuration
pub const EXIT_CONFIG_FAILURE: u8 = 2;

/// Open the configured PCM source (file replay or live device)
pub fn open_source(config: &SoundingConfig) -> Result<Box<dyn PcmSource>, SourceError> {
    match &config.pcm_file {
        Some(path) => Ok(Box::new(FileSource::open(path, &config.device)?)),
        None => Ok(Box::new(CpalSource::open(&config.device)?)),
    }
}

/// Instantiate every sink whose configuration is present
pub fn build_sinks(config: &SoundingConfig, handle: &Handle) -> Vec<Box<dyn MetricSink>> {
    let mut sinks: Vec<Box<dyn MetricSink>> = Vec::new();

    if let Some(format) = config.console {
        sinks.push(Box::new(ConsoleSink::new(format)));
    }

    if let Some(ref syslog) = config.syslog {
        match SyslogSink::connect(&syslog.host, syslog.port, config.prefix.clone(), &config.device) {
            Ok(sink) => sinks.push(Box::new(sink)),
            Err(e) => log::error!("Syslog sink disabled: {}", e),
        }
    }

    if let Some(ref graphite) = config.graphite {
        sinks.push(Box::new(GraphiteSink::spawn(graphite.clone(), handle)));
    }

    if sinks.is_empty() {
        log::warn!("No metric sinks configured; metrics will be discarded");
    }

    sinks
}

/// Open the device, wire the sinks and sample until shutdown or device loss
fn sample(config: SoundingConfig, handle: Handle, shutdown: Arc<AtomicBool>) -> ExitCode {
    let source = match open_source(&config) {
        Ok(source) => source,
        Err(e) => {
            log::error!("Cannot open capture source: {}", e);
            return ExitCode::from(EXIT_DEVICE_FAILURE);
        }
    };

    let sinks = build_sinks(&config, &handle);
    let sampler = Sampler::new(
        source,
        sinks,
        MetricNames::new(config.prefix.clone()),
        Pacing::fixed(config.interval),
    );

    match sampler.run(&shutdown) {
        Ok(_) => ExitCode::SUCCESS,
        Err(_) => ExitCode::from(EXIT_DEVICE_FAILURE),
    }
}

/// Resolve on Ctrl-C, or SIGTERM on Unix
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                log::warn!("SIGTERM handler unavailable: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn serve(config: SoundingConfig) -> ExitCode {
    let shutdown = Arc::new(AtomicBool::new(false));

    let signal_flag = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        log::info!("Shutdown signal received");
        signal_flag.store(true, Ordering::SeqCst);
    });

    // The loop paces itself with blocking sleeps, keep it off the async workers
    let handle = Handle::current();
    let task = tokio::task::spawn_blocking(move || sample(config, handle, shutdown));

    match task.await {
        Ok(code) => code,
        Err(e) => {
            log::error!("Sampling task failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Run the probe
pub fn run() -> ExitCode {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match SoundingConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            return ExitCode::from(EXIT_CONFIG_FAILURE);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(serve(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ConsoleFormat;
    use std::path::PathBuf;

    #[test]
    fn missing_pcm_file_is_device_failure() {
        let config = SoundingConfig {
            pcm_file: Some(PathBuf::from("/nonexistent/sounding.raw")),
            ..Default::default()
        };

        let err = open_source(&config).err().unwrap();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn sinks_exist_only_when_configured() {
        let handle = Handle::current();

        let config = SoundingConfig {
            console: None,
            ..Default::default()
        };
        assert!(build_sinks(&config, &handle).is_empty());

        let config = SoundingConfig {
            console: Some(ConsoleFormat::Json),
            ..Default::default()
        };
        let sinks = build_sinks(&config, &handle);
        let names: Vec<_> = sinks.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["console"]);
    }

    #[tokio::test]
    async fn syslog_sink_is_built_from_config() {
        let handle = Handle::current();
        let collector = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();

        let config = SoundingConfig {
            console: None,
            syslog: Some(config::SyslogConfig {
                host: "127.0.0.1".to_string(),
                port: collector.local_addr().unwrap().port(),
            }),
            ..Default::default()
        };

        let sinks = build_sinks(&config, &handle);
        let names: Vec<_> = sinks.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["syslog"]);
    }

    #[test]
    fn replayed_file_runs_to_completion() {
        use std::io::Write;

        let path = std::env::temp_dir().join(format!("sounding-run-{}.raw", std::process::id()));
        {
            let mut file = std::fs::File::create(&path).unwrap();
            for _ in 0..160 {
                file.write_all(&1000i16.to_le_bytes()).unwrap();
            }
        }

        let config = SoundingConfig {
            pcm_file: Some(path.clone()),
            console: None,
            interval: std::time::Duration::ZERO,
            ..Default::default()
        };

        let source = open_source(&config).unwrap();
        let mut sampler = Sampler::new(
            source,
            Vec::new(),
            MetricNames::default(),
            Pacing::fixed(config.interval),
        );

        assert!(matches!(
            sampler.run_cycle().unwrap(),
            sampler::CycleOutcome::Emitted { .. }
        ));
        assert_eq!(sampler.run_cycle().unwrap(), sampler::CycleOutcome::NoData);

        let _ = std::fs::remove_file(path);
    }
}
