//! Plaintext line-protocol sink (Graphite / collectd write_graphite)
//!
//! Each metric becomes `"<name> <value> <unix-seconds>\n"`. Lines are
//! queued without blocking and written by a background task that owns
//! the TCP connection.

use super::{MetricEvent, MetricSink, SinkError};
use parking_lot::Mutex;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// Lines buffered before new metrics are dropped
const DEFAULT_QUEUE_DEPTH: usize = 256;

/// How long `close` waits for queued lines to flush
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionMode {
    /// Reuse one connection, reconnecting after a failure.
    ///
    /// A collector that has closed the connection is noticed before the
    /// next write and the line goes out on a fresh connection. A line
    /// written while the close is still in flight is accepted by the
    /// kernel and lost, yet counted as sent; the write after it fails and
    /// reconnects.
    #[default]
    KeepAlive,

    /// Open, send one line, close
    PerMetric,
}

/// Sink configuration
#[derive(Debug, Clone)]
pub struct GraphiteSinkConfig {
    /// Collector hostname
    pub host: String,

    /// Collector port
    pub port: u16,

    pub mode: ConnectionMode,

    /// Connect timeout
    pub connect_timeout: Duration,

    /// Per-line write timeout
    pub write_timeout: Duration,

    /// Queue depth between the loop and the writer task
    pub queue_depth: usize,
}

impl Default for GraphiteSinkConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 2003,
            mode: ConnectionMode::KeepAlive,
            connect_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(2),
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

/// Delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Lines written to the collector
    pub sent: u64,

    /// Lines lost to connection or write errors
    pub failed: u64,

    /// Lines dropped because the queue was full
    pub dropped: u64,

    /// Connections opened
    pub connects: u64,
}

/// Network metric sink
pub struct GraphiteSink {
    addr: String,
    tx: Option<mpsc::Sender<String>>,
    stats: Arc<Mutex<DeliveryStats>>,
    done_rx: Option<std_mpsc::Receiver<()>>,
}

impl GraphiteSink {
    /// Start the writer task on the given runtime
    pub fn spawn(config: GraphiteSinkConfig, handle: &Handle) -> Self {
        let addr = format!("{}:{}", config.host, config.port);
        let (tx, rx) = mpsc::channel::<String>(config.queue_depth.max(1));
        let (done_tx, done_rx) = std_mpsc::channel();
        let stats = Arc::new(Mutex::new(DeliveryStats::default()));

        log::info!("Graphite sink sending to {} ({:?})", addr, config.mode);

        let writer = Writer {
            addr: addr.clone(),
            config,
            stats: stats.clone(),
            conn: None,
            healthy: true,
        };
        handle.spawn(async move {
            writer.run(rx).await;
            let _ = done_tx.send(());
        });

        Self {
            addr,
            tx: Some(tx),
            stats,
            done_rx: Some(done_rx),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Snapshot of delivery counters
    pub fn stats(&self) -> DeliveryStats {
        *self.stats.lock()
    }
}

/// Wire form of one event
pub fn format_line(event: &MetricEvent) -> String {
    format!("{} {} {}\n", event.name, event.value, event.unix_seconds())
}

impl MetricSink for GraphiteSink {
    fn name(&self) -> &'static str {
        "graphite"
    }

    fn emit(&mut self, event: &MetricEvent) -> Result<(), SinkError> {
        let tx = self.tx.as_ref().ok_or(SinkError::Closed)?;

        match tx.try_send(format_line(event)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.lock().dropped += 1;
                Err(SinkError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SinkError::Closed),
        }
    }

    fn close(&mut self) {
        // Dropping the sender lets the writer drain and exit
        if self.tx.take().is_none() {
            return;
        }

        if let Some(done_rx) = self.done_rx.take() {
            if done_rx.recv_timeout(CLOSE_TIMEOUT).is_err() {
                log::warn!("Graphite sink did not flush within {:?}", CLOSE_TIMEOUT);
            }
        }

        let stats = self.stats();
        log::info!(
            "Graphite sink closed: {} sent, {} failed, {} dropped",
            stats.sent,
            stats.failed,
            stats.dropped
        );
    }
}

impl Drop for GraphiteSink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Background task that owns the TCP connection
struct Writer {
    addr: String,
    config: GraphiteSinkConfig,
    stats: Arc<Mutex<DeliveryStats>>,
    conn: Option<TcpStream>,
    /// False while the collector is failing, to avoid a warning per line
    healthy: bool,
}

impl Writer {
    async fn run(mut self, mut rx: mpsc::Receiver<String>) {
        while let Some(line) = rx.recv().await {
            match self.deliver(&line).await {
                Ok(()) => {
                    self.stats.lock().sent += 1;
                    if !self.healthy {
                        log::info!("Graphite collector {} reachable again", self.addr);
                        self.healthy = true;
                    }
                }
                Err(e) => {
                    self.stats.lock().failed += 1;
                    if self.healthy {
                        log::warn!("Graphite delivery to {} failed: {}", self.addr, e);
                        self.healthy = false;
                    } else {
                        log::debug!("Graphite delivery to {} failed: {}", self.addr, e);
                    }
                    self.conn = None;
                }
            }

            if self.config.mode == ConnectionMode::PerMetric {
                self.disconnect().await;
            }
        }

        self.disconnect().await;
    }

    async fn deliver(&mut self, line: &str) -> Result<(), SinkError> {
        if self.conn.as_ref().is_some_and(peer_closed) {
            log::debug!("Graphite collector {} closed the connection, reconnecting", self.addr);
            self.disconnect().await;
        }

        if self.conn.is_none() {
            let stream = tokio::time::timeout(
                self.config.connect_timeout,
                TcpStream::connect(&self.addr),
            )
            .await
            .map_err(|_| SinkError::ConnectionFailed("Connection timeout".to_string()))?
            .map_err(|e| SinkError::ConnectionFailed(e.to_string()))?;

            self.stats.lock().connects += 1;
            self.conn = Some(stream);
        }

        let stream = self.conn.as_mut().ok_or(SinkError::Closed)?;
        tokio::time::timeout(self.config.write_timeout, stream.write_all(line.as_bytes()))
            .await
            .map_err(|_| SinkError::SendError("Write timeout".to_string()))?
            .map_err(|e| SinkError::SendError(e.to_string()))
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.conn.take() {
            let _ = stream.shutdown().await;
        }
    }
}

/// Whether the collector has hung up. Carbon never writes back, so a
/// readable socket means EOF or an error.
fn peer_closed(stream: &TcpStream) -> bool {
    let mut scratch = [0u8; 1];
    match stream.try_read(&mut scratch) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
        Err(_) => true,
    }
}
