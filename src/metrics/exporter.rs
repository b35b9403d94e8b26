use chrono::Utc;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::metrics::rpc_metrics::{RpcMetricSnapshot, RpcMetrics};

const HEADERS: [&str; 10] = ["Time", "Method", "ClientHost", "ServerHost", "Calls", "P50Ms", "P75Ms", "P95Ms", "P99Ms", "Exceptions"];

/// Messages sent to the writer thread.
enum ExportMessage {
    Flush,
    Shutdown,
}

/// Periodically writes [`RpcMetrics`] snapshots as `;`-delimited CSV rows for an external
/// collector. Runs on its own thread; writing never blocks the RPC path.
pub struct MetricsExporter {
    sender: mpsc::Sender<ExportMessage>,
    handle: Option<JoinHandle<()>>,
}

impl MetricsExporter {
    /// Spawns the writer thread. `path == None` writes to stdout.
    pub fn start(metrics: Arc<RpcMetrics>, path: Option<PathBuf>, interval: Duration) -> io::Result<Self> {
        let writer: Box<dyn Write + Send> = match &path {
            Some(p) => Box::new(File::create(p)?),
            None => Box::new(io::stdout()),
        };
        let (tx, rx) = mpsc::channel();

        let handle = thread::Builder::new().name("rpc-metrics-exporter".to_string()).spawn(move || {
            Self::worker_loop(metrics, writer, rx, interval);
        })?;

        Ok(MetricsExporter { sender: tx, handle: Some(handle) })
    }

    fn worker_loop(metrics: Arc<RpcMetrics>, writer: Box<dyn Write + Send>, rx: mpsc::Receiver<ExportMessage>, interval: Duration) {
        let mut csv_wtr = csv::WriterBuilder::new().delimiter(b';').from_writer(writer);

        if let Err(e) = csv_wtr.write_record(HEADERS) {
            log::error!("Metrics export: failed to write headers: {}", e);
        }

        loop {
            let stop = match rx.recv_timeout(interval) {
                Ok(ExportMessage::Flush) | Err(mpsc::RecvTimeoutError::Timeout) => false,
                Ok(ExportMessage::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => true,
            };

            for snapshot in metrics.snapshot() {
                if let Err(e) = csv_wtr.write_record(Self::to_row(&snapshot)) {
                    log::error!("Metrics export: failed to write record: {}", e);
                }
            }
            let _ = csv_wtr.flush();

            if stop {
                break;
            }
        }
    }

    fn to_row(snapshot: &RpcMetricSnapshot) -> Vec<String> {
        let exceptions = if snapshot.exceptions.is_empty() {
            "NA".to_string()
        } else {
            snapshot.exceptions.iter().map(|(name, count)| format!("{}={}", name, count)).collect::<Vec<_>>().join("|")
        };

        vec![
            Utc::now().to_rfc3339(),
            snapshot.key.method.clone(),
            snapshot.key.client_host.clone(),
            snapshot.key.server_host.clone(),
            snapshot.calls.to_string(),
            format!("{:.3}", snapshot.p50_ms),
            format!("{:.3}", snapshot.p75_ms),
            format!("{:.3}", snapshot.p95_ms),
            format!("{:.3}", snapshot.p99_ms),
            exceptions,
        ]
    }

    /// Writes a snapshot now instead of waiting for the next interval.
    pub fn flush(&self) {
        let _ = self.sender.send(ExportMessage::Flush);
    }

    /// Writes a final snapshot and joins the writer thread.
    pub fn shutdown(&mut self) {
        let _ = self.sender.send(ExportMessage::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Metrics exporter thread panicked.");
            }
        }
    }
}

impl Drop for MetricsExporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
