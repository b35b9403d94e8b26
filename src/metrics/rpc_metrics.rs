use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::domain::host::Host;
use crate::error::Error;

/// Target of the structured per-call events, so collectors can route them separately.
pub const RPC_METRICS_TARGET: &str = "rpc_metrics";

/// Durations kept per series for the percentile computation.
const DURATION_WINDOW: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RpcMetricKey {
    pub method: String,
    pub client_host: String,
    pub server_host: String,
}

#[derive(Debug, Default)]
struct MetricSeries {
    calls: u64,
    durations_ms: VecDeque<f64>,
    exceptions: BTreeMap<&'static str, u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcMetricSnapshot {
    pub key: RpcMetricKey,
    pub calls: u64,
    pub p50_ms: f64,
    pub p75_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub exceptions: BTreeMap<&'static str, u64>,
}

/// Per-method RPC call durations and exception counters, tagged by method, client host and
/// server host. Owned by whoever creates it and shared through an `Arc`.
#[derive(Debug, Default)]
pub struct RpcMetrics {
    series: Mutex<HashMap<RpcMetricKey, MetricSeries>>,
}

impl RpcMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record<T>(&self, method: &str, client_host: &Host, server_host: &Host, elapsed: Duration, outcome: &Result<T, Error>) {
        let key = RpcMetricKey { method: method.to_string(), client_host: client_host.to_string(), server_host: server_host.to_string() };
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        let exception = outcome.as_ref().err().map(Error::type_name);

        tracing::debug!(
            target: RPC_METRICS_TARGET,
            Method = %key.method,
            ClientHost = %key.client_host,
            ServerHost = %key.server_host,
            DurationMs = elapsed_ms,
            Exception = exception.unwrap_or("None"),
        );

        let Ok(mut guard) = self.series.lock() else {
            log::error!("RPC metrics lock poisoned, dropping sample for {}", method);
            return;
        };

        let series = guard.entry(key).or_default();
        series.calls += 1;
        if series.durations_ms.len() == DURATION_WINDOW {
            series.durations_ms.pop_front();
        }
        series.durations_ms.push_back(elapsed_ms);
        if let Some(name) = exception {
            *series.exceptions.entry(name).or_insert(0) += 1;
        }
    }

    /// Current percentiles of every series, ordered by key.
    pub fn snapshot(&self) -> Vec<RpcMetricSnapshot> {
        let Ok(guard) = self.series.lock() else {
            return Vec::new();
        };

        let mut snapshots: Vec<RpcMetricSnapshot> = guard
            .iter()
            .map(|(key, series)| {
                let mut sorted: Vec<f64> = series.durations_ms.iter().copied().collect();
                sorted.sort_by(|a, b| a.total_cmp(b));

                RpcMetricSnapshot {
                    key: key.clone(),
                    calls: series.calls,
                    p50_ms: percentile(&sorted, 0.50),
                    p75_ms: percentile(&sorted, 0.75),
                    p95_ms: percentile(&sorted, 0.95),
                    p99_ms: percentile(&sorted, 0.99),
                    exceptions: series.exceptions.clone(),
                }
            })
            .collect();

        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    pub fn exception_count(&self, method: &str, exception: &str) -> u64 {
        let Ok(guard) = self.series.lock() else {
            return 0;
        };
        guard.iter().filter(|(key, _)| key.method == method).filter_map(|(_, series)| series.exceptions.get(exception)).sum()
    }
}

/// Nearest-rank percentile over sorted samples.
fn percentile(sorted: &[f64], quantile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (quantile * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
