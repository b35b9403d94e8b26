pub mod exporter;
pub mod rpc_metrics;

pub use exporter::MetricsExporter;
pub use rpc_metrics::{RPC_METRICS_TARGET, RpcMetricKey, RpcMetricSnapshot, RpcMetrics};
