use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dispatch::host_selector::HostSelector;
use crate::error::{Error, Result};
use crate::loader::parser::parse_json_file;
use crate::remote::client::RpcClientConfig;
use crate::remote::codec::DEFAULT_MAX_FRAME_LENGTH;

/// Master process configuration. Every field has a default, so an empty JSON object is a valid file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MasterConfig {
    pub listen_host: String,
    pub listen_port: u16,
    pub rpc: RpcConfig,
    pub dispatch: DispatchConfig,
    pub event_bus: EventBusConfig,
    pub election: ElectionConfig,
    pub metrics: MetricsConfig,
    pub log: LogConfig,
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 5678,
            rpc: RpcConfig::default(),
            dispatch: DispatchConfig::default(),
            event_bus: EventBusConfig::default(),
            election: ElectionConfig::default(),
            metrics: MetricsConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl MasterConfig {
    pub fn load(file_path: impl AsRef<Path>) -> Result<Self> {
        let config: MasterConfig = parse_json_file(file_path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_host.is_empty() {
            return Err(Error::Config("listenHost must not be empty".to_string()));
        }
        if self.dispatch.retry_times == 0 {
            return Err(Error::Config("dispatch.retryTimes must be at least 1".to_string()));
        }
        if self.rpc.max_frame_length < crate::remote::frame::FRAME_OVERHEAD {
            return Err(Error::Config(format!("rpc.maxFrameLength {} is smaller than the frame overhead", self.rpc.max_frame_length)));
        }
        if self.election.lock_path.is_empty() {
            return Err(Error::Config("election.lockPath must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RpcConfig {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub max_frame_length: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig { connect_timeout_ms: 3_000, request_timeout_ms: 10_000, max_frame_length: DEFAULT_MAX_FRAME_LENGTH }
    }
}

impl RpcConfig {
    pub fn client_config(&self) -> RpcClientConfig {
        RpcClientConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            max_frame_length: self.max_frame_length,
        }
    }
}

/// Retry policy of the dispatcher. `retry_times` counts attempts per host, not extra retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatchConfig {
    pub retry_times: u32,
    pub retry_interval_ms: u64,
    pub host_selector: HostSelector,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig { retry_times: 3, retry_interval_ms: 1_000, host_selector: HostSelector::LowerWeight }
    }
}

impl DispatchConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventBusConfig {
    /// Pause of the consumer after a handler failed and the event was re-queued.
    pub failure_backoff_ms: u64,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        EventBusConfig { failure_backoff_ms: 1_000 }
    }
}

impl EventBusConfig {
    pub fn failure_backoff(&self) -> Duration {
        Duration::from_millis(self.failure_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ElectionConfig {
    pub lock_path: String,
    /// Fixed delay between election rounds.
    pub interval_ms: u64,
    /// Upper bound on a single lock acquisition attempt.
    pub lock_wait_ms: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        ElectionConfig { lock_path: "/lock/master-ha".to_string(), interval_ms: 5_000, lock_wait_ms: 1_000 }
    }
}

impl ElectionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsConfig {
    /// CSV export is off when unset.
    pub csv_path: Option<PathBuf>,
    pub export_interval_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig { csv_path: None, export_interval_ms: 60_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    /// Default filter when `RUST_LOG` is not set.
    pub level: String,
    /// Directory of the daily rolling log file. File logging is off when unset.
    pub dir: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig { level: "info".to_string(), dir: Some(PathBuf::from("logs")), file_prefix: "master.log".to_string() }
    }
}
