use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::DispatchConfig;
use crate::dispatch::host_selector::LoadBalancer;
use crate::dispatch::transport::Transport;
use crate::domain::host::Host;
use crate::error::{Error, ErrorKind, Result};
use crate::registry::{NodeType, Registry};
use crate::remote::command::{RpcRequest, StandardRpcResponse};

/// Where a unit of work should run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DispatchTarget {
    /// Exactly this node, no alternatives.
    Host(Host),
    /// Any live worker of the group.
    WorkerGroup(String),
}

impl fmt::Display for DispatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchTarget::Host(host) => write!(f, "host {}", host),
            DispatchTarget::WorkerGroup(group) => write!(f, "worker group {}", group),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    /// Host that served the request.
    pub host: Host,
    pub response: StandardRpcResponse,
}

/// Places requests on nodes.
///
/// `execute` resolves the candidates of a target, lets the load balancer choose the first one and
/// on transport failure moves on to the next untried candidate in registration order. Every host
/// gets `retry_times` attempts spaced by `retry_interval` before it counts as failed. Any
/// non-transport error (e.g. the remote handler rejected the request) ends the call at once.
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    registry: Arc<dyn Registry>,
    balancer: LoadBalancer,
    retry_times: u32,
    retry_interval: Duration,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, registry: Arc<dyn Registry>, config: &DispatchConfig) -> Self {
        Dispatcher {
            transport,
            registry,
            balancer: LoadBalancer::new(config.host_selector),
            retry_times: config.retry_times.max(1),
            retry_interval: config.retry_interval(),
        }
    }

    pub async fn execute(&self, target: &DispatchTarget, request: &RpcRequest) -> Result<DispatchOutcome> {
        let (candidates, first) = self.resolve(target).await?;
        let mut failed: Vec<Host> = Vec::new();
        let mut next = candidates.get(first).cloned();

        while let Some(host) = next {
            match self.send_with_retry(&host, request).await {
                Ok(response) => {
                    if !failed.is_empty() {
                        log::info!("{} for {} served by {} after failing over from {:?}", request.method, target, host, failed);
                    }
                    return Ok(DispatchOutcome { host, response });
                }
                Err(e) if e.kind() == ErrorKind::Transport => {
                    log::warn!("{} to {} failed, trying the next candidate of {}: {}", request.method, host, target, e);
                    failed.push(host);
                    next = candidates.iter().find(|candidate| !failed.contains(candidate)).cloned();
                }
                Err(e) => return Err(e),
            }
        }

        log::error!("{} for {} failed on every candidate: {:?}", request.method, target, failed);
        Err(Error::DispatchExhausted { target: target.to_string(), method: request.method.clone(), tried: failed })
    }

    /// Sends to `host` with local retries only. No resolution, no fail-over.
    pub async fn execute_directly(&self, host: &Host, request: &RpcRequest) -> Result<StandardRpcResponse> {
        self.send_with_retry(host, request).await
    }

    /// Candidates of `target` in registration order and the index the balancer picked.
    async fn resolve(&self, target: &DispatchTarget) -> Result<(Vec<Host>, usize)> {
        let (candidates, first) = match target {
            DispatchTarget::Host(host) => (vec![host.clone()], 0),
            DispatchTarget::WorkerGroup(group) => {
                let servers: Vec<_> = self.registry.get_server_list(NodeType::Worker).await?.into_iter().filter(|s| s.in_group(group)).collect();
                let first = self.balancer.select(&servers).unwrap_or(0);
                (servers.into_iter().map(|server| server.host).collect::<Vec<_>>(), first)
            }
        };

        if candidates.is_empty() {
            return Err(Error::NoAvailableNode { target: target.to_string() });
        }
        Ok((candidates, first))
    }

    async fn send_with_retry(&self, host: &Host, request: &RpcRequest) -> Result<StandardRpcResponse> {
        let mut attempt = 1;
        loop {
            match self.transport.send(host, request).await {
                Ok(response) => return Ok(response),
                Err(e) if e.kind() == ErrorKind::Transport && attempt < self.retry_times => {
                    log::debug!("Attempt {}/{} of {} to {} failed: {}", attempt, self.retry_times, request.method, host, e);
                    attempt += 1;
                    tokio::time::sleep(self.retry_interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::host_selector::HostSelector;
    use crate::registry::{MemoryRegistry, Server};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    /// Fails the first `failures[host]` sends to a host with a transport error.
    #[derive(Default)]
    struct ScriptedTransport {
        failures: Mutex<HashMap<Host, u32>>,
        always_down: HashSet<Host>,
        rejecting: HashSet<Host>,
        calls: Mutex<Vec<Host>>,
    }

    impl ScriptedTransport {
        fn calls_to(&self, host: &Host) -> usize {
            self.calls.lock().unwrap().iter().filter(|h| *h == host).count()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, host: &Host, _request: &RpcRequest) -> Result<StandardRpcResponse> {
            self.calls.lock().unwrap().push(host.clone());

            if self.always_down.contains(host) {
                return Err(Error::Transport { host: host.clone(), message: "connection refused".into() });
            }
            if self.rejecting.contains(host) {
                return Err(Error::Rpc { host: host.clone(), method: "m".into(), message: "rejected".into() });
            }
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(host).filter(|left| **left > 0) {
                *left -= 1;
                return Err(Error::Transport { host: host.clone(), message: "timeout".into() });
            }
            Ok(StandardRpcResponse::success(serde_json::json!({ "servedBy": host.to_string() })))
        }
    }

    fn host(port: u16) -> Host {
        Host::new("127.0.0.1", port)
    }

    async fn registry_with_workers(ports: &[u16]) -> Arc<dyn Registry> {
        let registry = MemoryRegistry::new().connect();
        for port in ports {
            registry.register(Server::worker(host(*port), vec!["default".to_string()])).await.unwrap();
        }
        Arc::new(registry)
    }

    fn config(retry_times: u32) -> DispatchConfig {
        DispatchConfig { retry_times, retry_interval_ms: 1, host_selector: HostSelector::LowerWeight }
    }

    fn request() -> RpcRequest {
        RpcRequest::new("TaskExecutor.dispatchTask", &serde_json::json!({})).unwrap()
    }

    #[tokio::test]
    async fn fails_over_until_a_candidate_succeeds() {
        let transport = Arc::new(ScriptedTransport { always_down: [host(1), host(2)].into_iter().collect(), ..Default::default() });
        let dispatcher = Dispatcher::new(transport.clone(), registry_with_workers(&[1, 2, 3]).await, &config(1));

        let outcome = dispatcher.execute(&DispatchTarget::WorkerGroup("default".into()), &request()).await.unwrap();

        assert_eq!(outcome.host, host(3));
        assert_eq!(*transport.calls.lock().unwrap(), vec![host(1), host(2), host(3)]);
    }

    #[tokio::test]
    async fn exhaustion_names_every_host_once() {
        let transport = Arc::new(ScriptedTransport { always_down: [host(1), host(2), host(3)].into_iter().collect(), ..Default::default() });
        let dispatcher = Dispatcher::new(transport.clone(), registry_with_workers(&[1, 2, 3]).await, &config(2));

        let err = dispatcher.execute(&DispatchTarget::WorkerGroup("default".into()), &request()).await.unwrap_err();

        match err {
            Error::DispatchExhausted { tried, .. } => assert_eq!(tried, vec![host(1), host(2), host(3)]),
            other => panic!("unexpected error {other:?}"),
        }
        for port in [1, 2, 3] {
            assert_eq!(transport.calls_to(&host(port)), 2);
        }
    }

    #[tokio::test]
    async fn local_retry_recovers_transient_failure() {
        let transport = Arc::new(ScriptedTransport { failures: Mutex::new([(host(1), 2)].into_iter().collect()), ..Default::default() });
        let dispatcher = Dispatcher::new(transport.clone(), registry_with_workers(&[1, 2]).await, &config(3));

        let outcome = dispatcher.execute(&DispatchTarget::WorkerGroup("default".into()), &request()).await.unwrap();

        assert_eq!(outcome.host, host(1));
        assert_eq!(transport.calls_to(&host(1)), 3);
        assert_eq!(transport.calls_to(&host(2)), 0);
    }

    #[tokio::test]
    async fn remote_rejection_is_not_failed_over() {
        let transport = Arc::new(ScriptedTransport { rejecting: [host(1)].into_iter().collect(), ..Default::default() });
        let dispatcher = Dispatcher::new(transport.clone(), registry_with_workers(&[1, 2]).await, &config(3));

        let err = dispatcher.execute(&DispatchTarget::WorkerGroup("default".into()), &request()).await.unwrap_err();

        assert!(matches!(err, Error::Rpc { .. }));
        assert_eq!(transport.calls_to(&host(2)), 0);
    }

    #[tokio::test]
    async fn empty_group_has_no_available_node() {
        let transport = Arc::new(ScriptedTransport::default());
        let dispatcher = Dispatcher::new(transport, registry_with_workers(&[1]).await, &config(1));

        let err = dispatcher.execute(&DispatchTarget::WorkerGroup("gpu".into()), &request()).await.unwrap_err();

        assert!(matches!(err, Error::NoAvailableNode { .. }));
    }

    #[tokio::test]
    async fn direct_execution_never_fails_over() {
        let transport = Arc::new(ScriptedTransport { always_down: [host(1)].into_iter().collect(), ..Default::default() });
        let dispatcher = Dispatcher::new(transport.clone(), registry_with_workers(&[1, 2]).await, &config(2));

        let err = dispatcher.execute_directly(&host(1), &request()).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(transport.calls_to(&host(1)), 2);
        assert_eq!(transport.calls_to(&host(2)), 0);
    }
}
