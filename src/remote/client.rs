use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::dispatch::transport::Transport;
use crate::domain::host::Host;
use crate::error::{Error, Result};
use crate::metrics::RpcMetrics;
use crate::remote::codec::TransporterCodec;
use crate::remote::command::{RpcRequest, StandardRpcResponse};
use crate::remote::frame::{OpaqueGenerator, Transporter, TransporterHeader};

#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub max_frame_length: usize,
}

type PendingReplies = Arc<Mutex<HashMap<i64, oneshot::Sender<Transporter>>>>;

/// One multiplexed connection to a remote host.
#[derive(Debug)]
struct Channel {
    outbound: mpsc::UnboundedSender<Transporter>,
    pending: PendingReplies,
    closed: CancellationToken,
}

impl Channel {
    fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && !self.outbound.is_closed()
    }
}

/// Client side of the RPC protocol.
///
/// Keeps one connection per remote host, stamps every request with a fresh opaque and routes
/// replies back to their caller by that opaque. Every call is recorded in [`RpcMetrics`].
#[derive(Debug)]
pub struct RpcClient {
    local_host: Host,
    config: RpcClientConfig,
    opaque: OpaqueGenerator,
    channels: tokio::sync::Mutex<HashMap<Host, Arc<Channel>>>,
    metrics: Arc<RpcMetrics>,
    shutdown: CancellationToken,
}

impl RpcClient {
    pub fn new(local_host: Host, config: RpcClientConfig, metrics: Arc<RpcMetrics>) -> Self {
        RpcClient {
            local_host,
            config,
            opaque: OpaqueGenerator::new(),
            channels: tokio::sync::Mutex::new(HashMap::new()),
            metrics,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn metrics(&self) -> &Arc<RpcMetrics> {
        &self.metrics
    }

    /// Sends `request` to `host` and waits for the matching reply.
    ///
    /// # Errors
    /// * `Error::Transport` if the host cannot be reached, the connection drops or the reply times out.
    /// * `Error::Rpc` if the remote side answered with an unsuccessful response.
    pub async fn send_sync(&self, host: &Host, request: &RpcRequest) -> Result<StandardRpcResponse> {
        let started = Instant::now();
        let outcome = self.call(host, request).await;
        self.metrics.record(&request.method, &self.local_host, host, started.elapsed(), &outcome);
        outcome
    }

    async fn call(&self, host: &Host, request: &RpcRequest) -> Result<StandardRpcResponse> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Transport { host: host.clone(), message: "RPC client is closed".to_string() });
        }

        let channel = self.channel(host).await?;
        let opaque = self.opaque.next_opaque();
        let frame = Transporter::new(TransporterHeader::new(request.method.clone(), opaque), request.body.clone());

        let (reply_tx, reply_rx) = oneshot::channel();
        Self::lock_pending(&channel.pending, host)?.insert(opaque, reply_tx);

        if channel.outbound.send(frame).is_err() {
            Self::lock_pending(&channel.pending, host)?.remove(&opaque);
            return Err(Error::Transport { host: host.clone(), message: "connection closed before the request was written".to_string() });
        }

        let reply = match tokio::time::timeout(self.config.request_timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                return Err(Error::Transport { host: host.clone(), message: format!("connection closed while waiting for {}", request.method) });
            }
            Err(_) => {
                Self::lock_pending(&channel.pending, host)?.remove(&opaque);
                return Err(Error::Transport {
                    host: host.clone(),
                    message: format!("no reply to {} (opaque {}) within {:?}", request.method, opaque, self.config.request_timeout),
                });
            }
        };

        let response: StandardRpcResponse = reply.decode_body()?;
        if !response.success {
            return Err(Error::Rpc {
                host: host.clone(),
                method: request.method.clone(),
                message: response.message.unwrap_or_else(|| "remote call failed".to_string()),
            });
        }

        Ok(response)
    }

    fn lock_pending<'a>(
        pending: &'a PendingReplies,
        host: &Host,
    ) -> Result<std::sync::MutexGuard<'a, HashMap<i64, oneshot::Sender<Transporter>>>> {
        pending.lock().map_err(|_| Error::Transport { host: host.clone(), message: "pending reply table poisoned".to_string() })
    }

    /// Returns the open channel to `host`, connecting if there is none.
    async fn channel(&self, host: &Host) -> Result<Arc<Channel>> {
        let mut channels = self.channels.lock().await;

        if let Some(channel) = channels.get(host) {
            if channel.is_open() {
                return Ok(channel.clone());
            }
            log::debug!("Connection to {} is closed, reconnecting.", host);
            channels.remove(host);
        }

        let channel = Arc::new(self.connect(host).await?);
        channels.insert(host.clone(), channel.clone());
        Ok(channel)
    }

    async fn connect(&self, host: &Host) -> Result<Channel> {
        let stream = match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(host.address())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(Error::Transport { host: host.clone(), message: format!("connect failed: {}", e) }),
            Err(_) => return Err(Error::Transport { host: host.clone(), message: format!("connect timed out after {:?}", self.config.connect_timeout) }),
        };
        let _ = stream.set_nodelay(true);

        let (mut sink, mut replies) = Framed::new(stream, TransporterCodec::with_max_frame_length(self.config.max_frame_length)).split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Transporter>();
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let closed = self.shutdown.child_token();

        let writer_closed = closed.clone();
        let writer_host = host.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_closed.cancelled() => break,
                    next = outbound_rx.recv() => {
                        let Some(frame) = next else { break };
                        if let Err(e) = sink.send(frame).await {
                            log::warn!("Failed to write to {}: {}", writer_host, e);
                            break;
                        }
                    }
                }
            }
            writer_closed.cancel();
        });

        let reader_closed = closed.clone();
        let reader_pending = pending.clone();
        let reader_host = host.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_closed.cancelled() => break,
                    next = replies.next() => {
                        match next {
                            Some(Ok(reply)) => {
                                let waiter = reader_pending.lock().ok().and_then(|mut pending| pending.remove(&reply.opaque()));
                                match waiter {
                                    Some(waiter) => {
                                        let _ = waiter.send(reply);
                                    }
                                    None => log::debug!("Dropping reply with unknown opaque {} from {}", reply.opaque(), reader_host),
                                }
                            }
                            Some(Err(e)) => {
                                log::error!("Closing connection to {}: {}", reader_host, e);
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
            reader_closed.cancel();
            // Dropping the senders wakes every caller still waiting on this connection.
            if let Ok(mut pending) = reader_pending.lock() {
                pending.clear();
            }
        });

        log::debug!("Connected to {}", host);
        Ok(Channel { outbound, pending, closed })
    }

    /// Closes every connection. Later calls fail with a transport error.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.channels.lock().await.clear();
    }
}

#[async_trait]
impl Transport for RpcClient {
    async fn send(&self, host: &Host, request: &RpcRequest) -> Result<StandardRpcResponse> {
        self.send_sync(host, request).await
    }
}
