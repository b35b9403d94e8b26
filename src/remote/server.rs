use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::remote::codec::TransporterCodec;
use crate::remote::command::StandardRpcResponse;
use crate::remote::frame::{Transporter, TransporterHeader};

/// Server side of one remote method.
#[async_trait]
pub trait RpcMethodHandler: Send + Sync {
    /// Returns the reply body. An error is sent back as an unsuccessful `StandardRpcResponse`.
    async fn handle(&self, request: &Transporter) -> Result<serde_json::Value>;
}

type HandlerMap = HashMap<String, Arc<dyn RpcMethodHandler>>;

/// TCP server answering framed requests.
///
/// Every connection gets a reader loop and a writer task; requests are handled concurrently and
/// replies carry the opaque of the request they answer. A frame that violates the protocol closes
/// the connection.
pub struct RpcServer {
    name: String,
    handlers: HandlerMap,
    max_frame_length: usize,
    cancel: CancellationToken,
    accept_handle: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl RpcServer {
    pub fn new(name: impl Into<String>, max_frame_length: usize) -> Self {
        RpcServer {
            name: name.into(),
            handlers: HashMap::new(),
            max_frame_length,
            cancel: CancellationToken::new(),
            accept_handle: None,
            local_addr: None,
        }
    }

    /// Registers `handler` under `method`. Must be called before [`RpcServer::start`].
    pub fn register(&mut self, method: &str, handler: Arc<dyn RpcMethodHandler>) -> &mut Self {
        if self.handlers.insert(method.to_string(), handler).is_some() {
            log::warn!("[{}] Handler for {} was registered twice, keeping the last one.", self.name, method);
        }
        self
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Binds `addr` and starts accepting connections. Returns the bound address, which differs from
    /// `addr` when port 0 was requested.
    pub async fn start(&mut self, addr: &str) -> Result<SocketAddr> {
        if self.accept_handle.is_some() {
            return Err(Error::Config(format!("RPC server {} is already started", self.name)));
        }

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let handlers: Arc<HandlerMap> = Arc::new(self.handlers.clone());
        let cancel = self.cancel.clone();
        let max_frame_length = self.max_frame_length;
        let name = self.name.clone();

        log::info!("[{}] RPC server listening on {} with {} methods.", name, local_addr, handlers.len());

        self.accept_handle = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                log::debug!("[{}] Accepted connection from {}", name, peer);
                                tokio::spawn(serve_connection(stream, peer, handlers.clone(), cancel.child_token(), max_frame_length));
                            }
                            Err(e) => log::warn!("[{}] Failed to accept connection: {}", name, e),
                        }
                    }
                }
            }
            log::info!("[{}] RPC server stopped accepting connections.", name);
        }));
        self.local_addr = Some(local_addr);

        Ok(local_addr)
    }

    /// Stops accepting and closes all open connections.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.accept_handle.take() {
            if let Err(e) = handle.await {
                log::warn!("[{}] Accept loop ended abnormally: {}", self.name, e);
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, handlers: Arc<HandlerMap>, cancel: CancellationToken, max_frame_length: usize) {
    let (mut sink, mut frames) = Framed::new(stream, TransporterCodec::with_max_frame_length(max_frame_length)).split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Transporter>();

    let writer = tokio::spawn(async move {
        while let Some(reply) = reply_rx.recv().await {
            if let Err(e) = sink.send(reply).await {
                log::warn!("Failed to write reply to {}: {}", peer, e);
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = frames.next() => {
                match next {
                    None => break,
                    Some(Err(e)) => {
                        log::error!("Closing connection from {}: {}", peer, e);
                        break;
                    }
                    Some(Ok(request)) => {
                        let handlers = handlers.clone();
                        let reply_tx = reply_tx.clone();
                        tokio::spawn(async move {
                            let reply = process(&handlers, request, peer).await;
                            let _ = reply_tx.send(reply);
                        });
                    }
                }
            }
        }
    }

    drop(reply_tx);
    if cancel.is_cancelled() {
        writer.abort();
    } else if let Err(e) = writer.await {
        log::debug!("Writer for {} ended abnormally: {}", peer, e);
    }
    log::debug!("Connection from {} closed.", peer);
}

async fn process(handlers: &HandlerMap, request: Transporter, peer: SocketAddr) -> Transporter {
    let header = TransporterHeader::new(request.method_identifier(), request.opaque());

    let response = match handlers.get(request.method_identifier()) {
        None => {
            log::warn!("Received unknown method identifier {} from {}", request.method_identifier(), peer);
            StandardRpcResponse::error(format!("Unknown method identifier: {}", request.method_identifier()))
        }
        Some(handler) => match handler.handle(&request).await {
            Ok(body) => StandardRpcResponse::success(body),
            Err(e) => {
                log::warn!("Handler for {} (opaque {}) from {} failed: {}", request.method_identifier(), request.opaque(), peer, e);
                StandardRpcResponse::error(e.to_string())
            }
        },
    };

    Transporter::with_json_body(header.clone(), &response).unwrap_or_else(|e| {
        log::error!("Failed to encode reply for {}: {}", header.method_identifier, e);
        Transporter::new(header, Bytes::from_static(br#"{"success":false,"message":"reply encoding failed"}"#))
    })
}
