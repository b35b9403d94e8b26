use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use workflow_orchestrator::config::RpcConfig;
use workflow_orchestrator::domain::host::Host;
use workflow_orchestrator::error::{Error, Result};
use workflow_orchestrator::metrics::RpcMetrics;
use workflow_orchestrator::remote::codec::DEFAULT_MAX_FRAME_LENGTH;
use workflow_orchestrator::remote::{RpcClient, RpcMethodHandler, RpcRequest, RpcServer, Transporter};

const ECHO: &str = "Test.echo";
const FAIL: &str = "Test.fail";

/// Echoes the body back. A numeric `delayMs` field delays the reply.
struct Echo;

#[async_trait]
impl RpcMethodHandler for Echo {
    async fn handle(&self, request: &Transporter) -> Result<Value> {
        let body: Value = request.decode_body()?;
        if let Some(delay) = body.get("delayMs").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(body)
    }
}

struct Failing;

#[async_trait]
impl RpcMethodHandler for Failing {
    async fn handle(&self, _request: &Transporter) -> Result<Value> {
        Err(Error::Data("task is unknown".to_string()))
    }
}

async fn start_server() -> (RpcServer, Host) {
    let mut server = RpcServer::new("test-worker", DEFAULT_MAX_FRAME_LENGTH);
    server.register(ECHO, Arc::new(Echo)).register(FAIL, Arc::new(Failing));
    let addr = server.start("127.0.0.1:0").await.unwrap();
    (server, Host::new("127.0.0.1", addr.port()))
}

fn client() -> RpcClient {
    RpcClient::new(Host::new("127.0.0.1", 1), RpcConfig::default().client_config(), Arc::new(RpcMetrics::new()))
}

#[tokio::test]
async fn test_request_reply_round_trip() {
    let (mut server, host) = start_server().await;
    let client = client();

    let request = RpcRequest::new(ECHO, &json!({ "taskInstanceId": 42 })).unwrap();
    let response = client.send_sync(&host, &request).await.unwrap();

    assert!(response.success);
    assert_eq!(response.body["taskInstanceId"], 42);

    let snapshot = client.metrics().snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].calls, 1);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_calls_are_matched_by_opaque() {
    let (mut server, host) = start_server().await;
    let client = Arc::new(client());

    // Later requests answer first, so replies arrive out of order on the shared connection.
    let calls = (0..8u64).map(|i| {
        let client = client.clone();
        let host = host.clone();
        async move {
            let request = RpcRequest::new(ECHO, &json!({ "call": i, "delayMs": (8 - i) * 15 })).unwrap();
            client.send_sync(&host, &request).await
        }
    });
    let responses = futures::future::join_all(calls).await;

    for (i, response) in responses.into_iter().enumerate() {
        assert_eq!(response.unwrap().body["call"], i as u64);
    }

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_unknown_method_is_rpc_error() {
    let (mut server, host) = start_server().await;
    let client = client();

    let request = RpcRequest::new("Nobody.listens", &json!({})).unwrap();
    let outcome = client.send_sync(&host, &request).await;

    match outcome {
        Err(Error::Rpc { method, message, .. }) => {
            assert_eq!(method, "Nobody.listens");
            assert!(message.contains("Unknown method identifier"));
        }
        other => panic!("expected rpc error, got {:?}", other),
    }
    assert_eq!(client.metrics().exception_count("Nobody.listens", "RpcError"), 1);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_handler_error_becomes_unsuccessful_response() {
    let (mut server, host) = start_server().await;
    let client = client();

    let outcome = client.send_sync(&host, &RpcRequest::new(FAIL, &json!({})).unwrap()).await;

    match outcome {
        Err(Error::Rpc { message, .. }) => assert!(message.contains("task is unknown")),
        other => panic!("expected rpc error, got {:?}", other),
    }

    // The connection survives a failed call.
    let response = client.send_sync(&host, &RpcRequest::new(ECHO, &json!({ "again": true })).unwrap()).await.unwrap();
    assert_eq!(response.body["again"], true);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_host_is_transport_error() {
    let (mut server, host) = start_server().await;
    server.shutdown().await;

    let outcome = client().send_sync(&host, &RpcRequest::new(ECHO, &json!({})).unwrap()).await;

    assert!(matches!(outcome, Err(Error::Transport { .. })), "got {:?}", outcome);
}

#[tokio::test]
async fn test_reply_timeout_is_transport_error() {
    let (mut server, host) = start_server().await;
    let mut config = RpcConfig::default();
    config.request_timeout_ms = 50;
    let client = RpcClient::new(Host::new("127.0.0.1", 1), config.client_config(), Arc::new(RpcMetrics::new()));

    let outcome = client.send_sync(&host, &RpcRequest::new(ECHO, &json!({ "delayMs": 500 })).unwrap()).await;

    assert!(matches!(outcome, Err(Error::Transport { .. })), "got {:?}", outcome);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_bad_magic_closes_connection() {
    let (mut server, host) = start_server().await;

    let mut stream = TcpStream::connect(host.address()).await.unwrap();
    stream.write_all(&[0x12, 0x00, 0, 0, 0, 0, 0, 0, 0, 0]).await.unwrap();

    let mut buf = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut buf)).await;
    assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_))), "connection should be closed without a reply");

    server.shutdown().await;
}
