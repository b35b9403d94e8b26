use async_trait::async_trait;

use crate::domain::host::Host;
use crate::error::Result;
use crate::remote::command::{RpcRequest, StandardRpcResponse};

/// One request/reply exchange with a remote host.
///
/// Connection failures and timeouts must surface as `Error::Transport`; those are the only
/// errors the dispatcher retries and fails over on.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, host: &Host, request: &RpcRequest) -> Result<StandardRpcResponse>;
}
