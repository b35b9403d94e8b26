use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::domain::host::Host;
use crate::domain::utils::id::{TaskCode, TaskInstanceId, WorkflowInstanceId};
use crate::error::{Error, Result};

/// Method identifiers understood by masters and workers.
pub mod method {
    /// master -> worker
    pub const DISPATCH_TASK: &str = "TaskExecutor.dispatchTask";
    /// master -> worker
    pub const KILL_TASK: &str = "TaskExecutor.killTask";
    /// worker -> master
    pub const TASK_EXECUTION_EVENT: &str = "TaskExecutionEventListener.onTaskExecutionEvent";
    /// master -> worker, acknowledges a task execution event
    pub const TASK_EXECUTION_EVENT_ACK: &str = "TaskExecutionEventListener.ack";
    /// any -> master
    pub const STOP_WORKFLOW_INSTANCE: &str = "WorkflowControl.stopWorkflowInstance";
}

/// An outgoing call before it gets an opaque and becomes a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRequest {
    pub method: String,
    pub body: Bytes,
}

impl RpcRequest {
    pub fn new<T: Serialize>(method: &str, body: &T) -> Result<Self> {
        Ok(RpcRequest { method: method.to_string(), body: Bytes::from(serde_json::to_vec(body)?) })
    }
}

/// Body of every reply frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StandardRpcResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl StandardRpcResponse {
    pub fn success(body: serde_json::Value) -> Self {
        StandardRpcResponse { success: true, message: None, body }
    }

    pub fn error(message: impl Into<String>) -> Self {
        StandardRpcResponse { success: false, message: Some(message.into()), body: serde_json::Value::Null }
    }

    pub fn decode_body<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.body.clone()).map_err(|e| Error::Protocol(format!("Unexpected reply body: {}", e)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDispatchRequest {
    pub task_instance_id: TaskInstanceId,
    pub workflow_instance_id: WorkflowInstanceId,
    pub task_code: TaskCode,
    pub task_name: String,
    pub task_type: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Master that expects the execution events of this task.
    pub master_host: Host,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskKillRequest {
    pub task_instance_id: TaskInstanceId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskExecutionEventKind {
    Running,
    Success,
    Failed,
    Killed,
    Paused,
}

/// Status report sent by a worker for one task instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecutionEventRequest {
    pub task_instance_id: TaskInstanceId,
    pub workflow_instance_id: WorkflowInstanceId,
    pub kind: TaskExecutionEventKind,
    pub worker_host: Host,
    /// Worker wants a `TASK_EXECUTION_EVENT_ACK` once the master has processed the event.
    #[serde(default)]
    pub need_ack: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub event_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecutionEventAck {
    pub task_instance_id: TaskInstanceId,
    pub kind: TaskExecutionEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStopRequest {
    pub workflow_instance_id: WorkflowInstanceId,
}
