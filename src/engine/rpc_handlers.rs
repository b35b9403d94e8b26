use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::event::{EventPublisher, LifecycleEvent};
use crate::remote::command::{TaskExecutionEventRequest, WorkflowStopRequest, method};
use crate::remote::frame::Transporter;
use crate::remote::server::{RpcMethodHandler, RpcServer};

/// Turns worker reports into lifecycle events. The reply only confirms receipt; the
/// acknowledgement that the report was applied is sent separately when the worker asks for one.
pub struct TaskExecutionEventListener {
    publisher: EventPublisher,
}

#[async_trait]
impl RpcMethodHandler for TaskExecutionEventListener {
    async fn handle(&self, request: &Transporter) -> Result<serde_json::Value> {
        let report: TaskExecutionEventRequest = request.decode_body()?;
        log::debug!("Worker {} reported {:?} for task instance {}", report.worker_host, report.kind, report.task_instance_id);

        let ack_to = report.need_ack.then(|| report.worker_host.clone());
        self.publisher.publish(LifecycleEvent::task_report(report.kind.into(), report.task_instance_id, report.worker_host, report.message, ack_to))?;
        Ok(serde_json::Value::Null)
    }
}

pub struct WorkflowControlHandler {
    publisher: EventPublisher,
}

#[async_trait]
impl RpcMethodHandler for WorkflowControlHandler {
    async fn handle(&self, request: &Transporter) -> Result<serde_json::Value> {
        let stop: WorkflowStopRequest = request.decode_body()?;
        log::info!("Stop requested for workflow instance {}", stop.workflow_instance_id);

        self.publisher.publish(LifecycleEvent::workflow_ready_to_stop(stop.workflow_instance_id))?;
        Ok(serde_json::Value::Null)
    }
}

/// Registers the methods a master serves.
pub fn register_master_methods(server: &mut RpcServer, publisher: EventPublisher) {
    server
        .register(method::TASK_EXECUTION_EVENT, Arc::new(TaskExecutionEventListener { publisher: publisher.clone() }))
        .register(method::STOP_WORKFLOW_INSTANCE, Arc::new(WorkflowControlHandler { publisher }));
}
