use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::host::Host;
use crate::domain::instance::ExecutionStatus;
use crate::domain::utils::id::{TaskInstanceId, WorkflowInstanceId};
use crate::remote::command::TaskExecutionEventKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskEventType {
    /// Internal request to place a submitted task instance on a worker.
    Dispatch,
    Dispatched,
    Running,
    Success,
    Failed,
    Killed,
    Paused,
    /// The instance was marked NEED_FAULT_TOLERANCE and needs a new attempt.
    Failover,
}

impl From<TaskExecutionEventKind> for TaskEventType {
    fn from(kind: TaskExecutionEventKind) -> Self {
        match kind {
            TaskExecutionEventKind::Running => TaskEventType::Running,
            TaskExecutionEventKind::Success => TaskEventType::Success,
            TaskExecutionEventKind::Failed => TaskEventType::Failed,
            TaskExecutionEventKind::Killed => TaskEventType::Killed,
            TaskExecutionEventKind::Paused => TaskEventType::Paused,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowEventType {
    ReadyToRun,
    Running,
    ReadyToStop,
    Stopped,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleEventType {
    Task(TaskEventType),
    Workflow(WorkflowEventType),
}

impl LifecycleEventType {
    pub fn is_task(&self) -> bool {
        matches!(self, LifecycleEventType::Task(_))
    }

    pub fn is_workflow(&self) -> bool {
        matches!(self, LifecycleEventType::Workflow(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    Empty,
    WorkflowStart {
        /// Set when the instance was adopted from a dead master.
        failover: bool,
    },
    TaskDispatched {
        worker_host: Host,
    },
    TaskReport {
        worker_host: Host,
        message: Option<String>,
        /// Worker expecting an acknowledgement once the report is applied.
        ack_to: Option<Host>,
    },
    WorkflowFinish {
        state: ExecutionStatus,
    },
}

/// Unit of work on the lifecycle event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub event_type: LifecycleEventType,
    /// Workflow instance id for workflow events, task instance id for task events.
    pub target_instance_id: i64,
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(event_type: LifecycleEventType, target_instance_id: i64, payload: EventPayload) -> Self {
        LifecycleEvent { event_type, target_instance_id, payload, timestamp: Utc::now() }
    }

    fn task(event_type: TaskEventType, id: TaskInstanceId, payload: EventPayload) -> Self {
        Self::new(LifecycleEventType::Task(event_type), id.value(), payload)
    }

    fn workflow(event_type: WorkflowEventType, id: WorkflowInstanceId, payload: EventPayload) -> Self {
        Self::new(LifecycleEventType::Workflow(event_type), id.value(), payload)
    }

    pub fn workflow_ready_to_run(id: WorkflowInstanceId, failover: bool) -> Self {
        Self::workflow(WorkflowEventType::ReadyToRun, id, EventPayload::WorkflowStart { failover })
    }

    pub fn workflow_running(id: WorkflowInstanceId) -> Self {
        Self::workflow(WorkflowEventType::Running, id, EventPayload::Empty)
    }

    pub fn workflow_ready_to_stop(id: WorkflowInstanceId) -> Self {
        Self::workflow(WorkflowEventType::ReadyToStop, id, EventPayload::Empty)
    }

    pub fn workflow_stopped(id: WorkflowInstanceId) -> Self {
        Self::workflow(WorkflowEventType::Stopped, id, EventPayload::WorkflowFinish { state: ExecutionStatus::Stop })
    }

    pub fn workflow_finished(id: WorkflowInstanceId, state: ExecutionStatus) -> Self {
        Self::workflow(WorkflowEventType::Finished, id, EventPayload::WorkflowFinish { state })
    }

    pub fn task_dispatch(id: TaskInstanceId) -> Self {
        Self::task(TaskEventType::Dispatch, id, EventPayload::Empty)
    }

    pub fn task_dispatched(id: TaskInstanceId, worker_host: Host) -> Self {
        Self::task(TaskEventType::Dispatched, id, EventPayload::TaskDispatched { worker_host })
    }

    pub fn task_report(event_type: TaskEventType, id: TaskInstanceId, worker_host: Host, message: Option<String>, ack_to: Option<Host>) -> Self {
        Self::task(event_type, id, EventPayload::TaskReport { worker_host, message, ack_to })
    }

    pub fn task_failover(id: TaskInstanceId) -> Self {
        Self::task(TaskEventType::Failover, id, EventPayload::Empty)
    }

    pub fn task_instance_id(&self) -> TaskInstanceId {
        TaskInstanceId::new(self.target_instance_id)
    }

    pub fn workflow_instance_id(&self) -> WorkflowInstanceId {
        WorkflowInstanceId::new(self.target_instance_id)
    }

    pub fn is(&self, event_type: LifecycleEventType) -> bool {
        self.event_type == event_type
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.event_type {
            LifecycleEventType::Task(t) => write!(f, "Task{:?}[{}]", t, self.target_instance_id),
            LifecycleEventType::Workflow(w) => write!(f, "Workflow{:?}[{}]", w, self.target_instance_id),
        }
    }
}
