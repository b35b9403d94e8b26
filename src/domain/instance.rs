use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::host::Host;
use crate::domain::utils::id::{TaskCode, TaskInstanceId, WorkflowCode, WorkflowInstanceId};
use crate::domain::workflow::TaskDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    SubmittedSuccess,
    Dispatched,
    RunningExecution,
    ReadyPause,
    Pause,
    ReadyStop,
    Stop,
    Failure,
    Success,
    Kill,
    /// Terminal for the current attempt but retryable: the node owning the instance died.
    NeedFaultTolerance,
}

impl ExecutionStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success
                | ExecutionStatus::Failure
                | ExecutionStatus::Kill
                | ExecutionStatus::Stop
                | ExecutionStatus::Pause
                | ExecutionStatus::NeedFaultTolerance
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ExecutionStatus::SubmittedSuccess | ExecutionStatus::Dispatched | ExecutionStatus::RunningExecution)
    }

    pub fn is_success(&self) -> bool {
        *self == ExecutionStatus::Success
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstance {
    pub id: WorkflowInstanceId,
    pub definition_code: WorkflowCode,
    pub name: String,
    pub state: ExecutionStatus,
    /// Master that currently owns the instance.
    pub host: Host,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    /// A freshly submitted instance. The id is assigned by the store on insert.
    pub fn new(definition_code: WorkflowCode, name: impl Into<String>) -> Self {
        WorkflowInstance {
            id: WorkflowInstanceId::new(0),
            definition_code,
            name: name.into(),
            state: ExecutionStatus::SubmittedSuccess,
            host: Host::empty(),
            start_time: None,
            end_time: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInstance {
    pub id: TaskInstanceId,
    pub workflow_instance_id: WorkflowInstanceId,
    pub task_code: TaskCode,
    pub name: String,
    pub task_type: String,
    pub worker_group: String,
    pub state: ExecutionStatus,
    /// Worker executing the instance, empty until dispatch succeeds.
    pub host: Host,
    pub retry_times: u32,
    pub max_retry_times: u32,
    pub submit_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl TaskInstance {
    pub fn from_definition(workflow_instance_id: WorkflowInstanceId, task: &TaskDefinition) -> Self {
        TaskInstance {
            id: TaskInstanceId::new(0),
            workflow_instance_id,
            task_code: task.code,
            name: task.name.clone(),
            task_type: task.task_type.clone(),
            worker_group: task.worker_group.clone(),
            state: ExecutionStatus::SubmittedSuccess,
            host: Host::empty(),
            retry_times: 0,
            max_retry_times: task.fail_retry_times,
            submit_time: Utc::now(),
            start_time: None,
            end_time: None,
        }
    }

    /// Copy used for the next attempt after a failure or a failover. Identity, binding and
    /// timings are reset, the attempt counter is carried over.
    pub fn next_attempt(&self) -> Self {
        TaskInstance {
            id: TaskInstanceId::new(0),
            state: ExecutionStatus::SubmittedSuccess,
            host: Host::empty(),
            retry_times: self.retry_times + 1,
            submit_time: Utc::now(),
            start_time: None,
            end_time: None,
            ..self.clone()
        }
    }
}
