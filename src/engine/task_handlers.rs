use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

use crate::dispatch::DispatchTarget;
use crate::domain::instance::{ExecutionStatus, TaskInstance};
use crate::engine::{EngineContext, LIFECYCLE_TARGET};
use crate::error::Result;
use crate::event::{EventPayload, LifecycleEvent, LifecycleEventHandler, LifecycleEventType, TaskEventType};
use crate::remote::RpcRequest;
use crate::remote::command::{TaskDispatchRequest, TaskExecutionEventKind, method};

/// Places a submitted task instance on a worker of its group.
///
/// A dispatch that exhausts every candidate fails the handler, so the request goes back on the bus
/// and is tried again after the backoff.
pub struct TaskDispatchHandler {
    context: Arc<EngineContext>,
}

impl TaskDispatchHandler {
    pub fn new(context: Arc<EngineContext>) -> Self {
        TaskDispatchHandler { context }
    }
}

#[async_trait]
impl LifecycleEventHandler for TaskDispatchHandler {
    async fn handle(&self, event: &LifecycleEvent) -> Result<()> {
        let ctx = &self.context;
        let task = ctx.task_instance(event.task_instance_id())?;

        if task.state != ExecutionStatus::SubmittedSuccess {
            log::debug!("Task instance {} is {:?}, skipping dispatch.", task.id, task.state);
            return Ok(());
        }
        let Some(execution) = ctx.repository.get(task.workflow_instance_id) else {
            log::debug!("Workflow instance {} is not owned by this master, skipping dispatch of {}.", task.workflow_instance_id, task.id);
            return Ok(());
        };

        let params = execution.graph.task(&task.task_code).map(|definition| definition.params.clone()).unwrap_or_default();
        let request = RpcRequest::new(
            method::DISPATCH_TASK,
            &TaskDispatchRequest {
                task_instance_id: task.id,
                workflow_instance_id: task.workflow_instance_id,
                task_code: task.task_code,
                task_name: task.name.clone(),
                task_type: task.task_type.clone(),
                params,
                master_host: ctx.local_host.clone(),
            },
        )?;

        let outcome = ctx.dispatcher.execute(&DispatchTarget::WorkerGroup(task.worker_group.clone()), &request).await?;
        log::info!("Dispatched task instance {} ({}) to {}.", task.id, task.name, outcome.host);

        ctx.publisher.publish(LifecycleEvent::task_dispatched(task.id, outcome.host))
    }
}

/// Binds the task instance to the worker that accepted it.
pub struct TaskDispatchedHandler {
    context: Arc<EngineContext>,
}

impl TaskDispatchedHandler {
    pub fn new(context: Arc<EngineContext>) -> Self {
        TaskDispatchedHandler { context }
    }
}

#[async_trait]
impl LifecycleEventHandler for TaskDispatchedHandler {
    async fn handle(&self, event: &LifecycleEvent) -> Result<()> {
        let EventPayload::TaskDispatched { worker_host } = &event.payload else {
            log::error!("{} carries no worker host, dropping it.", event);
            return Ok(());
        };
        let mut task = self.context.task_instance(event.task_instance_id())?;

        // A fast worker may already have reported; never move such an instance back.
        if task.state == ExecutionStatus::SubmittedSuccess {
            task.state = ExecutionStatus::Dispatched;
            task.host = worker_host.clone();
            task.start_time.get_or_insert_with(Utc::now);
        } else if task.host.is_empty() && !task.state.is_finished() {
            task.host = worker_host.clone();
        } else {
            return Ok(());
        }

        self.context.store.update_task_instance(&task)
    }
}

/// Applies a worker report (running, success, failed, killed, paused) and drives the workflow on.
pub struct TaskReportHandler {
    context: Arc<EngineContext>,
}

impl TaskReportHandler {
    pub fn new(context: Arc<EngineContext>) -> Self {
        TaskReportHandler { context }
    }

    fn report_kind(event_type: TaskEventType) -> Option<TaskExecutionEventKind> {
        match event_type {
            TaskEventType::Running => Some(TaskExecutionEventKind::Running),
            TaskEventType::Success => Some(TaskExecutionEventKind::Success),
            TaskEventType::Failed => Some(TaskExecutionEventKind::Failed),
            TaskEventType::Killed => Some(TaskExecutionEventKind::Killed),
            TaskEventType::Paused => Some(TaskExecutionEventKind::Paused),
            _ => None,
        }
    }

    fn after_report(&self, kind: TaskExecutionEventKind, task: &TaskInstance) -> Result<()> {
        let ctx = &self.context;
        let workflow_id = task.workflow_instance_id;
        let Some(execution) = ctx.repository.get(workflow_id) else {
            return Ok(());
        };

        match kind {
            TaskExecutionEventKind::Running => Ok(()),
            TaskExecutionEventKind::Success => ctx.submit_ready_tasks(&execution).map(|_| ()),
            TaskExecutionEventKind::Failed if task.retry_times < task.max_retry_times => {
                let retry = ctx.store.insert_task_instance(task.next_attempt())?;
                log::info!("Retrying task {} as instance {} (attempt {}/{}).", task.name, retry.id, retry.retry_times, task.max_retry_times);
                ctx.publisher.publish(LifecycleEvent::task_dispatch(retry.id))
            }
            TaskExecutionEventKind::Failed => ctx.publisher.publish(LifecycleEvent::workflow_finished(workflow_id, ExecutionStatus::Failure)),
            TaskExecutionEventKind::Killed => {
                if ctx.workflow_instance(workflow_id)?.state == ExecutionStatus::ReadyStop {
                    return Ok(());
                }
                ctx.publisher.publish(LifecycleEvent::workflow_finished(workflow_id, ExecutionStatus::Kill))
            }
            TaskExecutionEventKind::Paused => {
                let still_active = ctx.latest_attempts(workflow_id)?.values().any(|t| t.state.is_running());
                if still_active {
                    return Ok(());
                }
                ctx.publisher.publish(LifecycleEvent::workflow_finished(workflow_id, ExecutionStatus::Pause))
            }
        }
    }
}

#[async_trait]
impl LifecycleEventHandler for TaskReportHandler {
    async fn handle(&self, event: &LifecycleEvent) -> Result<()> {
        let ctx = &self.context;
        let (LifecycleEventType::Task(event_type), EventPayload::TaskReport { worker_host, message, ack_to }) = (event.event_type, &event.payload)
        else {
            log::error!("{} is not a worker report, dropping it.", event);
            return Ok(());
        };
        let Some(kind) = Self::report_kind(event_type) else {
            return Ok(());
        };

        let mut task = ctx.task_instance(event.task_instance_id())?;
        if task.state.is_finished() {
            log::debug!("Task instance {} is already {:?}, ignoring late {:?} report.", task.id, task.state, kind);
            ctx.acknowledge(ack_to.as_ref(), task.id, kind).await;
            return Ok(());
        }

        if !worker_host.is_empty() {
            task.host = worker_host.clone();
        }
        match kind {
            TaskExecutionEventKind::Running => {
                task.state = ExecutionStatus::RunningExecution;
                task.start_time.get_or_insert_with(Utc::now);
            }
            TaskExecutionEventKind::Success => task.state = ExecutionStatus::Success,
            TaskExecutionEventKind::Failed => task.state = ExecutionStatus::Failure,
            TaskExecutionEventKind::Killed => task.state = ExecutionStatus::Kill,
            TaskExecutionEventKind::Paused => task.state = ExecutionStatus::Pause,
        }
        if task.state.is_finished() {
            task.end_time = Some(Utc::now());
            tracing::info!(
                target: LIFECYCLE_TARGET,
                TaskInstance = task.id.value(),
                WorkflowInstance = task.workflow_instance_id.value(),
                Task = %task.name,
                State = ?task.state,
                Attempt = task.retry_times,
                Worker = %task.host,
            );
        }
        if let Some(message) = message {
            log::info!("Task instance {} reported {:?} from {}: {}", task.id, kind, worker_host, message);
        }

        ctx.store.update_task_instance(&task)?;
        ctx.acknowledge(ack_to.as_ref(), task.id, kind).await;

        self.after_report(kind, &task)
    }
}

/// Starts a new attempt for a task instance whose worker died.
pub struct TaskFailoverHandler {
    context: Arc<EngineContext>,
}

impl TaskFailoverHandler {
    pub fn new(context: Arc<EngineContext>) -> Self {
        TaskFailoverHandler { context }
    }
}

#[async_trait]
impl LifecycleEventHandler for TaskFailoverHandler {
    async fn handle(&self, event: &LifecycleEvent) -> Result<()> {
        let ctx = &self.context;
        let task = ctx.task_instance(event.task_instance_id())?;

        if task.state != ExecutionStatus::NeedFaultTolerance {
            log::debug!("Task instance {} is {:?}, no failover needed.", task.id, task.state);
            return Ok(());
        }
        if !ctx.repository.contains(task.workflow_instance_id) || !ctx.is_latest_attempt(&task)? {
            return Ok(());
        }

        let retry = ctx.store.insert_task_instance(task.next_attempt())?;
        log::info!("Failing over task instance {} ({}) from {} as instance {}.", task.id, task.name, task.host, retry.id);
        ctx.publisher.publish(LifecycleEvent::task_dispatch(retry.id))
    }
}
