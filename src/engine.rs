use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::dispatch::Dispatcher;
use crate::domain::host::Host;
use crate::domain::instance::{ExecutionStatus, TaskInstance, WorkflowInstance};
use crate::domain::utils::id::{TaskCode, TaskInstanceId, WorkflowInstanceId};
use crate::error::{Error, Result};
use crate::event::{EventBus, EventPublisher, LifecycleEvent, LifecycleEventType, TaskEventType, WorkflowEventType};
use crate::ha::{HaServerListener, ServerStatus};
use crate::remote::command::{TaskExecutionEventAck, TaskExecutionEventKind, TaskKillRequest, method};
use crate::remote::RpcRequest;
use crate::store::InstanceStore;

use self::execution_repository::{WorkflowExecution, WorkflowExecutionRepository};
use self::task_handlers::{TaskDispatchHandler, TaskDispatchedHandler, TaskFailoverHandler, TaskReportHandler};
use self::workflow_handlers::{WorkflowFinishHandler, WorkflowReadyToRunHandler, WorkflowReadyToStopHandler, WorkflowRunningHandler};

pub mod execution_repository;
pub mod rpc_handlers;
pub mod task_handlers;
pub mod workflow_handlers;

/// Target of the structured workflow/task outcome events.
pub const LIFECYCLE_TARGET: &str = "lifecycle";

/// Open while this master is ACTIVE. Workflows only start behind an open gate; workflows already
/// running here keep going when it closes.
#[derive(Debug, Default)]
pub struct SchedulingGate {
    open: AtomicBool,
}

impl SchedulingGate {
    pub fn new(open: bool) -> Self {
        SchedulingGate { open: AtomicBool::new(open) }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl HaServerListener for SchedulingGate {
    fn on_status_change(&self, status: ServerStatus) {
        self.open.store(status == ServerStatus::Active, Ordering::Release);
    }
}

/// Everything the lifecycle handlers of one master share.
pub struct EngineContext {
    pub local_host: Host,
    pub store: Arc<dyn InstanceStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub publisher: EventPublisher,
    pub repository: Arc<WorkflowExecutionRepository>,
    pub gate: Arc<SchedulingGate>,
}

impl EngineContext {
    pub fn workflow_instance(&self, id: WorkflowInstanceId) -> Result<WorkflowInstance> {
        self.store.workflow_instance(id)?.ok_or_else(|| Error::Data(format!("Workflow instance {} does not exist.", id)))
    }

    pub fn task_instance(&self, id: TaskInstanceId) -> Result<TaskInstance> {
        self.store.task_instance(id)?.ok_or_else(|| Error::Data(format!("Task instance {} does not exist.", id)))
    }

    /// The newest attempt of every task of the workflow instance.
    pub fn latest_attempts(&self, id: WorkflowInstanceId) -> Result<HashMap<TaskCode, TaskInstance>> {
        let mut latest: HashMap<TaskCode, TaskInstance> = HashMap::new();
        for task in self.store.task_instances_of_workflow(id)? {
            match latest.get(&task.task_code) {
                Some(existing) if existing.id > task.id => {}
                _ => {
                    latest.insert(task.task_code, task);
                }
            }
        }
        Ok(latest)
    }

    pub fn is_latest_attempt(&self, task: &TaskInstance) -> Result<bool> {
        Ok(self.latest_attempts(task.workflow_instance_id)?.get(&task.task_code).is_some_and(|latest| latest.id == task.id))
    }

    /// Creates an instance for every task whose predecessors all succeeded and that has no live
    /// attempt yet, and requests its dispatch. Tasks that already succeeded are kept, so a workflow
    /// taken over from a dead master resumes where it stopped. Finishes the workflow once every
    /// task succeeded.
    pub fn submit_ready_tasks(&self, execution: &WorkflowExecution) -> Result<usize> {
        let id = execution.workflow_instance_id;
        let graph = &execution.graph;
        let latest = self.latest_attempts(id)?;
        let succeeded = |code: &TaskCode| latest.get(code).is_some_and(|task| task.state.is_success());

        if graph.execution_order().iter().all(succeeded) {
            self.publisher.publish(LifecycleEvent::workflow_finished(id, ExecutionStatus::Success))?;
            return Ok(0);
        }

        let mut submitted = 0;
        for code in graph.execution_order() {
            if !graph.pre_tasks(code).iter().all(succeeded) {
                continue;
            }

            let next = match (latest.get(code), graph.task(code)) {
                (None, Some(definition)) => TaskInstance::from_definition(id, definition),
                (Some(previous), _) if previous.state == ExecutionStatus::NeedFaultTolerance => previous.next_attempt(),
                _ => continue,
            };

            let task = self.store.insert_task_instance(next)?;
            log::debug!("Submitted task instance {} ({}) of workflow instance {}", task.id, task.name, id);
            self.publisher.publish(LifecycleEvent::task_dispatch(task.id))?;
            submitted += 1;
        }

        Ok(submitted)
    }

    /// Kills every unfinished latest attempt. Dispatched ones get a kill request on their worker;
    /// a worker that cannot be reached does not stop the others from being killed.
    pub async fn kill_active_tasks(&self, id: WorkflowInstanceId) -> Result<usize> {
        let mut active: Vec<TaskInstance> = self.latest_attempts(id)?.into_values().filter(|task| !task.state.is_finished()).collect();
        active.sort_by_key(|task| task.id);

        for task in &mut active {
            if !task.host.is_empty() {
                let request = RpcRequest::new(method::KILL_TASK, &TaskKillRequest { task_instance_id: task.id })?;
                if let Err(e) = self.dispatcher.execute_directly(&task.host, &request).await {
                    log::warn!("Could not kill task instance {} on {}: {}", task.id, task.host, e);
                }
            }
            task.state = ExecutionStatus::Kill;
            task.end_time = Some(Utc::now());
            self.store.update_task_instance(task)?;
        }

        Ok(active.len())
    }

    /// Confirms a processed worker report. Delivery is best effort.
    pub async fn acknowledge(&self, ack_to: Option<&Host>, task_instance_id: TaskInstanceId, kind: TaskExecutionEventKind) {
        let Some(worker) = ack_to else {
            return;
        };

        let request = match RpcRequest::new(method::TASK_EXECUTION_EVENT_ACK, &TaskExecutionEventAck { task_instance_id, kind }) {
            Ok(request) => request,
            Err(e) => {
                log::error!("Could not encode ack for task instance {}: {}", task_instance_id, e);
                return;
            }
        };
        if let Err(e) = self.dispatcher.execute_directly(worker, &request).await {
            log::warn!("Ack of {:?} for task instance {} to {} failed: {}", kind, task_instance_id, worker, e);
        }
    }
}

/// Registers the workflow and task handlers on `bus`, one `(predicate, handler)` pair per event family.
pub fn register_lifecycle_handlers(bus: &mut EventBus, context: Arc<EngineContext>) {
    use LifecycleEventType::{Task, Workflow};

    bus.register(|e| e.is(Workflow(WorkflowEventType::ReadyToRun)), Arc::new(WorkflowReadyToRunHandler::new(context.clone())));
    bus.register(|e| e.is(Workflow(WorkflowEventType::Running)), Arc::new(WorkflowRunningHandler::new(context.clone())));
    bus.register(|e| e.is(Workflow(WorkflowEventType::ReadyToStop)), Arc::new(WorkflowReadyToStopHandler::new(context.clone())));
    bus.register(
        |e| e.is(Workflow(WorkflowEventType::Stopped)) || e.is(Workflow(WorkflowEventType::Finished)),
        Arc::new(WorkflowFinishHandler::new(context.clone())),
    );

    bus.register(|e| e.is(Task(TaskEventType::Dispatch)), Arc::new(TaskDispatchHandler::new(context.clone())));
    bus.register(|e| e.is(Task(TaskEventType::Dispatched)), Arc::new(TaskDispatchedHandler::new(context.clone())));
    bus.register(
        |e| {
            matches!(
                e.event_type,
                Task(TaskEventType::Running | TaskEventType::Success | TaskEventType::Failed | TaskEventType::Killed | TaskEventType::Paused)
            )
        },
        Arc::new(TaskReportHandler::new(context.clone())),
    );
    bus.register(|e| e.is(Task(TaskEventType::Failover)), Arc::new(TaskFailoverHandler::new(context)));
}
