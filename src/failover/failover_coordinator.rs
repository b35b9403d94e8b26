use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::host::Host;
use crate::domain::instance::{ExecutionStatus, TaskInstance, WorkflowInstance};
use crate::domain::utils::id::TaskCode;
use crate::engine::execution_repository::WorkflowExecutionRepository;
use crate::error::{Error, Result};
use crate::event::{EventPublisher, LifecycleEvent};
use crate::ha::{HaServerListener, ServerStatus};
use crate::registry::{NODES_ROOT, NodeType, Registry, RegistryEvent, RegistryEventKind};
use crate::store::InstanceStore;

/// What one failover run changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailoverSummary {
    pub host: Host,
    pub node_type: Option<NodeType>,
    pub workflow_instances: usize,
    pub task_instances: usize,
    /// Set when this master is not ACTIVE. A STAND_BY master only recovers the tasks of
    /// workflows it drives itself.
    pub skipped: bool,
}

#[derive(Debug)]
enum FailoverRequest {
    Server { host: Host, node_type: NodeType },
    SweepDeadMasters,
}

/// Recovers work orphaned by dead nodes. Only the ACTIVE master acts on the whole cluster.
///
/// * worker removed: its unfinished task instances become NEED_FAULT_TOLERANCE; those of
///   workflows this master drives get a new attempt through a task failover event. A STAND_BY
///   master still does this for the workflows it drives, since nobody else will.
/// * master removed: the unfinished task instances of its unfinished workflow instances become
///   NEED_FAULT_TOLERANCE, then the workflow is rebound to this master in one write and taken
///   over. An instance that cannot be updated is logged and left bound to the dead master.
///
/// Queries only return unfinished instances bound to the dead host, so running it twice for the
/// same host changes nothing the second time.
pub struct FailoverCoordinator {
    local_host: Host,
    registry: Arc<dyn Registry>,
    store: Arc<dyn InstanceStore>,
    publisher: EventPublisher,
    repository: Arc<WorkflowExecutionRepository>,
    active: AtomicBool,
    requests: mpsc::UnboundedSender<FailoverRequest>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<FailoverRequest>>>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FailoverCoordinator {
    pub fn new(
        local_host: Host,
        registry: Arc<dyn Registry>,
        store: Arc<dyn InstanceStore>,
        publisher: EventPublisher,
        repository: Arc<WorkflowExecutionRepository>,
    ) -> Self {
        let (requests, receiver) = mpsc::unbounded_channel();
        FailoverCoordinator {
            local_host,
            registry,
            store,
            publisher,
            repository,
            active: AtomicBool::new(false),
            requests,
            receiver: Mutex::new(Some(receiver)),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Subscribes to membership changes and starts the worker that runs failovers one at a time.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let receiver = self.receiver.lock().ok().and_then(|mut r| r.take());
        let Some(mut receiver) = receiver else {
            return Err(Error::Config("failover coordinator is already started".to_string()));
        };

        let requests = self.requests.clone();
        self.registry
            .subscribe(
                NODES_ROOT,
                Arc::new(move |event: &RegistryEvent| {
                    if event.kind != RegistryEventKind::Removed {
                        return;
                    }
                    if let Some(server) = &event.server {
                        let _ = requests.send(FailoverRequest::Server { host: server.host.clone(), node_type: server.node_type });
                    }
                }),
            )
            .await?;

        let coordinator = self.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = receiver.recv() => {
                        match next {
                            Some(request) => request,
                            None => break,
                        }
                    }
                };

                let outcome = match request {
                    FailoverRequest::Server { host, node_type } => coordinator.failover_server(&host, node_type).await.map(|summary| vec![summary]),
                    FailoverRequest::SweepDeadMasters => coordinator.failover_dead_masters().await,
                };
                if let Err(e) = outcome {
                    log::error!("Failover on {} failed: {}", coordinator.local_host, e);
                }
            }
        });

        if let Ok(mut slot) = self.handle.lock() {
            *slot = Some(handle);
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::error!("Failover worker ended abnormally: {}", e);
            }
        }
    }

    pub async fn failover_server(&self, host: &Host, node_type: NodeType) -> Result<FailoverSummary> {
        if !self.is_active() {
            log::debug!("Not ACTIVE, leaving failover of {} {} to the active master.", node_type, host);
            let mut summary = FailoverSummary { host: host.clone(), node_type: Some(node_type), skipped: true, ..Default::default() };
            if matches!(node_type, NodeType::Worker) {
                summary.task_instances = self.failover_local_tasks(host)?;
            }
            return Ok(summary);
        }

        match node_type {
            NodeType::Worker => self.failover_worker(host),
            NodeType::Master => self.failover_master(host),
        }
    }

    /// Marks the unfinished task instances of a dead worker as NEED_FAULT_TOLERANCE.
    pub fn failover_worker(&self, host: &Host) -> Result<FailoverSummary> {
        let tasks = self.store.query_need_failover_task_instances(host)?;
        let mut summary = FailoverSummary { host: host.clone(), node_type: Some(NodeType::Worker), ..Default::default() };

        for mut task in tasks {
            task.state = ExecutionStatus::NeedFaultTolerance;
            task.end_time = Some(Utc::now());
            if let Err(e) = self.store.update_task_instance(&task) {
                log::error!("Skipping failover of task instance {} from {}: {}", task.id, host, e);
                continue;
            }
            summary.task_instances += 1;

            if self.repository.contains(task.workflow_instance_id) {
                self.publisher.publish(LifecycleEvent::task_failover(task.id))?;
            }
        }

        log::info!("Worker {} failover done: {} task instances need fault tolerance.", host, summary.task_instances);
        Ok(summary)
    }

    /// Recovers the tasks a dead worker ran for workflows this master drives. Returns how many
    /// task instances it marked; tasks another master already marked are re-dispatched too.
    pub fn failover_local_tasks(&self, host: &Host) -> Result<usize> {
        let mut marked = 0;
        for workflow_id in self.repository.workflow_instance_ids() {
            let mut latest: HashMap<TaskCode, TaskInstance> = HashMap::new();
            for task in self.store.task_instances_of_workflow(workflow_id)? {
                match latest.get(&task.task_code) {
                    Some(existing) if existing.id > task.id => {}
                    _ => {
                        latest.insert(task.task_code, task);
                    }
                }
            }

            for mut task in latest.into_values().filter(|task| task.host == *host) {
                if !task.state.is_finished() {
                    task.state = ExecutionStatus::NeedFaultTolerance;
                    task.end_time = Some(Utc::now());
                    self.store.update_task_instance(&task)?;
                    marked += 1;
                }
                if task.state == ExecutionStatus::NeedFaultTolerance {
                    self.publisher.publish(LifecycleEvent::task_failover(task.id))?;
                }
            }
        }

        log::info!("Worker {} failover for workflows on {}: {} task instances need fault tolerance.", host, self.local_host, marked);
        Ok(marked)
    }

    /// Takes over the unfinished workflows of a dead master, one instance at a time.
    pub fn failover_master(&self, host: &Host) -> Result<FailoverSummary> {
        let mut summary = FailoverSummary { host: host.clone(), node_type: Some(NodeType::Master), ..Default::default() };
        if *host == self.local_host {
            log::warn!("Refusing to fail over this master ({}) from itself.", host);
            return Ok(summary);
        }

        for workflow in self.store.query_need_failover_workflow_instances(host)? {
            let id = workflow.id;
            match self.take_over_workflow(workflow) {
                Ok(tasks) => {
                    summary.workflow_instances += 1;
                    summary.task_instances += tasks;
                }
                Err(e) => log::error!("Skipping failover of workflow instance {} from {}: {}", id, host, e),
            }
        }

        log::info!(
            "Master {} failover done: took over {} workflow instances, {} task instances need fault tolerance.",
            host,
            summary.workflow_instances,
            summary.task_instances
        );
        Ok(summary)
    }

    /// The workflow stays bound to the dead master until its tasks are marked, so a failed run is
    /// picked up again by the next one.
    fn take_over_workflow(&self, mut workflow: WorkflowInstance) -> Result<usize> {
        let mut marked = 0;
        for mut task in self.store.task_instances_of_workflow(workflow.id)? {
            if task.state.is_finished() {
                continue;
            }
            task.state = ExecutionStatus::NeedFaultTolerance;
            task.end_time = Some(Utc::now());
            self.store.update_task_instance(&task)?;
            marked += 1;
        }

        workflow.host = self.local_host.clone();
        self.store.update_workflow_instance(&workflow)?;
        self.publisher.publish(LifecycleEvent::workflow_ready_to_run(workflow.id, true))?;
        Ok(marked)
    }

    /// Fails over every master that owns unfinished workflow instances but is no longer
    /// registered. Catches masters that died while nobody was ACTIVE.
    pub async fn failover_dead_masters(&self) -> Result<Vec<FailoverSummary>> {
        if !self.is_active() {
            return Ok(Vec::new());
        }

        let mut summaries = Vec::new();
        for host in self.store.workflow_instance_hosts()? {
            if host == self.local_host || self.registry.check_node_exists(&host, NodeType::Master).await? {
                continue;
            }
            summaries.push(self.failover_master(&host)?);
        }
        Ok(summaries)
    }
}

impl HaServerListener for FailoverCoordinator {
    fn on_status_change(&self, status: ServerStatus) {
        self.set_active(status == ServerStatus::Active);
        if status == ServerStatus::Active {
            let _ = self.requests.send(FailoverRequest::SweepDeadMasters);
        }
    }
}
