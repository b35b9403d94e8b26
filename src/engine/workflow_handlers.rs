use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

use crate::domain::instance::ExecutionStatus;
use crate::domain::workflow::WorkflowGraph;
use crate::engine::execution_repository::WorkflowExecution;
use crate::engine::{EngineContext, LIFECYCLE_TARGET};
use crate::error::{Error, Result};
use crate::event::{EventPayload, LifecycleEvent, LifecycleEventHandler};

/// Compiles the definition, takes ownership of the instance and starts it. Only an ACTIVE master
/// starts workflows.
pub struct WorkflowReadyToRunHandler {
    context: Arc<EngineContext>,
}

impl WorkflowReadyToRunHandler {
    pub fn new(context: Arc<EngineContext>) -> Self {
        WorkflowReadyToRunHandler { context }
    }
}

#[async_trait]
impl LifecycleEventHandler for WorkflowReadyToRunHandler {
    async fn handle(&self, event: &LifecycleEvent) -> Result<()> {
        let ctx = &self.context;
        let id = event.workflow_instance_id();
        let failover = matches!(event.payload, EventPayload::WorkflowStart { failover: true });
        let mut workflow = ctx.workflow_instance(id)?;

        if workflow.state.is_finished() {
            log::info!("Workflow instance {} is already {:?}, not starting it.", id, workflow.state);
            return Ok(());
        }
        if ctx.repository.contains(id) {
            log::debug!("Workflow instance {} is already running on this master.", id);
            return Ok(());
        }
        if !ctx.gate.is_open() {
            log::warn!("Master {} is not ACTIVE, not starting workflow instance {}.", ctx.local_host, id);
            return Ok(());
        }

        let definition = ctx
            .store
            .workflow_definition(workflow.definition_code)?
            .ok_or_else(|| Error::Data(format!("Workflow definition {} of instance {} does not exist.", workflow.definition_code, id)))?;

        let graph = match WorkflowGraph::compile(&definition) {
            Ok(graph) => graph,
            Err(e) => {
                log::error!("Workflow instance {} cannot run, its definition is invalid: {}", id, e);
                return ctx.publisher.publish(LifecycleEvent::workflow_finished(id, ExecutionStatus::Failure));
            }
        };

        workflow.host = ctx.local_host.clone();
        workflow.state = ExecutionStatus::RunningExecution;
        workflow.start_time.get_or_insert_with(Utc::now);
        ctx.store.update_workflow_instance(&workflow)?;
        ctx.repository.insert(WorkflowExecution { workflow_instance_id: id, graph: Arc::new(graph) })?;

        if failover {
            log::info!("Took over workflow instance {} ({}) on {}.", id, workflow.name, ctx.local_host);
        } else {
            log::info!("Started workflow instance {} ({}) on {}.", id, workflow.name, ctx.local_host);
        }

        ctx.publisher.publish(LifecycleEvent::workflow_running(id))
    }
}

/// Submits every task that is ready to run.
pub struct WorkflowRunningHandler {
    context: Arc<EngineContext>,
}

impl WorkflowRunningHandler {
    pub fn new(context: Arc<EngineContext>) -> Self {
        WorkflowRunningHandler { context }
    }
}

#[async_trait]
impl LifecycleEventHandler for WorkflowRunningHandler {
    async fn handle(&self, event: &LifecycleEvent) -> Result<()> {
        let id = event.workflow_instance_id();
        let Some(execution) = self.context.repository.get(id) else {
            log::debug!("Workflow instance {} is not owned by this master, ignoring {}.", id, event);
            return Ok(());
        };

        let submitted = self.context.submit_ready_tasks(&execution)?;
        log::debug!("Workflow instance {} submitted {} ready tasks.", id, submitted);
        Ok(())
    }
}

pub struct WorkflowReadyToStopHandler {
    context: Arc<EngineContext>,
}

impl WorkflowReadyToStopHandler {
    pub fn new(context: Arc<EngineContext>) -> Self {
        WorkflowReadyToStopHandler { context }
    }
}

#[async_trait]
impl LifecycleEventHandler for WorkflowReadyToStopHandler {
    async fn handle(&self, event: &LifecycleEvent) -> Result<()> {
        let ctx = &self.context;
        let id = event.workflow_instance_id();
        let mut workflow = ctx.workflow_instance(id)?;

        if workflow.state.is_finished() {
            log::info!("Workflow instance {} is already {:?}, nothing to stop.", id, workflow.state);
            return Ok(());
        }

        workflow.state = ExecutionStatus::ReadyStop;
        ctx.store.update_workflow_instance(&workflow)?;

        let killed = ctx.kill_active_tasks(id).await?;
        log::info!("Stopping workflow instance {}, killed {} active tasks.", id, killed);

        ctx.publisher.publish(LifecycleEvent::workflow_stopped(id))
    }
}

/// Writes the final state and releases the runtime context. Handles both finished and stopped.
pub struct WorkflowFinishHandler {
    context: Arc<EngineContext>,
}

impl WorkflowFinishHandler {
    pub fn new(context: Arc<EngineContext>) -> Self {
        WorkflowFinishHandler { context }
    }
}

#[async_trait]
impl LifecycleEventHandler for WorkflowFinishHandler {
    async fn handle(&self, event: &LifecycleEvent) -> Result<()> {
        let ctx = &self.context;
        let id = event.workflow_instance_id();
        let state = match event.payload {
            EventPayload::WorkflowFinish { state } => state,
            _ => ExecutionStatus::Success,
        };
        let mut workflow = ctx.workflow_instance(id)?;

        if workflow.state.is_finished() {
            log::debug!("Workflow instance {} already finished as {:?}.", id, workflow.state);
            ctx.repository.remove(id);
            return Ok(());
        }

        if !state.is_success() && state != ExecutionStatus::Stop {
            ctx.kill_active_tasks(id).await?;
        }

        workflow.state = state;
        workflow.end_time = Some(Utc::now());
        ctx.store.update_workflow_instance(&workflow)?;
        ctx.repository.remove(id);

        let duration_ms = match (workflow.start_time, workflow.end_time) {
            (Some(start), Some(end)) => (end - start).num_milliseconds(),
            _ => 0,
        };
        tracing::info!(
            target: LIFECYCLE_TARGET,
            WorkflowInstance = id.value(),
            Workflow = %workflow.name,
            State = ?state,
            DurationMs = duration_ms,
            Host = %ctx.local_host,
        );
        log::info!("Workflow instance {} ({}) finished as {:?}.", id, workflow.name, state);
        Ok(())
    }
}
