use std::sync::Arc;
use std::time::Duration;

use crate::config::MasterConfig;
use crate::dispatch::Dispatcher;
use crate::domain::host::Host;
use crate::domain::instance::WorkflowInstance;
use crate::domain::utils::id::WorkflowInstanceId;
use crate::domain::workflow::{WorkflowDefinition, WorkflowGraph};
use crate::engine::execution_repository::WorkflowExecutionRepository;
use crate::engine::rpc_handlers::register_master_methods;
use crate::engine::{EngineContext, SchedulingGate, register_lifecycle_handlers};
use crate::error::{Error, Result};
use crate::event::{EventBus, EventPublisher, LifecycleEvent};
use crate::failover::FailoverCoordinator;
use crate::ha::{HaServer, ServerStatus};
use crate::metrics::{MetricsExporter, RpcMetrics};
use crate::registry::{NodeType, Registry, Server};
use crate::remote::{RpcClient, RpcServer};
use crate::store::InstanceStore;

/// One master process: RPC endpoint, lifecycle engine, election and failover wired together.
pub struct MasterServer {
    local_host: Host,
    registry: Arc<dyn Registry>,
    store: Arc<dyn InstanceStore>,
    rpc_server: RpcServer,
    rpc_client: Arc<RpcClient>,
    bus: EventBus,
    publisher: EventPublisher,
    repository: Arc<WorkflowExecutionRepository>,
    ha: Arc<HaServer>,
    gate: Arc<SchedulingGate>,
    election_interval: Duration,
    failover: Arc<FailoverCoordinator>,
    metrics: Arc<RpcMetrics>,
    exporter: Option<MetricsExporter>,
}

impl MasterServer {
    /// Binds the RPC port, registers in the registry and starts every background loop.
    ///
    /// With `listen_port == 0` the OS picks the port; the bound one becomes the master's host.
    pub async fn start(config: MasterConfig, registry: Arc<dyn Registry>, store: Arc<dyn InstanceStore>) -> Result<Self> {
        config.validate()?;

        let mut bus = EventBus::new("master-events", config.event_bus.failure_backoff());
        let publisher = bus.publisher();

        let mut rpc_server = RpcServer::new("master", config.rpc.max_frame_length);
        register_master_methods(&mut rpc_server, publisher.clone());
        let bound = rpc_server.start(&config.listen_address()).await?;
        let local_host = Host::new(config.listen_host.clone(), bound.port());

        let metrics = Arc::new(RpcMetrics::new());
        let rpc_client = Arc::new(RpcClient::new(local_host.clone(), config.rpc.client_config(), metrics.clone()));
        let dispatcher = Arc::new(Dispatcher::new(rpc_client.clone(), registry.clone(), &config.dispatch));
        let repository = Arc::new(WorkflowExecutionRepository::new());
        let gate = Arc::new(SchedulingGate::new(false));

        let context = Arc::new(EngineContext {
            local_host: local_host.clone(),
            store: store.clone(),
            dispatcher,
            publisher: publisher.clone(),
            repository: repository.clone(),
            gate: gate.clone(),
        });
        register_lifecycle_handlers(&mut bus, context);
        bus.start()?;

        registry.register(Server::master(local_host.clone())).await?;

        let failover = Arc::new(FailoverCoordinator::new(local_host.clone(), registry.clone(), store.clone(), publisher.clone(), repository.clone()));
        failover.start().await?;

        let ha = Arc::new(HaServer::new(format!("master-{}", local_host), registry.clone(), &config.election));
        ha.add_listener(gate.clone());
        ha.add_listener(failover.clone());
        ha.start().await?;

        let exporter = match &config.metrics.csv_path {
            Some(path) => Some(MetricsExporter::start(metrics.clone(), Some(path.clone()), Duration::from_millis(config.metrics.export_interval_ms))?),
            None => None,
        };

        log::info!("Master {} started.", local_host);
        Ok(MasterServer {
            local_host,
            registry,
            store,
            rpc_server,
            rpc_client,
            bus,
            publisher,
            repository,
            ha,
            gate,
            election_interval: config.election.interval(),
            failover,
            metrics,
            exporter,
        })
    }

    pub fn local_host(&self) -> &Host {
        &self.local_host
    }

    pub fn status(&self) -> ServerStatus {
        self.ha.status()
    }

    /// Resolves once this master won the election.
    pub async fn wait_until_active(&self) {
        while !self.gate.is_open() {
            tokio::time::sleep(self.election_interval).await;
        }
    }

    pub fn store(&self) -> &Arc<dyn InstanceStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<RpcMetrics> {
        &self.metrics
    }

    pub fn running_workflows(&self) -> Vec<WorkflowInstanceId> {
        self.repository.workflow_instance_ids()
    }

    /// Stores the definition, creates an instance owned by this master and starts it.
    ///
    /// # Errors
    /// `Error::Election` while this master is STAND_BY, `Error::Data` if the definition does not
    /// compile.
    pub fn submit_workflow(&self, definition: WorkflowDefinition) -> Result<WorkflowInstanceId> {
        if !self.gate.is_open() {
            return Err(Error::Election(format!("master {} is not ACTIVE, submit workflows to the active master", self.local_host)));
        }
        WorkflowGraph::compile(&definition)?;

        let mut instance = WorkflowInstance::new(definition.code, definition.name.clone());
        instance.host = self.local_host.clone();
        self.store.save_workflow_definition(definition)?;
        let instance = self.store.insert_workflow_instance(instance)?;

        log::info!("Submitted workflow instance {} ({}).", instance.id, instance.name);
        self.publisher.publish(LifecycleEvent::workflow_ready_to_run(instance.id, false))?;
        Ok(instance.id)
    }

    pub fn stop_workflow(&self, id: WorkflowInstanceId) -> Result<()> {
        self.publisher.publish(LifecycleEvent::workflow_ready_to_stop(id))
    }

    /// Stops every loop in reverse start order and leaves the cluster.
    pub async fn shutdown(mut self) {
        log::info!("Shutting down master {}.", self.local_host);

        self.ha.shutdown().await;
        self.failover.shutdown().await;
        if let Err(e) = self.registry.unregister(NodeType::Master, &self.local_host).await {
            log::warn!("Could not unregister {}: {}", self.local_host, e);
        }
        self.bus.shutdown().await;
        self.rpc_server.shutdown().await;
        self.rpc_client.close().await;
        self.repository.close();
        if let Some(mut exporter) = self.exporter.take() {
            exporter.shutdown();
        }
    }
}
