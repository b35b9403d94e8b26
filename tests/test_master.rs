use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use workflow_orchestrator::config::{MasterConfig, RpcConfig};
use workflow_orchestrator::domain::host::Host;
use workflow_orchestrator::domain::instance::ExecutionStatus;
use workflow_orchestrator::domain::utils::id::{TaskCode, TaskInstanceId, WorkflowCode, WorkflowInstanceId};
use workflow_orchestrator::domain::workflow::{TaskDefinition, TaskRelation, WorkflowDefinition};
use workflow_orchestrator::error::{Error, Result};
use workflow_orchestrator::ha::ServerStatus;
use workflow_orchestrator::master::MasterServer;
use workflow_orchestrator::metrics::RpcMetrics;
use workflow_orchestrator::registry::{MemoryRegistry, MemoryRegistryClient, Registry, Server};
use workflow_orchestrator::remote::codec::DEFAULT_MAX_FRAME_LENGTH;
use workflow_orchestrator::remote::command::{
    TaskDispatchRequest, TaskExecutionEventAck, TaskExecutionEventKind, TaskExecutionEventRequest, TaskKillRequest, method,
};
use workflow_orchestrator::remote::{RpcClient, RpcMethodHandler, RpcRequest, RpcServer, Transporter};
use workflow_orchestrator::store::{InstanceStore, MemoryInstanceStore};

/// State shared by the handlers of one fake worker.
struct WorkerState {
    host: Mutex<Host>,
    client: RpcClient,
    /// Report SUCCESS after RUNNING. Otherwise the task runs until killed.
    completes: bool,
    dispatched: Mutex<Vec<TaskInstanceId>>,
    killed: Mutex<Vec<TaskInstanceId>>,
    acks: Mutex<Vec<TaskExecutionEventAck>>,
}

impl WorkerState {
    fn host(&self) -> Host {
        self.host.lock().unwrap().clone()
    }

    async fn report(&self, request: &TaskDispatchRequest, kind: TaskExecutionEventKind) {
        let event = TaskExecutionEventRequest {
            task_instance_id: request.task_instance_id,
            workflow_instance_id: request.workflow_instance_id,
            kind,
            worker_host: self.host(),
            need_ack: true,
            message: None,
            event_time: Utc::now(),
        };
        let rpc = RpcRequest::new(method::TASK_EXECUTION_EVENT, &event).unwrap();
        if let Err(e) = self.client.send_sync(&request.master_host, &rpc).await {
            eprintln!("worker report failed: {}", e);
        }
    }
}

struct Executor(Arc<WorkerState>);

#[async_trait]
impl RpcMethodHandler for Executor {
    async fn handle(&self, request: &Transporter) -> Result<Value> {
        let dispatch: TaskDispatchRequest = request.decode_body()?;
        self.0.dispatched.lock().unwrap().push(dispatch.task_instance_id);

        let state = self.0.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            state.report(&dispatch, TaskExecutionEventKind::Running).await;
            if state.completes {
                tokio::time::sleep(Duration::from_millis(20)).await;
                state.report(&dispatch, TaskExecutionEventKind::Success).await;
            }
        });
        Ok(Value::Null)
    }
}

struct Killer(Arc<WorkerState>);

#[async_trait]
impl RpcMethodHandler for Killer {
    async fn handle(&self, request: &Transporter) -> Result<Value> {
        let kill: TaskKillRequest = request.decode_body()?;
        self.0.killed.lock().unwrap().push(kill.task_instance_id);
        Ok(Value::Null)
    }
}

struct AckReceiver(Arc<WorkerState>);

#[async_trait]
impl RpcMethodHandler for AckReceiver {
    async fn handle(&self, request: &Transporter) -> Result<Value> {
        self.0.acks.lock().unwrap().push(request.decode_body()?);
        Ok(Value::Null)
    }
}

struct FakeWorker {
    server: RpcServer,
    session: MemoryRegistryClient,
    state: Arc<WorkerState>,
}

impl FakeWorker {
    async fn start(registry: &MemoryRegistry, completes: bool, weight: u32) -> Self {
        let state = Arc::new(WorkerState {
            host: Mutex::new(Host::empty()),
            client: RpcClient::new(Host::empty(), RpcConfig::default().client_config(), Arc::new(RpcMetrics::new())),
            completes,
            dispatched: Mutex::new(Vec::new()),
            killed: Mutex::new(Vec::new()),
            acks: Mutex::new(Vec::new()),
        });

        let mut server = RpcServer::new("fake-worker", DEFAULT_MAX_FRAME_LENGTH);
        server
            .register(method::DISPATCH_TASK, Arc::new(Executor(state.clone())))
            .register(method::KILL_TASK, Arc::new(Killer(state.clone())))
            .register(method::TASK_EXECUTION_EVENT_ACK, Arc::new(AckReceiver(state.clone())));
        let addr = server.start("127.0.0.1:0").await.unwrap();
        let host = Host::new("127.0.0.1", addr.port());
        *state.host.lock().unwrap() = host.clone();

        let session = registry.connect();
        session.register(Server::worker(host, vec!["default".into()]).with_weight(weight)).await.unwrap();
        FakeWorker { server, session, state }
    }

    /// Process death: the registry session ends and the port closes.
    async fn kill(&mut self) {
        self.session.close();
        self.server.shutdown().await;
        self.state.client.close().await;
    }
}

fn master_config() -> MasterConfig {
    let mut config = MasterConfig { listen_port: 0, ..MasterConfig::default() };
    config.log.dir = None;
    config.dispatch.retry_times = 2;
    config.dispatch.retry_interval_ms = 10;
    config.event_bus.failure_backoff_ms = 20;
    config.election.interval_ms = 50;
    config.election.lock_wait_ms = 10;
    config
}

fn task(code: i64, name: &str) -> TaskDefinition {
    TaskDefinition { code: TaskCode::new(code), name: name.to_string(), task_type: "SHELL".to_string(), ..Default::default() }
}

/// extract -> (clean, enrich)
fn fan_out_workflow() -> WorkflowDefinition {
    WorkflowDefinition {
        code: WorkflowCode::new(100),
        name: "nightly-etl".to_string(),
        version: 1,
        tasks: vec![task(1, "extract"), task(2, "clean"), task(3, "enrich")],
        relations: vec![TaskRelation::new(0, 1), TaskRelation::new(1, 2), TaskRelation::new(1, 3)],
    }
}

async fn wait_for_workflow(store: &MemoryInstanceStore, id: WorkflowInstanceId, state: ExecutionStatus) -> ExecutionStatus {
    let mut current = ExecutionStatus::SubmittedSuccess;
    for _ in 0..500 {
        current = store.workflow_instance(id).unwrap().unwrap().state;
        if current == state {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    current
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_workflow_runs_to_success_on_a_worker() {
    let registry = MemoryRegistry::new();
    let store = Arc::new(MemoryInstanceStore::new());
    let mut worker = FakeWorker::start(&registry, true, 100).await;

    let master = MasterServer::start(master_config(), Arc::new(registry.connect()), store.clone()).await.unwrap();
    master.wait_until_active().await;
    let id = master.submit_workflow(fan_out_workflow()).unwrap();

    assert_eq!(wait_for_workflow(&store, id, ExecutionStatus::Success).await, ExecutionStatus::Success);

    let tasks = store.task_instances_of_workflow(id).unwrap();
    assert_eq!(tasks.len(), 3);
    assert!(tasks.iter().all(|t| t.state == ExecutionStatus::Success && t.host == worker.state.host()));
    assert_eq!(worker.state.dispatched.lock().unwrap().len(), 3);

    // extract ran before both of its successors were dispatched.
    let extract = tasks.iter().find(|t| t.name == "extract").unwrap();
    assert_eq!(worker.state.dispatched.lock().unwrap()[0], extract.id);

    // Every report asked for an ack: RUNNING and SUCCESS per task.
    assert!(wait_until(|| worker.state.acks.lock().unwrap().len() == 6).await);
    assert!(master.running_workflows().is_empty());

    let workflow = store.workflow_instance(id).unwrap().unwrap();
    assert_eq!(workflow.host, *master.local_host());
    assert!(workflow.end_time.is_some());

    master.shutdown().await;
    worker.kill().await;
}

#[tokio::test]
async fn test_stop_kills_running_tasks() {
    let registry = MemoryRegistry::new();
    let store = Arc::new(MemoryInstanceStore::new());
    let mut worker = FakeWorker::start(&registry, false, 100).await;

    let master = MasterServer::start(master_config(), Arc::new(registry.connect()), store.clone()).await.unwrap();
    master.wait_until_active().await;
    let id = master.submit_workflow(fan_out_workflow()).unwrap();

    let running = wait_until(|| {
        store.task_instances_of_workflow(id).unwrap().iter().any(|t| t.state == ExecutionStatus::RunningExecution)
    })
    .await;
    assert!(running);

    master.stop_workflow(id).unwrap();

    assert_eq!(wait_for_workflow(&store, id, ExecutionStatus::Stop).await, ExecutionStatus::Stop);
    let tasks = store.task_instances_of_workflow(id).unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].state, ExecutionStatus::Kill);
    assert_eq!(*worker.state.killed.lock().unwrap(), vec![tasks[0].id]);

    master.shutdown().await;
    worker.kill().await;
}

#[tokio::test]
async fn test_task_of_dead_worker_is_rerun_elsewhere() {
    let registry = MemoryRegistry::new();
    let store = Arc::new(MemoryInstanceStore::new());
    // Lower weight: the balancer prefers the worker that is about to die.
    let mut doomed = FakeWorker::start(&registry, false, 1).await;
    let mut healthy = FakeWorker::start(&registry, true, 100).await;

    let master = MasterServer::start(master_config(), Arc::new(registry.connect()), store.clone()).await.unwrap();
    assert!(wait_until(|| master.status() == ServerStatus::Active).await);

    let single = WorkflowDefinition {
        code: WorkflowCode::new(200),
        name: "report".to_string(),
        version: 1,
        tasks: vec![task(1, "render")],
        relations: vec![TaskRelation::new(0, 1)],
    };
    let id = master.submit_workflow(single).unwrap();

    let doomed_host = doomed.state.host();
    assert!(
        wait_until(|| {
            store.task_instances_of_workflow(id).unwrap().iter().any(|t| t.state == ExecutionStatus::RunningExecution && t.host == doomed_host)
        })
        .await
    );

    doomed.kill().await;

    assert_eq!(wait_for_workflow(&store, id, ExecutionStatus::Success).await, ExecutionStatus::Success);
    let mut tasks = store.task_instances_of_workflow(id).unwrap();
    tasks.sort_by_key(|t| t.id);
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].state, ExecutionStatus::NeedFaultTolerance);
    assert_eq!(tasks[0].host, doomed_host);
    assert_eq!(tasks[1].state, ExecutionStatus::Success);
    assert_eq!(tasks[1].host, healthy.state.host());
    assert_eq!(tasks[1].retry_times, 1);

    master.shutdown().await;
    healthy.kill().await;
}

#[tokio::test]
async fn test_standby_master_does_not_schedule() {
    let registry = MemoryRegistry::new();
    let mut worker = FakeWorker::start(&registry, true, 100).await;

    let active_store = Arc::new(MemoryInstanceStore::new());
    let active = MasterServer::start(master_config(), Arc::new(registry.connect()), active_store.clone()).await.unwrap();
    active.wait_until_active().await;

    let standby_store = Arc::new(MemoryInstanceStore::new());
    let standby = MasterServer::start(master_config(), Arc::new(registry.connect()), standby_store.clone()).await.unwrap();
    // Several election rounds: the lock stays with the first master.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(standby.status(), ServerStatus::StandBy);

    let outcome = standby.submit_workflow(fan_out_workflow());

    assert!(matches!(outcome, Err(Error::Election(_))), "got {:?}", outcome);
    assert!(standby_store.workflow_instance(WorkflowInstanceId::new(1)).unwrap().is_none());
    assert!(standby.running_workflows().is_empty());
    assert!(worker.state.dispatched.lock().unwrap().is_empty());

    // The active master still takes the same workflow.
    let id = active.submit_workflow(fan_out_workflow()).unwrap();
    assert_eq!(wait_for_workflow(&active_store, id, ExecutionStatus::Success).await, ExecutionStatus::Success);

    standby.shutdown().await;
    active.shutdown().await;
    worker.kill().await;
}
