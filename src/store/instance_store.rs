use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::domain::host::Host;
use crate::domain::instance::{TaskInstance, WorkflowInstance};
use crate::domain::utils::id::{TaskInstanceId, WorkflowCode, WorkflowInstanceId};
use crate::domain::workflow::WorkflowDefinition;
use crate::error::{Error, Result};

/// Persistence seen by the orchestration core. The relational schema behind it is not the core's
/// concern; every call is a black-box read or write.
pub trait InstanceStore: std::fmt::Debug + Send + Sync {
    fn save_workflow_definition(&self, definition: WorkflowDefinition) -> Result<()>;

    fn workflow_definition(&self, code: WorkflowCode) -> Result<Option<WorkflowDefinition>>;

    /// Inserts the instance and returns it with its assigned id.
    fn insert_workflow_instance(&self, instance: WorkflowInstance) -> Result<WorkflowInstance>;

    fn workflow_instance(&self, id: WorkflowInstanceId) -> Result<Option<WorkflowInstance>>;

    fn update_workflow_instance(&self, instance: &WorkflowInstance) -> Result<()>;

    /// Inserts the instance and returns it with its assigned id.
    fn insert_task_instance(&self, instance: TaskInstance) -> Result<TaskInstance>;

    fn task_instance(&self, id: TaskInstanceId) -> Result<Option<TaskInstance>>;

    fn update_task_instance(&self, instance: &TaskInstance) -> Result<()>;

    /// All task instances (every attempt) of a workflow instance, oldest first.
    fn task_instances_of_workflow(&self, id: WorkflowInstanceId) -> Result<Vec<TaskInstance>>;

    /// Task instances bound to `host` that are not finished.
    fn query_need_failover_task_instances(&self, host: &Host) -> Result<Vec<TaskInstance>>;

    /// Workflow instances bound to `host` that are not finished.
    fn query_need_failover_workflow_instances(&self, host: &Host) -> Result<Vec<WorkflowInstance>>;

    /// Distinct, non-empty hosts owning unfinished workflow instances.
    fn workflow_instance_hosts(&self) -> Result<Vec<Host>>;
}

#[derive(Debug, Default)]
struct StoreInner {
    closed: bool,
    next_workflow_instance_id: i64,
    next_task_instance_id: i64,
    definitions: HashMap<WorkflowCode, WorkflowDefinition>,
    workflow_instances: BTreeMap<WorkflowInstanceId, WorkflowInstance>,
    task_instances: BTreeMap<TaskInstanceId, TaskInstance>,
}

/// In-process [`InstanceStore`]. Cheap to clone, all clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryInstanceStore {
    /// All maps are protected with a single lock.
    inner: Arc<RwLock<StoreInner>>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops all data. Later calls fail with `Error::Data`.
    pub fn close(&self) {
        if let Ok(mut guard) = self.inner.write() {
            *guard = StoreInner { closed: true, ..StoreInner::default() };
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, StoreInner>> {
        let guard = self.inner.read().map_err(|_| Error::Data("instance store lock poisoned".to_string()))?;
        if guard.closed {
            return Err(Error::Data("instance store is closed".to_string()));
        }
        Ok(guard)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StoreInner>> {
        let guard = self.inner.write().map_err(|_| Error::Data("instance store lock poisoned".to_string()))?;
        if guard.closed {
            return Err(Error::Data("instance store is closed".to_string()));
        }
        Ok(guard)
    }
}

impl InstanceStore for MemoryInstanceStore {
    fn save_workflow_definition(&self, definition: WorkflowDefinition) -> Result<()> {
        let mut guard = self.write()?;
        guard.definitions.insert(definition.code, definition);
        Ok(())
    }

    fn workflow_definition(&self, code: WorkflowCode) -> Result<Option<WorkflowDefinition>> {
        Ok(self.read()?.definitions.get(&code).cloned())
    }

    fn insert_workflow_instance(&self, mut instance: WorkflowInstance) -> Result<WorkflowInstance> {
        let mut guard = self.write()?;
        guard.next_workflow_instance_id += 1;
        instance.id = WorkflowInstanceId::new(guard.next_workflow_instance_id);
        guard.workflow_instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    fn workflow_instance(&self, id: WorkflowInstanceId) -> Result<Option<WorkflowInstance>> {
        Ok(self.read()?.workflow_instances.get(&id).cloned())
    }

    fn update_workflow_instance(&self, instance: &WorkflowInstance) -> Result<()> {
        let mut guard = self.write()?;
        match guard.workflow_instances.get_mut(&instance.id) {
            Some(stored) => {
                *stored = instance.clone();
                Ok(())
            }
            None => Err(Error::Data(format!("Workflow instance {} does not exist.", instance.id))),
        }
    }

    fn insert_task_instance(&self, mut instance: TaskInstance) -> Result<TaskInstance> {
        let mut guard = self.write()?;
        guard.next_task_instance_id += 1;
        instance.id = TaskInstanceId::new(guard.next_task_instance_id);
        guard.task_instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    fn task_instance(&self, id: TaskInstanceId) -> Result<Option<TaskInstance>> {
        Ok(self.read()?.task_instances.get(&id).cloned())
    }

    fn update_task_instance(&self, instance: &TaskInstance) -> Result<()> {
        let mut guard = self.write()?;
        match guard.task_instances.get_mut(&instance.id) {
            Some(stored) => {
                *stored = instance.clone();
                Ok(())
            }
            None => Err(Error::Data(format!("Task instance {} does not exist.", instance.id))),
        }
    }

    fn task_instances_of_workflow(&self, id: WorkflowInstanceId) -> Result<Vec<TaskInstance>> {
        let guard = self.read()?;
        Ok(guard.task_instances.values().filter(|task| task.workflow_instance_id == id).cloned().collect())
    }

    fn query_need_failover_task_instances(&self, host: &Host) -> Result<Vec<TaskInstance>> {
        let guard = self.read()?;
        Ok(guard.task_instances.values().filter(|task| &task.host == host && !task.state.is_finished()).cloned().collect())
    }

    fn query_need_failover_workflow_instances(&self, host: &Host) -> Result<Vec<WorkflowInstance>> {
        let guard = self.read()?;
        Ok(guard.workflow_instances.values().filter(|workflow| &workflow.host == host && !workflow.state.is_finished()).cloned().collect())
    }

    fn workflow_instance_hosts(&self) -> Result<Vec<Host>> {
        let guard = self.read()?;
        let hosts: BTreeSet<Host> = guard
            .workflow_instances
            .values()
            .filter(|workflow| !workflow.state.is_finished() && !workflow.host.is_empty())
            .map(|workflow| workflow.host.clone())
            .collect();
        Ok(hosts.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::instance::ExecutionStatus;
    use crate::domain::utils::id::TaskCode;
    use crate::domain::workflow::TaskDefinition;

    fn task_on(store: &MemoryInstanceStore, workflow: WorkflowInstanceId, host: &Host, state: ExecutionStatus) -> TaskInstance {
        let def = TaskDefinition { code: TaskCode::new(1), name: "t".into(), task_type: "SHELL".into(), ..Default::default() };
        let mut task = TaskInstance::from_definition(workflow, &def);
        task.host = host.clone();
        task.state = state;
        store.insert_task_instance(task).unwrap()
    }

    #[test]
    fn assigns_increasing_ids() {
        let store = MemoryInstanceStore::new();
        let a = store.insert_workflow_instance(WorkflowInstance::new(WorkflowCode::new(1), "a")).unwrap();
        let b = store.insert_workflow_instance(WorkflowInstance::new(WorkflowCode::new(1), "b")).unwrap();

        assert!(b.id > a.id);
        assert_eq!(store.workflow_instance(a.id).unwrap().unwrap().name, "a");
    }

    #[test]
    fn failover_query_only_returns_unfinished_on_host() {
        let store = MemoryInstanceStore::new();
        let dead = Host::new("10.0.0.1", 1234);
        let alive = Host::new("10.0.0.2", 1234);
        let wf = WorkflowInstanceId::new(1);

        let running = task_on(&store, wf, &dead, ExecutionStatus::RunningExecution);
        task_on(&store, wf, &dead, ExecutionStatus::Success);
        task_on(&store, wf, &alive, ExecutionStatus::RunningExecution);

        let found = store.query_need_failover_task_instances(&dead).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, running.id);
    }

    #[test]
    fn update_of_unknown_instance_is_a_data_error() {
        let store = MemoryInstanceStore::new();
        let instance = WorkflowInstance::new(WorkflowCode::new(1), "ghost");

        assert!(matches!(store.update_workflow_instance(&instance), Err(Error::Data(_))));
    }

    #[test]
    fn closed_store_rejects_calls() {
        let store = MemoryInstanceStore::new();
        store.close();

        assert!(store.workflow_instance_hosts().is_err());
    }
}
