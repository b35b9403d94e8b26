use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::domain::utils::id::WorkflowInstanceId;
use crate::domain::workflow::WorkflowGraph;
use crate::error::{Error, Result};

/// Runtime state of a workflow instance owned by this master.
#[derive(Debug)]
pub struct WorkflowExecution {
    pub workflow_instance_id: WorkflowInstanceId,
    pub graph: Arc<WorkflowGraph>,
}

#[derive(Debug, Default)]
struct RepositoryInner {
    closed: bool,
    executions: HashMap<WorkflowInstanceId, Arc<WorkflowExecution>>,
}

/// Workflows this master is currently driving. Being present here is what "owned locally" means
/// for event handling and failover.
#[derive(Debug, Default)]
pub struct WorkflowExecutionRepository {
    inner: RwLock<RepositoryInner>,
}

impl WorkflowExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, execution: WorkflowExecution) -> Result<Arc<WorkflowExecution>> {
        let mut inner = self.inner.write().map_err(|_| Error::Data("execution repository poisoned".to_string()))?;
        if inner.closed {
            return Err(Error::Data("execution repository is closed".to_string()));
        }
        let execution = Arc::new(execution);
        inner.executions.insert(execution.workflow_instance_id, execution.clone());
        Ok(execution)
    }

    pub fn get(&self, id: WorkflowInstanceId) -> Option<Arc<WorkflowExecution>> {
        self.inner.read().ok().and_then(|inner| inner.executions.get(&id).cloned())
    }

    pub fn contains(&self, id: WorkflowInstanceId) -> bool {
        self.get(id).is_some()
    }

    pub fn remove(&self, id: WorkflowInstanceId) -> Option<Arc<WorkflowExecution>> {
        self.inner.write().ok().and_then(|mut inner| inner.executions.remove(&id))
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.executions.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn workflow_instance_ids(&self) -> Vec<WorkflowInstanceId> {
        let mut ids: Vec<_> = self.inner.read().map(|inner| inner.executions.keys().copied().collect()).unwrap_or_default();
        ids.sort();
        ids
    }

    /// Forgets every execution; later inserts fail.
    pub fn close(&self) {
        if let Ok(mut inner) = self.inner.write() {
            inner.closed = true;
            inner.executions.clear();
        }
    }
}
