use serde::{Deserialize, Serialize};

use crate::domain::dag::Dag;
use crate::domain::utils::id::{TaskCode, WorkflowCode};
use crate::error::{Error, Result};

/// Relation code used for "no predecessor" in task relations.
pub const NO_PRE_TASK: i64 = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub code: WorkflowCode,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: i32,
    pub tasks: Vec<TaskDefinition>,
    #[serde(default)]
    pub relations: Vec<TaskRelation>,
}

fn default_version() -> i32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    pub code: TaskCode,
    pub name: String,
    pub task_type: String,
    #[serde(default = "default_worker_group")]
    pub worker_group: String,
    #[serde(default)]
    pub fail_retry_times: u32,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub fn default_worker_group() -> String {
    "default".to_string()
}

impl Default for TaskDefinition {
    fn default() -> Self {
        TaskDefinition {
            code: TaskCode::new(NO_PRE_TASK),
            name: String::new(),
            task_type: String::new(),
            worker_group: default_worker_group(),
            fail_retry_times: 0,
            params: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRelation {
    pub pre_task_code: TaskCode,
    pub post_task_code: TaskCode,
}

impl TaskRelation {
    pub fn new(pre_task_code: i64, post_task_code: i64) -> Self {
        TaskRelation { pre_task_code: TaskCode::new(pre_task_code), post_task_code: TaskCode::new(post_task_code) }
    }
}

/// A compiled workflow definition: the validated task DAG plus its execution order.
///
/// Built once per workflow instance start and then only read.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    pub workflow_code: WorkflowCode,
    dag: Dag<TaskCode, TaskDefinition, ()>,
    execution_order: Vec<TaskCode>,
}

impl WorkflowGraph {
    /// Validates the definition and derives its execution order.
    ///
    /// # Errors
    /// `Error::Data` if a relation references an unknown task, is a self loop or would close a
    /// cycle. `Error::GraphHasCycle` cannot happen for graphs built this way but is propagated.
    pub fn compile(definition: &WorkflowDefinition) -> Result<Self> {
        let mut dag: Dag<TaskCode, TaskDefinition, ()> = Dag::new();

        for task in &definition.tasks {
            if dag.contains_node(&task.code) {
                return Err(Error::Data(format!("Workflow {} defines task {} twice.", definition.code, task.code)));
            }
            dag.add_node(task.code, task.clone());
        }

        for relation in &definition.relations {
            if relation.pre_task_code.value() == NO_PRE_TASK {
                if !dag.contains_node(&relation.post_task_code) {
                    return Err(Error::Data(format!(
                        "Workflow {} has a relation to unknown task {}.",
                        definition.code, relation.post_task_code
                    )));
                }
                continue;
            }

            if !dag.add_edge(relation.pre_task_code, relation.post_task_code, (), false) {
                return Err(Error::Data(format!(
                    "Workflow {}: relation {} -> {} references an unknown task or closes a cycle.",
                    definition.code, relation.pre_task_code, relation.post_task_code
                )));
            }
        }

        let execution_order = dag.topological_sort()?;
        log::debug!("Compiled workflow {} into {} tasks, order {:?}", definition.code, execution_order.len(), execution_order);

        Ok(WorkflowGraph { workflow_code: definition.code, dag, execution_order })
    }

    pub fn execution_order(&self) -> &[TaskCode] {
        &self.execution_order
    }

    pub fn task(&self, code: &TaskCode) -> Option<&TaskDefinition> {
        self.dag.node(code)
    }

    pub fn begin_tasks(&self) -> Vec<TaskCode> {
        self.dag.begin_nodes()
    }

    pub fn end_tasks(&self) -> Vec<TaskCode> {
        self.dag.end_nodes()
    }

    pub fn post_tasks(&self, code: &TaskCode) -> Vec<TaskCode> {
        self.dag.subsequent_nodes(code)
    }

    pub fn pre_tasks(&self, code: &TaskCode) -> Vec<TaskCode> {
        self.dag.previous_nodes(code)
    }

    pub fn task_count(&self) -> usize {
        self.dag.node_count()
    }
}
