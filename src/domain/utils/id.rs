use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;

/// Numeric identifier tagged with the kind of entity it points to, so a task code can never be
/// passed where a workflow instance id is expected.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(transparent, bound = "")]
pub struct Id<T> {
    pub id: i64,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T> Id<T> {
    pub const fn new(id: i64) -> Self {
        Id { id, _marker: PhantomData }
    }

    pub fn value(&self) -> i64 {
        self.id
    }
}

impl<T> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl<T> From<Id<T>> for i64 {
    fn from(id_wrapper: Id<T>) -> Self {
        id_wrapper.id
    }
}

impl<T> From<i64> for Id<T> {
    fn from(id: i64) -> Self {
        Id::new(id)
    }
}

impl<T> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let full_name = std::any::type_name::<T>();
        let clean_name = full_name.split("::").last().unwrap_or(full_name);
        let display_name = clean_name.replace("Tag", "Id");

        write!(f, "{}: {}", display_name, self.id)
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Copy)]
pub struct WorkflowCodeTag;
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Copy)]
pub struct TaskCodeTag;
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Copy)]
pub struct WorkflowInstanceTag;
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Copy)]
pub struct TaskInstanceTag;

// Definition codes
pub type WorkflowCode = Id<WorkflowCodeTag>;
pub type TaskCode = Id<TaskCodeTag>;

// Runtime instance ids
pub type WorkflowInstanceId = Id<WorkflowInstanceTag>;
pub type TaskInstanceId = Id<TaskInstanceTag>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_names_the_tag() {
        let id = TaskCode::new(42);
        assert_eq!(format!("{:?}", id), "TaskCodeId: 42");
        assert_eq!(id.to_string(), "42");
    }

    #[test]
    fn serializes_as_plain_number() {
        let id = WorkflowInstanceId::new(7);
        assert_eq!(serde_json::to_string(&id).unwrap(), "7");
        let back: WorkflowInstanceId = serde_json::from_str("7").unwrap();
        assert_eq!(back, id);
    }
}
