pub mod event_bus;
pub mod lifecycle_event;

pub use event_bus::{EventBus, EventPredicate, EventPublisher, LifecycleEventHandler};
pub use lifecycle_event::{EventPayload, LifecycleEvent, LifecycleEventType, TaskEventType, WorkflowEventType};
