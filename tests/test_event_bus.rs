use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use workflow_orchestrator::domain::utils::id::{TaskInstanceId, WorkflowInstanceId};
use workflow_orchestrator::error::{Error, Result};
use workflow_orchestrator::event::{EventBus, LifecycleEvent, LifecycleEventHandler, LifecycleEventType, TaskEventType, WorkflowEventType};

/// Records every delivery. Ids in `fail_once` fail the first time, ids in `panic_once` panic the
/// first time.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<i64>>,
    fail_once: Mutex<HashSet<i64>>,
    panic_once: Mutex<HashSet<i64>>,
}

impl Recorder {
    fn seen(&self) -> Vec<i64> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl LifecycleEventHandler for Recorder {
    async fn handle(&self, event: &LifecycleEvent) -> Result<()> {
        let id = event.target_instance_id;
        self.seen.lock().unwrap().push(id);

        if self.panic_once.lock().unwrap().remove(&id) {
            panic!("handler blew up on {}", id);
        }
        if self.fail_once.lock().unwrap().remove(&id) {
            return Err(Error::Handler(format!("transient failure on {}", id)));
        }
        Ok(())
    }
}

async fn wait_for(recorder: &Recorder, count: usize) -> Vec<i64> {
    for _ in 0..200 {
        let seen = recorder.seen();
        if seen.len() >= count {
            return seen;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    recorder.seen()
}

fn dispatch(id: i64) -> LifecycleEvent {
    LifecycleEvent::task_dispatch(TaskInstanceId::new(id))
}

#[tokio::test]
async fn test_events_are_delivered_in_publish_order() {
    let recorder = Arc::new(Recorder::default());
    let mut bus = EventBus::new("fifo", Duration::from_millis(5));
    bus.register(|e: &LifecycleEvent| e.event_type.is_task(), recorder.clone());
    let publisher = bus.publisher();

    for id in 1..=5 {
        publisher.publish(dispatch(id)).unwrap();
    }
    bus.start().unwrap();

    assert_eq!(wait_for(&recorder, 5).await, vec![1, 2, 3, 4, 5]);
    bus.shutdown().await;
}

#[tokio::test]
async fn test_failed_event_goes_to_the_tail() {
    let recorder = Arc::new(Recorder::default());
    recorder.fail_once.lock().unwrap().insert(1);

    let mut bus = EventBus::new("requeue", Duration::from_millis(5));
    bus.register(|e: &LifecycleEvent| e.event_type.is_task(), recorder.clone());
    let publisher = bus.publisher();
    for id in 1..=3 {
        publisher.publish(dispatch(id)).unwrap();
    }
    bus.start().unwrap();

    assert_eq!(wait_for(&recorder, 4).await, vec![1, 2, 3, 1]);
    assert!(bus.is_running());
    bus.shutdown().await;
}

#[tokio::test]
async fn test_panicking_handler_does_not_stop_the_bus() {
    let recorder = Arc::new(Recorder::default());
    recorder.panic_once.lock().unwrap().insert(10);

    let mut bus = EventBus::new("panic", Duration::from_millis(5));
    bus.register(|e: &LifecycleEvent| e.event_type.is_task(), recorder.clone());
    bus.start().unwrap();

    let publisher = bus.publisher();
    publisher.publish(dispatch(10)).unwrap();
    publisher.publish(dispatch(11)).unwrap();

    assert_eq!(wait_for(&recorder, 3).await, vec![10, 11, 10]);
    assert!(bus.is_running());

    publisher.publish(dispatch(12)).unwrap();
    assert_eq!(wait_for(&recorder, 4).await, vec![10, 11, 10, 12]);
    bus.shutdown().await;
}

#[tokio::test]
async fn test_predicates_route_events_to_their_handlers() {
    let tasks = Arc::new(Recorder::default());
    let workflows = Arc::new(Recorder::default());

    let mut bus = EventBus::new("routing", Duration::from_millis(5));
    bus.register(|e: &LifecycleEvent| e.is(LifecycleEventType::Task(TaskEventType::Dispatch)), tasks.clone())
        .register(|e: &LifecycleEvent| e.is(LifecycleEventType::Workflow(WorkflowEventType::Running)), workflows.clone());
    bus.start().unwrap();

    let publisher = bus.publisher();
    publisher.publish(LifecycleEvent::workflow_running(WorkflowInstanceId::new(7))).unwrap();
    publisher.publish(dispatch(8)).unwrap();
    // Nobody handles this one; it is dropped without stalling the rest.
    publisher.publish(LifecycleEvent::workflow_stopped(WorkflowInstanceId::new(9))).unwrap();
    publisher.publish(dispatch(10)).unwrap();

    assert_eq!(wait_for(&tasks, 2).await, vec![8, 10]);
    assert_eq!(wait_for(&workflows, 1).await, vec![7]);
    bus.shutdown().await;
}

#[tokio::test]
async fn test_publish_fails_once_the_bus_is_gone() {
    let mut bus = EventBus::new("closing", Duration::from_millis(5));
    let publisher = bus.publisher();
    bus.start().unwrap();
    bus.shutdown().await;
    assert!(!bus.is_running());

    drop(bus);
    assert!(matches!(publisher.publish(dispatch(1)), Err(Error::Handler(_))));
}
