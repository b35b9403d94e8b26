use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, ErrorKind, Result};
use crate::event::lifecycle_event::LifecycleEvent;

#[async_trait]
pub trait LifecycleEventHandler: Send + Sync {
    /// An error re-queues the event at the tail of the bus, except for `ErrorKind::Data`: an event
    /// about inconsistent or missing instance data is logged and skipped.
    async fn handle(&self, event: &LifecycleEvent) -> Result<()>;
}

pub type EventPredicate = Box<dyn Fn(&LifecycleEvent) -> bool + Send + Sync>;

struct Registration {
    predicate: EventPredicate,
    handler: Arc<dyn LifecycleEventHandler>,
}

/// Cheap, cloneable producer side of an [`EventBus`]. Publishing never blocks.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: mpsc::UnboundedSender<LifecycleEvent>,
}

impl EventPublisher {
    pub fn publish(&self, event: LifecycleEvent) -> Result<()> {
        self.sender.send(event).map_err(|e| Error::Handler(format!("event bus is closed, dropping {}", e.0)))
    }
}

/// Unbounded FIFO of lifecycle events drained by exactly one consumer task.
///
/// For every event, all handlers whose predicate matches run in registration order. An event
/// nobody matches is logged and dropped. When a handler fails or panics, the event is appended to
/// the tail again and the consumer pauses for `failure_backoff`, so delivery is at-least-once.
/// Data errors are the exception: retrying cannot repair a missing instance or definition, so that
/// handler is skipped and delivery goes on with the next one.
pub struct EventBus {
    name: String,
    sender: mpsc::UnboundedSender<LifecycleEvent>,
    receiver: Option<mpsc::UnboundedReceiver<LifecycleEvent>>,
    registrations: Vec<Registration>,
    failure_backoff: Duration,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl EventBus {
    pub fn new(name: impl Into<String>, failure_backoff: Duration) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        EventBus {
            name: name.into(),
            sender,
            receiver: Some(receiver),
            registrations: Vec::new(),
            failure_backoff,
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    pub fn publisher(&self) -> EventPublisher {
        EventPublisher { sender: self.sender.clone() }
    }

    /// Adds a handler for every event `predicate` accepts. Handlers registered after
    /// [`EventBus::start`] are ignored.
    pub fn register<P>(&mut self, predicate: P, handler: Arc<dyn LifecycleEventHandler>) -> &mut Self
    where
        P: Fn(&LifecycleEvent) -> bool + Send + Sync + 'static,
    {
        if self.handle.is_some() {
            log::warn!("[{}] Handler registered after start, it will never be called.", self.name);
        }
        self.registrations.push(Registration { predicate: Box::new(predicate), handler });
        self
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Spawns the consumer task.
    pub fn start(&mut self) -> Result<()> {
        let Some(receiver) = self.receiver.take() else {
            return Err(Error::Config(format!("event bus {} was already started", self.name)));
        };

        let consumer = Consumer {
            name: self.name.clone(),
            requeue: self.sender.clone(),
            registrations: std::mem::take(&mut self.registrations),
            failure_backoff: self.failure_backoff,
            cancel: self.cancel.clone(),
        };
        log::info!("[{}] Event bus started with {} handlers.", self.name, consumer.registrations.len());

        self.handle = Some(tokio::spawn(consumer.run(receiver)));
        Ok(())
    }

    /// Stops the consumer after the event in hand and waits for it. Queued events are dropped.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                log::error!("[{}] Event bus consumer ended abnormally: {}", self.name, e);
            }
        }
    }
}

struct Consumer {
    name: String,
    requeue: mpsc::UnboundedSender<LifecycleEvent>,
    registrations: Vec<Registration>,
    failure_backoff: Duration,
    cancel: CancellationToken,
}

impl Consumer {
    async fn run(self, mut receiver: mpsc::UnboundedReceiver<LifecycleEvent>) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = receiver.recv() => {
                    match next {
                        Some(event) => event,
                        None => break,
                    }
                }
            };

            if self.deliver(&event).await {
                continue;
            }

            if self.requeue.send(event).is_err() {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.failure_backoff) => {}
            }
        }

        log::info!("[{}] Event bus consumer stopped, {} events left unprocessed.", self.name, receiver.len());
    }

    /// Returns `false` when the event has to be re-queued.
    async fn deliver(&self, event: &LifecycleEvent) -> bool {
        let matching: Vec<&Registration> = self.registrations.iter().filter(|r| (r.predicate)(event)).collect();

        if matching.is_empty() {
            tracing::warn!("No handler registered for lifecycle event {}, dropping it", event);
            return true;
        }

        for registration in matching {
            match AssertUnwindSafe(registration.handler.handle(event)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.kind() == ErrorKind::Data => {
                    log::error!("[{}] Skipping {}, its instance data is inconsistent: {}", self.name, event, e);
                }
                Ok(Err(e)) => {
                    log::error!("[{}] Handling {} failed, re-queueing: {}", self.name, event, e);
                    return false;
                }
                Err(_) => {
                    log::error!("[{}] Handler panicked on {}, re-queueing.", self.name, event);
                    return false;
                }
            }
        }
        true
    }
}
