//! In-process publish/subscribe for domain events.
//!
//! Handlers subscribe to a [`Topic`]. `publish` runs the handlers of the
//! event's topic one after another in subscription order, so two events
//! published in sequence reach every handler in that order. A failing handler
//! is logged and does not stop the others.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{info_span, warn, Instrument};

use cdm_common::events::{DomainEvent, Topic};

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

pub trait EventHandler: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn handle<'a>(&'a self, event: &'a DomainEvent) -> HandlerFuture<'a>;
}

/// What happened to one publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Delivery {
    pub handled: usize,
    pub failed: usize,
}

#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<RwLock<HashMap<Topic, Vec<Arc<dyn EventHandler>>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: Topic, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        handlers.entry(topic).or_default().push(handler);
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers.get(&topic).map_or(0, Vec::len)
    }

    pub async fn publish(&self, event: DomainEvent) -> Delivery {
        let topic = event.topic();
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
            handlers.get(&topic).cloned().unwrap_or_default()
        };

        let mut delivery = Delivery::default();
        for handler in handlers {
            let span = info_span!(
                "cdm.event.handle",
                topic = topic.as_str(),
                handler = handler.name(),
                node_id = event.node_id()
            );
            match handler.handle(&event).instrument(span).await {
                Ok(()) => delivery.handled += 1,
                Err(error) => {
                    delivery.failed += 1;
                    warn!(
                        topic = topic.as_str(),
                        handler = handler.name(),
                        node_id = event.node_id(),
                        ?error,
                        "event handler failed"
                    );
                }
            }
        }
        delivery
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use cdm_common::events::{ApprovalResolved, ChangeType, NodeChanged, Resolution};

    use super::*;

    struct Recorder {
        label: &'static str,
        seen: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl EventHandler for Recorder {
        fn name(&self) -> &'static str {
            self.label
        }

        fn handle<'a>(&'a self, event: &'a DomainEvent) -> HandlerFuture<'a> {
            Box::pin(async move {
                self.seen.lock().expect("lock").push(format!("{}:{}", self.label, event.node_id()));
                if self.fail {
                    anyhow::bail!("{} refused", self.label);
                }
                Ok(())
            })
        }
    }

    fn resolved(node_id: &str) -> DomainEvent {
        DomainEvent::ApprovalResolved(ApprovalResolved {
            node_id: node_id.into(),
            status: Resolution::Approved,
            approver_id: "u1".into(),
            step_index: 0,
            reason: None,
        })
    }

    #[tokio::test]
    async fn handlers_run_in_order_and_failures_are_isolated() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for (label, fail) in [("first", true), ("second", false)] {
            bus.subscribe(
                Topic::ApprovalResolved,
                Arc::new(Recorder { label, seen: seen.clone(), fail }),
            );
        }

        let delivery = bus.publish(resolved("a")).await;
        bus.publish(resolved("b")).await;

        assert_eq!(delivery, Delivery { handled: 1, failed: 1 });
        assert_eq!(
            *seen.lock().expect("lock"),
            vec!["first:a", "second:a", "first:b", "second:b"]
        );
    }

    #[tokio::test]
    async fn events_only_reach_their_topic() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            Topic::ApprovalResolved,
            Arc::new(Recorder { label: "resolved", seen: seen.clone(), fail: false }),
        );

        let delivery = bus
            .publish(DomainEvent::NodeChanged(NodeChanged {
                graph_id: "g".into(),
                node_id: "t".into(),
                node_name: "Pump".into(),
                change_type: ChangeType::Update,
            }))
            .await;

        assert_eq!(delivery, Delivery::default());
        assert!(seen.lock().expect("lock").is_empty());
        assert_eq!(bus.subscriber_count(Topic::ApprovalResolved), 1);
    }
}
