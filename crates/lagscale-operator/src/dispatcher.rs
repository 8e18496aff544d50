//! Watch dispatcher
//!
//! Maps change notifications for every watched kind back to the
//! ConsumerAutoscaler keys that must be reconciled. Topic changes are
//! resolved through a reverse index built from the autoscaler events
//! themselves; child changes through their owner reference.

use crate::model::{ChangeType, ObjectKey, ResourceEvent, ResourceKind};
use crate::queue::WorkQueue;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// What an autoscaler looked like the last time the dispatcher saw it
#[derive(Debug, Clone)]
struct Seen {
    topic: Option<ObjectKey>,
    generation: Option<i64>,
}

/// Resolves watch events to reconcile keys
#[derive(Default)]
pub struct Dispatcher {
    /// topic key -> autoscalers consuming it
    by_topic: DashMap<ObjectKey, BTreeSet<ObjectKey>>,
    /// autoscaler key -> last seen topic reference and generation
    autoscalers: DashMap<ObjectKey, Seen>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Autoscaler keys to reconcile for `event`; empty when nothing owns it
    pub fn resolve(&self, event: &ResourceEvent) -> Vec<ObjectKey> {
        match event.kind {
            ResourceKind::ConsumerAutoscaler => self.resolve_autoscaler(event),
            ResourceKind::Topic => self
                .by_topic
                .get(&event.key)
                .map(|keys| keys.iter().cloned().collect())
                .unwrap_or_default(),
            ResourceKind::Child(_) => event
                .owner
                .as_ref()
                .filter(|owner| !owner.is_empty())
                .map(|owner| vec![event.key.sibling(owner.clone())])
                .unwrap_or_default(),
        }
    }

    fn resolve_autoscaler(&self, event: &ResourceEvent) -> Vec<ObjectKey> {
        let key = event.key.clone();

        if event.change == ChangeType::Deleted {
            if let Some((_, seen)) = self.autoscalers.remove(&key) {
                self.unindex(&key, seen.topic.as_ref());
            }
            return vec![key];
        }

        let topic = event.topic_ref.as_ref().map(|t| key.sibling(t.clone()));
        let previous = self.autoscalers.insert(
            key.clone(),
            Seen {
                topic: topic.clone(),
                generation: event.generation,
            },
        );

        if let Some(previous) = &previous {
            if previous.topic != topic {
                self.unindex(&key, previous.topic.as_ref());
            }
        }
        if let Some(topic) = &topic {
            self.by_topic
                .entry(topic.clone())
                .or_default()
                .insert(key.clone());
        }

        // Status writes do not bump the generation; skip them
        match previous {
            Some(previous)
                if event.change == ChangeType::Modified
                    && event.generation.is_some()
                    && previous.generation == event.generation =>
            {
                trace!(key = %key, "Generation unchanged, ignoring event");
                vec![]
            }
            _ => vec![key],
        }
    }

    fn unindex(&self, key: &ObjectKey, topic: Option<&ObjectKey>) {
        let Some(topic) = topic else {
            return;
        };
        if let Some(mut keys) = self.by_topic.get_mut(topic) {
            keys.remove(key);
        }
        self.by_topic.remove_if(topic, |_, keys| keys.is_empty());
    }

    /// Feed `events` into `queue` until the stream ends
    pub async fn run(self: Arc<Self>, mut events: BoxStream<'static, ResourceEvent>, queue: Arc<WorkQueue>) {
        info!("Starting watch dispatcher");

        while let Some(event) = events.next().await {
            metrics::counter!("lagscale_watch_events_total", "kind" => event.kind.as_str())
                .increment(1);

            let keys = self.resolve(&event);
            if keys.is_empty() {
                trace!(kind = event.kind.as_str(), key = %event.key, "No owner for event, dropping");
                continue;
            }
            for key in keys {
                debug!(
                    kind = event.kind.as_str(),
                    source = %event.key,
                    key = %key,
                    change = ?event.change,
                    "Enqueueing reconcile"
                );
                queue.enqueue(key);
            }
        }

        info!("Watch stream ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChildKind;

    fn autoscaler_event(name: &str, topic: &str, generation: i64, change: ChangeType) -> ResourceEvent {
        ResourceEvent::new(
            ResourceKind::ConsumerAutoscaler,
            ObjectKey::new("default", name),
            change,
        )
        .with_topic_ref(topic)
        .with_generation(Some(generation))
    }

    fn topic_event(name: &str) -> ResourceEvent {
        ResourceEvent::new(
            ResourceKind::Topic,
            ObjectKey::new("default", name),
            ChangeType::Modified,
        )
    }

    #[test]
    fn test_autoscaler_maps_to_itself() {
        let dispatcher = Dispatcher::new();
        let keys = dispatcher.resolve(&autoscaler_event("orders", "orders-topic", 1, ChangeType::Added));
        assert_eq!(keys, vec![ObjectKey::new("default", "orders")]);
    }

    #[test]
    fn test_topic_resolves_through_reverse_index() {
        let dispatcher = Dispatcher::new();
        dispatcher.resolve(&autoscaler_event("orders", "orders-topic", 1, ChangeType::Added));

        assert_eq!(
            dispatcher.resolve(&topic_event("orders-topic")),
            vec![ObjectKey::new("default", "orders")]
        );
    }

    #[test]
    fn test_unreferenced_topic_is_dropped() {
        let dispatcher = Dispatcher::new();
        assert!(dispatcher.resolve(&topic_event("orphan")).is_empty());
    }

    #[test]
    fn test_shared_topic_fans_out() {
        let dispatcher = Dispatcher::new();
        dispatcher.resolve(&autoscaler_event("billing", "events", 1, ChangeType::Added));
        dispatcher.resolve(&autoscaler_event("audit", "events", 1, ChangeType::Added));

        assert_eq!(
            dispatcher.resolve(&topic_event("events")),
            vec![
                ObjectKey::new("default", "audit"),
                ObjectKey::new("default", "billing")
            ]
        );
    }

    #[test]
    fn test_topic_change_moves_index() {
        let dispatcher = Dispatcher::new();
        dispatcher.resolve(&autoscaler_event("orders", "old-topic", 1, ChangeType::Added));
        dispatcher.resolve(&autoscaler_event("orders", "new-topic", 2, ChangeType::Modified));

        assert!(dispatcher.resolve(&topic_event("old-topic")).is_empty());
        assert_eq!(dispatcher.resolve(&topic_event("new-topic")).len(), 1);
    }

    #[test]
    fn test_deleted_autoscaler_leaves_index() {
        let dispatcher = Dispatcher::new();
        dispatcher.resolve(&autoscaler_event("orders", "orders-topic", 1, ChangeType::Added));
        let keys = dispatcher.resolve(&autoscaler_event("orders", "orders-topic", 1, ChangeType::Deleted));

        assert_eq!(keys, vec![ObjectKey::new("default", "orders")]);
        assert!(dispatcher.resolve(&topic_event("orders-topic")).is_empty());
    }

    #[test]
    fn test_status_only_update_is_filtered() {
        let dispatcher = Dispatcher::new();
        dispatcher.resolve(&autoscaler_event("orders", "t", 1, ChangeType::Added));
        assert!(dispatcher
            .resolve(&autoscaler_event("orders", "t", 1, ChangeType::Modified))
            .is_empty());
        assert_eq!(
            dispatcher
                .resolve(&autoscaler_event("orders", "t", 2, ChangeType::Modified))
                .len(),
            1
        );
    }

    #[test]
    fn test_child_resolves_to_owner() {
        let dispatcher = Dispatcher::new();
        let event = ResourceEvent::new(
            ResourceKind::Child(ChildKind::ScalingPolicy),
            ObjectKey::new("default", "orders-scaler"),
            ChangeType::Modified,
        )
        .with_owner("orders");
        assert_eq!(
            dispatcher.resolve(&event),
            vec![ObjectKey::new("default", "orders")]
        );

        let unowned = ResourceEvent::new(
            ResourceKind::Child(ChildKind::Deployment),
            ObjectKey::new("default", "stray"),
            ChangeType::Added,
        );
        assert!(dispatcher.resolve(&unowned).is_empty());
    }

    #[tokio::test]
    async fn test_run_enqueues_resolved_keys() {
        let dispatcher = Arc::new(Dispatcher::new());
        let queue = WorkQueue::new();
        let events = futures::stream::iter(vec![
            autoscaler_event("orders", "orders-topic", 1, ChangeType::Added),
            topic_event("orders-topic"),
            topic_event("unrelated"),
        ])
        .boxed();

        dispatcher.run(events, Arc::clone(&queue)).await;

        // Autoscaler and topic events coalesce into one pending request
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next().await, Some(ObjectKey::new("default", "orders")));
    }
}
