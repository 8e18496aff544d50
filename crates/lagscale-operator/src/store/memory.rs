//! In-process resource store
//!
//! Behaves like the API server for the parts the reconciler relies on:
//! generation counters, resourceVersion checks on update, cascade deletion
//! through owner references and a watch stream that replays existing
//! objects on subscribe. Every accepted write is recorded so callers can
//! assert on exactly what was written.

use super::ResourceStore;
use crate::crd::{ConsumerAutoscaler, ConsumerAutoscalerStatus};
use crate::error::{OperatorError, Result};
use crate::model::{
    ChangeType, ChildKind, ChildResource, ChildSpec, DeploymentObserved, ObjectKey, ResourceEvent,
    ResourceKind, TopicState,
};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::ResourceExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

/// A write accepted by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreWrite {
    Create(ChildKind, ObjectKey),
    Update(ChildKind, ObjectKey),
    Status(ObjectKey),
}

/// Failure injected into the next write of a child kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Conflict,
    Unavailable,
}

#[derive(Default)]
struct Inner {
    autoscalers: BTreeMap<ObjectKey, ConsumerAutoscaler>,
    topics: BTreeMap<ObjectKey, TopicState>,
    children: BTreeMap<(ChildKind, ObjectKey), ChildResource>,
    revision: u64,
    writes: Vec<StoreWrite>,
    faults: HashMap<ChildKind, VecDeque<Fault>>,
    unavailable: bool,
    latency: Duration,
    subscribers: Vec<(Vec<ResourceKind>, mpsc::UnboundedSender<ResourceEvent>)>,
}

impl Inner {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn emit(&mut self, event: ResourceEvent) {
        self.subscribers.retain(|(kinds, tx)| {
            if !kinds.contains(&event.kind) {
                return !tx.is_closed();
            }
            tx.unbounded_send(event.clone()).is_ok()
        });
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable {
            Err(OperatorError::StoreUnavailable(
                "memory store is offline".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn take_fault(&mut self, kind: ChildKind, key: &ObjectKey) -> Result<()> {
        match self.faults.get_mut(&kind).and_then(VecDeque::pop_front) {
            Some(Fault::Conflict) => Err(OperatorError::Conflict {
                kind: kind.to_string(),
                name: key.name.clone(),
            }),
            Some(Fault::Unavailable) => Err(OperatorError::StoreUnavailable(format!(
                "injected failure writing {} {}",
                kind, key
            ))),
            None => Ok(()),
        }
    }
}

fn autoscaler_key(autoscaler: &ConsumerAutoscaler) -> ObjectKey {
    ObjectKey::new(
        autoscaler.namespace().unwrap_or_else(|| "default".to_string()),
        autoscaler.name_any(),
    )
}

fn autoscaler_event(autoscaler: &ConsumerAutoscaler, change: ChangeType) -> ResourceEvent {
    ResourceEvent::new(
        ResourceKind::ConsumerAutoscaler,
        autoscaler_key(autoscaler),
        change,
    )
    .with_topic_ref(autoscaler.spec.consumer_spec.topic_name.clone())
    .with_generation(autoscaler.metadata.generation)
}

fn child_event(child: &ChildResource, change: ChangeType) -> ResourceEvent {
    ResourceEvent::new(ResourceKind::Child(child.kind()), child.key.clone(), change)
        .with_owner(child.owner.name.clone())
}

/// In-memory [`ResourceStore`]
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a ConsumerAutoscaler, bumping its generation when the spec changes
    pub fn put_autoscaler(&self, mut autoscaler: ConsumerAutoscaler) -> ConsumerAutoscaler {
        let key = autoscaler_key(&autoscaler);
        let mut inner = self.inner.lock();
        let change = match inner.autoscalers.get(&key) {
            Some(existing) => {
                let generation = existing.metadata.generation.unwrap_or(1);
                autoscaler.metadata.generation = Some(if existing.spec == autoscaler.spec {
                    generation
                } else {
                    generation + 1
                });
                autoscaler.metadata.uid = existing.metadata.uid.clone();
                if autoscaler.status.is_none() {
                    autoscaler.status = existing.status.clone();
                }
                ChangeType::Modified
            }
            None => {
                autoscaler.metadata.generation = Some(1);
                if autoscaler.metadata.uid.is_none() {
                    autoscaler.metadata.uid = Some(format!("uid-{}", key));
                }
                ChangeType::Added
            }
        };
        autoscaler.metadata.namespace = Some(key.namespace.clone());
        autoscaler.metadata.resource_version = Some(inner.next_revision());
        inner.autoscalers.insert(key, autoscaler.clone());
        inner.emit(autoscaler_event(&autoscaler, change));
        autoscaler
    }

    /// Delete a ConsumerAutoscaler and garbage-collect the children it owns
    pub fn delete_autoscaler(&self, key: &ObjectKey) {
        let mut inner = self.inner.lock();
        let Some(removed) = inner.autoscalers.remove(key) else {
            return;
        };
        let owned: Vec<(ChildKind, ObjectKey)> = inner
            .children
            .iter()
            .filter(|((_, child_key), child)| {
                child_key.namespace == key.namespace && child.owner.name == key.name
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in owned {
            if let Some(child) = inner.children.remove(&id) {
                inner.emit(child_event(&child, ChangeType::Deleted));
            }
        }
        inner.emit(autoscaler_event(&removed, ChangeType::Deleted));
    }

    /// Create or replace a topic
    pub fn put_topic(&self, key: ObjectKey, partitions: i32, ready: bool) {
        let mut inner = self.inner.lock();
        let change = if inner.topics.contains_key(&key) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        inner.topics.insert(
            key.clone(),
            TopicState {
                key: key.clone(),
                partitions: Some(partitions),
                ready,
            },
        );
        inner.emit(ResourceEvent::new(ResourceKind::Topic, key, change));
    }

    pub fn delete_topic(&self, key: &ObjectKey) {
        let mut inner = self.inner.lock();
        if inner.topics.remove(key).is_some() {
            inner.emit(ResourceEvent::new(
                ResourceKind::Topic,
                key.clone(),
                ChangeType::Deleted,
            ));
        }
    }

    /// Simulate the autoscaler resizing the Deployment
    pub fn scale_deployment(&self, key: &ObjectKey, replicas: i32) {
        let mut inner = self.inner.lock();
        let revision = inner.next_revision();
        let Some(child) = inner
            .children
            .get_mut(&(ChildKind::Deployment, key.clone()))
        else {
            return;
        };
        if let ChildSpec::Deployment(spec) = &mut child.spec {
            spec.replicas = Some(replicas);
        }
        child.observed_generation += 1;
        child.resource_version = Some(revision);
        let event = child_event(child, ChangeType::Modified);
        inner.emit(event);
    }

    /// Simulate the Deployment controller reporting pods
    pub fn set_deployment_observed(&self, key: &ObjectKey, observed: DeploymentObserved) {
        let mut inner = self.inner.lock();
        let revision = inner.next_revision();
        let Some(child) = inner
            .children
            .get_mut(&(ChildKind::Deployment, key.clone()))
        else {
            return;
        };
        child.observed = Some(observed);
        child.resource_version = Some(revision);
        let event = child_event(child, ChangeType::Modified);
        inner.emit(event);
    }

    pub fn autoscaler(&self, key: &ObjectKey) -> Option<ConsumerAutoscaler> {
        self.inner.lock().autoscalers.get(key).cloned()
    }

    pub fn child(&self, kind: ChildKind, key: &ObjectKey) -> Option<ChildResource> {
        self.inner.lock().children.get(&(kind, key.clone())).cloned()
    }

    /// Accepted writes, oldest first
    pub fn writes(&self) -> Vec<StoreWrite> {
        self.inner.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.inner.lock().writes.clear();
    }

    /// Fail the next write of `kind` with `fault`
    pub fn fail_next_write(&self, kind: ChildKind, fault: Fault) {
        self.inner
            .lock()
            .faults
            .entry(kind)
            .or_default()
            .push_back(fault);
    }

    /// Make every call fail with `StoreUnavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unavailable = unavailable;
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.inner.lock().latency = latency;
    }

    async fn simulate_latency(&self) {
        let latency = self.inner.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get_autoscaler(&self, key: &ObjectKey) -> Result<Option<ConsumerAutoscaler>> {
        self.simulate_latency().await;
        let inner = self.inner.lock();
        inner.check_available()?;
        Ok(inner.autoscalers.get(key).cloned())
    }

    async fn list_autoscalers(&self) -> Result<Vec<ConsumerAutoscaler>> {
        self.simulate_latency().await;
        let inner = self.inner.lock();
        inner.check_available()?;
        Ok(inner.autoscalers.values().cloned().collect())
    }

    async fn get_topic(&self, key: &ObjectKey) -> Result<Option<TopicState>> {
        self.simulate_latency().await;
        let inner = self.inner.lock();
        inner.check_available()?;
        Ok(inner.topics.get(key).cloned())
    }

    async fn get_child(&self, kind: ChildKind, key: &ObjectKey) -> Result<Option<ChildResource>> {
        self.simulate_latency().await;
        let inner = self.inner.lock();
        inner.check_available()?;
        Ok(inner.children.get(&(kind, key.clone())).cloned())
    }

    async fn create_child(&self, child: &ChildResource) -> Result<ChildResource> {
        self.simulate_latency().await;
        let mut inner = self.inner.lock();
        inner.check_available()?;
        let kind = child.kind();
        inner.take_fault(kind, &child.key)?;

        let id = (kind, child.key.clone());
        if inner.children.contains_key(&id) {
            return Err(OperatorError::AlreadyExists {
                kind: kind.to_string(),
                name: child.key.name.clone(),
            });
        }

        let mut stored = child.clone();
        stored.observed_generation = 1;
        stored.resource_version = Some(inner.next_revision());
        inner.children.insert(id, stored.clone());
        inner.writes.push(StoreWrite::Create(kind, child.key.clone()));
        inner.emit(child_event(&stored, ChangeType::Added));
        Ok(stored)
    }

    async fn update_child(&self, child: &ChildResource) -> Result<ChildResource> {
        self.simulate_latency().await;
        let mut inner = self.inner.lock();
        inner.check_available()?;
        let kind = child.kind();
        inner.take_fault(kind, &child.key)?;

        let id = (kind, child.key.clone());
        let (generation, observed) = match inner.children.get(&id) {
            Some(existing) if existing.resource_version == child.resource_version => {
                (existing.observed_generation, existing.observed.clone())
            }
            _ => {
                return Err(OperatorError::Conflict {
                    kind: kind.to_string(),
                    name: child.key.name.clone(),
                })
            }
        };

        let mut stored = child.clone();
        stored.observed_generation = generation + 1;
        stored.resource_version = Some(inner.next_revision());
        stored.observed = observed;
        inner.children.insert(id, stored.clone());
        inner.writes.push(StoreWrite::Update(kind, child.key.clone()));
        inner.emit(child_event(&stored, ChangeType::Modified));
        Ok(stored)
    }

    async fn update_status(
        &self,
        key: &ObjectKey,
        status: &ConsumerAutoscalerStatus,
    ) -> Result<()> {
        self.simulate_latency().await;
        let mut inner = self.inner.lock();
        inner.check_available()?;
        let revision = inner.next_revision();
        let Some(autoscaler) = inner.autoscalers.get_mut(key) else {
            return Err(OperatorError::Conflict {
                kind: "ConsumerAutoscaler".to_string(),
                name: key.name.clone(),
            });
        };
        autoscaler.status = Some(status.clone());
        autoscaler.metadata.resource_version = Some(revision);
        let event = autoscaler_event(autoscaler, ChangeType::Modified);
        inner.writes.push(StoreWrite::Status(key.clone()));
        inner.emit(event);
        Ok(())
    }

    fn watch(&self, kinds: &[ResourceKind]) -> BoxStream<'static, ResourceEvent> {
        let (tx, rx) = mpsc::unbounded();
        let mut inner = self.inner.lock();

        let mut initial = Vec::new();
        if kinds.contains(&ResourceKind::ConsumerAutoscaler) {
            initial.extend(
                inner
                    .autoscalers
                    .values()
                    .map(|a| autoscaler_event(a, ChangeType::Added)),
            );
        }
        if kinds.contains(&ResourceKind::Topic) {
            initial.extend(
                inner
                    .topics
                    .keys()
                    .map(|k| ResourceEvent::new(ResourceKind::Topic, k.clone(), ChangeType::Added)),
            );
        }
        initial.extend(
            inner
                .children
                .values()
                .filter(|c| kinds.contains(&ResourceKind::Child(c.kind())))
                .map(|c| child_event(c, ChangeType::Added)),
        );
        for event in initial {
            // The receiver is still in scope, so the send cannot fail.
            let _ = tx.unbounded_send(event);
        }

        inner.subscribers.push((kinds.to_vec(), tx));
        rx.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ConsumerAutoscalerSpec, ConsumerSpec};
    use crate::model::{OwnerRef, ScalingPolicySpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn create_test_autoscaler(name: &str) -> ConsumerAutoscaler {
        ConsumerAutoscaler {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: ConsumerAutoscalerSpec {
                min_replicas: 1,
                lag_threshold: 100,
                metric_name: None,
                consumer_spec: ConsumerSpec {
                    image: "consumer:1".to_string(),
                    topic_name: "orders".to_string(),
                    container_name: "consumer".to_string(),
                    consumer_group: None,
                },
            },
            status: None,
        }
    }

    fn policy(owner: &str, max: i32) -> ChildResource {
        let owner_key = ObjectKey::new("default", owner);
        ChildResource::new(
            ChildKind::ScalingPolicy.child_key(&owner_key),
            OwnerRef {
                name: owner.to_string(),
                uid: "uid".to_string(),
            },
            ChildSpec::ScalingPolicy(ScalingPolicySpec {
                target_name: owner.to_string(),
                min_replicas: 1,
                max_replicas: max,
                target_metric_name: "lag".to_string(),
                target_value: 100,
            }),
        )
    }

    #[test]
    fn test_generation_only_bumps_on_spec_change() {
        let store = MemoryStore::new();
        let created = store.put_autoscaler(create_test_autoscaler("orders"));
        assert_eq!(created.metadata.generation, Some(1));

        let same = store.put_autoscaler(create_test_autoscaler("orders"));
        assert_eq!(same.metadata.generation, Some(1));

        let mut changed = create_test_autoscaler("orders");
        changed.spec.min_replicas = 2;
        let changed = store.put_autoscaler(changed);
        assert_eq!(changed.metadata.generation, Some(2));
        assert_eq!(changed.metadata.uid, created.metadata.uid);
    }

    #[tokio::test]
    async fn test_create_collision() {
        let store = MemoryStore::new();
        store.create_child(&policy("orders", 3)).await.unwrap();
        let err = store.create_child(&policy("orders", 3)).await.unwrap_err();
        assert!(matches!(err, OperatorError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let store = MemoryStore::new();
        let created = store.create_child(&policy("orders", 3)).await.unwrap();
        assert_eq!(created.observed_generation, 1);

        let mut first = created.clone();
        first.spec = policy("orders", 4).spec;
        let updated = store.update_child(&first).await.unwrap();
        assert_eq!(updated.observed_generation, 2);

        // Still carries the resourceVersion from before the first update
        let err = store.update_child(&first).await.unwrap_err();
        assert!(matches!(err, OperatorError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_cascade_delete() {
        let store = MemoryStore::new();
        let autoscaler = store.put_autoscaler(create_test_autoscaler("orders"));
        store.create_child(&policy("orders", 3)).await.unwrap();
        store.create_child(&policy("billing", 3)).await.unwrap();

        store.delete_autoscaler(&autoscaler_key(&autoscaler));

        let orders = ObjectKey::new("default", "orders-scaler");
        let billing = ObjectKey::new("default", "billing-scaler");
        assert!(store.child(ChildKind::ScalingPolicy, &orders).is_none());
        assert!(store.child(ChildKind::ScalingPolicy, &billing).is_some());
    }

    #[tokio::test]
    async fn test_injected_fault_applies_once() {
        let store = MemoryStore::new();
        store.fail_next_write(ChildKind::ScalingPolicy, Fault::Unavailable);
        assert!(store.create_child(&policy("orders", 3)).await.is_err());
        assert!(store.create_child(&policy("orders", 3)).await.is_ok());
        assert_eq!(store.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_watch_replays_existing_objects() {
        let store = MemoryStore::new();
        store.put_autoscaler(create_test_autoscaler("orders"));
        store.put_topic(ObjectKey::new("default", "orders"), 3, true);

        let mut events = store.watch(&[ResourceKind::ConsumerAutoscaler]);
        let first = events.next().await.unwrap();
        assert_eq!(first.kind, ResourceKind::ConsumerAutoscaler);
        assert_eq!(first.change, ChangeType::Added);
        assert_eq!(first.topic_ref.as_deref(), Some("orders"));

        store.put_topic(ObjectKey::new("default", "orders"), 6, true);
        store.delete_autoscaler(&ObjectKey::new("default", "orders"));
        let next = events.next().await.unwrap();
        assert_eq!(next.change, ChangeType::Deleted);
    }
}
