//! Kubernetes-backed resource store

use super::ResourceStore;
use crate::crd::{ConsumerAutoscaler, ConsumerAutoscalerStatus, KafkaTopic};
use crate::error::{OperatorError, Result};
use crate::model::{
    ChangeType, ChildKind, ChildResource, ChildSpec, DeploymentObserved, ObjectKey, ResourceEvent,
    ResourceKind, TopicState,
};
use crate::resources::{self, ResourceBuilder};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tracing::{debug, warn};

/// Resource store talking to the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    /// Namespace to watch; `None` means cluster-wide
    namespace: Option<String>,
}

impl KubeStore {
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn scoped<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    /// Names of the non-terminating pods backing a consumer Deployment
    async fn active_pods(&self, key: &ObjectKey, owner: &str) -> Result<Vec<String>> {
        let pods: Api<Pod> = self.namespaced(&key.namespace);
        let lp = ListParams::default().labels(&resources::selector_string(owner));
        let mut names: Vec<String> = pods
            .list(&lp)
            .await
            .map_err(|e| store_error(e, "Pod", &key.name))?
            .items
            .into_iter()
            .filter(|p| p.metadata.deletion_timestamp.is_none())
            .filter(|p| {
                p.status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .is_some_and(|phase| phase == "Running" || phase == "Pending")
            })
            .map(|p| p.name_any())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn get_object<K>(&self, key: &ObjectKey) -> Result<Option<K>>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = self.namespaced(&key.namespace);
        api.get_opt(&key.name)
            .await
            .map_err(|e| store_error(e, &K::kind(&Default::default()), &key.name))
    }

    async fn create_object<K>(&self, key: &ObjectKey, obj: &K) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + Serialize + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = self.namespaced(&key.namespace);
        let kind = K::kind(&Default::default()).to_string();
        debug!(kind = %kind, name = %key.name, "Creating object");
        match api.create(&PostParams::default(), obj).await {
            Ok(created) => Ok(created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(OperatorError::AlreadyExists {
                kind,
                name: key.name.clone(),
            }),
            Err(e) => Err(store_error(e, &kind, &key.name)),
        }
    }

    async fn replace_object<K>(&self, key: &ObjectKey, obj: &K) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + Serialize + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = self.namespaced(&key.namespace);
        let kind = K::kind(&Default::default()).to_string();
        debug!(kind = %kind, name = %key.name, "Replacing object");
        api.replace(&key.name, &PostParams::default(), obj)
            .await
            .map_err(|e| store_error(e, &kind, &key.name))
    }
}

/// Map API errors onto the reconcile taxonomy
fn store_error(error: kube::Error, kind: &str, name: &str) -> OperatorError {
    match error {
        // Not found on replace means the object vanished under us: stale view
        kube::Error::Api(ae) if ae.code == 409 || ae.code == 404 => OperatorError::Conflict {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(ae) if ae.code == 422 || ae.code == 400 => {
            OperatorError::InvalidSpec(format!("{} {} rejected: {}", kind, name, ae.message))
        }
        kube::Error::Api(ae) => OperatorError::StoreUnavailable(format!(
            "{} {}: {} ({})",
            kind, name, ae.message, ae.code
        )),
        other => OperatorError::StoreUnavailable(format!("{} {}: {}", kind, name, other)),
    }
}

fn topic_state(topic: &KafkaTopic, key: &ObjectKey) -> TopicState {
    let partitions = topic.spec.partitions.filter(|p| *p >= 1);
    TopicState {
        key: key.clone(),
        partitions,
        ready: topic.is_ready() && partitions.is_some(),
    }
}

fn key_of<K: Resource>(obj: &K) -> ObjectKey {
    ObjectKey::new(
        obj.meta()
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string()),
        obj.meta().name.clone().unwrap_or_default(),
    )
}

/// Turn a watcher stream into resource events
fn watch_kind<K, F>(
    api: Api<K>,
    config: watcher::Config,
    kind: ResourceKind,
    describe: F,
) -> BoxStream<'static, ResourceEvent>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    F: Fn(&K, ResourceEvent) -> ResourceEvent + Send + Sync + 'static,
{
    watcher(api, config)
        .default_backoff()
        .filter_map(move |event| {
            let mapped = match event {
                Ok(watcher::Event::InitApply(obj)) => {
                    Some(describe(&obj, ResourceEvent::new(kind, key_of(&obj), ChangeType::Added)))
                }
                Ok(watcher::Event::Apply(obj)) => Some(describe(
                    &obj,
                    ResourceEvent::new(kind, key_of(&obj), ChangeType::Modified),
                )),
                Ok(watcher::Event::Delete(obj)) => Some(describe(
                    &obj,
                    ResourceEvent::new(kind, key_of(&obj), ChangeType::Deleted),
                )),
                Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => None,
                Err(e) => {
                    warn!(kind = kind.as_str(), error = %e, "Watch stream error, resuming");
                    None
                }
            };
            futures::future::ready(mapped)
        })
        .boxed()
}

fn with_child_owner<K: Resource>(obj: &K, event: ResourceEvent) -> ResourceEvent {
    match resources::owner_of(obj.meta()) {
        Some(owner) => event.with_owner(owner.name),
        None => event,
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get_autoscaler(&self, key: &ObjectKey) -> Result<Option<ConsumerAutoscaler>> {
        self.get_object::<ConsumerAutoscaler>(key).await
    }

    async fn list_autoscalers(&self) -> Result<Vec<ConsumerAutoscaler>> {
        let api: Api<ConsumerAutoscaler> = self.scoped();
        Ok(api
            .list(&ListParams::default())
            .await
            .map_err(|e| store_error(e, "ConsumerAutoscaler", "*"))?
            .items)
    }

    async fn get_topic(&self, key: &ObjectKey) -> Result<Option<TopicState>> {
        Ok(self
            .get_object::<KafkaTopic>(key)
            .await?
            .map(|topic| topic_state(&topic, key)))
    }

    async fn get_child(&self, kind: ChildKind, key: &ObjectKey) -> Result<Option<ChildResource>> {
        match kind {
            ChildKind::Deployment => {
                let Some(deployment) = self.get_object::<Deployment>(key).await? else {
                    return Ok(None);
                };
                let mut child = resources::deployment_to_child(&deployment)?;
                let pods = self.active_pods(key, &child.owner.name).await?;
                child.observed = Some(DeploymentObserved {
                    replicas: deployment.status.as_ref().and_then(|s| s.replicas),
                    pods,
                });
                Ok(Some(child))
            }
            ChildKind::MetricsBinding => self
                .get_object::<ConfigMap>(key)
                .await?
                .map(|cm| resources::metrics_binding_to_child(&cm))
                .transpose(),
            ChildKind::ScalingPolicy => self
                .get_object::<HorizontalPodAutoscaler>(key)
                .await?
                .map(|hpa| resources::scaling_policy_to_child(&hpa))
                .transpose(),
        }
    }

    async fn create_child(&self, child: &ChildResource) -> Result<ChildResource> {
        let builder = ResourceBuilder::new(child);
        match &child.spec {
            ChildSpec::Deployment(spec) => {
                let created = self
                    .create_object(&child.key, &builder.build_deployment(spec))
                    .await?;
                resources::deployment_to_child(&created)
            }
            ChildSpec::MetricsBinding(spec) => {
                let created = self
                    .create_object(&child.key, &builder.build_metrics_binding(spec))
                    .await?;
                resources::metrics_binding_to_child(&created)
            }
            ChildSpec::ScalingPolicy(spec) => {
                let created = self
                    .create_object(&child.key, &builder.build_scaling_policy(spec))
                    .await?;
                resources::scaling_policy_to_child(&created)
            }
        }
    }

    async fn update_child(&self, child: &ChildResource) -> Result<ChildResource> {
        let builder = ResourceBuilder::new(child);
        match &child.spec {
            ChildSpec::Deployment(spec) => {
                let replaced = self
                    .replace_object(&child.key, &builder.build_deployment(spec))
                    .await?;
                resources::deployment_to_child(&replaced)
            }
            ChildSpec::MetricsBinding(spec) => {
                let replaced = self
                    .replace_object(&child.key, &builder.build_metrics_binding(spec))
                    .await?;
                resources::metrics_binding_to_child(&replaced)
            }
            ChildSpec::ScalingPolicy(spec) => {
                let replaced = self
                    .replace_object(&child.key, &builder.build_scaling_policy(spec))
                    .await?;
                resources::scaling_policy_to_child(&replaced)
            }
        }
    }

    async fn update_status(
        &self,
        key: &ObjectKey,
        status: &ConsumerAutoscalerStatus,
    ) -> Result<()> {
        let api: Api<ConsumerAutoscaler> = self.namespaced(&key.namespace);

        debug!(name = %key.name, message = %status.message, "Updating autoscaler status");

        let patch = serde_json::json!({
            "status": status
        });

        api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| store_error(e, "ConsumerAutoscaler", &key.name))?;

        Ok(())
    }

    fn watch(&self, kinds: &[ResourceKind]) -> BoxStream<'static, ResourceEvent> {
        let managed = watcher::Config::default().labels(&format!(
            "app.kubernetes.io/managed-by={}",
            crate::MANAGER_NAME
        ));

        let streams: Vec<BoxStream<'static, ResourceEvent>> = kinds
            .iter()
            .map(|kind| match kind {
                ResourceKind::ConsumerAutoscaler => watch_kind(
                    self.scoped::<ConsumerAutoscaler>(),
                    watcher::Config::default(),
                    *kind,
                    |obj: &ConsumerAutoscaler, event| {
                        event
                            .with_topic_ref(obj.spec.consumer_spec.topic_name.clone())
                            .with_generation(obj.metadata.generation)
                    },
                ),
                ResourceKind::Topic => watch_kind(
                    self.scoped::<KafkaTopic>(),
                    watcher::Config::default(),
                    *kind,
                    |_: &KafkaTopic, event| event,
                ),
                ResourceKind::Child(ChildKind::Deployment) => watch_kind(
                    self.scoped::<Deployment>(),
                    managed.clone(),
                    *kind,
                    with_child_owner::<Deployment>,
                ),
                ResourceKind::Child(ChildKind::MetricsBinding) => watch_kind(
                    self.scoped::<ConfigMap>(),
                    managed.clone(),
                    *kind,
                    with_child_owner::<ConfigMap>,
                ),
                ResourceKind::Child(ChildKind::ScalingPolicy) => watch_kind(
                    self.scoped::<HorizontalPodAutoscaler>(),
                    managed.clone(),
                    *kind,
                    with_child_owner::<HorizontalPodAutoscaler>,
                ),
            })
            .collect();

        stream::select_all(streams).boxed()
    }
}
