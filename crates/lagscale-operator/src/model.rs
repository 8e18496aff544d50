//! Domain types shared by the store, the calculator and the reconciler
//!
//! Child resources form a closed set: the consumer Deployment, the
//! MetricsBinding that publishes the lag metric, and the ScalingPolicy
//! (HorizontalPodAutoscaler) bounded by the topic's partition count.

use std::fmt;

/// Namespace/name identity of a namespaced object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of an object that lives next to this one
    pub fn sibling(&self, name: impl Into<String>) -> Self {
        Self::new(self.namespace.clone(), name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Kinds the operator watches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    ConsumerAutoscaler,
    Topic,
    Child(ChildKind),
}

impl ResourceKind {
    /// Every kind that can trigger a reconcile
    pub const WATCHED: [ResourceKind; 5] = [
        ResourceKind::ConsumerAutoscaler,
        ResourceKind::Topic,
        ResourceKind::Child(ChildKind::Deployment),
        ResourceKind::Child(ChildKind::MetricsBinding),
        ResourceKind::Child(ChildKind::ScalingPolicy),
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::ConsumerAutoscaler => "ConsumerAutoscaler",
            ResourceKind::Topic => "KafkaTopic",
            ResourceKind::Child(kind) => kind.as_str(),
        }
    }
}

/// The closed set of child resources owned by a ConsumerAutoscaler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChildKind {
    Deployment,
    MetricsBinding,
    ScalingPolicy,
}

impl ChildKind {
    /// Apply order: the scaling policy targets the Deployment, so it goes last
    pub const APPLY_ORDER: [ChildKind; 3] = [
        ChildKind::Deployment,
        ChildKind::MetricsBinding,
        ChildKind::ScalingPolicy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChildKind::Deployment => "Deployment",
            ChildKind::MetricsBinding => "MetricsBinding",
            ChildKind::ScalingPolicy => "ScalingPolicy",
        }
    }

    /// Derived child key; one name per kind per owner
    pub fn child_key(&self, owner: &ObjectKey) -> ObjectKey {
        let name = match self {
            ChildKind::Deployment => owner.name.clone(),
            ChildKind::MetricsBinding => format!("{}-lag-metric", owner.name),
            ChildKind::ScalingPolicy => format!("{}-scaler", owner.name),
        };
        owner.sibling(name)
    }
}

impl fmt::Display for ChildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Back-reference from a child to the ConsumerAutoscaler that owns it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerRef {
    pub name: String,
    pub uid: String,
}

/// Desired fields of the consumer Deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentSpec {
    pub image: String,
    pub container_name: String,
    pub topic_name: String,
    pub consumer_group: String,
    /// Seed value on creation; owned by the autoscaler afterwards
    pub replicas: Option<i32>,
}

/// Desired fields of the external-metric binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsBindingSpec {
    pub metric_name: String,
    pub topic_name: String,
    pub consumer_group: String,
    pub query: String,
}

/// Desired fields of the HorizontalPodAutoscaler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalingPolicySpec {
    pub target_name: String,
    pub min_replicas: i32,
    pub max_replicas: i32,
    pub target_metric_name: String,
    pub target_value: i64,
}

/// Kind-specific spec of a child resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildSpec {
    Deployment(DeploymentSpec),
    MetricsBinding(MetricsBindingSpec),
    ScalingPolicy(ScalingPolicySpec),
}

impl ChildSpec {
    pub fn kind(&self) -> ChildKind {
        match self {
            ChildSpec::Deployment(_) => ChildKind::Deployment,
            ChildSpec::MetricsBinding(_) => ChildKind::MetricsBinding,
            ChildSpec::ScalingPolicy(_) => ChildKind::ScalingPolicy,
        }
    }

    /// Field-by-field comparison against the live spec.
    ///
    /// Deployment replicas are excluded: after creation they belong to the
    /// autoscaler.
    pub fn matches(&self, actual: &ChildSpec) -> bool {
        match (self, actual) {
            (ChildSpec::Deployment(want), ChildSpec::Deployment(have)) => {
                want.image == have.image
                    && want.container_name == have.container_name
                    && want.topic_name == have.topic_name
                    && want.consumer_group == have.consumer_group
            }
            (want, have) => want == have,
        }
    }

    /// Spec to write over an existing object, keeping its live replica count
    pub fn for_update(&self, actual: &ChildSpec) -> ChildSpec {
        match (self, actual) {
            (ChildSpec::Deployment(want), ChildSpec::Deployment(have)) => {
                ChildSpec::Deployment(DeploymentSpec {
                    replicas: have.replicas,
                    ..want.clone()
                })
            }
            (want, _) => want.clone(),
        }
    }
}

/// Observed runtime state of a Deployment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentObserved {
    pub replicas: Option<i32>,
    pub pods: Vec<String>,
}

/// A child resource as read from or written to the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildResource {
    pub key: ObjectKey,
    pub owner: OwnerRef,
    pub spec: ChildSpec,
    /// Set by the store on each accepted write
    pub observed_generation: i64,
    /// Concurrency token; `None` for objects not yet created
    pub resource_version: Option<String>,
    /// Runtime state, only populated for Deployments
    pub observed: Option<DeploymentObserved>,
}

impl ChildResource {
    /// A child that has not been written yet
    pub fn new(key: ObjectKey, owner: OwnerRef, spec: ChildSpec) -> Self {
        Self {
            key,
            owner,
            spec,
            observed_generation: 0,
            resource_version: None,
            observed: None,
        }
    }

    pub fn kind(&self) -> ChildKind {
        self.spec.kind()
    }
}

/// Snapshot of a topic as seen by the reconciler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicState {
    pub key: ObjectKey,
    pub partitions: Option<i32>,
    pub ready: bool,
}

/// Change type of a watch notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
}

/// A change notification from the store's watch stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEvent {
    pub kind: ResourceKind,
    pub key: ObjectKey,
    pub change: ChangeType,
    /// Owning ConsumerAutoscaler name, set for child events
    pub owner: Option<String>,
    /// Referenced topic name, set for ConsumerAutoscaler events
    pub topic_ref: Option<String>,
    /// `metadata.generation`, set for ConsumerAutoscaler events
    pub generation: Option<i64>,
}

impl ResourceEvent {
    pub fn new(kind: ResourceKind, key: ObjectKey, change: ChangeType) -> Self {
        Self {
            kind,
            key,
            change,
            owner: None,
            topic_ref: None,
            generation: None,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_topic_ref(mut self, topic: impl Into<String>) -> Self {
        self.topic_ref = Some(topic.into());
        self
    }

    pub fn with_generation(mut self, generation: Option<i64>) -> Self {
        self.generation = generation;
        self
    }
}
