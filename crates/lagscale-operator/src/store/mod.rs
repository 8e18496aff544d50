//! Resource store client
//!
//! The reconciler only talks to the cluster through [`ResourceStore`]. The
//! Kubernetes-backed implementation lives in [`kubernetes`]; [`memory`]
//! keeps everything in process and is what the tests drive.

pub mod kubernetes;
pub mod memory;

use crate::crd::{ConsumerAutoscaler, ConsumerAutoscalerStatus};
use crate::error::Result;
use crate::model::{ChildKind, ChildResource, ObjectKey, ResourceEvent, ResourceKind, TopicState};
use async_trait::async_trait;
use futures::stream::BoxStream;

pub use kubernetes::KubeStore;
pub use memory::MemoryStore;

/// Read/write/watch access to the objects the operator works with
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch a ConsumerAutoscaler; `None` once it is deleted
    async fn get_autoscaler(&self, key: &ObjectKey) -> Result<Option<ConsumerAutoscaler>>;

    /// List every ConsumerAutoscaler in scope, used for periodic resync
    async fn list_autoscalers(&self) -> Result<Vec<ConsumerAutoscaler>>;

    /// Fetch the current state of a topic
    async fn get_topic(&self, key: &ObjectKey) -> Result<Option<TopicState>>;

    /// Fetch a child by its derived key
    async fn get_child(&self, kind: ChildKind, key: &ObjectKey) -> Result<Option<ChildResource>>;

    /// Create a child; fails with `AlreadyExists` on key collision
    async fn create_child(&self, child: &ChildResource) -> Result<ChildResource>;

    /// Replace a child; fails with `Conflict` when `resource_version` is stale
    async fn update_child(&self, child: &ChildResource) -> Result<ChildResource>;

    /// Write the status subresource of a ConsumerAutoscaler
    async fn update_status(&self, key: &ObjectKey, status: &ConsumerAutoscalerStatus)
        -> Result<()>;

    /// Long-lived change stream for the given kinds
    fn watch(&self, kinds: &[ResourceKind]) -> BoxStream<'static, ResourceEvent>;
}
