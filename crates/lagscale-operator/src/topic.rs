//! Topic state reader
//!
//! Read-through access to a topic's partition count. Nothing is cached:
//! a stale count would put the autoscaler bounds out of step with the
//! topic.

use crate::error::{OperatorError, Result};
use crate::model::ObjectKey;
use crate::store::ResourceStore;
use tracing::debug;

/// Partition count of a ready topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionCount(pub i32);

/// Reads topics through the resource store
pub struct TopicStateReader<'a> {
    store: &'a dyn ResourceStore,
}

impl<'a> TopicStateReader<'a> {
    pub fn new(store: &'a dyn ResourceStore) -> Self {
        Self { store }
    }

    /// Current partition count of `key`.
    ///
    /// Fails with `DependencyMissing` when the topic does not exist and
    /// with `DependencyNotReady` until the topic operator marks it ready.
    pub async fn partition_count(&self, key: &ObjectKey) -> Result<PartitionCount> {
        let topic = self
            .store
            .get_topic(key)
            .await?
            .ok_or_else(|| OperatorError::DependencyMissing(key.to_string()))?;

        match topic.partitions {
            Some(partitions) if topic.ready && partitions >= 1 => {
                debug!(topic = %key, partitions, "Read topic partition count");
                Ok(PartitionCount(partitions))
            }
            _ => Err(OperatorError::DependencyNotReady(key.to_string())),
        }
    }
}
