//! # Lagscale Kubernetes Operator
//!
//! Kubernetes operator that runs a Kafka consumer workload behind a
//! lag-driven HorizontalPodAutoscaler and keeps the autoscaler's upper
//! bound equal to the partition count of the consumed topic.
//!
//! Consumers beyond the partition count sit idle, so scaling past it only
//! burns capacity. The operator watches the topic and moves `maxReplicas`
//! whenever partitions are added or removed.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use lagscale_operator::prelude::*;
//! use kube::Client;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::try_default().await?;
//!     let store = Arc::new(KubeStore::new(client, None));
//!
//!     let readiness = Readiness::new();
//!     run_controller(store, OperatorConfig::default(), readiness, async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **Watch**: ConsumerAutoscalers, KafkaTopics and the owned children are
//!    watched; every event is mapped back to the autoscaler keys it affects
//! 2. **Queue**: keys are coalesced so each autoscaler has at most one cycle
//!    in flight
//! 3. **Reconcile**: desired children are derived from the spec and the
//!    topic's partition count, compared with what exists, and created or
//!    updated as needed
//! 4. **Status**: replica count, active pods and the cycle outcome are
//!    written back when they changed
//!
//! ## Modules
//!
//! - [`crd`] - Custom Resource Definition types with validation
//! - [`desired`] - Desired child state from spec and partition count
//! - [`reconciler`] - Reconcile cycle state machine
//! - [`controller`] - Worker pool, retries and periodic resync
//! - [`dispatcher`] - Watch event to reconcile key mapping
//! - [`queue`] - Coalescing work queue
//! - [`store`] - Resource store contract with Kubernetes and in-memory backends
//! - [`resources`] - Kubernetes object builders (Deployment, ConfigMap, HPA)
//! - [`error`] - Error taxonomy
//!
//! ## Custom Resource Definitions
//!
//! ### ConsumerAutoscaler
//!
//! ```yaml
//! apiVersion: lagscale.io/v1alpha1
//! kind: ConsumerAutoscaler
//! metadata:
//!   name: fast-data-consumer
//! spec:
//!   minReplicas: 1
//!   lagThreshold: 1000
//!   consumerSpec:
//!     image: ghcr.io/acme/consumer:1.4.0
//!     topicName: fast-data-topic
//!     containerName: consumer
//! ```
//!
//! The operator creates a Deployment `fast-data-consumer`, a ConfigMap
//! `fast-data-consumer-lag-metric` with the lag query for the metrics
//! adapter, and an HPA `fast-data-consumer-scaler` with
//! `minReplicas: 1` and `maxReplicas` = partitions of `fast-data-topic`.
//!
//! ## Metrics
//!
//! - `lagscale_reconciliations_total` - Reconcile cycles started
//! - `lagscale_reconciliation_errors_total{kind}` - Failed cycles by error kind
//! - `lagscale_reconciliation_duration_seconds` - Cycle latency
//! - `lagscale_store_writes_total` - Child creates and updates
//! - `lagscale_watch_events_total{kind}` - Watch events received

pub mod config;
pub mod controller;
pub mod crd;
pub mod desired;
pub mod dispatcher;
pub mod error;
pub mod model;
pub mod queue;
pub mod reconciler;
pub mod resources;
pub mod status;
pub mod store;
pub mod topic;

/// Field manager and `app.kubernetes.io/managed-by` value
pub const MANAGER_NAME: &str = "lagscale-operator";

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::config::{BackoffPolicy, OperatorConfig};
    pub use crate::controller::{run_controller, Controller, ControllerMetrics, Readiness};
    pub use crate::crd::{
        ConsumerAutoscaler, ConsumerAutoscalerSpec, ConsumerAutoscalerStatus, ConsumerSpec,
        KafkaTopic, KafkaTopicSpec,
    };
    pub use crate::error::{ErrorKind, OperatorError, Result};
    pub use crate::model::{ChildKind, ObjectKey};
    pub use crate::reconciler::{CycleOutcome, CyclePhase, Reconciler};
    pub use crate::store::{KubeStore, MemoryStore, ResourceStore};
}
