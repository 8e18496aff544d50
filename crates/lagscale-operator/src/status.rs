//! Status reporting
//!
//! Derives the observed-state summary of a ConsumerAutoscaler and writes
//! it only when it differs from what the resource already carries, so a
//! converged cycle issues no writes.

use crate::crd::{ConsumerAutoscaler, ConsumerAutoscalerStatus};
use crate::error::{OperatorError, Result};
use crate::model::{ChildResource, ChildSpec, ObjectKey};
use crate::store::ResourceStore;
use tracing::debug;

/// Message written after a successful cycle
pub const SUCCESS_MESSAGE: &str = "Reconciliation completed";

/// Where the replica figures in the status come from
#[derive(Debug, Clone, Copy)]
pub enum WorkloadView<'a> {
    /// Children were fetched this cycle; the Deployment may be absent
    Fetched(Option<&'a ChildResource>),
    /// The cycle failed before reading children; keep what was reported before
    Unknown,
}

/// Build the status for the outcome of one cycle
pub fn build_status(
    autoscaler: &ConsumerAutoscaler,
    workload: WorkloadView<'_>,
    outcome: std::result::Result<(), &OperatorError>,
) -> ConsumerAutoscalerStatus {
    let min_replicas = autoscaler.spec.min_replicas;
    let previous = autoscaler.status.as_ref();

    let (replicas, active_pods) = match workload {
        WorkloadView::Fetched(Some(deployment)) => {
            let observed = deployment.observed.as_ref();
            let spec_replicas = match &deployment.spec {
                ChildSpec::Deployment(spec) => spec.replicas,
                _ => None,
            };
            (
                observed
                    .and_then(|o| o.replicas)
                    .or(spec_replicas)
                    .unwrap_or(min_replicas),
                observed.map(|o| o.pods.clone()).unwrap_or_default(),
            )
        }
        WorkloadView::Fetched(None) => (min_replicas, Vec::new()),
        WorkloadView::Unknown => match previous {
            Some(status) => (status.replicas, status.active_pods.clone()),
            None => (min_replicas, Vec::new()),
        },
    };

    let message = match outcome {
        Ok(()) => SUCCESS_MESSAGE.to_string(),
        Err(e) => e.status_message(),
    };

    ConsumerAutoscalerStatus {
        replicas,
        active_pods,
        message,
        observed_generation: autoscaler.metadata.generation,
    }
}

/// Writes status through the resource store
pub struct StatusReporter<'a> {
    store: &'a dyn ResourceStore,
}

impl<'a> StatusReporter<'a> {
    pub fn new(store: &'a dyn ResourceStore) -> Self {
        Self { store }
    }

    /// Write `status` unless `previous` already matches it. Returns whether a write happened.
    pub async fn report(
        &self,
        key: &ObjectKey,
        previous: Option<&ConsumerAutoscalerStatus>,
        status: &ConsumerAutoscalerStatus,
    ) -> Result<bool> {
        if previous == Some(status) {
            debug!(name = %key, "Status unchanged, skipping write");
            return Ok(false);
        }

        debug!(name = %key, message = %status.message, "Updating autoscaler status");
        self.store.update_status(key, status).await?;
        Ok(true)
    }
}
