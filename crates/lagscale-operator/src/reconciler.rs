//! ConsumerAutoscaler reconciler
//!
//! One cycle walks `Fetching -> Calculating -> Diffing -> Applying ->
//! ReportingStatus -> Done`, dropping to `Failed` from any phase. Errors
//! never escape a cycle: they end up in `status.message` and in the
//! returned [`CycleOutcome`], which the controller turns into a retry
//! decision.

use crate::crd::ConsumerAutoscaler;
use crate::desired::{self, DesiredState};
use crate::error::{ErrorKind, OperatorError, Result};
use crate::model::{ChildKind, ChildResource, ObjectKey};
use crate::status::{self, StatusReporter, WorkloadView};
use crate::store::ResourceStore;
use crate::topic::TopicStateReader;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Phase of a reconcile cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Fetching,
    Calculating,
    Diffing,
    Applying,
    ReportingStatus,
    Done,
    Failed,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Result of one reconcile cycle
#[derive(Debug)]
pub struct CycleOutcome {
    /// `Done` or `Failed`
    pub phase: CyclePhase,
    /// Phase the cycle was in when it failed
    pub failed_in: Option<CyclePhase>,
    pub error: Option<OperatorError>,
    /// Store writes issued by the cycle, status included
    pub writes: usize,
}

impl CycleOutcome {
    pub fn is_done(&self) -> bool {
        self.phase == CyclePhase::Done
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(OperatorError::kind)
    }

    /// Whether the controller should schedule a backoff retry
    pub fn should_retry(&self) -> bool {
        self.error.as_ref().is_some_and(OperatorError::is_retryable)
    }
}

/// Create or update of one child
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildChange {
    Create(ChildResource),
    Update(ChildResource),
}

impl ChildChange {
    pub fn child(&self) -> &ChildResource {
        match self {
            ChildChange::Create(child) | ChildChange::Update(child) => child,
        }
    }
}

/// Minimal set of writes taking `actual` to `desired`, in apply order
pub fn plan(
    owner: &ObjectKey,
    desired: &DesiredState,
    actual: &BTreeMap<ChildKind, Option<ChildResource>>,
) -> Vec<ChildChange> {
    desired
        .in_apply_order()
        .filter_map(|(kind, want)| match actual.get(&kind).and_then(Option::as_ref) {
            None => Some(ChildChange::Create(ChildResource::new(
                kind.child_key(owner),
                desired.owner.clone(),
                want,
            ))),
            Some(have) if want.matches(&have.spec) => None,
            Some(have) => Some(ChildChange::Update(ChildResource {
                spec: want.for_update(&have.spec),
                owner: desired.owner.clone(),
                ..have.clone()
            })),
        })
        .collect()
}

/// Reject live children that belong to another autoscaler
fn verify_ownership(owner: &ObjectKey, uid: Option<&str>, child: &ChildResource) -> Result<()> {
    let same_name = child.owner.name == owner.name;
    let same_uid = match uid {
        Some(uid) if !uid.is_empty() && !child.owner.uid.is_empty() => child.owner.uid == uid,
        _ => true,
    };
    if same_name && same_uid {
        Ok(())
    } else {
        Err(OperatorError::InvalidSpec(format!(
            "{} {} is not owned by this autoscaler; refusing to overwrite it",
            child.kind(),
            child.key
        )))
    }
}

/// Mutable bookkeeping of the cycle in progress
#[derive(Debug)]
struct Cycle {
    key: ObjectKey,
    phase: CyclePhase,
    writes: usize,
}

impl Cycle {
    fn new(key: &ObjectKey) -> Self {
        Self {
            key: key.clone(),
            phase: CyclePhase::Fetching,
            writes: 0,
        }
    }

    fn enter(&mut self, phase: CyclePhase) {
        debug!(name = %self.key, from = %self.phase, to = %phase, "Cycle phase");
        self.phase = phase;
    }

    fn outcome(&self, error: Option<OperatorError>) -> CycleOutcome {
        match error {
            None => CycleOutcome {
                phase: CyclePhase::Done,
                failed_in: None,
                error: None,
                writes: self.writes,
            },
            Some(error) => CycleOutcome {
                phase: CyclePhase::Failed,
                failed_in: Some(self.phase),
                error: Some(error),
                writes: self.writes,
            },
        }
    }
}

/// Drives reconcile cycles against a resource store
pub struct Reconciler {
    store: Arc<dyn ResourceStore>,
    cycle_timeout: Duration,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ResourceStore>, cycle_timeout: Duration) -> Self {
        Self {
            store,
            cycle_timeout,
        }
    }

    /// Run one reconcile cycle for `key`
    #[instrument(skip(self, key), fields(name = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> CycleOutcome {
        let mut cycle = Cycle::new(key);

        let result = tokio::time::timeout(self.cycle_timeout, self.run(&mut cycle)).await;
        match result {
            Ok(outcome) => outcome,
            Err(_) => {
                let error = OperatorError::Timeout(self.cycle_timeout);
                warn!(name = %key, phase = %cycle.phase, "Reconcile cycle timed out");
                // Applies already issued stay in place; the retry re-applies idempotently.
                let failed_in = cycle.phase;
                cycle.enter(CyclePhase::ReportingStatus);
                match tokio::time::timeout(self.cycle_timeout, self.report_timeout(key, &error))
                    .await
                {
                    Ok(Ok(written)) => cycle.writes += usize::from(written),
                    Ok(Err(e)) => warn!(name = %key, error = %e, "Failed to report timeout"),
                    Err(_) => warn!(name = %key, "Timed out reporting timeout"),
                }
                let mut outcome = cycle.outcome(Some(error));
                outcome.failed_in = Some(failed_in);
                outcome
            }
        }
    }

    async fn run(&self, cycle: &mut Cycle) -> CycleOutcome {
        let key = cycle.key.clone();

        cycle.enter(CyclePhase::Fetching);
        let autoscaler = match self.store.get_autoscaler(&key).await {
            Ok(Some(autoscaler)) => autoscaler,
            Ok(None) => {
                // Children go with it through owner references
                debug!(name = %key, "ConsumerAutoscaler is gone, nothing to do");
                cycle.enter(CyclePhase::Done);
                return cycle.outcome(None);
            }
            Err(e) => {
                warn!(name = %key, error = %e, "Failed to fetch ConsumerAutoscaler");
                return cycle.outcome(Some(e));
            }
        };

        if let Err(e) = desired::validate(&autoscaler) {
            warn!(name = %key, error = %e, "ConsumerAutoscaler spec validation failed");
            return self
                .finish(cycle, &autoscaler, WorkloadView::Unknown, Err(e))
                .await;
        }

        let topic_key = key.sibling(autoscaler.spec.consumer_spec.topic_name.clone());
        let partitions = match TopicStateReader::new(self.store.as_ref())
            .partition_count(&topic_key)
            .await
        {
            Ok(partitions) => partitions,
            Err(e) => {
                warn!(name = %key, topic = %topic_key, error = %e, "Topic dependency unavailable");
                return self
                    .finish(cycle, &autoscaler, WorkloadView::Unknown, Err(e))
                    .await;
            }
        };

        let mut actual: BTreeMap<ChildKind, Option<ChildResource>> = BTreeMap::new();
        for kind in ChildKind::APPLY_ORDER {
            match self.store.get_child(kind, &kind.child_key(&key)).await {
                Ok(child) => {
                    actual.insert(kind, child);
                }
                Err(e) => {
                    warn!(name = %key, kind = %kind, error = %e, "Failed to fetch child");
                    return self
                        .finish(cycle, &autoscaler, WorkloadView::Unknown, Err(e))
                        .await;
                }
            }
        }

        let uid = autoscaler.metadata.uid.as_deref();
        if let Some(e) = actual
            .values()
            .flatten()
            .find_map(|child| verify_ownership(&key, uid, child).err())
        {
            warn!(name = %key, error = %e, "Ownership conflict");
            return self
                .finish(cycle, &autoscaler, WorkloadView::Unknown, Err(e))
                .await;
        }

        cycle.enter(CyclePhase::Calculating);
        let desired = match desired::desired_state(&autoscaler, partitions.0) {
            Ok(desired) => desired,
            Err(e) => {
                let deployment = actual.get(&ChildKind::Deployment).cloned().flatten();
                return self
                    .finish(cycle, &autoscaler, WorkloadView::Fetched(deployment.as_ref()), Err(e))
                    .await;
            }
        };
        debug!(
            name = %key,
            partitions = partitions.0,
            min_replicas = desired.scaling_policy.min_replicas,
            max_replicas = desired.scaling_policy.max_replicas,
            "Calculated desired state"
        );

        cycle.enter(CyclePhase::Diffing);
        let changes = plan(&key, &desired, &actual);
        if changes.is_empty() {
            debug!(name = %key, "Children up to date");
        }

        cycle.enter(CyclePhase::Applying);
        let attempted = changes.len();
        let mut failures = Vec::new();
        for change in changes {
            let child = change.child();
            let kind = child.kind();
            let applied = match &change {
                ChildChange::Create(child) => self.store.create_child(child).await,
                ChildChange::Update(child) => self.store.update_child(child).await,
            };
            match applied {
                Ok(mut written) => {
                    cycle.writes += 1;
                    metrics::counter!("lagscale_store_writes_total").increment(1);
                    info!(
                        name = %key,
                        kind = %kind,
                        child = %written.key,
                        created = matches!(change, ChildChange::Create(_)),
                        "Applied child"
                    );
                    if let Some(Some(previous)) = actual.get(&kind) {
                        if written.observed.is_none() {
                            written.observed = previous.observed.clone();
                        }
                    }
                    actual.insert(kind, Some(written));
                }
                Err(e) => {
                    warn!(name = %key, kind = %kind, error = %e, "Failed to apply child");
                    failures.push(e);
                }
            }
        }

        let result = collapse_failures(failures, attempted);
        let deployment = actual.get(&ChildKind::Deployment).cloned().flatten();
        self.finish(cycle, &autoscaler, WorkloadView::Fetched(deployment.as_ref()), result)
            .await
    }

    /// Report status for the cycle and settle its final phase
    async fn finish(
        &self,
        cycle: &mut Cycle,
        autoscaler: &ConsumerAutoscaler,
        workload: WorkloadView<'_>,
        result: Result<()>,
    ) -> CycleOutcome {
        let failed_in = cycle.phase;
        cycle.enter(CyclePhase::ReportingStatus);

        let status = status::build_status(autoscaler, workload, result.as_ref().map(|_| ()));
        let reported = StatusReporter::new(self.store.as_ref())
            .report(&cycle.key, autoscaler.status.as_ref(), &status)
            .await;

        let error = match (result, reported) {
            (Ok(()), Ok(written)) => {
                cycle.writes += usize::from(written);
                None
            }
            (Ok(()), Err(e)) => {
                warn!(name = %cycle.key, error = %e, "Failed to update status");
                Some(e)
            }
            (Err(e), Ok(written)) => {
                cycle.writes += usize::from(written);
                cycle.phase = failed_in;
                Some(e)
            }
            (Err(e), Err(report_err)) => {
                warn!(name = %cycle.key, error = %report_err, "Failed to update status");
                cycle.phase = failed_in;
                Some(e)
            }
        };

        match &error {
            None => {
                cycle.enter(CyclePhase::Done);
                info!(name = %cycle.key, writes = cycle.writes, "Reconciliation completed");
            }
            Some(e) => {
                info!(
                    name = %cycle.key,
                    kind = %e.kind(),
                    phase = %cycle.phase,
                    "Reconciliation failed"
                );
            }
        }
        cycle.outcome(error)
    }

    async fn report_timeout(&self, key: &ObjectKey, error: &OperatorError) -> Result<bool> {
        let Some(autoscaler) = self.store.get_autoscaler(key).await? else {
            return Ok(false);
        };
        let status = status::build_status(&autoscaler, WorkloadView::Unknown, Err(error));
        StatusReporter::new(self.store.as_ref())
            .report(key, autoscaler.status.as_ref(), &status)
            .await
    }
}

fn collapse_failures(mut failures: Vec<OperatorError>, attempted: usize) -> Result<()> {
    if failures.is_empty() {
        return Ok(());
    }
    let failed = failures.len();
    let first = failures.remove(0);
    if failed == attempted {
        Err(first)
    } else {
        Err(OperatorError::PartialApplyFailure {
            failed,
            attempted,
            first: Box::new(first),
        })
    }
}
