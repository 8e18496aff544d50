//! ConsumerAutoscaler Controller
//!
//! Wires the watch dispatcher, the work queue and a fixed pool of workers
//! around the reconciler. Transient failures are retried with exponential
//! backoff; a periodic resync re-enqueues every ConsumerAutoscaler so a
//! missed watch event is never fatal.

use crate::config::OperatorConfig;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::model::{ObjectKey, ResourceKind};
use crate::queue::WorkQueue;
use crate::reconciler::{CycleOutcome, Reconciler};
use crate::store::ResourceStore;
use dashmap::DashMap;
use kube::ResourceExt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Metrics for the controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    /// Create new controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("lagscale_reconciliations_total"),
            duration: metrics::histogram!("lagscale_reconciliation_duration_seconds"),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Register descriptions for every metric the operator emits
pub fn describe_metrics() {
    metrics::describe_counter!(
        "lagscale_reconciliations_total",
        "Reconcile cycles started"
    );
    metrics::describe_counter!(
        "lagscale_reconciliation_errors_total",
        "Failed reconcile cycles by error kind"
    );
    metrics::describe_histogram!(
        "lagscale_reconciliation_duration_seconds",
        metrics::Unit::Seconds,
        "Duration of one reconcile cycle"
    );
    metrics::describe_counter!(
        "lagscale_store_writes_total",
        "Child creates and updates issued"
    );
    metrics::describe_counter!(
        "lagscale_watch_events_total",
        "Watch events received by kind"
    );
}

/// Shared flag reporting whether the controller has started serving
#[derive(Clone, Debug, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self, ready: bool) {
        self.0.store(ready, Ordering::Release);
    }
}

/// Worker pool, retry bookkeeping and resync around one [`Reconciler`]
pub struct Controller {
    store: Arc<dyn ResourceStore>,
    reconciler: Reconciler,
    queue: Arc<WorkQueue>,
    dispatcher: Arc<Dispatcher>,
    config: OperatorConfig,
    metrics: ControllerMetrics,
    /// Per-autoscaler consecutive failure counts for exponential backoff
    error_counts: DashMap<ObjectKey, u32>,
}

impl Controller {
    pub fn new(store: Arc<dyn ResourceStore>, config: OperatorConfig) -> Arc<Self> {
        Arc::new(Self {
            reconciler: Reconciler::new(Arc::clone(&store), config.cycle_timeout),
            store,
            queue: WorkQueue::new(),
            dispatcher: Arc::new(Dispatcher::new()),
            config,
            metrics: ControllerMetrics::new(),
            error_counts: DashMap::new(),
        })
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Consecutive failures recorded for `key`
    pub fn retry_count(&self, key: &ObjectKey) -> u32 {
        self.error_counts.get(key).map(|count| *count).unwrap_or(0)
    }

    /// Take the next key off the queue and run one cycle for it.
    ///
    /// Returns `None` once the queue is closed.
    pub async fn process_next(&self) -> Option<(ObjectKey, CycleOutcome)> {
        let key = self.queue.next().await?;

        self.metrics.reconciliations.increment(1);
        let start = Instant::now();
        let outcome = self.reconciler.reconcile(&key).await;
        self.metrics.duration.record(start.elapsed().as_secs_f64());

        self.queue.done(&key);
        self.handle_outcome(&key, &outcome);
        Some((key, outcome))
    }

    fn handle_outcome(&self, key: &ObjectKey, outcome: &CycleOutcome) {
        let Some(error) = &outcome.error else {
            // Converged, or the autoscaler is gone
            self.error_counts.remove(key);
            return;
        };

        metrics::counter!("lagscale_reconciliation_errors_total", "kind" => error.kind().as_str())
            .increment(1);

        if !error.is_retryable() {
            self.error_counts.remove(key);
            warn!(
                name = %key,
                error = %error,
                "Reconciliation failed permanently, waiting for a spec change"
            );
            return;
        }

        let retries = {
            let mut entry = self.error_counts.entry(key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        let delay = self.config.backoff.delay(retries);

        warn!(
            error = %error,
            retry = retries,
            delay_secs = delay.as_secs(),
            "Reconciliation error for '{}', will retry",
            key
        );

        self.queue.enqueue_after(key.clone(), delay);
    }

    /// Enqueue every ConsumerAutoscaler in scope; returns how many were enqueued
    #[instrument(skip(self))]
    pub async fn resync(&self) -> Result<usize> {
        let autoscalers = self.store.list_autoscalers().await?;
        let count = autoscalers.len();
        for autoscaler in autoscalers {
            let namespace = autoscaler
                .namespace()
                .unwrap_or_else(|| "default".to_string());
            self.queue
                .enqueue(ObjectKey::new(namespace, autoscaler.name_any()));
        }
        debug!(count, "Resync enqueued autoscalers");
        Ok(count)
    }

    async fn worker(self: Arc<Self>, id: usize) {
        debug!(worker = id, "Worker started");
        while self.process_next().await.is_some() {}
        debug!(worker = id, "Worker stopped");
    }

    async fn resync_loop(self: Arc<Self>) {
        let period = self.config.resync_interval;
        // The watch replays existing objects on start, so skip the immediate tick
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.resync().await {
                warn!(error = %e, "Periodic resync failed");
            }
        }
    }

    /// Run until `shutdown` resolves, then let in-flight cycles finish
    pub async fn run<F>(self: Arc<Self>, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        info!(
            workers = self.config.workers,
            resync_secs = self.config.resync_interval.as_secs(),
            "Starting ConsumerAutoscaler controller"
        );

        let events = self.store.watch(&ResourceKind::WATCHED);
        let dispatcher = tokio::spawn(
            Arc::clone(&self.dispatcher).run(events, Arc::clone(&self.queue)),
        );
        let resync = tokio::spawn(Arc::clone(&self).resync_loop());
        let workers: Vec<_> = (0..self.config.workers.max(1))
            .map(|id| tokio::spawn(Arc::clone(&self).worker(id)))
            .collect();

        shutdown.await;
        info!("Shutting down controller");

        dispatcher.abort();
        resync.abort();
        self.queue.close();
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Worker task failed");
            }
        }

        info!("Controller stopped");
    }
}

/// Start the ConsumerAutoscaler controller against `store`.
///
/// `readiness` turns true once the store answered the initial list and
/// false again when shutdown begins.
pub async fn run_controller<F>(
    store: Arc<dyn ResourceStore>,
    config: OperatorConfig,
    readiness: Readiness,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    // Fails fast when the CRD is not installed or RBAC is missing
    let existing = store.list_autoscalers().await?;
    info!(count = existing.len(), "Found existing ConsumerAutoscalers");

    readiness.set(true);
    let signal = readiness.clone();
    Controller::new(store, config)
        .run(async move {
            shutdown.await;
            signal.set(false);
        })
        .await;
    Ok(())
}
