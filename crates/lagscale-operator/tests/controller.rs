//! Controller Integration Tests
//!
//! Runs the full controller (watch dispatcher, work queue, workers) against
//! the in-memory store and drives it by changing autoscalers and topics.
//!
//! Run with: cargo test -p lagscale-operator --test controller -- --nocapture

use anyhow::Result;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use lagscale_operator::config::OperatorConfig;
use lagscale_operator::controller::Controller;
use lagscale_operator::crd::{ConsumerAutoscaler, ConsumerAutoscalerSpec, ConsumerSpec};
use lagscale_operator::model::{ChildKind, ChildSpec, ObjectKey, ScalingPolicySpec};
use lagscale_operator::store::memory::StoreWrite;
use lagscale_operator::store::MemoryStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::info;

// =============================================================================
// HELPERS
// =============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn autoscaler(name: &str, topic: &str) -> ConsumerAutoscaler {
    ConsumerAutoscaler {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        spec: ConsumerAutoscalerSpec {
            min_replicas: 1,
            lag_threshold: 1000,
            metric_name: None,
            consumer_spec: ConsumerSpec {
                image: "ghcr.io/acme/consumer:1.4.0".to_string(),
                topic_name: topic.to_string(),
                container_name: "consumer".to_string(),
                consumer_group: None,
            },
        },
        status: None,
    }
}

fn key(name: &str) -> ObjectKey {
    ObjectKey::new("default", name)
}

fn scaling_policy(store: &MemoryStore, owner: &str) -> Option<ScalingPolicySpec> {
    let child_key = ChildKind::ScalingPolicy.child_key(&key(owner));
    match store.child(ChildKind::ScalingPolicy, &child_key)?.spec {
        ChildSpec::ScalingPolicy(spec) => Some(spec),
        _ => None,
    }
}

fn max_replicas(store: &MemoryStore, owner: &str) -> Option<i32> {
    scaling_policy(store, owner).map(|p| p.max_replicas)
}

fn status_message(store: &MemoryStore, owner: &str) -> String {
    store
        .autoscaler(&key(owner))
        .and_then(|a| a.status)
        .map(|s| s.message)
        .unwrap_or_default()
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..600 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {}", what);
}

struct RunningController {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl RunningController {
    fn start(store: &Arc<MemoryStore>) -> Self {
        let controller = Controller::new(store.clone(), OperatorConfig::default());
        let (shutdown, signal) = oneshot::channel::<()>();
        let handle = tokio::spawn(controller.run(async move {
            let _ = signal.await;
        }));
        Self { shutdown, handle }
    }

    async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.handle.await?;
        Ok(())
    }
}

// =============================================================================
// CONVERGENCE TESTS
// =============================================================================

/// Children are created on start and maxReplicas follows the partition count
#[tokio::test(start_paused = true)]
async fn test_max_replicas_tracks_partitions() -> Result<()> {
    init_tracing();

    let store = Arc::new(MemoryStore::new());
    store.put_autoscaler(autoscaler("fast-data-consumer", "fast-data-topic"));
    store.put_topic(key("fast-data-topic"), 1, true);

    let controller = RunningController::start(&store);

    wait_until("initial scaling policy", || {
        max_replicas(&store, "fast-data-consumer") == Some(1)
    })
    .await;
    let policy = scaling_policy(&store, "fast-data-consumer").unwrap();
    assert_eq!(policy.min_replicas, 1);
    assert_eq!(policy.target_value, 1000);
    assert!(store
        .child(
            ChildKind::MetricsBinding,
            &ChildKind::MetricsBinding.child_key(&key("fast-data-consumer"))
        )
        .is_some());
    info!("Initial children created");

    store.put_topic(key("fast-data-topic"), 3, true);
    wait_until("maxReplicas raised to 3", || {
        max_replicas(&store, "fast-data-consumer") == Some(3)
    })
    .await;

    store.put_topic(key("fast-data-topic"), 2, true);
    wait_until("maxReplicas lowered to 2", || {
        max_replicas(&store, "fast-data-consumer") == Some(2)
    })
    .await;
    assert_eq!(
        status_message(&store, "fast-data-consumer"),
        "Reconciliation completed"
    );

    controller.stop().await?;
    Ok(())
}

/// An autoscaler created before its topic converges once the topic shows up
#[tokio::test(start_paused = true)]
async fn test_waits_for_missing_topic() -> Result<()> {
    init_tracing();

    let store = Arc::new(MemoryStore::new());
    store.put_autoscaler(autoscaler("orders", "orders-topic"));

    let controller = RunningController::start(&store);

    wait_until("dependency status", || {
        status_message(&store, "orders").starts_with("DependencyMissing:")
    })
    .await;
    assert!(max_replicas(&store, "orders").is_none());

    store.put_topic(key("orders-topic"), 4, false);
    wait_until("not-ready status", || {
        status_message(&store, "orders").starts_with("DependencyNotReady:")
    })
    .await;

    store.put_topic(key("orders-topic"), 4, true);
    wait_until("scaling policy", || max_replicas(&store, "orders") == Some(4)).await;
    wait_until("success status", || {
        status_message(&store, "orders") == "Reconciliation completed"
    })
    .await;

    controller.stop().await?;
    Ok(())
}

/// Every autoscaler on a shared topic picks up a partition change
#[tokio::test(start_paused = true)]
async fn test_shared_topic_updates_every_autoscaler() -> Result<()> {
    init_tracing();

    let store = Arc::new(MemoryStore::new());
    store.put_topic(key("events"), 2, true);
    store.put_autoscaler(autoscaler("billing", "events"));
    store.put_autoscaler(autoscaler("audit", "events"));

    let controller = RunningController::start(&store);

    wait_until("both policies", || {
        max_replicas(&store, "billing") == Some(2) && max_replicas(&store, "audit") == Some(2)
    })
    .await;

    store.put_topic(key("events"), 6, true);
    wait_until("both policies raised", || {
        max_replicas(&store, "billing") == Some(6) && max_replicas(&store, "audit") == Some(6)
    })
    .await;

    controller.stop().await?;
    Ok(())
}

// =============================================================================
// STEADY STATE TESTS
// =============================================================================

/// A converged controller issues no further writes, including status
#[tokio::test(start_paused = true)]
async fn test_converged_controller_is_quiet() -> Result<()> {
    init_tracing();

    let store = Arc::new(MemoryStore::new());
    store.put_topic(key("events"), 3, true);
    store.put_autoscaler(autoscaler("billing", "events"));

    let controller = RunningController::start(&store);
    wait_until("convergence", || {
        status_message(&store, "billing") == "Reconciliation completed"
    })
    .await;

    // Let follow-up cycles triggered by our own writes run out
    tokio::time::sleep(Duration::from_secs(5)).await;
    store.clear_writes();

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(store.writes().is_empty(), "unexpected writes: {:?}", store.writes());

    controller.stop().await?;
    Ok(())
}

/// A spec change is rolled out to the Deployment without touching the policy
#[tokio::test(start_paused = true)]
async fn test_spec_change_updates_deployment() -> Result<()> {
    init_tracing();

    let store = Arc::new(MemoryStore::new());
    store.put_topic(key("events"), 3, true);
    store.put_autoscaler(autoscaler("billing", "events"));

    let controller = RunningController::start(&store);
    wait_until("convergence", || max_replicas(&store, "billing") == Some(3)).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    store.clear_writes();

    let mut changed = autoscaler("billing", "events");
    changed.spec.consumer_spec.image = "ghcr.io/acme/consumer:1.5.0".to_string();
    store.put_autoscaler(changed);

    let deployment_key = ChildKind::Deployment.child_key(&key("billing"));
    wait_until("deployment update", || {
        store
            .writes()
            .contains(&StoreWrite::Update(ChildKind::Deployment, deployment_key.clone()))
    })
    .await;
    assert!(!store
        .writes()
        .iter()
        .any(|w| matches!(w, StoreWrite::Update(ChildKind::ScalingPolicy, _))));

    controller.stop().await?;
    Ok(())
}

/// Deleting an autoscaler removes its children and stops its reconciles
#[tokio::test(start_paused = true)]
async fn test_deleted_autoscaler_is_forgotten() -> Result<()> {
    init_tracing();

    let store = Arc::new(MemoryStore::new());
    store.put_topic(key("events"), 3, true);
    store.put_autoscaler(autoscaler("billing", "events"));

    let controller = RunningController::start(&store);
    wait_until("convergence", || max_replicas(&store, "billing") == Some(3)).await;

    store.delete_autoscaler(&key("billing"));
    assert!(max_replicas(&store, "billing").is_none());
    tokio::time::sleep(Duration::from_secs(5)).await;
    store.clear_writes();

    store.put_topic(key("events"), 5, true);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(store.writes().is_empty());
    assert!(max_replicas(&store, "billing").is_none());

    controller.stop().await?;
    Ok(())
}
