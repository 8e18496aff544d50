//! Desired-state calculation
//!
//! Maps a ConsumerAutoscaler and the current partition count of its topic
//! to the spec of every child resource. Pure and deterministic: the diff
//! step relies on identical inputs yielding identical outputs.

use crate::crd::ConsumerAutoscaler;
use crate::error::{OperatorError, Result};
use crate::model::{
    ChildKind, ChildSpec, DeploymentSpec, MetricsBindingSpec, ObjectKey, OwnerRef,
    ScalingPolicySpec,
};
use kube::ResourceExt;
use validator::Validate;

/// Desired spec of every child of one ConsumerAutoscaler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredState {
    pub owner: OwnerRef,
    pub deployment: DeploymentSpec,
    pub metrics_binding: MetricsBindingSpec,
    pub scaling_policy: ScalingPolicySpec,
}

impl DesiredState {
    /// Desired spec for one child kind
    pub fn spec_for(&self, kind: ChildKind) -> ChildSpec {
        match kind {
            ChildKind::Deployment => ChildSpec::Deployment(self.deployment.clone()),
            ChildKind::MetricsBinding => ChildSpec::MetricsBinding(self.metrics_binding.clone()),
            ChildKind::ScalingPolicy => ChildSpec::ScalingPolicy(self.scaling_policy.clone()),
        }
    }

    /// Desired specs in apply order
    pub fn in_apply_order(&self) -> impl Iterator<Item = (ChildKind, ChildSpec)> + '_ {
        ChildKind::APPLY_ORDER
            .into_iter()
            .map(move |kind| (kind, self.spec_for(kind)))
    }
}

/// Upper replica bound: one consumer per partition, never below the floor
pub fn max_replicas(min_replicas: i32, partitions: i32) -> i32 {
    partitions.max(min_replicas)
}

/// PromQL expression the metrics adapter serves as the external metric
pub fn lag_query(metric_name: &str, topic: &str, consumer_group: &str) -> String {
    format!(
        "sum({}{{topic=\"{}\",consumergroup=\"{}\"}})",
        metric_name,
        escape_label_value(topic),
        escape_label_value(consumer_group)
    )
}

/// Escape a PromQL label value for use inside double quotes
fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Reject specs the calculator cannot turn into valid children
pub fn validate(autoscaler: &ConsumerAutoscaler) -> Result<()> {
    if autoscaler.metadata.name.is_none() {
        return Err(OperatorError::InvalidSpec(
            "metadata.name is required".to_string(),
        ));
    }

    if let Err(errors) = autoscaler.spec.validate() {
        let mut error_messages: Vec<String> = errors
            .field_errors()
            .iter()
            .flat_map(|(field, errs)| {
                errs.iter().map(move |e| match &e.message {
                    Some(message) => format!("{}: {}", field, message),
                    None => format!("{}: {}", field, e.code),
                })
            })
            .collect();
        // Nested struct errors are not part of field_errors
        for (field, nested) in errors.errors() {
            if let validator::ValidationErrorsKind::Struct(inner) = nested {
                for (inner_field, errs) in inner.field_errors() {
                    for e in errs {
                        error_messages.push(match &e.message {
                            Some(message) => format!("{}.{}: {}", field, inner_field, message),
                            None => format!("{}.{}: {}", field, inner_field, e.code),
                        });
                    }
                }
            }
        }
        error_messages.sort();
        return Err(OperatorError::InvalidSpec(error_messages.join("; ")));
    }

    Ok(())
}

/// Compute the desired children for `autoscaler` given the topic's partition count
pub fn desired_state(autoscaler: &ConsumerAutoscaler, partitions: i32) -> Result<DesiredState> {
    validate(autoscaler)?;

    let name = autoscaler.name_any();
    let namespace = autoscaler.namespace().unwrap_or_else(|| "default".to_string());
    let owner_key = ObjectKey::new(namespace, name.clone());
    let spec = &autoscaler.spec;
    let consumer = &spec.consumer_spec;
    let consumer_group = spec.consumer_group(&name).to_string();
    let metric_name = spec.metric_name().to_string();

    let deployment = DeploymentSpec {
        image: consumer.image.clone(),
        container_name: consumer.container_name.clone(),
        topic_name: consumer.topic_name.clone(),
        consumer_group: consumer_group.clone(),
        replicas: Some(spec.min_replicas),
    };

    let metrics_binding = MetricsBindingSpec {
        query: lag_query(&metric_name, &consumer.topic_name, &consumer_group),
        metric_name: metric_name.clone(),
        topic_name: consumer.topic_name.clone(),
        consumer_group,
    };

    let scaling_policy = ScalingPolicySpec {
        target_name: ChildKind::Deployment.child_key(&owner_key).name,
        min_replicas: spec.min_replicas,
        max_replicas: max_replicas(spec.min_replicas, partitions),
        target_metric_name: metric_name,
        target_value: spec.lag_threshold,
    };

    Ok(DesiredState {
        owner: OwnerRef {
            name,
            uid: autoscaler.metadata.uid.clone().unwrap_or_default(),
        },
        deployment,
        metrics_binding,
        scaling_policy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ConsumerAutoscalerSpec, ConsumerSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn create_test_autoscaler(min_replicas: i32) -> ConsumerAutoscaler {
        ConsumerAutoscaler {
            metadata: ObjectMeta {
                name: Some("fast-data-consumer".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("test-uid".to_string()),
                generation: Some(1),
                ..Default::default()
            },
            spec: ConsumerAutoscalerSpec {
                min_replicas,
                lag_threshold: 1000,
                metric_name: None,
                consumer_spec: ConsumerSpec {
                    image: "ghcr.io/acme/consumer:1.4.0".to_string(),
                    topic_name: "fast-data-topic".to_string(),
                    container_name: "consumer".to_string(),
                    consumer_group: None,
                },
            },
            status: None,
        }
    }

    #[test]
    fn test_single_partition_topic() {
        let desired = desired_state(&create_test_autoscaler(1), 1).unwrap();
        let policy = &desired.scaling_policy;
        assert_eq!(policy.min_replicas, 1);
        assert_eq!(policy.max_replicas, 1);
        assert_eq!(policy.target_value, 1000);
        assert_eq!(policy.target_name, "fast-data-consumer");
    }

    #[test]
    fn test_max_follows_partition_count() {
        for partitions in 1..=64 {
            let desired = desired_state(&create_test_autoscaler(1), partitions).unwrap();
            assert_eq!(desired.scaling_policy.max_replicas, partitions);
        }
    }

    #[test]
    fn test_max_clamped_to_min() {
        for partitions in 0..5 {
            let desired = desired_state(&create_test_autoscaler(5), partitions).unwrap();
            assert_eq!(desired.scaling_policy.max_replicas, 5);
            assert!(desired.scaling_policy.max_replicas >= desired.scaling_policy.min_replicas);
        }
    }

    #[test]
    fn test_partition_decrease_lowers_max() {
        let autoscaler = create_test_autoscaler(1);
        let before = desired_state(&autoscaler, 3).unwrap();
        let after = desired_state(&autoscaler, 1).unwrap();
        assert_eq!(before.scaling_policy.max_replicas, 3);
        assert_eq!(after.scaling_policy.max_replicas, 1);
        assert_eq!(before.deployment, after.deployment);
        assert_eq!(before.metrics_binding, after.metrics_binding);
    }

    #[test]
    fn test_deterministic() {
        let autoscaler = create_test_autoscaler(2);
        assert_eq!(
            desired_state(&autoscaler, 6).unwrap(),
            desired_state(&autoscaler, 6).unwrap()
        );
    }

    #[test]
    fn test_deployment_seeded_with_min_replicas() {
        let desired = desired_state(&create_test_autoscaler(2), 6).unwrap();
        assert_eq!(desired.deployment.replicas, Some(2));
        assert_eq!(desired.deployment.consumer_group, "fast-data-consumer");
    }

    #[test]
    fn test_metrics_binding_query() {
        let desired = desired_state(&create_test_autoscaler(1), 3).unwrap();
        assert_eq!(
            desired.metrics_binding.query,
            "sum(kafka_consumergroup_lag{topic=\"fast-data-topic\",consumergroup=\"fast-data-consumer\"})"
        );
    }

    #[test]
    fn test_apply_order() {
        let desired = desired_state(&create_test_autoscaler(1), 3).unwrap();
        let kinds: Vec<ChildKind> = desired.in_apply_order().map(|(k, _)| k).collect();
        assert_eq!(
            kinds,
            vec![
                ChildKind::Deployment,
                ChildKind::MetricsBinding,
                ChildKind::ScalingPolicy
            ]
        );
    }

    #[test]
    fn test_invalid_spec_rejected() {
        let mut autoscaler = create_test_autoscaler(0);
        autoscaler.spec.consumer_spec.container_name = "Bad Name".to_string();
        let err = desired_state(&autoscaler, 3).unwrap_err();
        assert!(matches!(err, OperatorError::InvalidSpec(_)));
        let message = err.to_string();
        assert!(message.contains("min_replicas"));
        assert!(message.contains("consumer_spec.container_name"));
    }

    #[test]
    fn test_unsafe_consumer_group_rejected() {
        let mut autoscaler = create_test_autoscaler(1);
        autoscaler.spec.consumer_spec.consumer_group = Some("orders\"} or vector(1)".to_string());
        let err = desired_state(&autoscaler, 3).unwrap_err();
        assert!(matches!(err, OperatorError::InvalidSpec(_)));
        assert!(err.to_string().contains("consumer_spec.consumer_group"));
    }

    #[test]
    fn test_lag_query_escapes_label_values() {
        assert_eq!(
            lag_query("kafka_consumergroup_lag", "orders", "a\"b\\c"),
            r#"sum(kafka_consumergroup_lag{topic="orders",consumergroup="a\"b\\c"})"#
        );
    }
}
