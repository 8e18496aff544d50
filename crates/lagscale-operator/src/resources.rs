//! Kubernetes Resource Builders
//!
//! Translates child specs into Kubernetes manifests (Deployment, ConfigMap,
//! HorizontalPodAutoscaler) and reads live objects back into child specs.

use crate::crd::API_VERSION;
use crate::error::{OperatorError, Result};
use crate::model::{
    ChildKind, ChildResource, ChildSpec, DeploymentSpec, MetricsBindingSpec, ObjectKey, OwnerRef,
    ScalingPolicySpec,
};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec as K8sDeploymentSpec};
use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, ExternalMetricSource, HorizontalPodAutoscaler,
    HorizontalPodAutoscalerSpec, MetricIdentifier, MetricSpec, MetricTarget,
};
use k8s_openapi::api::core::v1::{ConfigMap, Container, EnvVar, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use std::collections::BTreeMap;

/// Environment variable carrying the topic name into the consumer
pub const TOPIC_ENV: &str = "KAFKA_TOPIC";

/// Environment variable carrying the consumer group id into the consumer
pub const GROUP_ENV: &str = "KAFKA_CONSUMER_GROUP";

/// Owner kind written into owner references
pub const OWNER_KIND: &str = "ConsumerAutoscaler";

const BINDING_METRIC: &str = "metricName";
const BINDING_TOPIC: &str = "topic";
const BINDING_GROUP: &str = "consumerGroup";
const BINDING_QUERY: &str = "query";

/// Labels for managed resources
pub fn labels(owner_name: &str) -> BTreeMap<String, String> {
    let mut labels = selector_labels(owner_name);
    labels.insert(
        "app.kubernetes.io/component".to_string(),
        "consumer".to_string(),
    );
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        crate::MANAGER_NAME.to_string(),
    );
    labels
}

/// Selector labels for the consumer pods
pub fn selector_labels(owner_name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app.kubernetes.io/name".to_string(), "lagscale".to_string());
    labels.insert(
        "app.kubernetes.io/instance".to_string(),
        owner_name.to_string(),
    );
    labels
}

/// Label selector string matching the pods of `owner_name`
pub fn selector_string(owner_name: &str) -> String {
    selector_labels(owner_name)
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Builder for generating Kubernetes objects from a child resource
pub struct ResourceBuilder<'a> {
    child: &'a ChildResource,
}

impl<'a> ResourceBuilder<'a> {
    pub fn new(child: &'a ChildResource) -> Self {
        Self { child }
    }

    /// Get owner reference for managed resources
    fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: API_VERSION.to_string(),
            kind: OWNER_KIND.to_string(),
            name: self.child.owner.name.clone(),
            uid: self.child.owner.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn metadata(&self) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.child.key.name.clone()),
            namespace: Some(self.child.key.namespace.clone()),
            labels: Some(labels(&self.child.owner.name)),
            owner_references: Some(vec![self.owner_reference()]),
            resource_version: self.child.resource_version.clone(),
            ..Default::default()
        }
    }

    /// Build the consumer Deployment
    pub fn build_deployment(&self, spec: &DeploymentSpec) -> Deployment {
        let selector = selector_labels(&self.child.owner.name);

        let container = Container {
            name: spec.container_name.clone(),
            image: Some(spec.image.clone()),
            env: Some(vec![
                EnvVar {
                    name: TOPIC_ENV.to_string(),
                    value: Some(spec.topic_name.clone()),
                    ..Default::default()
                },
                EnvVar {
                    name: GROUP_ENV.to_string(),
                    value: Some(spec.consumer_group.clone()),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };

        Deployment {
            metadata: self.metadata(),
            spec: Some(K8sDeploymentSpec {
                replicas: spec.replicas,
                selector: LabelSelector {
                    match_labels: Some(selector.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(selector),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build the ConfigMap holding the external-metric rule
    pub fn build_metrics_binding(&self, spec: &MetricsBindingSpec) -> ConfigMap {
        let mut data = BTreeMap::new();
        data.insert(BINDING_METRIC.to_string(), spec.metric_name.clone());
        data.insert(BINDING_TOPIC.to_string(), spec.topic_name.clone());
        data.insert(BINDING_GROUP.to_string(), spec.consumer_group.clone());
        data.insert(BINDING_QUERY.to_string(), spec.query.clone());

        ConfigMap {
            metadata: self.metadata(),
            data: Some(data),
            ..Default::default()
        }
    }

    /// Build the HorizontalPodAutoscaler bounded by the partition count
    pub fn build_scaling_policy(&self, spec: &ScalingPolicySpec) -> HorizontalPodAutoscaler {
        let metric = MetricSpec {
            type_: "External".to_string(),
            external: Some(ExternalMetricSource {
                metric: MetricIdentifier {
                    name: spec.target_metric_name.clone(),
                    selector: None,
                },
                target: MetricTarget {
                    type_: "AverageValue".to_string(),
                    average_value: Some(Quantity(spec.target_value.to_string())),
                    ..Default::default()
                },
            }),
            ..Default::default()
        };

        HorizontalPodAutoscaler {
            metadata: self.metadata(),
            spec: Some(HorizontalPodAutoscalerSpec {
                scale_target_ref: CrossVersionObjectReference {
                    api_version: Some("apps/v1".to_string()),
                    kind: "Deployment".to_string(),
                    name: spec.target_name.clone(),
                },
                min_replicas: Some(spec.min_replicas),
                max_replicas: spec.max_replicas,
                metrics: Some(vec![metric]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn object_key(meta: &ObjectMeta, kind: ChildKind) -> Result<ObjectKey> {
    let name = meta
        .name
        .clone()
        .ok_or_else(|| OperatorError::InvalidSpec(format!("{} missing metadata.name", kind)))?;
    Ok(ObjectKey::new(
        meta.namespace.clone().unwrap_or_else(|| "default".to_string()),
        name,
    ))
}

/// Owner of a managed object, from its controller owner reference
pub fn owner_of(meta: &ObjectMeta) -> Option<OwnerRef> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|r| r.kind == OWNER_KIND && r.api_version == API_VERSION)
        .map(|r| OwnerRef {
            name: r.name.clone(),
            uid: r.uid.clone(),
        })
}

fn unowned(meta: &ObjectMeta) -> OwnerRef {
    OwnerRef {
        name: String::new(),
        uid: meta.uid.clone().unwrap_or_default(),
    }
}

fn child_from_meta(meta: &ObjectMeta, kind: ChildKind, spec: ChildSpec) -> Result<ChildResource> {
    Ok(ChildResource {
        key: object_key(meta, kind)?,
        owner: owner_of(meta).unwrap_or_else(|| unowned(meta)),
        spec,
        observed_generation: meta.generation.unwrap_or(0),
        resource_version: meta.resource_version.clone(),
        observed: None,
    })
}

/// Read a live Deployment back into a child resource
pub fn deployment_to_child(deployment: &Deployment) -> Result<ChildResource> {
    let spec = deployment.spec.as_ref();
    let container = spec
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.first());
    let env = |name: &str| -> String {
        container
            .and_then(|c| c.env.as_ref())
            .and_then(|env| env.iter().find(|e| e.name == name))
            .and_then(|e| e.value.clone())
            .unwrap_or_default()
    };

    let child_spec = ChildSpec::Deployment(DeploymentSpec {
        image: container.and_then(|c| c.image.clone()).unwrap_or_default(),
        container_name: container.map(|c| c.name.clone()).unwrap_or_default(),
        topic_name: env(TOPIC_ENV),
        consumer_group: env(GROUP_ENV),
        replicas: spec.and_then(|s| s.replicas),
    });

    child_from_meta(&deployment.metadata, ChildKind::Deployment, child_spec)
}

/// Read a live metrics-binding ConfigMap back into a child resource
pub fn metrics_binding_to_child(cm: &ConfigMap) -> Result<ChildResource> {
    let field = |key: &str| -> String {
        cm.data
            .as_ref()
            .and_then(|d| d.get(key))
            .cloned()
            .unwrap_or_default()
    };

    let child_spec = ChildSpec::MetricsBinding(MetricsBindingSpec {
        metric_name: field(BINDING_METRIC),
        topic_name: field(BINDING_TOPIC),
        consumer_group: field(BINDING_GROUP),
        query: field(BINDING_QUERY),
    });

    child_from_meta(&cm.metadata, ChildKind::MetricsBinding, child_spec)
}

/// Parse a Kubernetes quantity into a whole number.
///
/// Accepts plain integers and decimals, decimal SI suffixes (`m`, `k`,
/// `M`, ...), binary suffixes (`Ki`, `Mi`, ...) and the exponent form
/// (`1e3`). Returns `None` for malformed input, fractional values and
/// values outside `i64`.
fn parse_quantity(value: &str) -> Option<i64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(split);

    let (base, exponent): (i128, i32) = match suffix {
        "" => (10, 0),
        "n" => (10, -9),
        "u" => (10, -6),
        "m" => (10, -3),
        "k" => (10, 3),
        "M" => (10, 6),
        "G" => (10, 9),
        "T" => (10, 12),
        "P" => (10, 15),
        "E" => (10, 18),
        "Ki" => (2, 10),
        "Mi" => (2, 20),
        "Gi" => (2, 30),
        "Ti" => (2, 40),
        "Pi" => (2, 50),
        "Ei" => (2, 60),
        s if s.starts_with(['e', 'E']) => (10, s[1..].parse().ok()?),
        _ => return None,
    };

    let (negative, number) = match number.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, number.strip_prefix('+').unwrap_or(number)),
    };
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    let digits = format!("{}{}", whole, fraction);
    if digits.len() > 30 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let mantissa: i128 = digits.parse().ok()?;
    let scale = u32::try_from(fraction.len()).ok()?;

    // value = mantissa * base^exponent / 10^scale
    let (numerator, denominator) = if base == 10 {
        let shift = exponent - i32::try_from(scale).ok()?;
        if shift >= 0 {
            (mantissa.checked_mul(10i128.checked_pow(shift.unsigned_abs())?)?, 1)
        } else {
            (mantissa, 10i128.checked_pow(shift.unsigned_abs())?)
        }
    } else {
        (
            mantissa.checked_mul(2i128.checked_pow(exponent.unsigned_abs())?)?,
            10i128.checked_pow(scale)?,
        )
    };
    if numerator % denominator != 0 {
        return None;
    }

    let magnitude = numerator / denominator;
    i64::try_from(if negative { -magnitude } else { magnitude }).ok()
}

/// Read a live HorizontalPodAutoscaler back into a child resource
pub fn scaling_policy_to_child(hpa: &HorizontalPodAutoscaler) -> Result<ChildResource> {
    let spec = hpa.spec.as_ref();
    let external = spec
        .and_then(|s| s.metrics.as_ref())
        .and_then(|m| m.iter().find_map(|m| m.external.as_ref()));

    // The API server canonicalises quantities ("1000" comes back as "1k").
    // A target that is not a whole number never matches and gets rewritten.
    let target_value = external
        .and_then(|e| e.target.average_value.as_ref())
        .and_then(|q| parse_quantity(&q.0))
        .unwrap_or(-1);

    let child_spec = ChildSpec::ScalingPolicy(ScalingPolicySpec {
        target_name: spec
            .map(|s| s.scale_target_ref.name.clone())
            .unwrap_or_default(),
        min_replicas: spec.and_then(|s| s.min_replicas).unwrap_or(1),
        max_replicas: spec.map(|s| s.max_replicas).unwrap_or(0),
        target_metric_name: external
            .map(|e| e.metric.name.clone())
            .unwrap_or_default(),
        target_value,
    });

    child_from_meta(&hpa.metadata, ChildKind::ScalingPolicy, child_spec)
}
