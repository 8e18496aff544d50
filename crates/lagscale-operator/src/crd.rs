//! Custom Resource Definitions for the Lagscale operator
//!
//! `ConsumerAutoscaler` is the resource users declare. `KafkaTopic` mirrors
//! the subset of the Strimzi topic resource the operator reads; it is owned
//! by the topic operator and never written here.

use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// API group of the ConsumerAutoscaler resource
pub const API_GROUP: &str = "lagscale.io";

/// API version of the ConsumerAutoscaler resource
pub const API_VERSION: &str = "lagscale.io/v1alpha1";

/// Metric exported by kafka-exporter for consumer group lag
pub const DEFAULT_METRIC_NAME: &str = "kafka_consumergroup_lag";

/// Regex for validating Kubernetes names (RFC 1123 label)
static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Regex for validating Prometheus metric names
static METRIC_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z_:][a-zA-Z0-9_:]*$").unwrap());

/// Regex for validating Kafka consumer group ids
static GROUP_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._-]{1,249}$").unwrap());

/// Validate a Kubernetes name (RFC 1123 label)
fn validate_k8s_name(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::new("empty_name").with_message("name must not be empty".into()));
    }
    if value.len() > 63 {
        return Err(
            ValidationError::new("name_too_long").with_message("name exceeds 63 characters".into())
        );
    }
    if !NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", value).into(),
        ));
    }
    Ok(())
}

/// Validate a container image reference
fn validate_image(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("empty_image").with_message("image must not be empty".into()));
    }
    if value.len() > 255 {
        return Err(ValidationError::new("image_too_long")
            .with_message("image reference exceeds 255 characters".into()));
    }
    if value.contains("..") || value.starts_with('/') || value.starts_with('-') || value.contains(' ')
    {
        return Err(ValidationError::new("invalid_image")
            .with_message(format!("'{}' is not a valid container image", value).into()));
    }
    Ok(())
}

fn validate_consumer_group(value: &str) -> Result<(), ValidationError> {
    if GROUP_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_consumer_group").with_message(
            format!(
                "'{}' is not a valid consumer group (letters, digits, '.', '_', '-')",
                value
            )
            .into(),
        ))
    }
}

fn validate_metric_name(value: &str) -> Result<(), ValidationError> {
    if METRIC_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_metric_name")
            .with_message(format!("'{}' is not a valid metric name", value).into()))
    }
}

/// ConsumerAutoscaler custom resource definition
///
/// Declares a Kafka consumer workload whose horizontal autoscaler is kept
/// bounded by the partition count of the topic it consumes.
///
/// ```yaml
/// apiVersion: lagscale.io/v1alpha1
/// kind: ConsumerAutoscaler
/// metadata:
///   name: fast-data-consumer
/// spec:
///   minReplicas: 1
///   lagThreshold: 1000
///   consumerSpec:
///     image: ghcr.io/acme/consumer:1.4.0
///     topicName: fast-data-topic
///     containerName: consumer
/// ```
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[kube(
    group = "lagscale.io",
    version = "v1alpha1",
    kind = "ConsumerAutoscaler",
    plural = "consumerautoscalers",
    shortname = "cas",
    namespaced,
    status = "ConsumerAutoscalerStatus",
    printcolumn = r#"{"name":"Topic", "type":"string", "jsonPath":".spec.consumerSpec.topicName"}"#,
    printcolumn = r#"{"name":"Min", "type":"integer", "jsonPath":".spec.minReplicas"}"#,
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Message", "type":"string", "jsonPath":".status.message"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerAutoscalerSpec {
    /// Lower bound for the consumer replica count
    #[serde(default = "default_min_replicas")]
    #[validate(range(min = 1, message = "minReplicas must be at least 1"))]
    pub min_replicas: i32,

    /// Target average lag per replica
    #[validate(range(min = 0, message = "lagThreshold must not be negative"))]
    pub lag_threshold: i64,

    /// Name of the external metric the autoscaler tracks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_metric_name"))]
    pub metric_name: Option<String>,

    /// The consumer workload
    #[validate(nested)]
    pub consumer_spec: ConsumerSpec,
}

/// Consumer workload description
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerSpec {
    /// Container image of the consumer
    #[validate(custom(function = "validate_image"))]
    pub image: String,

    /// KafkaTopic resource consumed by the workload
    #[validate(custom(function = "validate_k8s_name"))]
    pub topic_name: String,

    /// Name of the consumer container
    #[validate(custom(function = "validate_k8s_name"))]
    pub container_name: String,

    /// Consumer group id, defaults to the resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_consumer_group"))]
    pub consumer_group: Option<String>,
}

fn default_min_replicas() -> i32 {
    1
}

/// Observed state of a ConsumerAutoscaler
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerAutoscalerStatus {
    /// Current replica count of the consumer Deployment
    #[serde(default)]
    pub replicas: i32,

    /// Pods currently running the consumer
    #[serde(default)]
    pub active_pods: Vec<String>,

    /// Outcome of the most recent reconcile cycle
    #[serde(default)]
    pub message: String,

    /// Generation of the spec the message refers to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl ConsumerAutoscalerSpec {
    /// Metric name used by the scaling policy and the metrics binding
    pub fn metric_name(&self) -> &str {
        self.metric_name.as_deref().unwrap_or(DEFAULT_METRIC_NAME)
    }

    /// Consumer group id, falling back to the resource name
    pub fn consumer_group<'a>(&'a self, resource_name: &'a str) -> &'a str {
        self.consumer_spec
            .consumer_group
            .as_deref()
            .unwrap_or(resource_name)
    }
}

/// Strimzi KafkaTopic, read-only view
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kafka.strimzi.io",
    version = "v1beta2",
    kind = "KafkaTopic",
    plural = "kafkatopics",
    namespaced,
    status = "KafkaTopicStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct KafkaTopicSpec {
    /// Name of the topic in Kafka when it differs from the resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_name: Option<String>,

    /// Number of partitions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partitions: Option<i32>,

    /// Replication factor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

/// Status reported by the topic operator
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KafkaTopicStatus {
    #[serde(default)]
    pub conditions: Vec<TopicCondition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Condition on a KafkaTopic
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TopicCondition {
    /// Type of condition
    pub r#type: String,

    /// Status of the condition (True, False, Unknown)
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl KafkaTopic {
    /// Whether the topic operator reports the topic as ready
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.conditions
                .iter()
                .any(|c| c.r#type == "Ready" && c.status == "True")
        })
    }
}
