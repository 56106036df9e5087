//! Cluster API owner types
//!
//! Read-only projections of the `cluster.x-k8s.io/v1beta1` `Cluster` and `Machine`
//! objects. Only the fields the reconcilers consume are modelled; everything else the
//! API server returns is ignored on deserialization. These types are never installed
//! by `crdgen`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// API group of the cluster-api core types
pub const CLUSTER_API_GROUP: &str = "cluster.x-k8s.io";

/// Label carrying the owning cluster's name on every cluster-scoped object
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Label present on control plane machines
pub const CONTROL_PLANE_LABEL: &str = "cluster.x-k8s.io/control-plane";

/// Annotation that pauses reconciliation of the annotated object
pub const PAUSED_ANNOTATION: &str = "cluster.x-k8s.io/paused";

/// Host/port pair used for API endpoints
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApiEndpoint {
    /// Hostname or IP address
    #[serde(default)]
    pub host: String,

    /// Port number
    #[serde(default)]
    pub port: i32,
}

impl ApiEndpoint {
    /// True when neither host nor port is set
    pub fn is_zero(&self) -> bool {
        self.host.is_empty() && self.port == 0
    }
}

impl std::fmt::Display for ApiEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Reference to another Kubernetes object
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    /// API version of the referent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    /// Kind of the referent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Name of the referent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Namespace of the referent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Cluster",
    namespaced,
    status = "ClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Pauses reconciliation of the cluster and everything it owns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,

    /// Endpoint of the cluster's API server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_endpoint: Option<ApiEndpoint>,

    /// Infrastructure object providing the cluster's infrastructure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ObjectReference>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Set by cluster-api once the infrastructure cluster reports ready
    #[serde(default)]
    pub infrastructure_ready: bool,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Machine",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Name of the owning cluster
    #[serde(default)]
    pub cluster_name: String,

    /// Bootstrap configuration
    #[serde(default)]
    pub bootstrap: Bootstrap,

    /// Failure domain the machine should be placed in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_domain: Option<String>,

    /// Infrastructure object backing this machine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ObjectReference>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct Bootstrap {
    /// Name of the secret holding the bootstrap data under the `value` key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_secret_name: Option<String>,
}

/// True when the annotations contain the cluster-api pause marker
pub fn has_paused_annotation(annotations: Option<&BTreeMap<String, String>>) -> bool {
    annotations.is_some_and(|a| a.contains_key(PAUSED_ANNOTATION))
}

impl Cluster {
    /// True when the cluster is paused via spec or annotation
    pub fn is_paused(&self) -> bool {
        self.spec.paused.unwrap_or(false)
            || has_paused_annotation(self.metadata.annotations.as_ref())
    }

    /// True when cluster-api reports the infrastructure as ready
    pub fn infrastructure_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.infrastructure_ready)
    }
}

impl Machine {
    /// True when the machine carries the control plane label
    pub fn is_control_plane(&self) -> bool {
        self.metadata
            .labels
            .as_ref()
            .is_some_and(|l| l.contains_key(CONTROL_PLANE_LABEL))
    }

    /// Name of the owning cluster: the cluster-name label, else `spec.clusterName`
    pub fn cluster_name(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(CLUSTER_NAME_LABEL))
            .map(String::as_str)
            .filter(|name| !name.is_empty())
            .or_else(|| Some(self.spec.cluster_name.as_str()).filter(|name| !name.is_empty()))
    }
}
