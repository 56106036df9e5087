//! MicrovmCluster CRD
//!
//! Infrastructure cluster: the static pool of microvm hosts, credentials for reaching
//! them, and the registry of failure domains derived from the pool.

use crate::cluster_api::ApiEndpoint;
use crate::conditions::Condition;
use crate::microvm::SshPublicKey;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Finalizer held on a `MicrovmCluster` while it exists
pub const CLUSTER_FINALIZER: &str = "microvmcluster.infrastructure.cluster.x-k8s.io";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1alpha1",
    kind = "MicrovmCluster",
    namespaced,
    status = "MicrovmClusterStatus",
    shortname = "mvmc",
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MicrovmClusterSpec {
    /// Endpoint used to reach the workload cluster's API server
    #[serde(default)]
    pub control_plane_endpoint: ApiEndpoint,

    /// SSH keys for every machine that does not declare its own
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_public_keys: Vec<SshPublicKey>,

    /// Where microvms are placed
    #[serde(default)]
    pub placement: Placement,

    /// Proxy for calls to the microvm service hosts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub microvm_proxy: Option<MicrovmProxy>,

    /// Secret holding `tls.crt`, `tls.key` and `ca.crt` for the microvm service hosts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret_ref: Option<String>,
}

/// Placement configuration; exactly one option is expected to be set
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    /// Place microvms across a fixed pool of hosts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_pool: Option<StaticPoolPlacement>,
}

impl Placement {
    /// True when a placement option is configured
    pub fn is_set(&self) -> bool {
        self.static_pool.is_some()
    }
}

/// A fixed pool of microvm hosts
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StaticPoolPlacement {
    /// Hosts in the pool
    pub hosts: Vec<MicrovmHost>,

    /// Secret with one basic auth token per host, keyed by host without port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth_secret: Option<String>,
}

/// A host running the microvm service
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MicrovmHost {
    /// Optional friendly name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Service endpoint including port
    pub endpoint: String,

    /// Whether control plane machines may be placed on this host
    #[serde(default = "default_true", rename = "controlplaneAllowed")]
    pub control_plane_allowed: bool,
}

fn default_true() -> bool {
    true
}

/// Proxy used for microvm service calls
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MicrovmProxy {
    /// Proxy URL
    pub endpoint: String,
}

/// A failure domain registered for the cluster
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FailureDomainSpec {
    /// Whether control plane machines may be placed in this domain
    #[serde(default)]
    pub control_plane: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MicrovmClusterStatus {
    /// Set once the failure domain registry is populated
    #[serde(default)]
    pub ready: bool,

    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Failure domains keyed by host endpoint
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failure_domains: BTreeMap<String, FailureDomainSpec>,
}

impl MicrovmCluster {
    /// Registered failure domains, empty when status has not been written yet
    pub fn failure_domains(&self) -> BTreeMap<String, FailureDomainSpec> {
        self.status
            .as_ref()
            .map(|s| s.failure_domains.clone())
            .unwrap_or_default()
    }
}
