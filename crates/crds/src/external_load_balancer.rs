//! ExternalLoadBalancer CRD
//!
//! A load balancer fronting the control plane that the provider does not manage but
//! probes for availability.

use crate::cluster_api::ApiEndpoint;
use crate::conditions::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Port used when the endpoint does not specify one
pub const DEFAULT_API_SERVER_PORT: i32 = 6443;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1alpha1",
    kind = "ExternalLoadBalancer",
    namespaced,
    status = "ExternalLoadBalancerStatus",
    shortname = "elb"
)]
#[serde(rename_all = "camelCase")]
pub struct ExternalLoadBalancerSpec {
    /// Endpoint of the load balancer
    pub endpoint: ApiEndpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalLoadBalancerStatus {
    /// Set when the endpoint answers its liveness probe
    #[serde(default)]
    pub ready: bool,

    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ExternalLoadBalancerSpec {
    /// Probe URL base (`http://host:port`), defaulting the port
    pub fn endpoint_url(&self) -> String {
        let port = if self.endpoint.port == 0 {
            DEFAULT_API_SERVER_PORT
        } else {
            self.endpoint.port
        };
        format!("http://{}:{}", self.endpoint.host, port)
    }
}
