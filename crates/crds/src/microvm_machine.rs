//! MicrovmMachine CRD
//!
//! Infrastructure machine backed by a microvm on one of the cluster's hosts.

use crate::conditions::Condition;
use crate::microvm::{ContainerFileSource, NetworkInterface, SshPublicKey, Volume, VmState};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Finalizer held on a `MicrovmMachine` until its microvm is gone
pub const MACHINE_FINALIZER: &str = "microvmmachine.infrastructure.cluster.x-k8s.io";

/// Scheme prefix of microvm provider identifiers
pub const PROVIDER_ID_PREFIX: &str = "microvm://";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1alpha1",
    kind = "MicrovmMachine",
    namespaced,
    status = "MicrovmMachineStatus",
    shortname = "mvmm",
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.vmState"}"#,
    printcolumn = r#"{"name":"ProviderID","type":"string","jsonPath":".spec.providerID"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MicrovmMachineSpec {
    /// Number of virtual CPUs
    pub vcpu: u32,

    /// Memory in megabytes
    pub memory_mb: u32,

    /// Root volume
    pub root_volume: Volume,

    /// Additional volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_volumes: Vec<Volume>,

    /// Kernel image
    pub kernel: ContainerFileSource,

    /// Kernel command line arguments
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub kernel_cmdline: BTreeMap<String, String>,

    /// Optional initial ramdisk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initrd: Option<ContainerFileSource>,

    /// Network interfaces in addition to the default one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_interfaces: Vec<NetworkInterface>,

    /// SSH keys for this machine; takes precedence over the cluster's keys
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_public_keys: Vec<SshPublicKey>,

    /// Identifier of the microvm, `microvm://<failure-domain>/<uid>`. Never reassigned
    /// once set.
    #[serde(default, rename = "providerID", skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MicrovmMachineStatus {
    /// Set when the microvm is running
    #[serde(default)]
    pub ready: bool,

    /// Last observed microvm state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_state: Option<VmState>,

    /// Addresses assigned to the machine
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,

    /// Terminal failure reason, for cluster-api to surface
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Terminal failure message, for cluster-api to surface
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,

    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// An address of a machine
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineAddress {
    /// Address type, e.g. `InternalIP`
    #[serde(rename = "type")]
    pub type_: String,

    /// The address
    pub address: String,
}

/// Builds a provider identifier from a failure domain and a microvm uid
pub fn format_provider_id(failure_domain: &str, uid: &str) -> String {
    format!("{}{}/{}", PROVIDER_ID_PREFIX, failure_domain, uid)
}

/// Splits a provider identifier into failure domain and uid.
///
/// Returns `None` when the identifier does not use the microvm scheme or has no
/// failure domain segment.
pub fn parse_provider_id(provider_id: &str) -> Option<(&str, &str)> {
    let rest = provider_id.strip_prefix(PROVIDER_ID_PREFIX)?;
    let (domain, uid) = rest.split_once('/').unwrap_or((rest, ""));
    (!domain.is_empty()).then_some((domain, uid))
}

impl MicrovmMachine {
    /// Failure domain encoded in the provider identifier, if any
    pub fn provider_failure_domain(&self) -> Option<&str> {
        self.spec
            .provider_id
            .as_deref()
            .and_then(parse_provider_id)
            .map(|(domain, _)| domain)
    }
}
