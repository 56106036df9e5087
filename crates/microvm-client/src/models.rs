//! Wire models of the microvm service

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Desired state of a microvm
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MicroVmSpec {
    /// Identifier, unique within the namespace
    pub id: String,

    /// Namespace of the microvm
    pub namespace: String,

    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Number of virtual CPUs
    pub vcpu: u32,

    /// Memory in megabytes
    pub memory_in_mb: u32,

    /// Kernel to boot
    pub kernel: Kernel,

    /// Optional initial ramdisk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initrd: Option<Initrd>,

    /// Root volume
    pub root_volume: Volume,

    /// Additional volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_volumes: Vec<Volume>,

    /// Network interfaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<NetworkInterface>,

    /// Cloud-init metadata (`user-data`, `vendor-data`, `meta-data`), base64-encoded
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,

    /// Unique id assigned by the service on create
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// Kernel configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Kernel {
    /// Container image holding the kernel
    pub image: String,

    /// Kernel command line
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cmdline: BTreeMap<String, String>,

    /// Kernel file inside the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,

    /// Let the service append network configuration to the command line
    #[serde(default)]
    pub add_network_config: bool,
}

/// Initial ramdisk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Initrd {
    /// Container image holding the initrd
    pub image: String,

    /// Initrd file inside the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// A volume
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Volume id
    pub id: String,

    /// Attach read-only
    #[serde(default)]
    pub is_read_only: bool,

    /// Mount point in the guest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<String>,

    /// Where the volume contents come from
    pub source: VolumeSource,
}

/// Source of a volume
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSource {
    /// Container image holding the volume contents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_source: Option<String>,
}

/// Host interface type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterfaceType {
    /// macvtap
    #[default]
    Macvtap,
    /// tap
    Tap,
}

/// A guest network interface
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    /// Device name in the guest
    pub device_id: String,

    /// Guest MAC address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_mac: Option<String>,

    /// Host interface type
    #[serde(rename = "type")]
    pub type_: InterfaceType,

    /// Static address in CIDR form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Lifecycle state reported by the service
///
/// Values the client does not know deserialize to `Unknown` instead of failing, so the
/// caller can handle them as a state of their own.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MicroVmState {
    /// Being provisioned
    Pending,
    /// Created and running
    Created,
    /// Provisioning failed
    Failed,
    /// Being deleted
    Deleting,
    /// Anything else
    #[default]
    #[serde(other)]
    Unknown,
}

/// Observed state of a microvm
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MicroVmStatus {
    /// Lifecycle state
    #[serde(default)]
    pub state: MicroVmState,
}

/// A microvm as returned by the service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MicroVm {
    /// Revision counter
    #[serde(default)]
    pub version: i64,

    /// Spec as stored by the service
    pub spec: MicroVmSpec,

    /// Observed status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MicroVmStatus>,
}

impl MicroVm {
    /// Lifecycle state, `Unknown` when the service sent no status
    pub fn state(&self) -> MicroVmState {
        self.status
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(MicroVmState::Unknown)
    }

    /// Service-assigned unique id, empty when absent
    pub fn uid(&self) -> &str {
        self.spec.uid.as_deref().unwrap_or_default()
    }
}

/// Body of a create request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMicroVmRequest {
    /// Desired microvm
    pub microvm: MicroVmSpec,
}

/// Body of a create or get response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicroVmResponse {
    /// The microvm
    pub microvm: MicroVm,
}
