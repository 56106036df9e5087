//! Shared microvm building blocks
//!
//! Types used by both the machine and cluster resources: volumes, kernel sources,
//! network interfaces, SSH keys and the mirrored VM lifecycle state.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A volume attached to a microvm, sourced from a container image
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Volume identifier, unique within the microvm
    pub id: String,

    /// Container image holding the volume contents
    pub image: String,

    /// Attach the volume read-only
    #[serde(default)]
    pub read_only: bool,

    /// Where the volume is mounted inside the guest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<String>,
}

/// A file pulled from a container image (kernel, initrd)
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerFileSource {
    /// Container image holding the file
    pub image: String,

    /// Path of the file inside the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// Network interface type on the host
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IfaceType {
    /// macvtap interface
    #[default]
    Macvtap,
    /// tap interface
    Tap,
}

/// A network interface inside the guest
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    /// Device name inside the guest, e.g. `eth1`
    pub guest_device_name: String,

    /// MAC address; one is generated when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_mac: Option<String>,

    /// Host-side interface type
    #[serde(default, rename = "type")]
    pub type_: IfaceType,

    /// Static address in CIDR form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Authorized SSH keys for a guest user
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SshPublicKey {
    /// Guest user name
    pub user: String,

    /// Public keys allowed to log in as the user
    #[serde(default)]
    pub authorized_keys: Vec<String>,
}

/// Lifecycle state of the microvm backing a machine
///
/// Serializes as PascalCase but accepts lowercase values as written by older
/// controllers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum VmState {
    /// Being provisioned
    #[serde(alias = "pending")]
    Pending,
    /// Running
    #[serde(alias = "running")]
    Running,
    /// Provisioning failed
    #[serde(alias = "failed")]
    Failed,
    /// Being deleted
    #[serde(alias = "deleting")]
    Deleting,
    /// Reported state was not recognised
    #[serde(alias = "unknown")]
    Unknown,
}
