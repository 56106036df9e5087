//! Cloud-init payloads handed to a microvm at creation.
//!
//! Three documents are attached to the microvm metadata, each base64-encoded:
//! - `user-data`: the bootstrap provider's data, verbatim except for the
//!   `PROVIDER_ID` placeholder
//! - `vendor-data`: hostname, boot fixups and SSH users, as `#cloud-config`
//! - `meta-data`: instance identity
//!
//! Everything here is a pure function of its inputs.

use crate::error::ControllerError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use crds::SshPublicKey;
use serde::Serialize;
use std::collections::BTreeMap;

/// Token in the bootstrap data replaced by the machine's provider id
pub const PROVIDER_ID_PLACEHOLDER: &str = "PROVIDER_ID";

/// Header cloud-init requires on vendor data
pub const CLOUD_CONFIG_HEADER: &str = "#cloud-config\n";

/// Platform tag written into the instance metadata
pub const PLATFORM: &str = "liquid_metal";

/// Metadata key of the bootstrap user data
pub const USER_DATA_KEY: &str = "user-data";
/// Metadata key of the vendor data
pub const VENDOR_DATA_KEY: &str = "vendor-data";
/// Metadata key of the instance metadata
pub const META_DATA_KEY: &str = "meta-data";

const FINAL_MESSAGE: &str = "The Liquid Metal booted system is good to go after $UPTIME seconds";
const RESOLV_CONF_FIXUP: &str = "ln -sf /run/systemd/resolve/stub-resolv.conf /etc/resolv.conf";

/// Everything the payloads are derived from
#[derive(Debug, Clone, Copy)]
pub struct BootstrapInput<'a> {
    /// Raw bootstrap data from the machine's bootstrap secret
    pub bootstrap_data: &'a [u8],
    /// Machine name, also the guest hostname
    pub name: &'a str,
    /// Machine namespace
    pub namespace: &'a str,
    /// Owning cluster name
    pub cluster_name: &'a str,
    /// SSH users and keys; the caller picks machine keys over cluster keys
    pub ssh_public_keys: &'a [SshPublicKey],
    /// Host the microvm is created on
    pub failure_domain: &'a str,
    /// Provider id, when already known
    pub provider_id: Option<&'a str>,
}

/// Base64-encoded cloud-init documents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapPayload {
    /// Encoded `user-data`
    pub user_data: String,
    /// Encoded `vendor-data`
    pub vendor_data: String,
    /// Encoded `meta-data`
    pub meta_data: String,
}

impl BootstrapPayload {
    /// Builds all three documents
    pub fn build(input: &BootstrapInput<'_>) -> Result<Self, ControllerError> {
        Ok(Self {
            user_data: user_data(input.bootstrap_data, input.provider_id),
            vendor_data: vendor_data(input.name, input.ssh_public_keys)?,
            meta_data: meta_data(
                input.name,
                input.namespace,
                input.cluster_name,
                input.failure_domain,
            )?,
        })
    }

    /// The documents keyed as the microvm service expects them
    pub fn into_metadata(self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (USER_DATA_KEY.to_string(), self.user_data),
            (VENDOR_DATA_KEY.to_string(), self.vendor_data),
            (META_DATA_KEY.to_string(), self.meta_data),
        ])
    }
}

#[derive(Debug, Serialize)]
struct VendorData<'a> {
    hostname: &'a str,
    final_message: &'a str,
    bootcmd: Vec<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    users: Vec<CloudInitUser<'a>>,
}

#[derive(Debug, Serialize)]
struct CloudInitUser<'a> {
    name: &'a str,
    ssh_authorized_keys: Vec<&'a str>,
}

#[derive(Debug, Serialize)]
struct InstanceMetadata<'a> {
    instance_id: String,
    local_hostname: &'a str,
    platform: &'a str,
    cluster_name: &'a str,
    failure_domain: &'a str,
}

/// Encodes the bootstrap data, substituting the provider id when it is known.
///
/// Data that is not UTF-8 is passed through untouched.
pub fn user_data(bootstrap_data: &[u8], provider_id: Option<&str>) -> String {
    let substituted = provider_id
        .filter(|id| !id.is_empty())
        .and_then(|id| {
            std::str::from_utf8(bootstrap_data)
                .ok()
                .map(|text| text.replace(PROVIDER_ID_PLACEHOLDER, id))
        });

    match substituted {
        Some(text) => STANDARD.encode(text),
        None => STANDARD.encode(bootstrap_data),
    }
}

/// Encodes the `#cloud-config` vendor document.
///
/// Every authorized key becomes its own user entry, so a user with two keys appears
/// twice, once per key.
pub fn vendor_data(hostname: &str, ssh_public_keys: &[SshPublicKey]) -> Result<String, ControllerError> {
    let users = ssh_public_keys
        .iter()
        .flat_map(|key| {
            key.authorized_keys.iter().map(|authorized| CloudInitUser {
                name: key.user.as_str(),
                ssh_authorized_keys: vec![authorized.as_str()],
            })
        })
        .collect();

    let document = VendorData {
        hostname,
        final_message: FINAL_MESSAGE,
        bootcmd: vec![RESOLV_CONF_FIXUP],
        users,
    };

    let yaml = serde_yaml::to_string(&document)?;
    Ok(STANDARD.encode(format!("{}{}", CLOUD_CONFIG_HEADER, yaml)))
}

/// Encodes the instance metadata document
pub fn meta_data(
    name: &str,
    namespace: &str,
    cluster_name: &str,
    failure_domain: &str,
) -> Result<String, ControllerError> {
    let document = InstanceMetadata {
        instance_id: format!("{}/{}", namespace, name),
        local_hostname: name,
        platform: PLATFORM,
        cluster_name,
        failure_domain,
    };

    let yaml = serde_yaml::to_string(&document)?;
    Ok(STANDARD.encode(yaml))
}
