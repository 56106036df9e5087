//! MicroVM service adapter
//!
//! Translates a `MicrovmMachine` into a microvm service request and wraps the three
//! service calls so that "does not exist" is an ordinary outcome instead of an error.

use crds::{IfaceType, MicrovmMachine};
use microvm_client::{
    InterfaceType, Initrd, Kernel, MicroVm, MicroVmSpec, MicrovmClientTrait, MicrovmError,
    NetworkInterface, Volume, VolumeSource,
};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Id of the root volume in every microvm
pub const ROOT_VOLUME_ID: &str = "root";

/// Label carrying the cluster name on every microvm
pub const CLUSTER_NAME_LABEL: &str = "cluster-name";

/// One machine's microvm on one host
pub struct VmService {
    client: Box<dyn MicrovmClientTrait>,
    namespace: String,
    name: String,
}

impl std::fmt::Debug for VmService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmService")
            .field("endpoint", &self.client.endpoint())
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .finish()
    }
}

impl VmService {
    /// Creates the adapter for the microvm `namespace/name` behind `client`
    pub fn new(client: Box<dyn MicrovmClientTrait>, namespace: &str, name: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Host endpoint the adapter talks to
    pub fn endpoint(&self) -> &str {
        self.client.endpoint()
    }

    /// Fetches the microvm; `None` when the service has no record of it
    pub async fn get(&self) -> Result<Option<MicroVm>, MicrovmError> {
        debug!(
            "Getting microvm {}/{} from {}",
            self.namespace,
            self.name,
            self.endpoint()
        );
        match self.client.get_microvm(&self.namespace, &self.name).await {
            Ok(microvm) => Ok(Some(microvm)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Creates the microvm from a prepared spec
    pub async fn create(&self, spec: MicroVmSpec) -> Result<MicroVm, MicrovmError> {
        info!(
            "Creating microvm {}/{} on {}",
            self.namespace,
            self.name,
            self.endpoint()
        );
        self.client.create_microvm(spec).await
    }

    /// Requests deletion; a microvm that is already gone counts as deleted
    pub async fn delete(&self) -> Result<(), MicrovmError> {
        info!(
            "Deleting microvm {}/{} on {}",
            self.namespace,
            self.name,
            self.endpoint()
        );
        match self.client.delete_microvm(&self.namespace, &self.name).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}

/// Builds the service request for a machine, without metadata.
///
/// Interfaces without a MAC address get a generated one.
pub fn microvm_spec(machine: &MicrovmMachine, namespace: &str, name: &str, cluster_name: &str) -> MicroVmSpec {
    let spec = &machine.spec;

    MicroVmSpec {
        id: name.to_string(),
        namespace: namespace.to_string(),
        labels: BTreeMap::from([(CLUSTER_NAME_LABEL.to_string(), cluster_name.to_string())]),
        vcpu: spec.vcpu,
        memory_in_mb: spec.memory_mb,
        kernel: Kernel {
            image: spec.kernel.image.clone(),
            cmdline: spec.kernel_cmdline.clone(),
            filename: spec.kernel.filename.clone(),
            add_network_config: true,
        },
        initrd: spec.initrd.as_ref().map(|initrd| Initrd {
            image: initrd.image.clone(),
            filename: initrd.filename.clone(),
        }),
        root_volume: Volume {
            id: ROOT_VOLUME_ID.to_string(),
            is_read_only: spec.root_volume.read_only,
            mount_point: spec.root_volume.mount_point.clone(),
            source: VolumeSource {
                container_source: Some(spec.root_volume.image.clone()),
            },
        },
        additional_volumes: spec
            .additional_volumes
            .iter()
            .map(|volume| Volume {
                id: volume.id.clone(),
                is_read_only: volume.read_only,
                mount_point: volume.mount_point.clone(),
                source: VolumeSource {
                    container_source: Some(volume.image.clone()),
                },
            })
            .collect(),
        interfaces: spec
            .network_interfaces
            .iter()
            .map(|iface| NetworkInterface {
                device_id: iface.guest_device_name.clone(),
                guest_mac: Some(
                    iface
                        .guest_mac
                        .clone()
                        .filter(|mac| !mac.is_empty())
                        .unwrap_or_else(generate_mac),
                ),
                type_: match iface.type_ {
                    IfaceType::Macvtap => InterfaceType::Macvtap,
                    IfaceType::Tap => InterfaceType::Tap,
                },
                address: iface.address.clone().filter(|a| !a.is_empty()),
            })
            .collect(),
        metadata: BTreeMap::new(),
        uid: None,
    }
}

/// Random locally administered unicast MAC address
pub fn generate_mac() -> String {
    let random = uuid::Uuid::new_v4();
    let bytes = random.as_bytes();
    let first = (bytes[0] & 0xfe) | 0x02;
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        first, bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
    )
}
