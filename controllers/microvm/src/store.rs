//! Access to the Kubernetes API used by the reconcilers.
//!
//! Reconcilers only see [`ResourceStore`]. [`KubeStore`] is the real implementation;
//! tests use the in-memory store from `test_utils`.

use crate::error::ControllerError;
use crds::{
    CLUSTER_NAME_LABEL, Cluster, ExternalLoadBalancer, Machine, MicrovmCluster, MicrovmMachine,
};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Part of an object a patch is applied to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchTarget {
    /// Metadata and spec
    Object,
    /// The status subresource
    Status,
}

/// Reads and conditional writes against the Kubernetes API
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
/// Patches are JSON merge patches; when they carry `metadata.resourceVersion` the
/// write only succeeds against that version and fails with
/// [`ControllerError::Conflict`] otherwise.
#[async_trait::async_trait]
pub trait ResourceStore: Send + Sync {
    /// Get a MicrovmMachine
    async fn get_microvm_machine(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MicrovmMachine>, ControllerError>;

    /// Get a MicrovmCluster
    async fn get_microvm_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MicrovmCluster>, ControllerError>;

    /// Get an ExternalLoadBalancer
    async fn get_external_load_balancer(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ExternalLoadBalancer>, ControllerError>;

    /// Get a cluster-api Machine
    async fn get_machine(&self, namespace: &str, name: &str)
    -> Result<Option<Machine>, ControllerError>;

    /// Get a cluster-api Cluster
    async fn get_cluster(&self, namespace: &str, name: &str)
    -> Result<Option<Cluster>, ControllerError>;

    /// Get the decoded data of a Secret
    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, ControllerError>;

    /// List the MicrovmMachines labelled with `cluster_name`
    async fn list_microvm_machines(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<MicrovmMachine>, ControllerError>;

    /// Merge-patch a MicrovmMachine
    async fn patch_microvm_machine(
        &self,
        namespace: &str,
        name: &str,
        target: PatchTarget,
        patch: &Value,
    ) -> Result<MicrovmMachine, ControllerError>;

    /// Merge-patch a MicrovmCluster
    async fn patch_microvm_cluster(
        &self,
        namespace: &str,
        name: &str,
        target: PatchTarget,
        patch: &Value,
    ) -> Result<MicrovmCluster, ControllerError>;

    /// Merge-patch an ExternalLoadBalancer
    async fn patch_external_load_balancer(
        &self,
        namespace: &str,
        name: &str,
        target: PatchTarget,
        patch: &Value,
    ) -> Result<ExternalLoadBalancer, ControllerError>;
}

/// [`ResourceStore`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore").finish_non_exhaustive()
    }
}

impl KubeStore {
    /// Creates a store using `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = kube::core::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

async fn merge_patch<K>(
    api: Api<K>,
    name: &str,
    target: PatchTarget,
    patch: &Value,
) -> Result<K, ControllerError>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug,
    K::DynamicType: Default,
{
    let params = PatchParams::default();
    let merge = Patch::Merge(patch);
    let result = match target {
        PatchTarget::Object => api.patch(name, &params, &merge).await,
        PatchTarget::Status => api.patch_status(name, &params, &merge).await,
    };

    match result {
        Ok(object) => Ok(object),
        Err(kube::Error::Api(e)) if e.code == 409 => Err(ControllerError::Conflict(format!(
            "{} {}",
            K::kind(&Default::default()),
            name
        ))),
        Err(e) => Err(e.into()),
    }
}

#[async_trait::async_trait]
impl ResourceStore for KubeStore {
    async fn get_microvm_machine(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MicrovmMachine>, ControllerError> {
        Ok(self.api::<MicrovmMachine>(namespace).get_opt(name).await?)
    }

    async fn get_microvm_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MicrovmCluster>, ControllerError> {
        Ok(self.api::<MicrovmCluster>(namespace).get_opt(name).await?)
    }

    async fn get_external_load_balancer(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ExternalLoadBalancer>, ControllerError> {
        Ok(self.api::<ExternalLoadBalancer>(namespace).get_opt(name).await?)
    }

    async fn get_machine(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Machine>, ControllerError> {
        Ok(self.api::<Machine>(namespace).get_opt(name).await?)
    }

    async fn get_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Cluster>, ControllerError> {
        Ok(self.api::<Cluster>(namespace).get_opt(name).await?)
    }

    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, ControllerError> {
        let secret = self.api::<Secret>(namespace).get_opt(name).await?;
        Ok(secret.map(|secret| {
            secret
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|(key, value)| (key, value.0))
                .collect()
        }))
    }

    async fn list_microvm_machines(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<MicrovmMachine>, ControllerError> {
        let params = ListParams::default().labels(&format!("{}={}", CLUSTER_NAME_LABEL, cluster_name));
        let list = self.api::<MicrovmMachine>(namespace).list(&params).await?;
        Ok(list.items)
    }

    async fn patch_microvm_machine(
        &self,
        namespace: &str,
        name: &str,
        target: PatchTarget,
        patch: &Value,
    ) -> Result<MicrovmMachine, ControllerError> {
        merge_patch(self.api(namespace), name, target, patch).await
    }

    async fn patch_microvm_cluster(
        &self,
        namespace: &str,
        name: &str,
        target: PatchTarget,
        patch: &Value,
    ) -> Result<MicrovmCluster, ControllerError> {
        merge_patch(self.api(namespace), name, target, patch).await
    }

    async fn patch_external_load_balancer(
        &self,
        namespace: &str,
        name: &str,
        target: PatchTarget,
        patch: &Value,
    ) -> Result<ExternalLoadBalancer, ControllerError> {
        merge_patch(self.api(namespace), name, target, patch).await
    }
}
