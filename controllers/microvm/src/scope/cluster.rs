//! Scopes of MicrovmCluster and ExternalLoadBalancer reconciliations

use super::{ResourceScope, ScopedResource};
use crate::error::ControllerError;
use crate::store::{PatchTarget, ResourceStore};
use crds::{
    ApiEndpoint, CLUSTER_FINALIZER, Cluster, Condition, ConditionSeverity,
    EXTERNAL_LOAD_BALANCER_ENDPOINT_AVAILABLE_CONDITION, ExternalLoadBalancer,
    FailureDomainSpec, LOAD_BALANCER_AVAILABLE_CONDITION, MicrovmCluster, Placement,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

#[async_trait::async_trait]
impl ScopedResource for MicrovmCluster {
    const SUMMARY_CONDITIONS: &'static [&'static str] = &[LOAD_BALANCER_AVAILABLE_CONDITION];

    fn spec_value(&self) -> Result<Value, ControllerError> {
        Ok(serde_json::to_value(&self.spec)?)
    }

    fn status_value(&self) -> Result<Value, ControllerError> {
        Ok(serde_json::to_value(&self.status)?)
    }

    fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or(&[])
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }

    async fn write(
        store: &dyn ResourceStore,
        namespace: &str,
        name: &str,
        target: PatchTarget,
        patch: &Value,
    ) -> Result<Self, ControllerError> {
        store.patch_microvm_cluster(namespace, name, target, patch).await
    }
}

#[async_trait::async_trait]
impl ScopedResource for ExternalLoadBalancer {
    const SUMMARY_CONDITIONS: &'static [&'static str] =
        &[EXTERNAL_LOAD_BALANCER_ENDPOINT_AVAILABLE_CONDITION];

    fn spec_value(&self) -> Result<Value, ControllerError> {
        Ok(serde_json::to_value(&self.spec)?)
    }

    fn status_value(&self) -> Result<Value, ControllerError> {
        Ok(serde_json::to_value(&self.status)?)
    }

    fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or(&[])
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }

    async fn write(
        store: &dyn ResourceStore,
        namespace: &str,
        name: &str,
        target: PatchTarget,
        patch: &Value,
    ) -> Result<Self, ControllerError> {
        store
            .patch_external_load_balancer(namespace, name, target, patch)
            .await
    }
}

/// A MicrovmCluster with its owning Cluster
#[derive(Debug)]
pub struct ClusterScope {
    inner: ResourceScope<MicrovmCluster>,
    /// Owning cluster-api Cluster
    pub cluster: Cluster,
}

impl ClusterScope {
    /// Creates the scope
    pub fn new(
        microvm_cluster: MicrovmCluster,
        cluster: Cluster,
        store: Arc<dyn ResourceStore>,
    ) -> Result<Self, ControllerError> {
        Ok(Self {
            inner: ResourceScope::new(microvm_cluster, store)?,
            cluster,
        })
    }

    /// The wrapped MicrovmCluster
    pub fn microvm_cluster(&self) -> &MicrovmCluster {
        self.inner.resource()
    }

    /// `namespace/name`
    pub fn key(&self) -> String {
        self.inner.key()
    }

    /// True once the MicrovmCluster is marked for deletion
    pub fn is_deleting(&self) -> bool {
        self.inner.is_deleting()
    }

    /// Adds the cluster finalizer
    pub fn add_finalizer(&mut self) -> bool {
        self.inner.add_finalizer(CLUSTER_FINALIZER)
    }

    /// Removes the cluster finalizer
    pub fn remove_finalizer(&mut self) -> bool {
        self.inner.remove_finalizer(CLUSTER_FINALIZER)
    }

    /// Configured placement
    pub fn placement(&self) -> &Placement {
        &self.inner.resource().spec.placement
    }

    /// Endpoint of the workload cluster's API server.
    ///
    /// The MicrovmCluster's own endpoint wins; the Cluster's is the fallback.
    pub fn control_plane_endpoint(&self) -> Option<ApiEndpoint> {
        let own = &self.inner.resource().spec.control_plane_endpoint;
        if !own.is_zero() {
            return Some(own.clone());
        }
        self.cluster
            .spec
            .control_plane_endpoint
            .clone()
            .filter(|endpoint| !endpoint.is_zero())
    }

    /// Rebuilds the failure domain registry from the static pool.
    ///
    /// Returns [`ControllerError::NoPlacement`] when no pool is configured.
    pub fn set_failure_domains(&mut self) -> Result<(), ControllerError> {
        let key = self.key();
        let pool = self
            .placement()
            .static_pool
            .as_ref()
            .ok_or(ControllerError::NoPlacement(key))?;

        let domains: BTreeMap<String, FailureDomainSpec> = pool
            .hosts
            .iter()
            .map(|host| {
                (
                    host.endpoint.clone(),
                    FailureDomainSpec {
                        control_plane: host.control_plane_allowed,
                    },
                )
            })
            .collect();

        self.inner
            .resource_mut()
            .status
            .get_or_insert_with(Default::default)
            .failure_domains = domains;
        Ok(())
    }

    /// Sets `status.ready`
    pub fn set_ready(&mut self, ready: bool) {
        self.inner
            .resource_mut()
            .status
            .get_or_insert_with(Default::default)
            .ready = ready;
    }

    /// Marks the control plane endpoint available
    pub fn set_load_balancer_available(&mut self) {
        self.inner.mark_true(LOAD_BALANCER_AVAILABLE_CONDITION);
    }

    /// Marks the control plane endpoint unavailable
    pub fn set_load_balancer_unavailable(
        &mut self,
        reason: &str,
        severity: ConditionSeverity,
        message: impl Into<String>,
    ) {
        self.inner
            .mark_false(LOAD_BALANCER_AVAILABLE_CONDITION, reason, severity, message);
    }

    /// Writes pending changes
    pub async fn patch(&mut self) -> Result<(), ControllerError> {
        self.inner.patch().await
    }
}

/// Scope of an ExternalLoadBalancer reconciliation
pub type LoadBalancerScope = ResourceScope<ExternalLoadBalancer>;

impl ResourceScope<ExternalLoadBalancer> {
    /// Name of the owning cluster, from the cluster-name label
    pub fn cluster_name(&self) -> Option<String> {
        self.resource()
            .labels()
            .get(crds::CLUSTER_NAME_LABEL)
            .filter(|name| !name.is_empty())
            .cloned()
    }

    /// Adds an owner reference to `cluster`; returns whether it was missing
    pub fn ensure_cluster_owner(&mut self, cluster: &Cluster) -> bool {
        let reference = OwnerReference {
            api_version: "cluster.x-k8s.io/v1beta1".to_string(),
            kind: "Cluster".to_string(),
            name: cluster.name_any(),
            uid: cluster.uid().unwrap_or_default(),
            ..Default::default()
        };
        self.ensure_owner_reference(reference)
    }

    /// Probe URL of the endpoint
    pub fn livez_url(&self) -> String {
        format!("{}/livez", self.resource().spec.endpoint_url())
    }

    /// Marks the endpoint available and the load balancer ready
    pub fn set_available(&mut self) {
        self.resource_mut()
            .status
            .get_or_insert_with(Default::default)
            .ready = true;
        self.mark_true(EXTERNAL_LOAD_BALANCER_ENDPOINT_AVAILABLE_CONDITION);
    }

    /// Marks the endpoint unavailable and the load balancer not ready
    pub fn set_unavailable(
        &mut self,
        reason: &str,
        severity: ConditionSeverity,
        message: impl Into<String>,
    ) {
        self.resource_mut()
            .status
            .get_or_insert_with(Default::default)
            .ready = false;
        self.mark_false(
            EXTERNAL_LOAD_BALANCER_ENDPOINT_AVAILABLE_CONDITION,
            reason,
            severity,
            message,
        );
    }
}
