//! MicrovmCluster reconciliation
//!
//! Publishes the static host pool as the cluster's failure domains and probes the
//! control plane endpoint.

use super::{REQUEUE_PERIOD, Reconciler, owner_name};
use crate::error::ControllerError;
use crate::probe::ProbeOutcome;
use crate::scope::{ClusterScope, settle};
use crds::{
    ConditionSeverity, LOAD_BALANCER_FAILED_REASON, LOAD_BALANCER_NOT_AVAILABLE_REASON,
    has_paused_annotation,
};
use futures::FutureExt;
use kube::ResourceExt;
use kube_runtime::controller::Action;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Condition message while the control plane endpoint does not answer
pub const LOAD_BALANCER_NOT_AVAILABLE_MESSAGE: &str =
    "control plane load balancer isn't available";

impl Reconciler {
    /// Reconciles the MicrovmCluster `namespace/name`.
    pub async fn reconcile_microvm_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Action, ControllerError> {
        let key = format!("{}/{}", namespace, name);

        let Some(microvm_cluster) = self.store.get_microvm_cluster(namespace, name).await? else {
            debug!("MicrovmCluster {} no longer exists", key);
            return Ok(Action::await_change());
        };

        let Some(cluster_name) = owner_name(microvm_cluster.owner_references(), "Cluster") else {
            info!("Waiting for Cluster controller to set owner reference on MicrovmCluster {}", key);
            return Ok(Action::await_change());
        };
        let Some(cluster) = self.store.get_cluster(namespace, &cluster_name).await? else {
            info!("Cluster {}/{} of MicrovmCluster {} not found", namespace, cluster_name, key);
            return Ok(Action::await_change());
        };

        if cluster.is_paused() || has_paused_annotation(microvm_cluster.metadata.annotations.as_ref()) {
            info!("MicrovmCluster {} or its cluster is paused, skipping", key);
            return Ok(Action::await_change());
        }

        let mut scope = ClusterScope::new(microvm_cluster, cluster, Arc::clone(&self.store))?;

        let outcome = AssertUnwindSafe(self.reconcile_cluster_scope(&mut scope))
            .catch_unwind()
            .await;
        let patched = scope.patch().await;
        settle(outcome, patched, &key)
    }

    async fn reconcile_cluster_scope(
        &self,
        scope: &mut ClusterScope,
    ) -> Result<Action, ControllerError> {
        if scope.is_deleting() {
            // The cluster owns nothing outside the API server.
            info!("Reconciling deletion of MicrovmCluster {}", scope.key());
            scope.remove_finalizer();
            return Ok(Action::await_change());
        }

        self.reconcile_cluster_normal(scope).await
    }

    async fn reconcile_cluster_normal(
        &self,
        scope: &mut ClusterScope,
    ) -> Result<Action, ControllerError> {
        let key = scope.key();
        scope.add_finalizer();

        let endpoint = scope
            .control_plane_endpoint()
            .ok_or_else(|| ControllerError::ControlPlaneEndpointRequired(key.clone()))?;

        if !scope.placement().is_set() {
            return Err(ControllerError::NoPlacement(key));
        }
        scope.set_failure_domains()?;

        let has_domains = scope
            .microvm_cluster()
            .status
            .as_ref()
            .is_some_and(|status| !status.failure_domains.is_empty());
        scope.set_ready(has_domains);

        let url = format!("https://{}/livez", endpoint);
        match self.prober.probe(&url).await {
            Ok(ProbeOutcome::Available) => {
                debug!("Control plane endpoint {} of {} is available", endpoint, key);
                scope.set_load_balancer_available();
                Ok(Action::requeue(self.resync_period))
            }
            Ok(ProbeOutcome::Unavailable { status }) => {
                info!(
                    "Control plane endpoint {} of {} answered {}, retrying",
                    endpoint, key, status
                );
                scope.set_load_balancer_unavailable(
                    LOAD_BALANCER_NOT_AVAILABLE_REASON,
                    ConditionSeverity::Info,
                    LOAD_BALANCER_NOT_AVAILABLE_MESSAGE,
                );
                Ok(Action::requeue(REQUEUE_PERIOD))
            }
            Err(ControllerError::ProbeTimeout(_)) => {
                info!("Control plane endpoint {} of {} timed out, retrying", endpoint, key);
                scope.set_load_balancer_unavailable(
                    LOAD_BALANCER_NOT_AVAILABLE_REASON,
                    ConditionSeverity::Info,
                    LOAD_BALANCER_NOT_AVAILABLE_MESSAGE,
                );
                Ok(Action::requeue(REQUEUE_PERIOD))
            }
            Err(e) => {
                warn!("Probing control plane endpoint of {} failed: {}", key, e);
                scope.set_load_balancer_unavailable(
                    LOAD_BALANCER_FAILED_REASON,
                    ConditionSeverity::Warning,
                    e.to_string(),
                );
                Ok(Action::requeue(REQUEUE_PERIOD))
            }
        }
    }
}
