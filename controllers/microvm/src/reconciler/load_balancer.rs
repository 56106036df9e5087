//! ExternalLoadBalancer reconciliation

use super::{REQUEUE_PERIOD, Reconciler};
use crate::error::ControllerError;
use crate::probe::ProbeOutcome;
use crate::scope::{LoadBalancerScope, settle};
use crds::{
    ConditionSeverity, EXTERNAL_LOAD_BALANCER_ENDPOINT_FAILED_REASON,
    EXTERNAL_LOAD_BALANCER_ENDPOINT_NOT_AVAILABLE_REASON,
};
use futures::FutureExt;
use kube_runtime::controller::Action;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn};

impl Reconciler {
    /// Reconciles the ExternalLoadBalancer `namespace/name`.
    pub async fn reconcile_external_load_balancer(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Action, ControllerError> {
        let key = format!("{}/{}", namespace, name);

        let Some(load_balancer) = self.store.get_external_load_balancer(namespace, name).await? else {
            debug!("ExternalLoadBalancer {} no longer exists", key);
            return Ok(Action::await_change());
        };

        let mut scope = LoadBalancerScope::new(load_balancer, Arc::clone(&self.store))?;

        let outcome = AssertUnwindSafe(self.reconcile_load_balancer_scope(&mut scope))
            .catch_unwind()
            .await;
        let patched = scope.patch().await;
        settle(outcome, patched, &key)
    }

    async fn reconcile_load_balancer_scope(
        &self,
        scope: &mut LoadBalancerScope,
    ) -> Result<Action, ControllerError> {
        let key = scope.key();
        if scope.is_deleting() {
            debug!("ExternalLoadBalancer {} is being deleted, nothing to clean up", key);
            return Ok(Action::await_change());
        }

        if let Some(cluster_name) = scope.cluster_name() {
            match self.store.get_cluster(&scope.namespace(), &cluster_name).await? {
                Some(cluster) => {
                    if scope.ensure_cluster_owner(&cluster) {
                        info!("Set Cluster {} as owner of ExternalLoadBalancer {}", cluster_name, key);
                    }
                }
                None => debug!("Cluster {} of ExternalLoadBalancer {} not found", cluster_name, key),
            }
        }

        let url = scope.livez_url();
        match self.prober.probe(&url).await {
            Ok(ProbeOutcome::Available) => {
                debug!("ExternalLoadBalancer {} endpoint {} is available", key, url);
                scope.set_available();
                Ok(Action::requeue(self.resync_period))
            }
            Ok(ProbeOutcome::Unavailable { status }) => {
                info!("ExternalLoadBalancer {} endpoint answered {}, retrying", key, status);
                scope.set_unavailable(
                    EXTERNAL_LOAD_BALANCER_ENDPOINT_NOT_AVAILABLE_REASON,
                    ConditionSeverity::Info,
                    format!("endpoint {} answered {}", url, status),
                );
                Ok(Action::requeue(REQUEUE_PERIOD))
            }
            Err(e @ ControllerError::ProbeTimeout(_)) => {
                warn!("ExternalLoadBalancer {} endpoint timed out", key);
                scope.set_unavailable(
                    EXTERNAL_LOAD_BALANCER_ENDPOINT_NOT_AVAILABLE_REASON,
                    ConditionSeverity::Info,
                    e.to_string(),
                );
                Err(e)
            }
            Err(e) => {
                warn!("Probing ExternalLoadBalancer {} failed: {}", key, e);
                scope.set_unavailable(
                    EXTERNAL_LOAD_BALANCER_ENDPOINT_FAILED_REASON,
                    ConditionSeverity::Info,
                    e.to_string(),
                );
                Err(e)
            }
        }
    }
}
