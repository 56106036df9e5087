//! MicrovmMachine reconciliation
//!
//! Keeps one microvm per MicrovmMachine on the host picked by placement, and mirrors
//! the microvm's lifecycle state into the machine's status.

use super::{REQUEUE_PERIOD, Reconciler, owner_name};
use crate::bootstrap::{BootstrapInput, BootstrapPayload};
use crate::error::ControllerError;
use crate::placement::PlacementStrategy;
use crate::scope::{MachineScope, settle};
use crate::vm_service::{VmService, microvm_spec};
use crds::{
    ConditionSeverity, MICROVM_DELETE_FAILED_REASON, MICROVM_DELETING_REASON,
    MICROVM_PENDING_REASON, MICROVM_PROVISION_FAILED_REASON, MICROVM_UNKNOWN_STATE_REASON,
    MicrovmMachine, VmState, WAITING_FOR_BOOTSTRAP_DATA_REASON,
    WAITING_FOR_CLUSTER_INFRASTRUCTURE_REASON, has_paused_annotation,
};
use futures::FutureExt;
use kube::ResourceExt;
use kube_runtime::controller::Action;
use microvm_client::{MicroVm, MicroVmState, MicrovmError};
use std::panic::AssertUnwindSafe;
use tracing::{debug, error, info, warn};

/// Stores the provider id of `microvm`; a microvm without uid cannot be tracked
fn record_provider_id(
    scope: &mut MachineScope,
    failure_domain: &str,
    microvm: &MicroVm,
) -> Result<(), ControllerError> {
    if microvm.uid().is_empty() {
        return Err(MicrovmError::Api(format!("microvm of {} has no uid", scope.key())).into());
    }
    scope.set_provider_id(failure_domain, microvm.uid());
    Ok(())
}

impl Reconciler {
    /// Reconciles the MicrovmMachine `namespace/name`.
    ///
    /// The machine's status is patched once the pass finishes, whatever its outcome.
    pub async fn reconcile_microvm_machine(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Action, ControllerError> {
        let key = format!("{}/{}", namespace, name);

        let Some(microvm_machine) = self.store.get_microvm_machine(namespace, name).await? else {
            debug!("MicrovmMachine {} no longer exists", key);
            return Ok(Action::await_change());
        };

        let Some(machine_name) = owner_name(microvm_machine.owner_references(), "Machine") else {
            info!("Waiting for Machine controller to set owner reference on MicrovmMachine {}", key);
            return Ok(Action::await_change());
        };
        let Some(machine) = self.store.get_machine(namespace, &machine_name).await? else {
            info!("Machine {}/{} of MicrovmMachine {} not found", namespace, machine_name, key);
            return Ok(Action::await_change());
        };

        let Some(cluster_name) = machine.cluster_name().map(str::to_string) else {
            info!("Machine {}/{} is missing the cluster label", namespace, machine_name);
            return Ok(Action::await_change());
        };
        let Some(cluster) = self.store.get_cluster(namespace, &cluster_name).await? else {
            info!("Cluster {}/{} of MicrovmMachine {} not found", namespace, cluster_name, key);
            return Ok(Action::await_change());
        };

        if cluster.is_paused() || has_paused_annotation(microvm_machine.metadata.annotations.as_ref()) {
            info!("MicrovmMachine {} or its cluster is paused, skipping", key);
            return Ok(Action::await_change());
        }

        let Some(microvm_cluster_name) = cluster
            .spec
            .infrastructure_ref
            .as_ref()
            .and_then(|reference| reference.name.clone())
        else {
            info!("Cluster {}/{} has no infrastructure reference yet", namespace, cluster_name);
            return Ok(Action::await_change());
        };
        let microvm_cluster_namespace = cluster
            .spec
            .infrastructure_ref
            .as_ref()
            .and_then(|reference| reference.namespace.clone())
            .unwrap_or_else(|| namespace.to_string());
        let Some(microvm_cluster) = self
            .store
            .get_microvm_cluster(&microvm_cluster_namespace, &microvm_cluster_name)
            .await?
        else {
            info!(
                "MicrovmCluster {}/{} of MicrovmMachine {} not found",
                microvm_cluster_namespace, microvm_cluster_name, key
            );
            return Ok(Action::await_change());
        };

        let mut scope = MachineScope::new(
            microvm_machine,
            machine,
            cluster,
            microvm_cluster,
            std::sync::Arc::clone(&self.store),
        )?;

        let outcome = AssertUnwindSafe(self.reconcile_machine_scope(&mut scope))
            .catch_unwind()
            .await;
        let patched = scope.patch().await;
        settle(outcome, patched, &key)
    }

    async fn reconcile_machine_scope(
        &self,
        scope: &mut MachineScope,
    ) -> Result<Action, ControllerError> {
        if scope.is_deleting() {
            self.reconcile_machine_delete(scope).await
        } else {
            self.reconcile_machine_normal(scope).await
        }
    }

    async fn reconcile_machine_normal(
        &self,
        scope: &mut MachineScope,
    ) -> Result<Action, ControllerError> {
        let key = scope.key();

        if !scope.cluster.infrastructure_ready() {
            info!("Cluster infrastructure of {} is not ready yet", key);
            scope.set_not_ready(
                WAITING_FOR_CLUSTER_INFRASTRUCTURE_REASON,
                ConditionSeverity::Info,
                "",
            );
            return Ok(Action::await_change());
        }

        if scope.machine.spec.bootstrap.data_secret_name.is_none() {
            info!("Bootstrap data secret of {} is not available yet", key);
            scope.set_not_ready(WAITING_FOR_BOOTSTRAP_DATA_REASON, ConditionSeverity::Info, "");
            return Ok(Action::await_change());
        }

        let failure_domain = self.resolve_failure_domain(scope).await?;

        // Must be persisted before the microvm exists so deletion can clean it up.
        scope.add_finalizer();
        scope.patch().await?;

        let service = self.vm_service(scope, &failure_domain).await?;

        let microvm = match service.get().await? {
            Some(microvm) => microvm,
            None => {
                let microvm = self.create_microvm(scope, &service, &failure_domain).await?;
                record_provider_id(scope, &failure_domain, &microvm)?;
                scope.patch().await?;
                microvm
            }
        };

        if scope.provider_id().is_none() {
            // Created by a pass that did not get to persist the provider id.
            record_provider_id(scope, &failure_domain, &microvm)?;
        }

        self.map_microvm_state(scope, &microvm)
    }

    async fn reconcile_machine_delete(
        &self,
        scope: &mut MachineScope,
    ) -> Result<Action, ControllerError> {
        let key = scope.key();
        info!("Reconciling deletion of MicrovmMachine {}", key);

        let failure_domain = match scope.sticky_failure_domain() {
            Some(domain) => domain,
            None => match self.resolve_failure_domain(scope).await {
                Ok(domain) => domain,
                Err(ControllerError::NoFailureDomain(_)) => {
                    // Without any host no microvm can have been created.
                    info!("No failure domain for {}, removing finalizer", key);
                    scope.remove_finalizer();
                    return Ok(Action::await_change());
                }
                Err(e) => return Err(e),
            },
        };

        let service = self.vm_service(scope, &failure_domain).await?;

        let Some(microvm) = service.get().await? else {
            info!("Microvm of {} is gone, removing finalizer", key);
            scope.remove_finalizer();
            return Ok(Action::await_change());
        };

        scope.set_not_ready(MICROVM_DELETING_REASON, ConditionSeverity::Info, "");
        scope.patch().await?;

        if microvm.state() != MicroVmState::Deleting {
            if let Err(e) = service.delete().await {
                error!("Failed to delete microvm of {}: {}", key, e);
                scope.set_not_ready(
                    MICROVM_DELETE_FAILED_REASON,
                    ConditionSeverity::Error,
                    e.to_string(),
                );
                return Err(e.into());
            }
        } else {
            debug!("Microvm of {} is already being deleted", key);
        }

        Ok(Action::requeue(REQUEUE_PERIOD))
    }

    /// Failure domain for the machine, consulting the registry when nothing pins it
    async fn resolve_failure_domain(&self, scope: &MachineScope) -> Result<String, ControllerError> {
        if let Some(domain) = scope.sticky_failure_domain() {
            return Ok(domain);
        }

        let placed = match self.placement {
            PlacementStrategy::NameHash => Vec::new(),
            PlacementStrategy::FewestMachines => self.placed_domains(scope).await?,
        };
        let domain = scope.failure_domain(self.placement, &placed)?;
        debug!("Placing {} in failure domain {}", scope.key(), domain);
        Ok(domain)
    }

    /// Domains of the other machines of the same cluster that already have a microvm
    async fn placed_domains(&self, scope: &MachineScope) -> Result<Vec<String>, ControllerError> {
        let own_name = scope.name();
        let machines = self
            .store
            .list_microvm_machines(&scope.namespace(), &scope.cluster_name())
            .await?;
        Ok(machines
            .iter()
            .filter(|machine| machine.name_any() != own_name)
            .filter_map(MicrovmMachine::provider_failure_domain)
            .map(str::to_string)
            .collect())
    }

    async fn vm_service(
        &self,
        scope: &MachineScope,
        failure_domain: &str,
    ) -> Result<VmService, ControllerError> {
        let options = scope
            .client_options(failure_domain, self.global_proxy.as_deref())
            .await?;
        let client = self.client_factory.client_for(failure_domain, options)?;
        Ok(VmService::new(client, &scope.namespace(), &scope.name()))
    }

    async fn create_microvm(
        &self,
        scope: &MachineScope,
        service: &VmService,
        failure_domain: &str,
    ) -> Result<MicroVm, ControllerError> {
        let name = scope.name();
        let namespace = scope.namespace();
        let cluster_name = scope.cluster_name();
        let bootstrap_data = scope.bootstrap_data().await?;

        let payload = BootstrapPayload::build(&BootstrapInput {
            bootstrap_data: &bootstrap_data,
            name: &name,
            namespace: &namespace,
            cluster_name: &cluster_name,
            ssh_public_keys: scope.ssh_public_keys(),
            failure_domain,
            provider_id: scope.provider_id(),
        })?;

        let mut spec = microvm_spec(scope.microvm_machine(), &namespace, &name, &cluster_name);
        spec.metadata = payload.into_metadata();

        let microvm = service.create(spec).await?;
        info!(
            "Created microvm {} for {} on {}",
            microvm.uid(),
            scope.key(),
            failure_domain
        );
        Ok(microvm)
    }

    fn map_microvm_state(
        &self,
        scope: &mut MachineScope,
        microvm: &MicroVm,
    ) -> Result<Action, ControllerError> {
        let key = scope.key();
        match microvm.state() {
            MicroVmState::Created => {
                info!("Microvm of {} is running", key);
                scope.set_vm_state(VmState::Running);
                scope.set_ready();
                Ok(Action::requeue(self.resync_period))
            }
            MicroVmState::Pending => {
                info!("Microvm of {} is pending", key);
                scope.set_vm_state(VmState::Pending);
                scope.set_not_ready(MICROVM_PENDING_REASON, ConditionSeverity::Info, "");
                Ok(Action::requeue(REQUEUE_PERIOD))
            }
            MicroVmState::Deleting => {
                info!("Microvm of {} is being deleted", key);
                Ok(Action::requeue(REQUEUE_PERIOD))
            }
            MicroVmState::Failed => {
                let message = "microvm is in a failed state";
                error!("Microvm of {} failed to provision", key);
                scope.set_vm_state(VmState::Failed);
                scope.set_not_ready(
                    MICROVM_PROVISION_FAILED_REASON,
                    ConditionSeverity::Error,
                    message,
                );
                scope.set_failure(MICROVM_PROVISION_FAILED_REASON, message);
                Err(ControllerError::MicrovmFailed(key))
            }
            MicroVmState::Unknown => {
                warn!("Microvm of {} is in an unknown state", key);
                scope.set_vm_state(VmState::Unknown);
                scope.set_not_ready(
                    MICROVM_UNKNOWN_STATE_REASON,
                    ConditionSeverity::Error,
                    "microvm is in an unknown state",
                );
                Err(ControllerError::UnknownMicrovmState(key))
            }
        }
    }
}
