//! Scope of a MicrovmMachine reconciliation

use super::{ResourceScope, ScopedResource};
use crate::error::ControllerError;
use crate::placement::{self, PlacementRequest, PlacementStrategy};
use crate::store::{PatchTarget, ResourceStore};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use crds::{
    Cluster, Condition, ConditionSeverity, MACHINE_FINALIZER,
    MICROVM_READY_CONDITION, Machine, MicrovmCluster, MicrovmMachine, SshPublicKey, VmState,
    format_provider_id,
};
use kube::ResourceExt;
use microvm_client::{ClientOptions, TlsConfig};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Key of the bootstrap data inside the bootstrap secret
pub const BOOTSTRAP_DATA_KEY: &str = "value";

/// Client certificate key inside the TLS secret
pub const TLS_CERT_KEY: &str = "tls.crt";
/// Client key inside the TLS secret
pub const TLS_KEY_KEY: &str = "tls.key";
/// CA certificate key inside the TLS secret
pub const CA_CERT_KEY: &str = "ca.crt";

#[async_trait::async_trait]
impl ScopedResource for MicrovmMachine {
    const SUMMARY_CONDITIONS: &'static [&'static str] = &[MICROVM_READY_CONDITION];

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
        store.patch_microvm_machine(namespace, name, target, patch).await
    }
}

/// A MicrovmMachine with its owning Machine, Cluster and MicrovmCluster
#[derive(Debug)]
pub struct MachineScope {
    inner: ResourceScope<MicrovmMachine>,
    /// Owning cluster-api Machine
    pub machine: Machine,
    /// Owning cluster-api Cluster
    pub cluster: Cluster,
    /// Infrastructure cluster of the owning Cluster
    pub microvm_cluster: MicrovmCluster,
}

impl MachineScope {
    /// Creates the scope
    pub fn new(
        microvm_machine: MicrovmMachine,
        machine: Machine,
        cluster: Cluster,
        microvm_cluster: MicrovmCluster,
        store: Arc<dyn ResourceStore>,
    ) -> Result<Self, ControllerError> {
        Ok(Self {
            inner: ResourceScope::new(microvm_machine, store)?,
            machine,
            cluster,
            microvm_cluster,
        })
    }

    /// The wrapped MicrovmMachine
    pub fn microvm_machine(&self) -> &MicrovmMachine {
        self.inner.resource()
    }

    /// Machine name
    pub fn name(&self) -> String {
        self.inner.name()
    }

    /// Machine namespace
    pub fn namespace(&self) -> String {
        self.inner.namespace()
    }

    /// `namespace/name`
    pub fn key(&self) -> String {
        self.inner.key()
    }

    /// Name of the owning cluster
    pub fn cluster_name(&self) -> String {
        self.machine
            .cluster_name()
            .map_or_else(|| self.cluster.name_any(), str::to_string)
    }

    /// True once the MicrovmMachine is marked for deletion
    pub fn is_deleting(&self) -> bool {
        self.inner.is_deleting()
    }

    /// True for control plane machines
    pub fn is_control_plane(&self) -> bool {
        self.machine.is_control_plane()
    }

    /// Adds the machine finalizer
    pub fn add_finalizer(&mut self) -> bool {
        self.inner.add_finalizer(MACHINE_FINALIZER)
    }

    /// Removes the machine finalizer
    pub fn remove_finalizer(&mut self) -> bool {
        self.inner.remove_finalizer(MACHINE_FINALIZER)
    }

    /// Provider id, once a microvm was created
    pub fn provider_id(&self) -> Option<&str> {
        self.inner
            .resource()
            .spec
            .provider_id
            .as_deref()
            .filter(|id| !id.is_empty())
    }

    /// Records the provider id of the created microvm; an existing id is kept
    pub fn set_provider_id(&mut self, failure_domain: &str, uid: &str) -> bool {
        if self.provider_id().is_some() {
            return false;
        }
        let provider_id = format_provider_id(failure_domain, uid);
        info!("Setting provider id of {} to {}", self.key(), provider_id);
        self.inner.resource_mut().spec.provider_id = Some(provider_id);
        true
    }

    fn status_mut(&mut self) -> &mut crds::MicrovmMachineStatus {
        self.inner
            .resource_mut()
            .status
            .get_or_insert_with(Default::default)
    }

    /// Marks the machine ready
    pub fn set_ready(&mut self) {
        let status = self.status_mut();
        status.ready = true;
        status.failure_reason = None;
        status.failure_message = None;
        self.inner.mark_true(MICROVM_READY_CONDITION);
    }

    /// Marks the machine not ready
    pub fn set_not_ready(&mut self, reason: &str, severity: ConditionSeverity, message: impl Into<String>) {
        self.status_mut().ready = false;
        self.inner
            .mark_false(MICROVM_READY_CONDITION, reason, severity, message);
    }

    /// Records the observed microvm state
    pub fn set_vm_state(&mut self, state: VmState) {
        self.status_mut().vm_state = Some(state);
    }

    /// Records a terminal failure for cluster-api to surface
    pub fn set_failure(&mut self, reason: &str, message: impl Into<String>) {
        let status = self.status_mut();
        status.failure_reason = Some(reason.to_string());
        status.failure_message = Some(message.into());
    }

    fn placement_request(&self) -> PlacementRequest<'_> {
        PlacementRequest {
            machine_name: self.inner.resource().metadata.name.as_deref().unwrap_or_default(),
            explicit_domain: self.machine.spec.failure_domain.as_deref(),
            provider_id: self.provider_id(),
            control_plane: self.is_control_plane(),
            registry: self
                .microvm_cluster
                .status
                .as_ref()
                .map(|s| &s.failure_domains)
                .unwrap_or(&EMPTY_REGISTRY),
        }
    }

    /// Failure domain fixed by the Machine or the provider id, if any
    pub fn sticky_failure_domain(&self) -> Option<String> {
        placement::sticky_failure_domain(&self.placement_request())
    }

    /// Resolves the failure domain of this machine
    ///
    /// `placed` lists the domains of the cluster's other machines.
    pub fn failure_domain(
        &self,
        strategy: PlacementStrategy,
        placed: &[String],
    ) -> Result<String, ControllerError> {
        placement::select_failure_domain(&self.placement_request(), strategy, placed)
    }

    /// Raw bootstrap data from the secret named by the owning Machine
    pub async fn bootstrap_data(&self) -> Result<Vec<u8>, ControllerError> {
        let secret_name = self
            .machine
            .spec
            .bootstrap
            .data_secret_name
            .clone()
            .ok_or_else(|| ControllerError::MissingBootstrapDataSecret(self.key()))?;

        let namespace = self.namespace();
        let mut data = self
            .inner
            .store()
            .get_secret_data(&namespace, &secret_name)
            .await?
            .ok_or_else(|| ControllerError::SecretNotFound(format!("{}/{}", namespace, secret_name)))?;

        data.remove(BOOTSTRAP_DATA_KEY)
            .ok_or_else(|| ControllerError::MissingBootstrapSecretKey(format!("{}/{}", namespace, secret_name)))
    }

    /// SSH keys for the guest: the machine's own, or the cluster's when it has none
    pub fn ssh_public_keys(&self) -> &[SshPublicKey] {
        let machine_keys = &self.inner.resource().spec.ssh_public_keys;
        if machine_keys.is_empty() {
            &self.microvm_cluster.spec.ssh_public_keys
        } else {
            machine_keys
        }
    }

    /// Basic auth token for `endpoint` from the static pool's auth secret.
    ///
    /// Tokens are keyed by host without port. A host without a token gets `None`.
    pub async fn basic_auth_token(&self, endpoint: &str) -> Result<Option<String>, ControllerError> {
        let Some(secret_name) = self
            .microvm_cluster
            .spec
            .placement
            .static_pool
            .as_ref()
            .and_then(|pool| pool.basic_auth_secret.clone())
            .filter(|name| !name.is_empty())
        else {
            return Ok(None);
        };

        let namespace = self.microvm_cluster.namespace().unwrap_or_else(|| self.namespace());
        let data = self
            .inner
            .store()
            .get_secret_data(&namespace, &secret_name)
            .await?
            .ok_or_else(|| ControllerError::SecretNotFound(format!("{}/{}", namespace, secret_name)))?;

        let host = host_of(endpoint);
        let token = data
            .get(host)
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
            .filter(|token| !token.is_empty());
        if token.is_none() {
            info!("No basic auth token for host {} in secret {}/{}", host, namespace, secret_name);
        }
        Ok(token)
    }

    /// Mutual TLS material from the cluster's TLS secret, if one is referenced.
    ///
    /// Each field is stored base64-encoded inside the secret data.
    pub async fn tls_config(&self) -> Result<Option<TlsConfig>, ControllerError> {
        let Some(secret_name) = self
            .microvm_cluster
            .spec
            .tls_secret_ref
            .clone()
            .filter(|name| !name.is_empty())
        else {
            debug!("No TLS secret for {}, using plain connections", self.key());
            return Ok(None);
        };

        let namespace = self.microvm_cluster.namespace().unwrap_or_else(|| self.namespace());
        let data = self
            .inner
            .store()
            .get_secret_data(&namespace, &secret_name)
            .await?
            .ok_or_else(|| ControllerError::SecretNotFound(format!("{}/{}", namespace, secret_name)))?;

        let field = |key: &str| -> Result<String, ControllerError> {
            let tls_error = |message: String| ControllerError::Tls {
                secret: format!("{}/{}", namespace, secret_name),
                message,
            };
            let raw = data
                .get(key)
                .ok_or_else(|| tls_error(format!("missing field {}", key)))?;
            let decoded = STANDARD
                .decode(raw)
                .map_err(|e| tls_error(format!("field {} is not base64: {}", key, e)))?;
            String::from_utf8(decoded).map_err(|e| tls_error(format!("field {} is not UTF-8: {}", key, e)))
        };

        Ok(Some(TlsConfig {
            cert: field(TLS_CERT_KEY)?,
            key: field(TLS_KEY_KEY)?,
            ca_cert: field(CA_CERT_KEY)?,
        }))
    }

    /// Connection options for the microvm service on `endpoint`.
    ///
    /// The cluster's proxy overrides `global_proxy`.
    pub async fn client_options(
        &self,
        endpoint: &str,
        global_proxy: Option<&str>,
    ) -> Result<ClientOptions, ControllerError> {
        let proxy = self
            .microvm_cluster
            .spec
            .microvm_proxy
            .as_ref()
            .map(|p| p.endpoint.clone())
            .filter(|p| !p.is_empty())
            .or_else(|| global_proxy.map(str::to_string));

        Ok(ClientOptions {
            proxy,
            basic_auth_token: self.basic_auth_token(endpoint).await?,
            tls: self.tls_config().await?,
            ..Default::default()
        })
    }

    /// Writes pending changes
    pub async fn patch(&mut self) -> Result<(), ControllerError> {
        self.inner.patch().await
    }
}

static EMPTY_REGISTRY: std::collections::BTreeMap<String, crds::FailureDomainSpec> =
    std::collections::BTreeMap::new();

/// Host part of an endpoint (`host:port` or `scheme://host:port`)
fn host_of(endpoint: &str) -> &str {
    let without_scheme = endpoint
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(endpoint);
    without_scheme.split(':').next().unwrap_or(without_scheme)
}
