//! Reconciliation logic for the microvm provider's resources.
//!
//! - `machine`: MicrovmMachines and their microvms
//! - `cluster`: MicrovmClusters, their failure domains and control plane probe
//! - `load_balancer`: ExternalLoadBalancer availability

pub mod cluster;
pub mod load_balancer;
pub mod machine;

#[cfg(test)]
mod machine_test;

use crate::backoff::FibonacciBackoff;
use crate::config::ControllerSettings;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::placement::PlacementStrategy;
use crate::probe::EndpointProber;
use crate::store::ResourceStore;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use microvm_client::MicrovmClientFactory;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

/// Fixed retry interval for states that are expected to change on their own
pub const REQUEUE_PERIOD: Duration = Duration::from_secs(30);

/// Upper bound of the per-resource error backoff
pub const MAX_BACKOFF: Duration = Duration::from_secs(600);

/// Backoff state for a resource
#[derive(Debug, Clone)]
struct BackoffState {
    backoff: FibonacciBackoff,
    error_count: u32,
}

impl BackoffState {
    fn new() -> Self {
        Self {
            backoff: FibonacciBackoff::new(REQUEUE_PERIOD, MAX_BACKOFF),
            error_count: 0,
        }
    }

    fn increment_error(&mut self) {
        self.error_count += 1;
    }
}

/// Reconciles MicrovmMachines, MicrovmClusters and ExternalLoadBalancers.
pub struct Reconciler {
    pub(crate) store: Arc<dyn ResourceStore>,
    pub(crate) client_factory: Box<dyn MicrovmClientFactory>,
    pub(crate) prober: Box<dyn EndpointProber>,
    pub(crate) placement: PlacementStrategy,
    pub(crate) global_proxy: Option<String>,
    pub(crate) resync_period: Duration,
    pub(crate) metrics: Arc<Metrics>,
    /// Error count tracking per resource (kind/namespace/name -> BackoffState)
    backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("placement", &self.placement)
            .field("global_proxy", &self.global_proxy)
            .field("resync_period", &self.resync_period)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(
        store: Arc<dyn ResourceStore>,
        client_factory: impl MicrovmClientFactory + 'static,
        prober: impl EndpointProber + 'static,
        metrics: Arc<Metrics>,
        settings: &ControllerSettings,
    ) -> Self {
        Self {
            store,
            client_factory: Box::new(client_factory),
            prober: Box::new(prober),
            placement: settings.placement_strategy,
            global_proxy: settings.microvm_proxy.clone(),
            resync_period: settings.resync_period,
            metrics,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Metrics the reconciler reports to
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Requeue delay after a failed pass of `resource_key`.
    ///
    /// Microvms in an unknown state are polled at the fixed interval; every other
    /// error backs off along the Fibonacci sequence.
    pub fn error_requeue(&self, resource_key: &str, error: &ControllerError) -> Duration {
        let Ok(mut states) = self.backoff_states.lock() else {
            warn!("Failed to lock backoff_states, using default backoff");
            return REQUEUE_PERIOD;
        };
        let state = states
            .entry(resource_key.to_string())
            .or_insert_with(BackoffState::new);
        state.increment_error();

        if matches!(error, ControllerError::UnknownMicrovmState(_)) {
            return REQUEUE_PERIOD;
        }
        let delay = state.backoff.next_backoff();
        warn!(
            "Retrying {} in {}s (error #{})",
            resource_key,
            delay.as_secs(),
            state.error_count
        );
        delay
    }

    /// Forgets the error backoff of `resource_key` after a successful pass
    pub fn reset_error(&self, resource_key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            states.remove(resource_key);
        }
    }

    /// Number of consecutive failed passes of `resource_key`
    pub fn error_count(&self, resource_key: &str) -> u32 {
        self.backoff_states
            .lock()
            .ok()
            .and_then(|states| states.get(resource_key).map(|s| s.error_count))
            .unwrap_or(0)
    }

    /// Number of resources with a pending error backoff
    #[cfg(test)]
    pub fn backoff_entries(&self) -> usize {
        self.backoff_states.lock().map(|states| states.len()).unwrap_or(0)
    }
}

/// Name of the first owner of `kind` in the cluster-api group
pub(crate) fn owner_name(owners: &[OwnerReference], kind: &str) -> Option<String> {
    owners
        .iter()
        .find(|owner| {
            owner.kind == kind
                && owner
                    .api_version
                    .split('/')
                    .next()
                    .is_some_and(|group| group == "cluster.x-k8s.io")
        })
        .map(|owner| owner.name.clone())
}
