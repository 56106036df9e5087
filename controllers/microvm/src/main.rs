//! Microvm Controller
//!
//! Cluster API infrastructure provider that runs machines as microvms on a static
//! pool of hosts:
//! - MicrovmMachine: creates, tracks and deletes the microvm backing a Machine
//! - MicrovmCluster: publishes the host pool as failure domains and probes the
//!   control plane endpoint
//! - ExternalLoadBalancer: probes an externally managed API server endpoint

mod backoff;
mod bootstrap;
mod config;
mod controller;
mod error;
mod metrics;
mod placement;
mod probe;
mod reconciler;
mod scope;
mod store;
#[cfg(test)]
mod test_utils;
mod vm_service;
mod watcher;

use crate::config::ControllerSettings;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::probe::HttpProber;
use crate::reconciler::Reconciler;
use crate::store::KubeStore;
use controller::Controller;
use kube::Client;
use microvm_client::HttpClientFactory;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Microvm Controller");

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    let settings = ControllerSettings::from_env()?;
    info!("Configuration:");
    info!("  Namespace: {}", settings.namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Machine concurrency: {}", settings.machine_concurrency);
    info!("  Cluster concurrency: {}", settings.cluster_concurrency);
    info!("  Resync period: {}s", settings.resync_period.as_secs());
    info!("  Placement strategy: {}", settings.placement_strategy);
    info!("  Microvm proxy: {}", settings.microvm_proxy.as_deref().unwrap_or("none"));
    info!("  Metrics address: {}", settings.metrics_bind_address);

    let client = Client::try_default().await?;
    let metrics = Arc::new(Metrics::new()?);

    let reconciler = Arc::new(Reconciler::new(
        Arc::new(KubeStore::new(client.clone())),
        HttpClientFactory,
        HttpProber::new()?,
        Arc::clone(&metrics),
        &settings,
    ));

    let metrics_address = settings.metrics_bind_address;
    let metrics_server = Arc::clone(&metrics);
    tokio::spawn(async move {
        if let Err(e) = metrics::serve(metrics_address, metrics_server).await {
            error!("Metrics server stopped: {}", e);
        }
    });

    let controller = Controller::new(reconciler, client, settings);
    metrics.set_ready();
    controller.run().await?;

    Ok(())
}
