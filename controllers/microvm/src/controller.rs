//! Main controller implementation.
//!
//! The `Controller` owns one background task per infrastructure kind and runs until
//! the first of them stops, either on shutdown or because it failed.

use crate::config::ControllerSettings;
use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crate::watcher::Watcher;
use kube::Client;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Main controller for microvm infrastructure.
#[derive(Debug)]
pub struct Controller {
    microvm_machine_watcher: JoinHandle<Result<(), ControllerError>>,
    microvm_cluster_watcher: JoinHandle<Result<(), ControllerError>>,
    external_load_balancer_watcher: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Starts a watcher task for every kind.
    pub fn new(reconciler: Arc<Reconciler>, client: Client, settings: ControllerSettings) -> Self {
        info!("Initializing microvm controller");
        let watcher_instance = Arc::new(Watcher::new(reconciler, client, settings));

        let microvm_machine_watcher = {
            let watcher = Arc::clone(&watcher_instance);
            tokio::spawn(async move { watcher.watch_microvm_machines().await })
        };
        let microvm_cluster_watcher = {
            let watcher = Arc::clone(&watcher_instance);
            tokio::spawn(async move { watcher.watch_microvm_clusters().await })
        };
        let external_load_balancer_watcher = {
            let watcher = Arc::clone(&watcher_instance);
            tokio::spawn(async move { watcher.watch_external_load_balancers().await })
        };

        Self {
            microvm_machine_watcher,
            microvm_cluster_watcher,
            external_load_balancer_watcher,
        }
    }

    /// Runs until the first watcher exits.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Controller running");

        tokio::select! {
            result = &mut self.microvm_machine_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("MicrovmMachine watcher panicked: {}", e)))??;
            }
            result = &mut self.microvm_cluster_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("MicrovmCluster watcher panicked: {}", e)))??;
            }
            result = &mut self.external_load_balancer_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("ExternalLoadBalancer watcher panicked: {}", e)))??;
            }
        }

        info!("Controller stopped");
        Ok(())
    }
}
