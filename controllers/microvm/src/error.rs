//! Controller-specific error types.
//!
//! This module defines error types specific to the microvm controller
//! that are not covered by upstream library errors.

use kube::Error as KubeError;
use microvm_client::MicrovmError;
use thiserror::Error;

/// Errors that can occur in the microvm controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// MicroVM service error
    #[error("MicroVM service error: {0}")]
    Microvm(#[from] MicrovmError),

    /// A conditional write lost against a concurrent update
    #[error("resource version conflict writing {0}")]
    Conflict(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// The cluster has no failure domain the machine can be placed in
    #[error("no failure domains found for machine {0}")]
    NoFailureDomain(String),

    /// The owning Machine does not name a bootstrap data secret
    #[error("bootstrap data secret name is not set for machine {0}")]
    MissingBootstrapDataSecret(String),

    /// The bootstrap data secret has no `value` key
    #[error("bootstrap data secret {0} has no 'value' key")]
    MissingBootstrapSecretKey(String),

    /// A referenced secret does not exist
    #[error("secret not found: {0}")]
    SecretNotFound(String),

    /// TLS material in the cluster's TLS secret is missing or malformed
    #[error("TLS secret {secret}: {message}")]
    Tls {
        /// Secret the material was read from
        secret: String,
        /// What is wrong with it
        message: String,
    },

    /// MicrovmCluster without a placement
    #[error("no placement configured for cluster {0}")]
    NoPlacement(String),

    /// Neither the Cluster nor the MicrovmCluster sets a control plane endpoint
    #[error("control plane endpoint is required for cluster {0}")]
    ControlPlaneEndpointRequired(String),

    /// The microvm service reports the microvm as failed
    #[error("microvm {0} is in a failed state")]
    MicrovmFailed(String),

    /// The microvm service reports a state the controller does not understand
    #[error("microvm {0} is in an unknown state")]
    UnknownMicrovmState(String),

    /// Liveness probe did not answer in time
    #[error("liveness probe to {0} timed out")]
    ProbeTimeout(String),

    /// Liveness probe failed for a reason other than a timeout
    #[error("liveness probe to {endpoint} failed: {message}")]
    Probe {
        /// Probed endpoint
        endpoint: String,
        /// Failure detail
        message: String,
    },

    /// Serialization error (cloud-init documents, patches)
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl From<serde_json::Error> for ControllerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for ControllerError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
