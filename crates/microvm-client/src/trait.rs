//! MicrovmClient traits for mocking
//!
//! The reconcilers only see these traits. The concrete HTTP client implements them,
//! and tests use the in-memory implementations from the `mock` module.

use crate::error::MicrovmError;
use crate::models::{MicroVm, MicroVmSpec};
use crate::options::ClientOptions;

/// Operations of the microvm service on one host
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait MicrovmClientTrait: Send + Sync {
    /// Endpoint of the host this client talks to
    fn endpoint(&self) -> &str;

    /// Creates a microvm; the returned microvm carries the assigned uid and state
    async fn create_microvm(&self, spec: MicroVmSpec) -> Result<MicroVm, MicrovmError>;

    /// Fetches a microvm; `MicrovmError::NotFound` when it does not exist
    async fn get_microvm(&self, namespace: &str, id: &str) -> Result<MicroVm, MicrovmError>;

    /// Requests deletion of a microvm; deletion completes asynchronously
    async fn delete_microvm(&self, namespace: &str, id: &str) -> Result<(), MicrovmError>;
}

/// Builds a client for a host endpoint
pub trait MicrovmClientFactory: Send + Sync {
    /// Returns a client for `endpoint` configured with `options`
    fn client_for(
        &self,
        endpoint: &str,
        options: ClientOptions,
    ) -> Result<Box<dyn MicrovmClientTrait>, MicrovmError>;
}
