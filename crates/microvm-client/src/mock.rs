//! Mock MicrovmClient for unit testing
//!
//! An in-memory microvm service. Created microvms start in a configurable state,
//! deletes move a microvm to `Deleting` rather than removing it, and every operation
//! can be made to fail once. Clones share state, so a test keeps a handle to inspect
//! calls after handing a clone to the code under test.

use crate::error::MicrovmError;
use crate::microvm_trait::{MicrovmClientFactory, MicrovmClientTrait};
use crate::models::{MicroVm, MicroVmSpec, MicroVmState, MicroVmStatus};
use crate::options::ClientOptions;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type MicroVmKey = (String, String);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Operation of the microvm service, used to inject failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    /// `create_microvm`
    Create,
    /// `get_microvm`
    Get,
    /// `delete_microvm`
    Delete,
}

#[derive(Debug, Default)]
struct CallCounts {
    create: usize,
    get: usize,
    delete: usize,
}

/// Mock microvm service client
#[derive(Debug, Clone)]
pub struct MockMicrovmClient {
    endpoint: String,
    microvms: Arc<Mutex<HashMap<MicroVmKey, MicroVm>>>,
    create_state: Arc<Mutex<MicroVmState>>,
    failures: Arc<Mutex<HashMap<MockOperation, String>>>,
    calls: Arc<Mutex<CallCounts>>,
    created_specs: Arc<Mutex<Vec<MicroVmSpec>>>,
    next_uid: Arc<Mutex<u64>>,
}

impl MockMicrovmClient {
    /// Create a new mock client
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            microvms: Arc::new(Mutex::new(HashMap::new())),
            create_state: Arc::new(Mutex::new(MicroVmState::Pending)),
            failures: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(CallCounts::default())),
            created_specs: Arc::new(Mutex::new(Vec::new())),
            next_uid: Arc::new(Mutex::new(1)),
        }
    }

    /// Add a microvm to the mock store (for test setup)
    pub fn add_microvm(&self, microvm: MicroVm) {
        let key = (microvm.spec.namespace.clone(), microvm.spec.id.clone());
        lock(&self.microvms).insert(key, microvm);
    }

    /// Add a microvm in the given state (for test setup)
    pub fn add_microvm_in_state(&self, namespace: &str, id: &str, uid: &str, state: MicroVmState) {
        self.add_microvm(MicroVm {
            version: 1,
            spec: MicroVmSpec {
                id: id.to_string(),
                namespace: namespace.to_string(),
                uid: Some(uid.to_string()),
                ..Default::default()
            },
            status: Some(MicroVmStatus { state }),
        });
    }

    /// Change the state of a stored microvm
    pub fn set_state(&self, namespace: &str, id: &str, state: MicroVmState) {
        let key = (namespace.to_string(), id.to_string());
        if let Some(microvm) = lock(&self.microvms).get_mut(&key) {
            microvm.status = Some(MicroVmStatus { state });
        }
    }

    /// Remove a microvm, as the service does once deletion completes
    pub fn remove_microvm(&self, namespace: &str, id: &str) {
        lock(&self.microvms).remove(&(namespace.to_string(), id.to_string()));
    }

    /// State newly created microvms start in (default `Pending`)
    pub fn set_create_state(&self, state: MicroVmState) {
        *lock(&self.create_state) = state;
    }

    /// Make the next call of `operation` fail with an API error
    pub fn fail_next(&self, operation: MockOperation, message: impl Into<String>) {
        lock(&self.failures).insert(operation, message.into());
    }

    /// Stored microvm, if any
    pub fn microvm(&self, namespace: &str, id: &str) -> Option<MicroVm> {
        lock(&self.microvms)
            .get(&(namespace.to_string(), id.to_string()))
            .cloned()
    }

    /// Number of `create_microvm` calls
    pub fn create_calls(&self) -> usize {
        lock(&self.calls).create
    }

    /// Number of `get_microvm` calls
    pub fn get_calls(&self) -> usize {
        lock(&self.calls).get
    }

    /// Number of `delete_microvm` calls
    pub fn delete_calls(&self) -> usize {
        lock(&self.calls).delete
    }

    /// Specs passed to `create_microvm`, in call order
    pub fn created_specs(&self) -> Vec<MicroVmSpec> {
        lock(&self.created_specs).clone()
    }

    fn take_failure(&self, operation: MockOperation) -> Option<MicrovmError> {
        lock(&self.failures)
            .remove(&operation)
            .map(MicrovmError::Api)
    }

    fn next_uid(&self) -> String {
        let mut next = lock(&self.next_uid);
        let current = *next;
        *next += 1;
        format!("uid-{}", current)
    }
}

#[async_trait::async_trait]
impl MicrovmClientTrait for MockMicrovmClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn create_microvm(&self, mut spec: MicroVmSpec) -> Result<MicroVm, MicrovmError> {
        lock(&self.calls).create += 1;
        if let Some(err) = self.take_failure(MockOperation::Create) {
            return Err(err);
        }

        lock(&self.created_specs).push(spec.clone());
        spec.uid = Some(self.next_uid());
        let microvm = MicroVm {
            version: 1,
            spec,
            status: Some(MicroVmStatus {
                state: *lock(&self.create_state),
            }),
        };
        self.add_microvm(microvm.clone());
        Ok(microvm)
    }

    async fn get_microvm(&self, namespace: &str, id: &str) -> Result<MicroVm, MicrovmError> {
        lock(&self.calls).get += 1;
        if let Some(err) = self.take_failure(MockOperation::Get) {
            return Err(err);
        }

        self.microvm(namespace, id)
            .ok_or_else(|| MicrovmError::NotFound(format!("microvm {}/{}", namespace, id)))
    }

    async fn delete_microvm(&self, namespace: &str, id: &str) -> Result<(), MicrovmError> {
        lock(&self.calls).delete += 1;
        if let Some(err) = self.take_failure(MockOperation::Delete) {
            return Err(err);
        }

        let key = (namespace.to_string(), id.to_string());
        match lock(&self.microvms).get_mut(&key) {
            Some(microvm) => {
                microvm.status = Some(MicroVmStatus {
                    state: MicroVmState::Deleting,
                });
                Ok(())
            }
            None => Err(MicrovmError::NotFound(format!("microvm {}/{}", namespace, id))),
        }
    }
}

/// Factory handing out clones of one [`MockMicrovmClient`] and recording every request
#[derive(Debug, Clone)]
pub struct MockClientFactory {
    client: MockMicrovmClient,
    requests: Arc<Mutex<Vec<(String, ClientOptions)>>>,
}

impl MockClientFactory {
    /// Create a factory around `client`
    pub fn new(client: MockMicrovmClient) -> Self {
        Self {
            client,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Endpoints and options clients were requested for, in order
    pub fn requests(&self) -> Vec<(String, ClientOptions)> {
        lock(&self.requests).clone()
    }
}

impl MicrovmClientFactory for MockClientFactory {
    fn client_for(
        &self,
        endpoint: &str,
        options: ClientOptions,
    ) -> Result<Box<dyn MicrovmClientTrait>, MicrovmError> {
        lock(&self.requests).push((endpoint.to_string(), options));
        Ok(Box::new(self.client.clone()))
    }
}
