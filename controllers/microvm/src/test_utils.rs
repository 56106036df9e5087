//! Test utilities for unit testing reconcilers
//!
//! This module provides an in-memory resource store, a scripted liveness prober and
//! helpers for creating test data.

use crate::config::ControllerSettings;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::probe::{EndpointProber, ProbeOutcome};
use crate::reconciler::Reconciler;
use crate::store::{PatchTarget, ResourceStore};
use crds::*;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
use kube::Resource;
use microvm_client::{MockClientFactory, MockMicrovmClient};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

pub const NAMESPACE: &str = "default";
pub const CLUSTER: &str = "mvm-test";
pub const HOST1: &str = "host1:9090";
pub const HOST2: &str = "host2:9090";
pub const BOOTSTRAP_SECRET: &str = "worker-0-bootstrap";

type ObjectKey = (String, String, String);

/// A patch as received by [`MemoryStore`]
#[derive(Debug, Clone)]
pub struct PatchRecord {
    pub kind: String,
    pub name: String,
    pub target: PatchTarget,
    pub body: Value,
}

#[derive(Debug, Default)]
struct StoreState {
    objects: HashMap<ObjectKey, Value>,
    secrets: HashMap<(String, String), BTreeMap<String, Vec<u8>>>,
    patches: Vec<PatchRecord>,
    failing_patches: usize,
    next_version: u64,
}

impl StoreState {
    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

/// In-memory [`ResourceStore`] with the API server's merge patch and optimistic
/// concurrency semantics.
///
/// Objects whose deletion timestamp is set disappear once their last finalizer is
/// removed.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

fn object_key(kind: &str, namespace: &str, name: &str) -> ObjectKey {
    (kind.to_string(), namespace.to_string(), name.to_string())
}

/// Applies a JSON merge patch (RFC 7386) to `target`
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                apply_merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap()
    }

    /// Stores `object`, assigning a fresh resource version
    pub fn insert<K>(&self, object: &K)
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let mut state = self.lock();
        let mut value = serde_json::to_value(object).unwrap();
        value["metadata"]["resourceVersion"] = Value::String(state.bump_version());
        let key = object_key(
            &K::kind(&()),
            object.meta().namespace.as_deref().unwrap_or_default(),
            object.meta().name.as_deref().unwrap_or_default(),
        );
        state.objects.insert(key, value);
    }

    /// Current stored version of an object
    pub fn get<K>(&self, namespace: &str, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        self.lock()
            .objects
            .get(&object_key(&K::kind(&()), namespace, name))
            .map(|value| serde_json::from_value(value.clone()).unwrap())
    }

    /// Simulates a concurrent writer by bumping an object's resource version
    pub fn touch<K>(&self, namespace: &str, name: &str)
    where
        K: Resource<DynamicType = ()>,
    {
        let mut state = self.lock();
        let version = state.bump_version();
        if let Some(value) = state.objects.get_mut(&object_key(&K::kind(&()), namespace, name)) {
            value["metadata"]["resourceVersion"] = Value::String(version);
        }
    }

    pub fn insert_secret(&self, namespace: &str, name: &str, data: &[(&str, &[u8])]) {
        self.lock().secrets.insert(
            (namespace.to_string(), name.to_string()),
            data.iter()
                .map(|(key, value)| ((*key).to_string(), value.to_vec()))
                .collect(),
        );
    }

    /// Makes the next `count` patches fail
    pub fn fail_patches(&self, count: usize) {
        self.lock().failing_patches = count;
    }

    pub fn patches(&self) -> Vec<PatchRecord> {
        self.lock().patches.clone()
    }

    /// Patches of `kind` with `target`
    pub fn patch_count(&self, kind: &str, target: PatchTarget) -> usize {
        self.lock()
            .patches
            .iter()
            .filter(|p| p.kind == kind && p.target == target)
            .count()
    }

    fn list<K>(&self, namespace: &str) -> Vec<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let kind = K::kind(&()).to_string();
        let mut items: Vec<(String, Value)> = self
            .lock()
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .map(|((_, _, name), value)| (name.clone(), value.clone()))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        items
            .into_iter()
            .map(|(_, value)| serde_json::from_value(value).unwrap())
            .collect()
    }

    fn patch<K>(
        &self,
        namespace: &str,
        name: &str,
        target: PatchTarget,
        patch: &Value,
    ) -> Result<K, ControllerError>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let kind = K::kind(&()).to_string();
        let mut state = self.lock();
        state.patches.push(PatchRecord {
            kind: kind.clone(),
            name: name.to_string(),
            target,
            body: patch.clone(),
        });

        if state.failing_patches > 0 {
            state.failing_patches -= 1;
            return Err(ControllerError::Conflict(format!("{} {} (injected)", kind, name)));
        }

        let key = object_key(&kind, namespace, name);
        let Some(current) = state.objects.get(&key).cloned() else {
            return Err(ControllerError::Watch(format!("{} {} not found", kind, name)));
        };

        let mut body = patch.clone();
        let expected = body
            .get_mut("metadata")
            .and_then(Value::as_object_mut)
            .and_then(|metadata| metadata.remove("resourceVersion"));
        if let Some(expected) = expected {
            if current["metadata"]["resourceVersion"] != expected {
                return Err(ControllerError::Conflict(format!("{} {}", kind, name)));
            }
        }

        let mut updated = current;
        match target {
            PatchTarget::Object => {
                if let Some(object) = body.as_object_mut() {
                    object.remove("status");
                }
                apply_merge_patch(&mut updated, &body);
            }
            PatchTarget::Status => {
                if let Some(status) = body.get("status") {
                    apply_merge_patch(&mut updated, &json!({ "status": status }));
                }
            }
        }
        updated["metadata"]["resourceVersion"] = Value::String(state.bump_version());

        let finalizers_empty = updated["metadata"]["finalizers"]
            .as_array()
            .is_none_or(Vec::is_empty);
        if !updated["metadata"]["deletionTimestamp"].is_null() && finalizers_empty {
            state.objects.remove(&key);
        } else {
            state.objects.insert(key, updated.clone());
        }

        Ok(serde_json::from_value(updated)?)
    }
}

#[async_trait::async_trait]
impl ResourceStore for MemoryStore {
    async fn get_microvm_machine(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MicrovmMachine>, ControllerError> {
        Ok(self.get(namespace, name))
    }

    async fn get_microvm_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MicrovmCluster>, ControllerError> {
        Ok(self.get(namespace, name))
    }

    async fn get_external_load_balancer(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ExternalLoadBalancer>, ControllerError> {
        Ok(self.get(namespace, name))
    }

    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>, ControllerError> {
        Ok(self.get(namespace, name))
    }

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, ControllerError> {
        Ok(self.get(namespace, name))
    }

    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, ControllerError> {
        Ok(self
            .lock()
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_microvm_machines(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<MicrovmMachine>, ControllerError> {
        Ok(self
            .list::<MicrovmMachine>(namespace)
            .into_iter()
            .filter(|machine| {
                machine
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get(CLUSTER_NAME_LABEL))
                    .is_some_and(|name| name == cluster_name)
            })
            .collect())
    }

    async fn patch_microvm_machine(
        &self,
        namespace: &str,
        name: &str,
        target: PatchTarget,
        patch: &Value,
    ) -> Result<MicrovmMachine, ControllerError> {
        self.patch(namespace, name, target, patch)
    }

    async fn patch_microvm_cluster(
        &self,
        namespace: &str,
        name: &str,
        target: PatchTarget,
        patch: &Value,
    ) -> Result<MicrovmCluster, ControllerError> {
        self.patch(namespace, name, target, patch)
    }

    async fn patch_external_load_balancer(
        &self,
        namespace: &str,
        name: &str,
        target: PatchTarget,
        patch: &Value,
    ) -> Result<ExternalLoadBalancer, ControllerError> {
        self.patch(namespace, name, target, patch)
    }
}

/// Scripted probe answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockProbe {
    Available,
    Unavailable(u16),
    Timeout,
    Refused,
}

/// [`EndpointProber`] answering with a fixed [`MockProbe`] and recording probed URLs
#[derive(Debug, Clone)]
pub struct MockProber {
    answer: Arc<Mutex<MockProbe>>,
    queued: Arc<Mutex<VecDeque<MockProbe>>>,
    urls: Arc<Mutex<Vec<String>>>,
}

impl MockProber {
    pub fn new(answer: MockProbe) -> Self {
        Self {
            answer: Arc::new(Mutex::new(answer)),
            queued: Arc::new(Mutex::new(VecDeque::new())),
            urls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Changes the answer of every later probe
    pub fn set(&self, answer: MockProbe) {
        *self.answer.lock().unwrap() = answer;
    }

    /// Answers the next probe with `answer`, then falls back to the fixed answer
    pub fn queue(&self, answer: MockProbe) {
        self.queued.lock().unwrap().push_back(answer);
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl EndpointProber for MockProber {
    async fn probe(&self, url: &str) -> Result<ProbeOutcome, ControllerError> {
        self.urls.lock().unwrap().push(url.to_string());
        let answer = self
            .queued
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(*self.answer.lock().unwrap());
        match answer {
            MockProbe::Available => Ok(ProbeOutcome::Available),
            MockProbe::Unavailable(status) => Ok(ProbeOutcome::Unavailable { status }),
            MockProbe::Timeout => Err(ControllerError::ProbeTimeout(url.to_string())),
            MockProbe::Refused => Err(ControllerError::Probe {
                endpoint: url.to_string(),
                message: "connection refused".to_string(),
            }),
        }
    }
}

/// Collaborators of a test reconciler
#[derive(Debug, Clone)]
pub struct TestEnv {
    pub store: MemoryStore,
    pub client: MockMicrovmClient,
    pub factory: MockClientFactory,
    pub prober: MockProber,
    pub metrics: Arc<Metrics>,
}

pub fn default_settings() -> ControllerSettings {
    ControllerSettings::from_lookup(|_| None).unwrap()
}

/// Reconciler over an empty [`MemoryStore`], a mock microvm service and a prober
/// that reports every endpoint available
pub fn test_reconciler() -> (Reconciler, TestEnv) {
    test_reconciler_with(&default_settings())
}

pub fn test_reconciler_with(settings: &ControllerSettings) -> (Reconciler, TestEnv) {
    let store = MemoryStore::new();
    let client = MockMicrovmClient::new("mock");
    let factory = MockClientFactory::new(client.clone());
    let prober = MockProber::new(MockProbe::Available);
    let metrics = Arc::new(Metrics::new().unwrap());

    let reconciler = Reconciler::new(
        Arc::new(store.clone()),
        factory.clone(),
        prober.clone(),
        Arc::clone(&metrics),
        settings,
    );
    let env = TestEnv {
        store,
        client,
        factory,
        prober,
        metrics,
    };
    (reconciler, env)
}

fn owner(kind: &str, name: &str) -> OwnerReference {
    OwnerReference {
        api_version: "cluster.x-k8s.io/v1beta1".to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        uid: format!("{}-uid", name),
        ..Default::default()
    }
}

fn cluster_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(CLUSTER_NAME_LABEL.to_string(), cluster_name.to_string())])
}

/// Marks `meta` as being deleted
pub fn mark_deleting(meta: &mut ObjectMeta) {
    let timestamp: Time = serde_json::from_value(json!("2024-01-01T00:00:00Z")).unwrap();
    meta.deletion_timestamp = Some(timestamp);
}

/// Helper to create a test Cluster with ready infrastructure
pub fn create_test_cluster(name: &str, namespace: &str, microvm_cluster_name: &str) -> Cluster {
    Cluster {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("{}-uid", name)),
            ..Default::default()
        },
        spec: ClusterSpec {
            paused: None,
            control_plane_endpoint: None,
            infrastructure_ref: Some(ObjectReference {
                api_version: Some(format!("{}/{}", INFRASTRUCTURE_GROUP, INFRASTRUCTURE_VERSION)),
                kind: Some("MicrovmCluster".to_string()),
                name: Some(microvm_cluster_name.to_string()),
                namespace: None,
            }),
        },
        status: Some(ClusterStatus {
            infrastructure_ready: true,
        }),
    }
}

/// Helper to create a test Machine; `bootstrap_secret` is the bootstrap data secret
pub fn create_test_machine(
    name: &str,
    namespace: &str,
    cluster_name: &str,
    bootstrap_secret: Option<&str>,
) -> Machine {
    Machine {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(cluster_labels(cluster_name)),
            ..Default::default()
        },
        spec: MachineSpec {
            cluster_name: cluster_name.to_string(),
            bootstrap: Bootstrap {
                data_secret_name: bootstrap_secret.map(str::to_string),
            },
            failure_domain: None,
            infrastructure_ref: None,
        },
    }
}

/// Adds the control plane label to a Machine
pub fn as_control_plane(mut machine: Machine) -> Machine {
    machine
        .metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(CONTROL_PLANE_LABEL.to_string(), String::new());
    machine
}

/// Helper to create a test MicrovmMachine owned by `machine_name`
pub fn create_test_microvm_machine(
    name: &str,
    namespace: &str,
    cluster_name: &str,
    machine_name: &str,
) -> MicrovmMachine {
    MicrovmMachine {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(cluster_labels(cluster_name)),
            owner_references: Some(vec![owner("Machine", machine_name)]),
            ..Default::default()
        },
        spec: MicrovmMachineSpec {
            vcpu: 2,
            memory_mb: 2048,
            root_volume: Volume {
                id: "root".to_string(),
                image: "ghcr.io/example/capmvm-kubernetes:1.23.5".to_string(),
                read_only: false,
                mount_point: None,
            },
            kernel: ContainerFileSource {
                image: "ghcr.io/example/kernel-bin:5.10.77".to_string(),
                filename: Some("boot/vmlinux".to_string()),
            },
            network_interfaces: vec![NetworkInterface {
                guest_device_name: "eth1".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        },
        status: None,
    }
}

/// Helper to create a test MicrovmCluster owned by `cluster_name` with a static pool
/// of `(endpoint, control_plane_allowed)` hosts
pub fn create_test_microvm_cluster(
    name: &str,
    namespace: &str,
    cluster_name: &str,
    hosts: &[(&str, bool)],
) -> MicrovmCluster {
    let mut microvm_cluster = MicrovmCluster {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(cluster_labels(cluster_name)),
            owner_references: Some(vec![owner("Cluster", cluster_name)]),
            ..Default::default()
        },
        spec: MicrovmClusterSpec {
            control_plane_endpoint: ApiEndpoint {
                host: "cp.example.com".to_string(),
                port: 6443,
            },
            ssh_public_keys: vec![SshPublicKey {
                user: "root".to_string(),
                authorized_keys: vec!["ssh-ed25519 AAAA cluster".to_string()],
            }],
            placement: Placement {
                static_pool: Some(StaticPoolPlacement {
                    hosts: hosts
                        .iter()
                        .map(|(endpoint, control_plane_allowed)| MicrovmHost {
                            name: None,
                            endpoint: (*endpoint).to_string(),
                            control_plane_allowed: *control_plane_allowed,
                        })
                        .collect(),
                    basic_auth_secret: None,
                }),
            },
            microvm_proxy: None,
            tls_secret_ref: None,
        },
        status: None,
    };
    microvm_cluster.status = Some(MicrovmClusterStatus {
        ready: true,
        conditions: Vec::new(),
        failure_domains: hosts
            .iter()
            .map(|(endpoint, control_plane)| {
                (
                    (*endpoint).to_string(),
                    FailureDomainSpec {
                        control_plane: *control_plane,
                    },
                )
            })
            .collect(),
    });
    microvm_cluster
}

/// Helper to create a test ExternalLoadBalancer labelled with `cluster_name`
pub fn create_test_external_load_balancer(
    name: &str,
    namespace: &str,
    cluster_name: Option<&str>,
) -> ExternalLoadBalancer {
    ExternalLoadBalancer {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: cluster_name.map(cluster_labels),
            ..Default::default()
        },
        spec: ExternalLoadBalancerSpec {
            endpoint: ApiEndpoint {
                host: "lb.example.com".to_string(),
                port: 0,
            },
        },
        status: None,
    }
}

/// Seeds the store with a ready cluster on `hosts` and one worker `worker-0` with
/// bootstrap data
pub fn seed_worker(store: &MemoryStore, hosts: &[(&str, bool)]) {
    store.insert(&create_test_cluster(CLUSTER, NAMESPACE, CLUSTER));
    store.insert(&create_test_microvm_cluster(CLUSTER, NAMESPACE, CLUSTER, hosts));
    store.insert(&create_test_machine(
        "worker-0",
        NAMESPACE,
        CLUSTER,
        Some(BOOTSTRAP_SECRET),
    ));
    store.insert(&create_test_microvm_machine(
        "worker-0",
        NAMESPACE,
        CLUSTER,
        "worker-0",
    ));
    store.insert_secret(
        NAMESPACE,
        BOOTSTRAP_SECRET,
        &[("value", b"#cloud-config\nruncmd: [kubeadm join]\n".as_slice())],
    );
}
