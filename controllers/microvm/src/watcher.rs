//! Kubernetes resource watchers.
//!
//! Each infrastructure kind runs in its own `kube_runtime::Controller`. Besides the
//! primary resource, every controller watches the cluster-api objects it depends on
//! and maps their events back onto the infrastructure objects:
//! - a Machine triggers the MicrovmMachine named by its infrastructure reference
//! - a Cluster triggers its MicrovmCluster, and every MicrovmMachine and
//!   ExternalLoadBalancer labelled with its name
//! - a MicrovmCluster triggers every MicrovmMachine labelled with its cluster name

use crate::config::ControllerSettings;
use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crds::{
    CLUSTER_NAME_LABEL, Cluster, ExternalLoadBalancer, INFRASTRUCTURE_GROUP, Machine,
    MicrovmCluster, MicrovmMachine, ObjectReference,
};
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client, Resource, ResourceExt};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{
    Controller, watcher,
    controller::{Action, Config as ControllerConfig},
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

#[cfg(test)]
#[path = "watcher_test.rs"]
mod watcher_test;

const DEBOUNCE: Duration = Duration::from_secs(5);

/// Runs `controller` until it shuts down.
///
/// `reconcile_fn` is called with the namespace and name of each object to
/// reconcile. Failed passes requeue with the reconciler's per-resource backoff;
/// a clean pass resets it.
async fn watch_resource<K, F, Fut>(
    controller: Controller<K>,
    reconciler: Arc<Reconciler>,
    kind: &'static str,
    concurrency: u16,
    reconcile_fn: F,
) -> Result<(), ControllerError>
where
    K: Resource<DynamicType = ()>
        + Clone
        + Send
        + Sync
        + 'static
        + std::fmt::Debug
        + serde::de::DeserializeOwned,
    F: Fn(Arc<Reconciler>, String, String) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<Action, ControllerError>> + Send + 'static,
{
    info!("Starting {} watcher", kind);

    let error_policy = move |obj: Arc<K>, error: &ControllerError, ctx: Arc<Reconciler>| {
        let key = resource_key(kind, obj.as_ref());
        error!("Reconciliation error for {}: {}", key, error);
        ctx.metrics().failed(kind);
        Action::requeue(ctx.error_requeue(&key, error))
    };

    let reconcile = move |obj: Arc<K>, ctx: Arc<Reconciler>| {
        let reconcile_fn = reconcile_fn.clone();
        async move {
            let key = resource_key(kind, obj.as_ref());
            debug!("Reconciling {}", key);
            let action = reconcile_fn(
                Arc::clone(&ctx),
                obj.namespace().unwrap_or_default(),
                obj.name_any(),
            )
            .await?;
            ctx.reset_error(&key);
            ctx.metrics().reconciled(kind);
            Ok::<Action, ControllerError>(action)
        }
    };

    let controller_config = ControllerConfig::default()
        .debounce(DEBOUNCE)
        .concurrency(concurrency);

    controller
        .with_config(controller_config)
        .shutdown_on_signal()
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!("Reconciled {} {}: {:?}", kind, obj, action),
                Err(e) => debug!("{} controller: {}", kind, e),
            }
        })
        .await;

    info!("{} watcher stopped", kind);
    Ok(())
}

/// `kind/namespace/name`, the key of the per-resource backoff
fn resource_key<K: Resource>(kind: &str, obj: &K) -> String {
    format!("{}/{}/{}", kind, obj.namespace().unwrap_or_default(), obj.name_any())
}

/// Reference to the infrastructure object `reference` points at, when it is of `kind`
pub(crate) fn infrastructure_target<K>(
    reference: Option<&ObjectReference>,
    kind: &str,
    default_namespace: Option<String>,
) -> Option<ObjectRef<K>>
where
    K: Resource<DynamicType = ()>,
{
    let reference = reference?;
    if reference.kind.as_deref() != Some(kind) {
        return None;
    }
    let in_group = reference
        .api_version
        .as_deref()
        .is_some_and(|version| version.split('/').next() == Some(INFRASTRUCTURE_GROUP));
    if !in_group {
        return None;
    }

    let name = reference.name.as_deref().filter(|n| !n.is_empty())?;
    let mut target = ObjectRef::new(name);
    if let Some(namespace) = reference.namespace.clone().or(default_namespace) {
        target = target.within(&namespace);
    }
    Some(target)
}

/// References to every object in `objects` labelled with `cluster_name` in `namespace`
pub(crate) fn labelled_with_cluster<K>(
    objects: &[Arc<K>],
    namespace: Option<&str>,
    cluster_name: &str,
) -> Vec<ObjectRef<K>>
where
    K: Resource<DynamicType = ()>,
{
    objects
        .iter()
        .filter(|obj| obj.namespace().as_deref() == namespace)
        .filter(|obj| obj.labels().get(CLUSTER_NAME_LABEL).map(String::as_str) == Some(cluster_name))
        .map(|obj| ObjectRef::from_obj(obj.as_ref()))
        .collect()
}

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
{
    match namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    }
}

/// Watches the infrastructure kinds and the cluster-api objects they depend on.
#[derive(Clone)]
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    client: Client,
    settings: ControllerSettings,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(reconciler: Arc<Reconciler>, client: Client, settings: ControllerSettings) -> Self {
        Self {
            reconciler,
            client,
            settings,
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        api(&self.client, self.settings.namespace.as_deref())
    }

    /// Starts watching MicrovmMachine resources.
    pub async fn watch_microvm_machines(&self) -> Result<(), ControllerError> {
        let controller = Controller::new(self.api::<MicrovmMachine>(), watcher::Config::default());
        let by_cluster = controller.store();
        let by_microvm_cluster = controller.store();

        let controller = controller
            .watches(self.api::<Machine>(), watcher::Config::default(), |machine| {
                infrastructure_target::<MicrovmMachine>(
                    machine.spec.infrastructure_ref.as_ref(),
                    "MicrovmMachine",
                    machine.namespace(),
                )
            })
            .watches(self.api::<Cluster>(), watcher::Config::default(), move |cluster| {
                labelled_with_cluster(
                    &by_cluster.state(),
                    cluster.namespace().as_deref(),
                    &cluster.name_any(),
                )
            })
            .watches(
                self.api::<MicrovmCluster>(),
                watcher::Config::default(),
                move |microvm_cluster| match microvm_cluster.labels().get(CLUSTER_NAME_LABEL) {
                    Some(cluster_name) => labelled_with_cluster(
                        &by_microvm_cluster.state(),
                        microvm_cluster.namespace().as_deref(),
                        cluster_name,
                    ),
                    None => Vec::new(),
                },
            );

        watch_resource(
            controller,
            Arc::clone(&self.reconciler),
            "MicrovmMachine",
            self.settings.machine_concurrency,
            |ctx: Arc<Reconciler>, namespace: String, name: String| async move {
                ctx.reconcile_microvm_machine(&namespace, &name).await
            },
        )
        .await
    }

    /// Starts watching MicrovmCluster resources.
    pub async fn watch_microvm_clusters(&self) -> Result<(), ControllerError> {
        let controller = Controller::new(self.api::<MicrovmCluster>(), watcher::Config::default())
            .watches(self.api::<Cluster>(), watcher::Config::default(), |cluster| {
                infrastructure_target::<MicrovmCluster>(
                    cluster.spec.infrastructure_ref.as_ref(),
                    "MicrovmCluster",
                    cluster.namespace(),
                )
            });

        watch_resource(
            controller,
            Arc::clone(&self.reconciler),
            "MicrovmCluster",
            self.settings.cluster_concurrency,
            |ctx: Arc<Reconciler>, namespace: String, name: String| async move {
                ctx.reconcile_microvm_cluster(&namespace, &name).await
            },
        )
        .await
    }

    /// Starts watching ExternalLoadBalancer resources.
    pub async fn watch_external_load_balancers(&self) -> Result<(), ControllerError> {
        let controller =
            Controller::new(self.api::<ExternalLoadBalancer>(), watcher::Config::default());
        let load_balancers = controller.store();
        let controller = controller.watches(
            self.api::<Cluster>(),
            watcher::Config::default(),
            move |cluster| {
                labelled_with_cluster(
                    &load_balancers.state(),
                    cluster.namespace().as_deref(),
                    &cluster.name_any(),
                )
            },
        );

        watch_resource(
            controller,
            Arc::clone(&self.reconciler),
            "ExternalLoadBalancer",
            self.settings.cluster_concurrency,
            |ctx: Arc<Reconciler>, namespace: String, name: String| async move {
                ctx.reconcile_external_load_balancer(&namespace, &name).await
            },
        )
        .await
    }
}
