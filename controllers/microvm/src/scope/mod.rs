//! Resource scopes.
//!
//! A scope wraps the infrastructure object being reconciled together with the owner
//! objects it was loaded with. Reconcilers mutate the wrapped object freely; `patch()`
//! folds the conditions into the aggregate `Ready` condition and writes whatever
//! changed since the last write, as at most one merge patch on the object and one on
//! the status subresource. Both carry the resource version they were computed
//! against, so a concurrent update makes the write fail instead of being overwritten.
//!
//! Every reconciliation pass ends with a patch, whatever the outcome of the pass; see
//! [`settle`].

pub mod cluster;
pub mod machine;


pub use cluster::{ClusterScope, LoadBalancerScope};
pub use machine::MachineScope;

use crate::error::ControllerError;
use crate::store::{PatchTarget, ResourceStore};
use crds::{Condition, ConditionSeverity, mark_false, mark_true, set_summary};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use serde_json::{Map, Value, json};
use std::any::Any;
use std::sync::Arc;
use tracing::{debug, error};

/// An infrastructure object a scope can wrap
#[async_trait::async_trait]
pub trait ScopedResource: Resource<DynamicType = ()> + Clone + Send + Sync + 'static {
    /// Condition types folded into the aggregate `Ready` condition, in priority order
    const SUMMARY_CONDITIONS: &'static [&'static str];

    /// The `.spec` field as JSON
    fn spec_value(&self) -> Result<Value, ControllerError>;

    /// The status as JSON, `null` when unset
    fn status_value(&self) -> Result<Value, ControllerError>;

    /// Current conditions
    fn conditions(&self) -> &[Condition];

    /// Mutable conditions, creating the status when unset
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;

    /// Applies a merge patch through the store
    async fn write(
        store: &dyn ResourceStore,
        namespace: &str,
        name: &str,
        target: PatchTarget,
        patch: &Value,
    ) -> Result<Self, ControllerError>;
}

/// Wraps one object and remembers what was last persisted
pub struct ResourceScope<K: ScopedResource> {
    resource: K,
    persisted_object: Value,
    persisted_status: Value,
    store: Arc<dyn ResourceStore>,
}

impl<K: ScopedResource + std::fmt::Debug> std::fmt::Debug for ResourceScope<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceScope")
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}

fn object_value<K: ScopedResource>(resource: &K) -> Result<Value, ControllerError> {
    let meta = resource.meta();
    Ok(json!({
        "metadata": {
            "finalizers": meta.finalizers,
            "ownerReferences": meta.owner_references,
        },
        "spec": resource.spec_value()?,
    }))
}

impl<K: ScopedResource> ResourceScope<K> {
    /// Wraps `resource`; its current state counts as persisted
    pub fn new(resource: K, store: Arc<dyn ResourceStore>) -> Result<Self, ControllerError> {
        Ok(Self {
            persisted_object: object_value(&resource)?,
            persisted_status: resource.status_value()?,
            resource,
            store,
        })
    }

    /// The wrapped object
    pub fn resource(&self) -> &K {
        &self.resource
    }

    /// The wrapped object, for mutation
    pub fn resource_mut(&mut self) -> &mut K {
        &mut self.resource
    }

    /// Store the scope writes to
    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    /// Object name
    pub fn name(&self) -> String {
        self.resource.name_any()
    }

    /// Object namespace
    pub fn namespace(&self) -> String {
        self.resource.namespace().unwrap_or_default()
    }

    /// `namespace/name`, for logs
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace(), self.name())
    }

    /// True once the object is marked for deletion
    pub fn is_deleting(&self) -> bool {
        self.resource.meta().deletion_timestamp.is_some()
    }

    /// Adds `finalizer`; returns whether it was missing
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        let finalizers = self.resource.meta_mut().finalizers.get_or_insert_with(Vec::new);
        if finalizers.iter().any(|f| f == finalizer) {
            return false;
        }
        finalizers.push(finalizer.to_string());
        true
    }

    /// Removes `finalizer`; returns whether it was present
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        match self.resource.meta_mut().finalizers.as_mut() {
            Some(finalizers) => {
                let before = finalizers.len();
                finalizers.retain(|f| f != finalizer);
                finalizers.len() != before
            }
            None => false,
        }
    }

    /// Adds `owner` to the owner references unless an entry with the same uid exists
    pub fn ensure_owner_reference(&mut self, owner: OwnerReference) -> bool {
        let owners = self
            .resource
            .meta_mut()
            .owner_references
            .get_or_insert_with(Vec::new);
        if owners.iter().any(|o| o.uid == owner.uid) {
            return false;
        }
        owners.push(owner);
        true
    }

    /// Marks a condition `True`
    pub fn mark_true(&mut self, condition_type: &str) {
        mark_true(self.resource.conditions_mut(), condition_type);
    }

    /// Marks a condition `False`
    pub fn mark_false(
        &mut self,
        condition_type: &str,
        reason: &str,
        severity: ConditionSeverity,
        message: impl Into<String>,
    ) {
        mark_false(
            self.resource.conditions_mut(),
            condition_type,
            reason,
            severity,
            message,
        );
    }

    /// Recomputes `Ready` and writes everything changed since the last write.
    ///
    /// Issues no request when nothing changed.
    pub async fn patch(&mut self) -> Result<(), ControllerError> {
        set_summary(self.resource.conditions_mut(), K::SUMMARY_CONDITIONS);

        let name = self.name();
        let namespace = self.namespace();
        let kind = K::kind(&());

        let object = object_value(&self.resource)?;
        if let Some(diff) = merge_diff(&self.persisted_object, &object) {
            debug!("Patching {} {}/{}: {}", kind, namespace, name, diff);
            let body = with_resource_version(diff, self.resource.resource_version());
            let updated =
                K::write(&*self.store, &namespace, &name, PatchTarget::Object, &body).await?;
            self.resource.meta_mut().resource_version = updated.resource_version();
            self.persisted_object = object;

            if self.is_deleting() && self.resource.finalizers().is_empty() {
                debug!("{} {}/{} released its last finalizer", kind, namespace, name);
                return Ok(());
            }
        }

        let status = self.resource.status_value()?;
        if let Some(diff) = merge_diff(&self.persisted_status, &status) {
            debug!("Patching {} {}/{} status: {}", kind, namespace, name, diff);
            let body = with_resource_version(json!({ "status": diff }), self.resource.resource_version());
            let updated =
                K::write(&*self.store, &namespace, &name, PatchTarget::Status, &body).await?;
            self.resource.meta_mut().resource_version = updated.resource_version();
            self.persisted_status = status;
        }

        Ok(())
    }
}

fn with_resource_version(mut body: Value, resource_version: Option<String>) -> Value {
    if let (Some(version), Some(object)) = (resource_version, body.as_object_mut()) {
        let metadata = object
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(metadata) = metadata.as_object_mut() {
            metadata.insert("resourceVersion".to_string(), Value::String(version));
        }
    }
    body
}

/// JSON merge patch (RFC 7386) turning `old` into `new`; `None` when they are equal
pub fn merge_diff(old: &Value, new: &Value) -> Option<Value> {
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for (key, new_value) in new {
                match old.get(key) {
                    Some(old_value) => {
                        if let Some(diff) = merge_diff(old_value, new_value) {
                            patch.insert(key.clone(), diff);
                        }
                    }
                    None if new_value.is_null() => {}
                    None => {
                        patch.insert(key.clone(), new_value.clone());
                    }
                }
            }
            for key in old.keys() {
                if !new.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            (!patch.is_empty()).then_some(Value::Object(patch))
        }
        _ if old == new => None,
        _ => Some(new.clone()),
    }
}

/// Combines the outcome of a pass with the outcome of its final patch.
///
/// A panic in the pass is resumed once the patch has run. An error from the pass wins
/// over a patch error, which is then only logged; a patch error is returned when the
/// pass itself succeeded.
pub fn settle<T>(
    outcome: Result<Result<T, ControllerError>, Box<dyn Any + Send>>,
    patched: Result<(), ControllerError>,
    key: &str,
) -> Result<T, ControllerError> {
    let result = match outcome {
        Ok(result) => result,
        Err(panic) => {
            if let Err(e) = patched {
                error!("Failed to patch {} after a panic: {}", key, e);
            }
            std::panic::resume_unwind(panic);
        }
    };

    match (result, patched) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(patch_err)) => {
            error!("Failed to patch {}: {}", key, patch_err);
            Err(patch_err)
        }
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(patch_err)) => {
            error!("Failed to patch {}: {}", key, patch_err);
            Err(e)
        }
    }
}
