//! MicroVM provider CRD definitions
//!
//! Kubernetes Custom Resource Definitions for the microvm infrastructure provider,
//! plus read-only projections of the cluster-api objects that own them.

pub mod cluster_api;
pub mod conditions;
pub mod external_load_balancer;
pub mod microvm;
pub mod microvm_cluster;
pub mod microvm_machine;

pub use cluster_api::*;
pub use conditions::*;
pub use external_load_balancer::*;
pub use microvm::*;
pub use microvm_cluster::*;
pub use microvm_machine::*;

/// API group of the provider's own resources
pub const INFRASTRUCTURE_GROUP: &str = "infrastructure.cluster.x-k8s.io";

/// API version of the provider's own resources
pub const INFRASTRUCTURE_VERSION: &str = "v1alpha1";
