//! The controller's view of Kubernetes.
//!
//! Re-exports the API types the workspace consumes, plus the contracts that
//! are inherently Kubernetes-flavored: label-selector evaluation, the
//! filtered-watch event framework, and the selector-keyed address-set
//! registry.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod addr_sets;
pub mod labels;
pub mod watch;

pub use self::addr_sets::{AddressSetFactory, AddressSetHandles};
pub use self::watch::{EventHandler, WatchFactory, WatchHandle};
pub use k8s_openapi::api::core::v1::{Namespace, Pod, PodSpec, PodStatus};
pub use k8s_openapi::api::networking::v1::{
    IPBlock, NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicyPeer,
    NetworkPolicyPort, NetworkPolicySpec,
};
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
pub use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
pub use kube::{
    api::{Api, ListParams, ObjectMeta, Resource, ResourceExt},
    Client,
};

/// Canonical identifier of a NetworkPolicy within the controller.
pub fn policy_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}
