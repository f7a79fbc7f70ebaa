//! The address-set registry contract.
//!
//! Address sets are owned and lifecycle-managed externally; the controller
//! holds opaque keys for release and hashed set names for ACL match text.
//! Ensure operations are idempotent and deletes are reference-counted by
//! owner, so a policy can be torn down and retried without leaking sets
//! shared with other policies.

use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use ovn_policy_controller_core::AclDirection;

/// Hashed IPv4/IPv6 set names, referenced from match expressions as
/// `$<name>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressSetHandles {
    pub v4: String,
    pub v6: String,
}

#[async_trait]
pub trait AddressSetFactory: Send + Sync + 'static {
    /// Ensures the shared address set tracking the pods matched by
    /// `pod_selector` (scoped by `namespace_selector`, or to
    /// `policy_namespace` when absent). The registry keeps the set in step
    /// with cluster membership.
    ///
    /// The release key is returned even when ensure fails, so callers can
    /// record it for cleanup before checking the error: a partially ensured
    /// set must still be released.
    async fn ensure_pod_selector_address_set(
        &self,
        pod_selector: &LabelSelector,
        namespace_selector: Option<&LabelSelector>,
        policy_namespace: &str,
        owner: &str,
    ) -> (String, Result<AddressSetHandles>);

    /// Ensures the per-rule union set for a namespace-selector peer. The set
    /// starts empty; the caller's peer-namespace watcher maintains its
    /// membership through [`add_namespace_addresses`] and
    /// [`remove_namespace_addresses`]. The key is returned even on failure,
    /// as with [`ensure_pod_selector_address_set`].
    ///
    /// [`add_namespace_addresses`]: AddressSetFactory::add_namespace_addresses
    /// [`remove_namespace_addresses`]: AddressSetFactory::remove_namespace_addresses
    /// [`ensure_pod_selector_address_set`]: AddressSetFactory::ensure_pod_selector_address_set
    async fn ensure_peer_namespaces_address_set(
        &self,
        policy_namespace: &str,
        policy_name: &str,
        direction: AclDirection,
        gress_index: usize,
        owner: &str,
    ) -> (String, Result<AddressSetHandles>);

    /// Merges the addresses of every pod in `namespace` into the union set
    /// identified by `key`.
    async fn add_namespace_addresses(&self, key: &str, namespace: &str) -> Result<()>;

    async fn remove_namespace_addresses(&self, key: &str, namespace: &str) -> Result<()>;

    /// Handles of a namespace's own address set, maintained by namespace
    /// lifecycle handling. Pure name derivation; the set is not created here.
    fn namespace_address_set(&self, namespace: &str) -> AddressSetHandles;

    /// Releases one ownership reference on the set identified by `key`. The
    /// set is destroyed when its last owner releases it.
    async fn delete_address_set(&self, key: &str, owner: &str) -> Result<()>;
}
