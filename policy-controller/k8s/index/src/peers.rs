//! Peer compilation and peer-namespace events.
//!
//! A rule's peers either contribute IPBlock match fragments, reference an
//! address set ensured up front (pod selectors and the policy's own
//! namespace), or require a namespace watcher: the rule then owns a union
//! address set whose membership follows the namespaces matching the peer's
//! selector. Namespace events mutate the union through the registry and
//! rebuild the rule's ACLs only when membership actually changed.

use crate::gress::GressPolicy;
use crate::policy::{NetworkPolicy, PolicyState};
use crate::{Controller, Errors};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ovn_policy_controller_core::{AclLogging, NbOp};
use ovn_policy_controller_k8s_api::{self as k8s, labels, EventHandler};
use std::sync::Arc;
use tracing::warn;

impl Controller {
    /// Compiles one peer into `gress`. Returns the namespace selector when
    /// the peer needs a watcher, which the caller starts after releasing
    /// the policy write lock.
    pub(crate) async fn setup_gress_peer(
        &self,
        np: &NetworkPolicy,
        state: &mut PolicyState,
        gress: &mut GressPolicy,
        peer: &k8s::NetworkPolicyPeer,
    ) -> Result<Option<k8s::LabelSelector>> {
        if let Some(block) = &peer.ip_block {
            gress.add_ip_block(block)?;
            return Ok(None);
        }
        if peer.pod_selector.is_none() && peer.namespace_selector.is_none() {
            // Validation upstream should reject this; compile to nothing.
            warn!(policy = %np.key(), "Peer with no selector and no ipBlock, ignoring");
            return Ok(None);
        }
        gress.has_peer_selector = true;

        let pod_selector = peer.pod_selector.clone().unwrap_or_default();
        let selects_all_pods = labels::selects_all(&pod_selector);

        match &peer.namespace_selector {
            // All pods of the policy's own namespace: its address set is
            // maintained by namespace handling, only its name is needed.
            None if selects_all_pods => {
                gress.add_peer_address_sets(&self.address_sets.namespace_address_set(&np.namespace));
                Ok(None)
            }

            // All pods of selected namespaces: the rule's union set,
            // maintained by a peer-namespace watcher. An empty namespace
            // selector means every namespace and is handled below through
            // the pod-selector registry instead.
            Some(namespace_selector) if selects_all_pods && !labels::selects_all(namespace_selector) => {
                if gress.peer_namespaces_key().is_none() {
                    let (key, res) = self
                        .address_sets
                        .ensure_peer_namespaces_address_set(
                            &np.namespace,
                            &np.name,
                            gress.direction,
                            gress.idx,
                            &np.owner_key(),
                        )
                        .await;
                    // Record the key before the error check: a failed ensure
                    // may have left partial state that cleanup must release.
                    state.peer_address_sets.push(key.clone());
                    let handles = res
                        .with_context(|| format!("failed to ensure peer namespaces set {}", key))?;
                    gress.set_peer_namespaces_set(key, handles);
                }
                Ok(Some(namespace_selector.clone()))
            }

            // A real pod selector (or an all-namespaces scope): a shared
            // pod-selector set kept current by the registry.
            namespace_selector => {
                let (key, res) = self
                    .address_sets
                    .ensure_pod_selector_address_set(
                        &pod_selector,
                        namespace_selector.as_ref(),
                        &np.namespace,
                        &np.owner_key(),
                    )
                    .await;
                state.peer_address_sets.push(key.clone());
                let handles = res
                    .with_context(|| format!("failed to ensure pod selector address set {}", key))?;
                gress.add_peer_address_sets(&handles);
                Ok(None)
            }
        }
    }

    /// Merges namespaces into a rule's union set. Per-namespace failures
    /// aggregate; ACLs rebuild once if anything changed.
    pub(crate) async fn handle_peer_namespace_add(
        &self,
        np: &NetworkPolicy,
        gress: &Arc<GressPolicy>,
        namespaces: &[k8s::Namespace],
    ) -> Result<()> {
        self.metrics.record_peer_namespace_event("add");
        let mut updated = false;
        let mut errors = Vec::new();
        {
            let state = np.state.read().await;
            if state.deleted {
                return Ok(());
            }
            let key = gress
                .peer_namespaces_key()
                .ok_or_else(|| anyhow!("peer namespace event for a rule with no union set"))?;
            for namespace in namespaces {
                let Some(name) = namespace.metadata.name.as_deref() else {
                    continue;
                };
                if !gress.add_namespace(name) {
                    continue;
                }
                match self.address_sets.add_namespace_addresses(&key, name).await {
                    Ok(()) => updated = true,
                    Err(error) => {
                        // Roll the membership back so a retry re-attempts
                        // the registry call.
                        gress.remove_namespace(name);
                        errors.push(error.context(format!("adding namespace {} to {}", name, key)));
                    }
                }
            }
        }
        // The read lock must be released before peer_namespace_update:
        // it re-locks namespace-then-policy.
        if updated {
            if let Err(error) = self.peer_namespace_update(np, gress).await {
                errors.push(error);
            }
        }
        Errors::ok_if_empty(errors)
    }

    /// Removes namespaces from a rule's union set.
    pub(crate) async fn handle_peer_namespace_delete(
        &self,
        np: &NetworkPolicy,
        gress: &Arc<GressPolicy>,
        namespaces: &[k8s::Namespace],
    ) -> Result<()> {
        self.metrics.record_peer_namespace_event("delete");
        let mut updated = false;
        let mut errors = Vec::new();
        {
            let state = np.state.read().await;
            if state.deleted {
                return Ok(());
            }
            let key = gress
                .peer_namespaces_key()
                .ok_or_else(|| anyhow!("peer namespace event for a rule with no union set"))?;
            for namespace in namespaces {
                let Some(name) = namespace.metadata.name.as_deref() else {
                    continue;
                };
                if !gress.remove_namespace(name) {
                    continue;
                }
                match self
                    .address_sets
                    .remove_namespace_addresses(&key, name)
                    .await
                {
                    Ok(()) => updated = true,
                    Err(error) => {
                        gress.add_namespace(name);
                        errors
                            .push(error.context(format!("removing namespace {} from {}", name, key)));
                    }
                }
            }
        }
        if updated {
            if let Err(error) = self.peer_namespace_update(np, gress).await {
                errors.push(error);
            }
        }
        Errors::ok_if_empty(errors)
    }

    /// Rebuilds one rule's ACLs after its peer state changed, adding the
    /// current set to the policy port group and dropping the stale set, in
    /// one transaction.
    ///
    /// Locks strictly namespace-then-policy; callers must hold neither.
    pub(crate) async fn peer_namespace_update(
        &self,
        np: &NetworkPolicy,
        gress: &Arc<GressPolicy>,
    ) -> Result<()> {
        // The namespace lock is taken first so a concurrent log-level update
        // cannot interleave between reading the levels and writing ACLs.
        let record = self.namespaces.get(&np.namespace);
        let (acl_logging, _info_guard) = match &record {
            None => (AclLogging::default(), None),
            Some(record) => {
                let info = record.info.lock().await;
                (info.acl_logging, Some(info))
            }
        };

        let state = np.state.read().await;
        if state.deleted {
            return Ok(());
        }
        let (current, removed) = gress.build_local_pod_acls(&state.port_group_name, &acl_logging);
        let mut ops = Vec::new();
        if !current.is_empty() {
            ops.push(NbOp::CreateOrUpdateAcls(current.clone()));
            ops.push(NbOp::add_acls_to_port_group(
                state.port_group_name.clone(),
                &current,
            ));
        }
        if !removed.is_empty() {
            ops.push(NbOp::delete_acls_from_port_group(
                state.port_group_name.clone(),
                &removed,
            ));
        }
        if ops.is_empty() {
            return Ok(());
        }
        self.nb
            .transact(ops)
            .await
            .context("failed to update peer ACLs")
    }

    /// Starts a watcher over the namespaces a peer selects. The initial
    /// sync merges every currently matching namespace.
    pub(crate) async fn add_peer_namespace_handler(
        &self,
        np: &Arc<NetworkPolicy>,
        gress: Arc<GressPolicy>,
        selector: &k8s::LabelSelector,
    ) -> Result<()> {
        let handler = Arc::new(PeerNamespaceEvents {
            controller: self.strong_ref(),
            np: np.clone(),
            gress,
        });
        let handle = self
            .namespace_watches
            .watch_filtered(None, selector, handler)
            .await?;
        np.handlers.lock().peer_namespaces.push(handle);
        Ok(())
    }
}

/// Callbacks of one rule's peer-namespace watcher.
struct PeerNamespaceEvents {
    controller: Arc<Controller>,
    np: Arc<NetworkPolicy>,
    gress: Arc<GressPolicy>,
}

#[async_trait]
impl EventHandler<k8s::Namespace> for PeerNamespaceEvents {
    async fn sync(&self, namespaces: Vec<k8s::Namespace>) -> Result<()> {
        if let Err(error) = self
            .controller
            .handle_peer_namespace_add(&self.np, &self.gress, &namespaces)
            .await
        {
            warn!(policy = %self.np.key(), %error, "Initial namespace sync left peers to retry");
        }
        Ok(())
    }

    async fn add(&self, namespace: k8s::Namespace) -> Result<()> {
        self.controller
            .handle_peer_namespace_add(&self.np, &self.gress, std::slice::from_ref(&namespace))
            .await
    }

    async fn delete(&self, namespace: k8s::Namespace) -> Result<()> {
        self.controller
            .handle_peer_namespace_delete(&self.np, &self.gress, std::slice::from_ref(&namespace))
            .await
    }
}
