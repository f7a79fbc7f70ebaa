//! The compiled NetworkPolicy object and the top-level add/delete flows.
//!
//! A policy participates in three global events (create, delete, namespace
//! log-level update, all keyed through the policy registry) and two local
//! event streams owned by its watchers (local pods, peer namespaces).
//! Deleting conflicts with everything else, so cleanup takes the policy's
//! write lock, flags `deleted`, and only then tears resources down; every
//! handler takes the read lock and returns immediately once the flag is
//! set. The allowed lock order is namespace lock, then the registry key
//! lock, then the policy RW-lock; the write lock is dropped before watchers
//! start because their initial sync takes the read lock.

use crate::gress::GressPolicy;
use crate::locked_map::KeyGuard;
use crate::Controller;
use ahash::AHashMap as HashMap;
use anyhow::{anyhow, bail, Context, Result};
use ovn_policy_controller_core::{
    policy_port_group_name, Acl, AclDirection, AclLogging, NbOp, PortGroup,
};
use ovn_policy_controller_k8s_api::{self as k8s, ResourceExt, WatchHandle};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

pub(crate) struct NetworkPolicy {
    pub(crate) name: String,
    pub(crate) namespace: String,
    pub(crate) is_ingress: bool,
    pub(crate) is_egress: bool,
    pub(crate) state: RwLock<PolicyState>,
    /// Watcher registrations, touched only by create and cleanup, both of
    /// which run under the registry key lock.
    pub(crate) handlers: parking_lot::Mutex<PolicyHandlers>,
}

#[derive(Default)]
pub(crate) struct PolicyState {
    /// Set before any resource belonging to the policy is destroyed; read
    /// under the read lock by every handler.
    pub(crate) deleted: bool,
    pub(crate) ingress: Vec<Arc<GressPolicy>>,
    pub(crate) egress: Vec<Arc<GressPolicy>>,
    pub(crate) port_group_name: String,
    /// port name -> port UUID of pods successfully installed in both the
    /// per-policy port group and the applicable deny groups. Concurrent pod
    /// handlers mutate this under the policy *read* lock, hence the mutex.
    pub(crate) local_pods: parking_lot::Mutex<HashMap<String, String>>,
    /// Address-set keys to release on cleanup, in ensure order. Shrinks
    /// monotonically during cleanup: releases run from index 0 and the
    /// unreleased tail is retained on failure so a retry resumes there.
    pub(crate) peer_address_sets: Vec<String>,
}

#[derive(Default)]
pub(crate) struct PolicyHandlers {
    pub(crate) local_pods: Option<WatchHandle>,
    pub(crate) peer_namespaces: Vec<WatchHandle>,
}

// === impl NetworkPolicy ===

impl NetworkPolicy {
    pub(crate) fn new(namespace: String, name: String, spec: &k8s::NetworkPolicySpec) -> Self {
        let (is_ingress, is_egress) = policy_types(spec);
        Self {
            name,
            namespace,
            is_ingress,
            is_egress,
            state: RwLock::new(PolicyState::default()),
            handlers: parking_lot::Mutex::new(PolicyHandlers::default()),
        }
    }

    pub(crate) fn key(&self) -> String {
        k8s::policy_key(&self.namespace, &self.name)
    }

    /// Owner identity handed to the address-set registry.
    pub(crate) fn owner_key(&self) -> String {
        format!("NetworkPolicy/{}/{}", self.namespace, self.name)
    }
}

/// Whether the policy isolates for ingress and/or egress. Policies that do
/// not enumerate their types affect ingress, and egress only when they carry
/// an egress section.
fn policy_types(spec: &k8s::NetworkPolicySpec) -> (bool, bool) {
    match &spec.policy_types {
        Some(types) => (
            types.iter().any(|t| t == "Ingress"),
            types.iter().any(|t| t == "Egress"),
        ),
        None => (true, spec.egress.is_some()),
    }
}

fn metadata(policy: &k8s::NetworkPolicy) -> Result<(String, String)> {
    let namespace = policy
        .namespace()
        .ok_or_else(|| anyhow!("network policy without a namespace"))?;
    let name = policy
        .metadata
        .name
        .clone()
        .ok_or_else(|| anyhow!("network policy without a name"))?;
    Ok((namespace, name))
}

// === impl Controller: policy reconciliation ===

impl Controller {
    /// Compiles and applies a NetworkPolicy. Retriable: when a previous
    /// incarnation exists under the same key it is cleaned up first, and a
    /// failed create is cleaned up before the error propagates.
    pub async fn add_network_policy(&self, policy: &k8s::NetworkPolicy) -> Result<()> {
        let (namespace, name) = metadata(policy)?;
        let np_key = k8s::policy_key(&namespace, &name);
        info!(policy = %np_key, "Adding network policy");
        self.metrics.record_policy_event("add");

        // Snapshot the namespace's log levels without holding its lock
        // across the whole create; drift is reconciled at the end.
        let record = self
            .namespaces
            .get(&namespace)
            .ok_or_else(|| anyhow!("namespace {} does not exist", namespace))?;
        let acl_logging = record.info.lock().await.acl_logging;
        drop(record);

        let np = match self.create_network_policy(policy, &acl_logging).await {
            Ok(np) => np,
            Err(error) => {
                // Try to clean up straight away; the event framework retries
                // the add either way.
                info!(policy = %np_key, "Create network policy failed, cleaning up");
                let guard = self.network_policies.lock(&np_key).await;
                match guard.load() {
                    None => info!(policy = %np_key, "Policy already deleted"),
                    Some(np) => {
                        if let Err(cleanup_error) = self.cleanup_network_policy(&guard, np).await {
                            info!(policy = %np_key, %cleanup_error, "Cleanup after failed create returned an error");
                        }
                    }
                }
                return Err(error.context(format!("failed to create network policy {}", np_key)));
            }
        };

        // Re-lock the namespace: if the log levels drifted from the snapshot
        // used during compilation, rewrite them, then subscribe to future
        // namespace updates.
        let record = self.namespaces.get(&namespace).ok_or_else(|| {
            anyhow!(
                "unable to get namespace at the end of network policy {} creation",
                np_key
            )
        })?;
        let mut info = record.info.lock().await;
        if info.acl_logging.deny != acl_logging.deny {
            self.update_acl_logging_for_default_acls(&namespace, &info.acl_logging)
                .await
                .with_context(|| format!("update of default deny ACLs failed for {}", np_key))?;
        }
        if info.acl_logging.allow != acl_logging.allow {
            self.update_acl_logging_for_policy(&np, &info.acl_logging)
                .await
                .with_context(|| format!("update of policy ACLs failed for {}", np_key))?;
        }
        info.related_network_policies.insert(np_key);
        Ok(())
    }

    /// Removes a policy. Only the namespace and name are significant.
    pub async fn delete_network_policy(&self, namespace: &str, name: &str) -> Result<()> {
        let np_key = k8s::policy_key(namespace, name);
        info!(policy = %np_key, "Deleting network policy");
        self.metrics.record_policy_event("delete");

        // Unsubscribe from namespace updates first; the namespace lock must
        // not be held while the registry key is.
        if let Some(record) = self.namespaces.get(namespace) {
            record
                .info
                .lock()
                .await
                .related_network_policies
                .remove(&np_key);
        }

        let guard = self.network_policies.lock(&np_key).await;
        match guard.load() {
            None => {
                info!(policy = %np_key, "Deleting policy that is already deleted");
                Ok(())
            }
            Some(np) => self
                .cleanup_network_policy(&guard, np)
                .await
                .with_context(|| format!("deleting policy {} failed", np_key)),
        }
    }

    /// Creates the policy's resources. Must run under the registry key lock
    /// for `policy`'s key (callers go through [`add_network_policy`]).
    ///
    /// Allow ACLs must apply before deny does, to avoid disrupting existing
    /// connections: peers compile and peer-namespace watchers start before
    /// the local-pod watcher installs any port in the deny groups.
    async fn create_network_policy(
        &self,
        policy: &k8s::NetworkPolicy,
        acl_logging: &AclLogging,
    ) -> Result<Arc<NetworkPolicy>> {
        let (namespace, name) = metadata(policy)?;
        let np_key = k8s::policy_key(&namespace, &name);
        let spec = policy.spec.clone().unwrap_or_default();

        let guard = self.network_policies.lock(&np_key).await;
        if let Some(old) = guard.load() {
            self.cleanup_network_policy(&guard, old)
                .await
                .context("cleanup for retrying network policy create failed")?;
        }
        let (np, existed) =
            guard.load_or_store(|| NetworkPolicy::new(namespace.clone(), name.clone(), &spec));
        if existed {
            // Successful cleanup removes the entry; reaching this means the
            // registry is inconsistent and this attempt cannot proceed.
            bail!("network policy {} still present after cleanup", np_key);
        }

        let mut state = np.state.write().await;

        let stateless = self.config.enable_stateless_netpol
            && policy
                .annotations()
                .get(crate::STATELESS_ACL_ANNOTATION)
                .map(|v| v == "true")
                .unwrap_or(false);

        // Compile every rule; peers that need a namespace-selector watcher
        // are deferred until the write lock can be dropped.
        let mut deferred: Vec<(Arc<GressPolicy>, k8s::LabelSelector)> = Vec::new();
        for (i, rule) in spec.ingress.iter().flatten().enumerate() {
            let mut gress = GressPolicy::new(
                AclDirection::Ingress,
                i,
                &np.namespace,
                &np.name,
                &self.config,
                stateless,
            );
            for port in rule.ports.iter().flatten() {
                gress.add_port_policy(port);
            }
            let mut selectors = Vec::new();
            for peer in rule.from.iter().flatten() {
                if let Some(selector) = self
                    .setup_gress_peer(&np, &mut state, &mut gress, peer)
                    .await?
                {
                    selectors.push(selector);
                }
            }
            let gress = Arc::new(gress);
            state.ingress.push(gress.clone());
            deferred.extend(selectors.into_iter().map(|sel| (gress.clone(), sel)));
        }
        for (i, rule) in spec.egress.iter().flatten().enumerate() {
            let mut gress = GressPolicy::new(
                AclDirection::Egress,
                i,
                &np.namespace,
                &np.name,
                &self.config,
                stateless,
            );
            for port in rule.ports.iter().flatten() {
                gress.add_port_policy(port);
            }
            let mut selectors = Vec::new();
            for peer in rule.to.iter().flatten() {
                if let Some(selector) = self
                    .setup_gress_peer(&np, &mut state, &mut gress, peer)
                    .await?
                {
                    selectors.push(selector);
                }
            }
            let gress = Arc::new(gress);
            state.egress.push(gress.clone());
            deferred.extend(selectors.into_iter().map(|sel| (gress.clone(), sel)));
        }

        // Join the shared default-deny record. No ports are installed yet,
        // so ordering before the per-policy port group is safe.
        self.add_policy_to_default_port_groups(&np, acl_logging)
            .await?;

        // Build the per-policy port group with every compiled ACL in one
        // transaction. Local pods join the group later, via the watcher.
        let (pg_name, readable_name) = policy_port_group_name(&np.namespace, &np.name);
        state.port_group_name = pg_name.clone();
        let acls = build_network_policy_acls(&state, acl_logging);
        let mut ops = Vec::new();
        if !acls.is_empty() {
            ops.push(NbOp::CreateOrUpdateAcls(acls.clone()));
        }
        ops.push(NbOp::CreateOrUpdatePortGroups(vec![PortGroup::new(
            pg_name,
            readable_name,
            vec![],
            &acls,
        )]));
        self.nb
            .transact(ops)
            .await
            .context("failed to create policy port group and ACLs")?;

        // Watchers take the read lock in their initial sync; holding the
        // write lock across their start would self-deadlock.
        drop(state);

        for (gress, selector) in deferred {
            self.add_peer_namespace_handler(&np, gress, &selector)
                .await
                .context("failed to start peer namespace handler")?;
        }
        self.add_local_pod_handler(policy, &np)
            .await
            .context("failed to start local pod handler")?;

        Ok(np)
    }

    /// Tears down everything the policy owns. Idempotent and retriable; the
    /// registry entry is removed last, as the signal of full success. Must
    /// run under the registry key lock held by `guard`.
    pub(crate) async fn cleanup_network_policy(
        &self,
        guard: &KeyGuard<'_, NetworkPolicy>,
        np: Arc<NetworkPolicy>,
    ) -> Result<()> {
        info!(policy = %np.key(), "Cleaning up network policy");
        let mut state = np.state.write().await;

        // Signal in-flight handlers to no-op before anything is destroyed.
        state.deleted = true;

        {
            let mut handlers = np.handlers.lock();
            if let Some(handle) = handlers.local_pods.take() {
                handle.stop();
            }
            for handle in handlers.peer_namespaces.drain(..) {
                handle.stop();
            }
        }

        // Release peer address sets in ensure order. On failure, keep the
        // unreleased tail so the retry resumes where this attempt stopped.
        let keys = std::mem::take(&mut state.peer_address_sets);
        for (i, key) in keys.iter().enumerate() {
            if let Err(error) = self.address_sets.delete_address_set(key, &np.owner_key()).await {
                state.peer_address_sets = keys[i..].to_vec();
                return Err(error)
                    .with_context(|| format!("failed to release peer address set {}", key));
            }
        }

        // Drop the port group and the policy's deny-group references in one
        // transaction.
        let mut ops = Vec::new();
        if !state.port_group_name.is_empty() {
            ops.push(NbOp::DeletePortGroups(vec![state.port_group_name.clone()]));
        }
        self.deny_pg_delete_ports(&np, &state, None, true, ops)
            .await
            .context("unable to delete ports from default deny port groups")?;
        state.local_pods.lock().clear();

        self.del_policy_from_default_port_groups(&np)
            .await
            .context("unable to leave default deny port groups")?;

        guard.remove();
        Ok(())
    }
}

/// Every allow ACL the policy's rules currently produce.
pub(crate) fn build_network_policy_acls(
    state: &PolicyState,
    acl_logging: &AclLogging,
) -> Vec<Acl> {
    let mut acls = Vec::new();
    for gress in state.ingress.iter().chain(state.egress.iter()) {
        let (current, _) = gress.build_local_pod_acls(&state.port_group_name, acl_logging);
        acls.extend(current);
    }
    acls
}
