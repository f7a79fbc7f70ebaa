//! Local-pod events: membership of selected pods in the per-policy and
//! default-deny port groups.
//!
//! One watcher per policy, filtered by the policy's pod selector and scoped
//! to its namespace. Handlers diff incoming pods against `localPods`, so
//! re-deliveries and retries are cheap no-ops; `localPods` is only updated
//! after the transaction installing the ports succeeds.

use crate::policy::{NetworkPolicy, PolicyState};
use crate::{Controller, Errors};
use ahash::AHashMap as HashMap;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ovn_policy_controller_core::{logical_port_name, NbOp};
use ovn_policy_controller_k8s_api::{self as k8s, EventHandler, ResourceExt};
use std::sync::Arc;
use tracing::{debug, warn};

/// Pods that can never obtain a logical port: not yet scheduled, running on
/// the host network, or already finished.
fn pod_expected_in_port_cache(pod: &k8s::Pod) -> bool {
    let scheduled = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.node_name.as_deref())
        .map(|node| !node.is_empty())
        .unwrap_or(false);
    if !scheduled {
        return false;
    }
    let host_network = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.host_network)
        .unwrap_or(false);
    if host_network {
        return false;
    }
    !matches!(
        pod.status
            .as_ref()
            .and_then(|status| status.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

impl Controller {
    /// Resolves port info for pods not yet tracked in `localPods`. Pods
    /// whose port lookup fails, or whose port is scheduled for deletion,
    /// are returned as per-pod errors for retry.
    async fn get_new_local_policy_ports(
        &self,
        np: &NetworkPolicy,
        state: &PolicyState,
        pods: &[k8s::Pod],
    ) -> (HashMap<String, String>, Vec<String>, Vec<anyhow::Error>) {
        let mut ports = HashMap::new();
        let mut uuids = Vec::with_capacity(pods.len());
        let mut errors = Vec::new();

        for pod in pods {
            let (Some(namespace), Some(name)) = (pod.namespace(), pod.metadata.name.clone())
            else {
                continue;
            };
            let port_name = logical_port_name(&namespace, &name);
            if state.local_pods.lock().contains_key(&port_name) {
                // Already installed for this policy.
                continue;
            }
            if !pod_expected_in_port_cache(pod) {
                continue;
            }

            let info = match self.port_cache.get(&namespace, &name).await {
                Ok(info) => info,
                Err(error) => {
                    warn!(
                        pod = %format_args!("{}/{}", namespace, name),
                        policy = %np.key(),
                        %error,
                        "Failed to get logical port for pod",
                    );
                    errors.push(anyhow!("unable to get port info for pod {}/{}", namespace, name));
                    continue;
                }
            };
            if info.pending_delete {
                warn!(port = %info.name, policy = %np.key(), "Stale logical port found in cache");
                errors.push(anyhow!("unable to get port info for pod {}/{}", namespace, name));
                continue;
            }

            debug!(port = %info.name, policy = %np.key(), "Fresh logical port found in cache");
            uuids.push(info.uuid.clone());
            ports.insert(info.name, info.uuid);
        }
        (ports, uuids, errors)
    }

    /// Port info for pods currently tracked in `localPods`.
    fn get_existing_local_policy_ports(
        &self,
        state: &PolicyState,
        pods: &[k8s::Pod],
    ) -> (HashMap<String, String>, Vec<String>) {
        let local_pods = state.local_pods.lock();
        let mut ports = HashMap::new();
        let mut uuids = Vec::with_capacity(pods.len());
        for pod in pods {
            let (Some(namespace), Some(name)) = (pod.namespace(), pod.metadata.name.clone())
            else {
                continue;
            };
            let port_name = logical_port_name(&namespace, &name);
            if let Some(uuid) = local_pods.get(&port_name) {
                uuids.push(uuid.clone());
                ports.insert(port_name, uuid.clone());
            }
        }
        (ports, uuids)
    }

    /// Installs newly selected pods in the per-policy port group and the
    /// applicable default-deny groups. Retriable; per-pod failures are
    /// aggregated so only the offending pods retry.
    pub(crate) async fn handle_local_pod_add(
        &self,
        np: &NetworkPolicy,
        pods: &[k8s::Pod],
    ) -> Result<()> {
        self.metrics.record_pod_event("add");
        let state = np.state.read().await;
        if state.deleted {
            return Ok(());
        }

        let (ports, uuids, errors) = self.get_new_local_policy_ports(np, &state, pods).await;
        if !ports.is_empty() {
            let mut ops = Vec::new();
            if !self.port_group_has_ports(&state.port_group_name, &uuids).await {
                ops.push(NbOp::AddPortsToPortGroup {
                    group: state.port_group_name.clone(),
                    ports: uuids,
                });
            }
            // deny_pg_add_ports submits the combined transaction and rolls
            // its counters back if submission fails.
            self.deny_pg_add_ports(np, &ports, ops)
                .await
                .context("unable to add new pods to default deny port groups")?;
            state.local_pods.lock().extend(ports);
        }

        Errors::ok_if_empty(errors)
    }

    /// Removes deselected or deleted pods from both port-group families.
    pub(crate) async fn handle_local_pod_delete(
        &self,
        np: &NetworkPolicy,
        pods: &[k8s::Pod],
    ) -> Result<()> {
        self.metrics.record_pod_event("delete");
        let state = np.state.read().await;
        if state.deleted {
            return Ok(());
        }

        let (ports, uuids) = self.get_existing_local_policy_ports(&state, pods);
        if !ports.is_empty() {
            let ops = vec![NbOp::DeletePortsFromPortGroup {
                group: state.port_group_name.clone(),
                ports: uuids,
            }];
            self.deny_pg_delete_ports(np, &state, Some(&ports), false, ops)
                .await
                .context("unable to delete pods from default deny port groups")?;
            let mut local_pods = state.local_pods.lock();
            for port_name in ports.keys() {
                local_pods.remove(port_name);
            }
        }
        Ok(())
    }

    /// True when the policy port group already holds every given port, in
    /// which case the membership op can be skipped.
    async fn port_group_has_ports(&self, group: &str, uuids: &[String]) -> bool {
        match self.nb.get_port_group(group).await {
            Ok(Some(record)) => uuids.iter().all(|uuid| record.ports.contains(uuid)),
            Ok(None) => false,
            Err(error) => {
                debug!(%group, %error, "Port group lookup failed, emitting membership op");
                false
            }
        }
    }

    /// Starts the policy's local-pod watcher. The initial sync installs all
    /// currently selected pods; its per-pod failures are left to the event
    /// framework's retry.
    pub(crate) async fn add_local_pod_handler(
        &self,
        policy: &k8s::NetworkPolicy,
        np: &Arc<NetworkPolicy>,
    ) -> Result<()> {
        let selector = policy
            .spec
            .as_ref()
            .map(|spec| spec.pod_selector.clone())
            .unwrap_or_default();
        let handler = Arc::new(LocalPodEvents {
            controller: self.strong_ref(),
            np: np.clone(),
        });
        let handle = self
            .pod_watches
            .watch_filtered(Some(&np.namespace), &selector, handler)
            .await?;
        np.handlers.lock().local_pods = Some(handle);
        Ok(())
    }
}

/// The per-policy pod watcher callbacks.
struct LocalPodEvents {
    controller: Arc<Controller>,
    np: Arc<NetworkPolicy>,
}

#[async_trait]
impl EventHandler<k8s::Pod> for LocalPodEvents {
    async fn sync(&self, pods: Vec<k8s::Pod>) -> Result<()> {
        // Handle the whole initial set in one transaction; pods that fail
        // individually are retried through their own add events.
        if let Err(error) = self.controller.handle_local_pod_add(&self.np, &pods).await {
            warn!(policy = %self.np.key(), %error, "Initial pod sync left pods to retry");
        }
        Ok(())
    }

    async fn add(&self, pod: k8s::Pod) -> Result<()> {
        self.controller
            .handle_local_pod_add(&self.np, std::slice::from_ref(&pod))
            .await
    }

    async fn delete(&self, pod: k8s::Pod) -> Result<()> {
        self.controller
            .handle_local_pod_delete(&self.np, std::slice::from_ref(&pod))
            .await
    }
}
