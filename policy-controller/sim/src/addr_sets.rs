//! In-memory address-set registry.
//!
//! Tracks ensured sets with their owner references and, for peer-namespace
//! union sets, their namespace membership. Tests preload per-namespace pod
//! addresses and assert on the effective membership of a union set; they can
//! also inject one-shot release failures to exercise cleanup retry.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use ovn_policy_controller_core::{hashed_name, AclDirection};
use ovn_policy_controller_k8s_api::labels;
use ovn_policy_controller_k8s_api::{AddressSetFactory, AddressSetHandles};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, Default)]
struct SetRow {
    owners: BTreeSet<String>,
    /// Namespaces merged into a peer-namespaces union set.
    namespaces: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct State {
    sets: BTreeMap<String, SetRow>,
    namespace_addresses: BTreeMap<String, BTreeSet<String>>,
    fail_next_delete: BTreeSet<String>,
    fail_next_ensure: bool,
}

#[derive(Debug, Default)]
pub struct MemAddressSets {
    state: Mutex<State>,
}

fn handles_for(key: &str) -> AddressSetHandles {
    AddressSetHandles {
        v4: hashed_name(&format!("{}_v4", key)),
        v6: hashed_name(&format!("{}_v6", key)),
    }
}

// === impl MemAddressSets ===

impl MemAddressSets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preloads the pod addresses attributed to a namespace.
    pub fn set_namespace_addresses(
        &self,
        namespace: &str,
        addresses: impl IntoIterator<Item = impl Into<String>>,
    ) {
        self.state.lock().namespace_addresses.insert(
            namespace.to_string(),
            addresses.into_iter().map(Into::into).collect(),
        );
    }

    /// The next release of `key` fails once.
    pub fn fail_next_delete(&self, key: &str) {
        self.state.lock().fail_next_delete.insert(key.to_string());
    }

    /// The next ensure fails once; the key is still handed out, mirroring a
    /// registry that partially created the set.
    pub fn fail_next_ensure(&self) {
        self.state.lock().fail_next_ensure = true;
    }

    /// Keys of sets that currently exist.
    pub fn live_keys(&self) -> BTreeSet<String> {
        self.state.lock().sets.keys().cloned().collect()
    }

    /// Effective membership of a union set: the addresses of every namespace
    /// merged into it.
    pub fn addresses(&self, key: &str) -> Option<BTreeSet<String>> {
        let state = self.state.lock();
        let row = state.sets.get(key)?;
        Some(
            row.namespaces
                .iter()
                .flat_map(|ns| state.namespace_addresses.get(ns).into_iter().flatten())
                .cloned()
                .collect(),
        )
    }

    pub fn namespaces_in(&self, key: &str) -> Option<BTreeSet<String>> {
        self.state
            .lock()
            .sets
            .get(key)
            .map(|row| row.namespaces.clone())
    }

    fn ensure(&self, key: String, owner: &str) -> (String, Result<AddressSetHandles>) {
        let mut state = self.state.lock();
        if state.fail_next_ensure {
            state.fail_next_ensure = false;
            // The row is created anyway: a failed ensure may have left
            // partial state behind, which is exactly what release cleans up.
            state
                .sets
                .entry(key.clone())
                .or_default()
                .owners
                .insert(owner.to_string());
            return (key, Err(anyhow!("injected ensure failure")));
        }
        let row = state.sets.entry(key.clone()).or_default();
        row.owners.insert(owner.to_string());
        let handles = handles_for(&key);
        (key, Ok(handles))
    }
}

#[async_trait]
impl AddressSetFactory for MemAddressSets {
    async fn ensure_pod_selector_address_set(
        &self,
        pod_selector: &LabelSelector,
        namespace_selector: Option<&LabelSelector>,
        policy_namespace: &str,
        owner: &str,
    ) -> (String, Result<AddressSetHandles>) {
        // The key must be identical for every policy sharing the same
        // selector pair, so it is derived from the canonical query form.
        let pods = labels::to_query(pod_selector).unwrap_or_default();
        let key = match namespace_selector {
            Some(nss) => {
                let namespaces = labels::to_query(nss).unwrap_or_default();
                format!("PodSelector:cluster:[{}]:[{}]", pods, namespaces)
            }
            None => format!("PodSelector:{}:[{}]", policy_namespace, pods),
        };
        self.ensure(key, owner)
    }

    async fn ensure_peer_namespaces_address_set(
        &self,
        policy_namespace: &str,
        policy_name: &str,
        direction: AclDirection,
        gress_index: usize,
        owner: &str,
    ) -> (String, Result<AddressSetHandles>) {
        let key = format!(
            "PeerNamespaces:{}:{}:{}:{}",
            policy_namespace, policy_name, direction, gress_index,
        );
        self.ensure(key, owner)
    }

    async fn add_namespace_addresses(&self, key: &str, namespace: &str) -> Result<()> {
        let mut state = self.state.lock();
        let row = state
            .sets
            .get_mut(key)
            .ok_or_else(|| anyhow!("address set {} does not exist", key))?;
        row.namespaces.insert(namespace.to_string());
        Ok(())
    }

    async fn remove_namespace_addresses(&self, key: &str, namespace: &str) -> Result<()> {
        let mut state = self.state.lock();
        let row = state
            .sets
            .get_mut(key)
            .ok_or_else(|| anyhow!("address set {} does not exist", key))?;
        row.namespaces.remove(namespace);
        Ok(())
    }

    fn namespace_address_set(&self, namespace: &str) -> AddressSetHandles {
        handles_for(&format!("Namespace:{}", namespace))
    }

    async fn delete_address_set(&self, key: &str, owner: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_next_delete.remove(key) {
            bail!("injected release failure for {}", key);
        }
        if let Some(row) = state.sets.get_mut(key) {
            row.owners.remove(owner);
            if row.owners.is_empty() {
                state.sets.remove(key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_is_idempotent_and_delete_is_ref_counted() {
        let sets = MemAddressSets::new();
        let sel = LabelSelector::default();
        let (key1, res1) = sets
            .ensure_pod_selector_address_set(&sel, None, "ns1", "NetworkPolicy/ns1/p1")
            .await;
        let (key2, res2) = sets
            .ensure_pod_selector_address_set(&sel, None, "ns1", "NetworkPolicy/ns1/p2")
            .await;
        assert_eq!(key1, key2);
        assert_eq!(res1.unwrap(), res2.unwrap());

        sets.delete_address_set(&key1, "NetworkPolicy/ns1/p1")
            .await
            .unwrap();
        assert!(sets.live_keys().contains(&key1));
        sets.delete_address_set(&key1, "NetworkPolicy/ns1/p2")
            .await
            .unwrap();
        assert!(sets.live_keys().is_empty());
    }

    #[tokio::test]
    async fn union_membership_follows_namespaces() {
        let sets = MemAddressSets::new();
        sets.set_namespace_addresses("prod-1", ["10.0.1.1", "10.0.1.2"]);
        sets.set_namespace_addresses("prod-2", ["10.0.2.1"]);

        let (key, res) = sets
            .ensure_peer_namespaces_address_set("ns1", "p1", AclDirection::Ingress, 0, "owner")
            .await;
        res.unwrap();
        sets.add_namespace_addresses(&key, "prod-1").await.unwrap();
        sets.add_namespace_addresses(&key, "prod-2").await.unwrap();
        let addrs = sets.addresses(&key).unwrap();
        assert!(addrs.contains("10.0.1.2") && addrs.contains("10.0.2.1"));

        sets.remove_namespace_addresses(&key, "prod-1")
            .await
            .unwrap();
        assert_eq!(sets.addresses(&key).unwrap().len(), 1);
    }
}
