//! In-memory logical-port cache.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ovn_policy_controller_core::{logical_port_name, LogicalPortCache, PortInfo};
use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct MemPortCache {
    ports: Mutex<BTreeMap<(String, String), PortInfo>>,
}

// === impl MemPortCache ===

impl MemPortCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, namespace: &str, pod: &str, uuid: &str) {
        self.ports.lock().insert(
            (namespace.to_string(), pod.to_string()),
            PortInfo {
                name: logical_port_name(namespace, pod),
                uuid: uuid.to_string(),
                pending_delete: false,
            },
        );
    }

    /// Marks the pod's port as scheduled for removal; lookups succeed but
    /// carry the pending-delete marker.
    pub fn mark_pending_delete(&self, namespace: &str, pod: &str) {
        if let Some(info) = self
            .ports
            .lock()
            .get_mut(&(namespace.to_string(), pod.to_string()))
        {
            info.pending_delete = true;
        }
    }

    pub fn clear_pending_delete(&self, namespace: &str, pod: &str) {
        if let Some(info) = self
            .ports
            .lock()
            .get_mut(&(namespace.to_string(), pod.to_string()))
        {
            info.pending_delete = false;
        }
    }

    pub fn remove(&self, namespace: &str, pod: &str) {
        self.ports
            .lock()
            .remove(&(namespace.to_string(), pod.to_string()));
    }
}

#[async_trait]
impl LogicalPortCache for MemPortCache {
    async fn get(&self, namespace: &str, pod: &str) -> Result<PortInfo> {
        self.ports
            .lock()
            .get(&(namespace.to_string(), pod.to_string()))
            .cloned()
            .ok_or_else(|| anyhow!("no logical port cached for pod {}/{}", namespace, pod))
    }
}
