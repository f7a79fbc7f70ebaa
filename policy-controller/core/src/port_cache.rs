use anyhow::Result;
use async_trait::async_trait;

/// A pod's logical switch port as known by the port cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    pub uuid: String,
    /// Set when the port is scheduled for removal (e.g. a stateful-set pod
    /// being replaced). Such ports must not be added to port groups; callers
    /// surface them as retryable errors instead.
    pub pending_delete: bool,
}

/// Name of the logical switch port backing a pod.
pub fn logical_port_name(namespace: &str, pod: &str) -> String {
    format!("{}_{}", namespace, pod)
}

/// Lookup of pod logical ports, maintained elsewhere by pod lifecycle
/// handling.
#[async_trait]
pub trait LogicalPortCache: Send + Sync + 'static {
    /// Fails when the pod has no cached port yet; callers treat that as
    /// retryable.
    async fn get(&self, namespace: &str, pod: &str) -> Result<PortInfo>;
}
