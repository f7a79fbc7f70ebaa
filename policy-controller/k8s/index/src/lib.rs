//! OVN NetworkPolicy compiler and reconciliation engine.
//!
//! The controller translates NetworkPolicy resources into northbound ACLs,
//! port groups, and address-set references:
//!
//! - Each namespace with at least one policy owns two *default-deny* port
//!   groups (ingress and egress) holding every pod selected by a policy of
//!   that direction. Membership is reference counted, since pods are shared
//!   by every policy in the namespace.
//! - Each policy owns a *per-policy* port group whose ACLs implement the
//!   policy's allow rules, one compiled [`gress::GressPolicy`] per rule.
//! - Peer pod/namespace selectors become address-set references kept in step
//!   with cluster membership by per-policy watchers.
//!
//! ```ignore
//! [NetworkPolicy] -> [gress rules] -> [per-policy PG + allow ACLs]
//!        |-> [local pod watcher]  -> [default-deny PGs (refcounted)]
//!        |-> [peer ns watchers]   -> [address sets]
//! ```
//!
//! Event streams for one policy are serialized by its RW-lock (handlers
//! read, cleanup writes and flags `deleted`); policies in one namespace
//! serialize default-deny mutations through a keyed lock on the namespace.
//! The allowed lock order is namespace lock, then policy key lock, then the
//! policy RW-lock; the default-deny store's keyed lock is independent and
//! never nests the others inside it.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod default_deny;
mod gress;
mod locked_map;
pub mod metrics;
mod namespaces;
mod peers;
mod pods;
mod policy;
mod sync;
pub mod watch;


use self::default_deny::DefaultDenyPortGroups;
use self::locked_map::LockedMap;
use self::metrics::Metrics;
use self::namespaces::Namespaces;
use self::policy::NetworkPolicy;
use ovn_policy_controller_core::{LogicalPortCache, NbClient};
use ovn_policy_controller_k8s_api::{self as k8s, AddressSetFactory, WatchFactory};
use std::sync::{Arc, Weak};

/// Annotation selecting stateless allow ACLs for a policy, honored when the
/// matching feature flag is enabled.
pub const STATELESS_ACL_ANNOTATION: &str = "k8s.ovn.org/acl-stateless";

/// Static controller configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Stamped into every owned row's external ids; rows from other
    /// controllers are invisible to predicate search and sync.
    pub controller_name: String,
    pub ipv4_mode: bool,
    pub ipv6_mode: bool,
    /// Honor [`STATELESS_ACL_ANNOTATION`] on policies.
    pub enable_stateless_netpol: bool,
    /// The cluster-wide port group carrying the hairpin-allow ACLs.
    pub cluster_port_group: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controller_name: "default".to_string(),
            ipv4_mode: true,
            ipv6_mode: false,
            enable_stateless_netpol: false,
            cluster_port_group: "clusterPortGroup".to_string(),
        }
    }
}

/// The NetworkPolicy controller.
///
/// All state outside the northbound database is derived: registries keyed by
/// policy key and namespace, rebuilt from watches after a restart. Shared
/// with every running watcher task, so constructed behind an [`Arc`].
pub struct Controller {
    pub(crate) config: Config,
    pub(crate) nb: Arc<dyn NbClient>,
    pub(crate) address_sets: Arc<dyn AddressSetFactory>,
    pub(crate) port_cache: Arc<dyn LogicalPortCache>,
    pub(crate) pod_watches: Arc<dyn WatchFactory<k8s::Pod>>,
    pub(crate) namespace_watches: Arc<dyn WatchFactory<k8s::Namespace>>,

    pub(crate) namespaces: Namespaces,
    pub(crate) network_policies: LockedMap<NetworkPolicy>,
    pub(crate) shared_deny_port_groups: LockedMap<DefaultDenyPortGroups>,
    pub(crate) metrics: Metrics,

    /// Back-reference handed to watcher callbacks, which outlive any one
    /// method invocation.
    weak_self: Weak<Controller>,
}

// === impl Controller ===

impl Controller {
    /// `metrics` is taken pre-built so callers can register it with their
    /// exporter before the controller (and whatever it needs, e.g. an API
    /// client) comes up.
    pub fn new(
        config: Config,
        nb: Arc<dyn NbClient>,
        address_sets: Arc<dyn AddressSetFactory>,
        port_cache: Arc<dyn LogicalPortCache>,
        pod_watches: Arc<dyn WatchFactory<k8s::Pod>>,
        namespace_watches: Arc<dyn WatchFactory<k8s::Namespace>>,
        metrics: Metrics,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            config,
            nb,
            address_sets,
            port_cache,
            pod_watches,
            namespace_watches,
            namespaces: Namespaces::default(),
            network_policies: LockedMap::default(),
            shared_deny_port_groups: LockedMap::default(),
            metrics,
            weak_self: weak_self.clone(),
        })
    }

    /// A strong handle on the controller. Methods only run while a caller
    /// holds one, so the upgrade cannot fail.
    pub(crate) fn strong_ref(&self) -> Arc<Controller> {
        self.weak_self
            .upgrade()
            .expect("controller is alive while its methods run")
    }
}

/// Aggregates per-object handler failures so the retry layer retries only
/// the offending objects.
#[derive(Debug)]
pub(crate) struct Errors(Vec<anyhow::Error>);

impl Errors {
    pub(crate) fn ok_if_empty(errors: Vec<anyhow::Error>) -> anyhow::Result<()> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Self(errors).into())
        }
    }
}

impl std::fmt::Display for Errors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0[0])?;
        for e in &self.0[1..] {
            write!(f, "; and {}", e)?;
        }
        Ok(())
    }
}

impl std::error::Error for Errors {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.0[0])
    }
}
