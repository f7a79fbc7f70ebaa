//! Per-namespace default-deny port groups.
//!
//! Every policy in a namespace shares the namespace's two default-deny port
//! groups, so membership is reference counted: a port belongs to the ingress
//! (resp. egress) group in the database exactly while at least one ingress
//! (resp. egress) policy references it in memory. Counters and database
//! updates are kept in agreement by holding the namespace's key in the
//! store's keyed lock across both, and by reverting the counters when the
//! transaction fails.

use crate::policy::NetworkPolicy;
use crate::Controller;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use anyhow::{Context, Result};
use ovn_policy_controller_core::acl::{DEFAULT_ALLOW_PRIORITY, DEFAULT_DENY_PRIORITY};
use ovn_policy_controller_core::{
    default_deny_port_group_name, Acl, AclAction, AclDirection, AclLogging, AclOwner, AclSeverity,
    DbIds, ExternalIdKey, NbOp, PortGroup, EGRESS_DEFAULT_DENY_SUFFIX,
    INGRESS_DEFAULT_DENY_SUFFIX,
};
use parking_lot::Mutex;
use tracing::info;

pub(crate) const DEFAULT_DENY_ACL_TYPE: &str = "defaultDeny";
pub(crate) const ARP_ALLOW_ACL_TYPE: &str = "arpAllow";

/// Neighbor discovery must keep working under blanket deny.
const ARP_ALLOW_MATCH: &str = "(arp || nd)";

#[derive(Default)]
struct DenyState {
    /// port name -> keys of the ingress policies referencing the port.
    ingress_port_to_policies: HashMap<String, HashSet<String>>,
    egress_port_to_policies: HashMap<String, HashSet<String>>,
    /// Keys of the policies that joined this record.
    policies: HashSet<String>,
}

/// The shared record for one namespace. All access happens with the
/// namespace's key held in the store's keyed lock; the inner mutex only
/// satisfies `&self` mutation.
#[derive(Default)]
pub(crate) struct DefaultDenyPortGroups {
    state: Mutex<DenyState>,
}

// === impl DefaultDenyPortGroups ===

impl DefaultDenyPortGroups {
    /// Records that `np` references each given port and returns the port
    /// UUIDs whose reference count went zero-to-one per direction; only
    /// those need adding to the database groups.
    pub(crate) fn add_ports_for_policy(
        &self,
        np: &NetworkPolicy,
        ports: &HashMap<String, String>,
    ) -> (Vec<String>, Vec<String>) {
        let mut state = self.state.lock();
        let mut ingress_new = Vec::new();
        let mut egress_new = Vec::new();
        if np.is_ingress {
            for (port_name, port_uuid) in ports {
                let refs = state
                    .ingress_port_to_policies
                    .entry(port_name.clone())
                    .or_default();
                if refs.is_empty() {
                    ingress_new.push(port_uuid.clone());
                }
                refs.insert(np.key());
            }
        }
        if np.is_egress {
            for (port_name, port_uuid) in ports {
                let refs = state
                    .egress_port_to_policies
                    .entry(port_name.clone())
                    .or_default();
                if refs.is_empty() {
                    egress_new.push(port_uuid.clone());
                }
                refs.insert(np.key());
            }
        }
        (ingress_new, egress_new)
    }

    /// Drops `np`'s references and returns the port UUIDs whose reference
    /// count reached zero per direction; only those leave the database
    /// groups. Entries for freed ports are removed entirely.
    pub(crate) fn delete_ports_for_policy(
        &self,
        np: &NetworkPolicy,
        ports: &HashMap<String, String>,
    ) -> (Vec<String>, Vec<String>) {
        let mut state = self.state.lock();
        let mut ingress_freed = Vec::new();
        let mut egress_freed = Vec::new();
        if np.is_ingress {
            for (port_name, port_uuid) in ports {
                if let Some(refs) = state.ingress_port_to_policies.get_mut(port_name) {
                    refs.remove(&np.key());
                    if refs.is_empty() {
                        ingress_freed.push(port_uuid.clone());
                        state.ingress_port_to_policies.remove(port_name);
                    }
                }
            }
        }
        if np.is_egress {
            for (port_name, port_uuid) in ports {
                if let Some(refs) = state.egress_port_to_policies.get_mut(port_name) {
                    refs.remove(&np.key());
                    if refs.is_empty() {
                        egress_freed.push(port_uuid.clone());
                        state.egress_port_to_policies.remove(port_name);
                    }
                }
            }
        }
        (ingress_freed, egress_freed)
    }

    fn join(&self, np_key: String) {
        self.state.lock().policies.insert(np_key);
    }

    /// Removes the policy; true when it was the last owner.
    fn leave(&self, np_key: &str) -> bool {
        let mut state = self.state.lock();
        state.policies.remove(np_key);
        state.policies.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn ingress_ref_count(&self, port_name: &str) -> usize {
        self.state
            .lock()
            .ingress_port_to_policies
            .get(port_name)
            .map(|refs| refs.len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn egress_ref_count(&self, port_name: &str) -> usize {
        self.state
            .lock()
            .egress_port_to_policies
            .get(port_name)
            .map(|refs| refs.len())
            .unwrap_or(0)
    }
}

// === impl Controller: default-deny lifecycle ===

impl Controller {
    fn default_deny_acl_ids(
        &self,
        namespace: &str,
        direction: AclDirection,
        acl_type: &str,
    ) -> DbIds {
        // One namespace carries two deny port groups; direction and type
        // disambiguate the four ACLs.
        DbIds::new(AclOwner::NetpolNamespace, &self.config.controller_name)
            .with(ExternalIdKey::ObjectName, namespace)
            .with(ExternalIdKey::PolicyDirection, direction.as_str())
            .with(ExternalIdKey::Type, acl_type)
    }

    /// The drop ACL and the ARP/ND allow ACL for one direction's deny group.
    fn build_deny_acls(
        &self,
        namespace: &str,
        pg_name: &str,
        deny_log: Option<AclSeverity>,
        direction: AclDirection,
    ) -> (Acl, Acl) {
        let deny = Acl::new(
            self.default_deny_acl_ids(namespace, direction, DEFAULT_DENY_ACL_TYPE),
            DEFAULT_DENY_PRIORITY,
            direction.port_group_match(pg_name),
            AclAction::Drop,
            deny_log,
            direction.pipeline(),
        );
        let allow = Acl::new(
            self.default_deny_acl_ids(namespace, direction, ARP_ALLOW_ACL_TYPE),
            DEFAULT_ALLOW_PRIORITY,
            format!(
                "{} && {}",
                ARP_ALLOW_MATCH,
                direction.port_group_match(pg_name)
            ),
            AclAction::Allow,
            None,
            direction.pipeline(),
        );
        (deny, allow)
    }

    /// Creates both deny port groups and their four ACLs in one transaction.
    /// Must be called with the namespace's deny-store key held.
    async fn create_default_deny_pg_and_acls(
        &self,
        namespace: &str,
        acl_logging: &AclLogging,
    ) -> Result<()> {
        let ingress_pg = default_deny_port_group_name(namespace, INGRESS_DEFAULT_DENY_SUFFIX);
        let egress_pg = default_deny_port_group_name(namespace, EGRESS_DEFAULT_DENY_SUFFIX);
        let (ingress_deny, ingress_allow) =
            self.build_deny_acls(namespace, &ingress_pg, acl_logging.deny, AclDirection::Ingress);
        let (egress_deny, egress_allow) =
            self.build_deny_acls(namespace, &egress_pg, acl_logging.deny, AclDirection::Egress);

        let acls = vec![ingress_deny, ingress_allow, egress_deny, egress_allow];
        let ops = vec![
            NbOp::CreateOrUpdateAcls(acls.clone()),
            NbOp::CreateOrUpdatePortGroups(vec![
                PortGroup::new(ingress_pg.clone(), ingress_pg, vec![], &acls[..2]),
                PortGroup::new(egress_pg.clone(), egress_pg, vec![], &acls[2..]),
            ]),
        ];
        self.nb.transact(ops).await
    }

    /// Deletes both deny port groups; the ACLs are garbage collected with
    /// them. Must be called with the namespace's deny-store key held.
    async fn delete_default_deny_pg_and_acls(&self, namespace: &str) -> Result<()> {
        let ops = vec![NbOp::DeletePortGroups(vec![
            default_deny_port_group_name(namespace, INGRESS_DEFAULT_DENY_SUFFIX),
            default_deny_port_group_name(namespace, EGRESS_DEFAULT_DENY_SUFFIX),
        ])];
        self.nb.transact(ops).await
    }

    /// Joins `np` to its namespace's shared record, materializing the deny
    /// port groups when the record is created fresh. A database failure
    /// removes the record again so a retry starts clean.
    pub(crate) async fn add_policy_to_default_port_groups(
        &self,
        np: &NetworkPolicy,
        acl_logging: &AclLogging,
    ) -> Result<()> {
        let guard = self.shared_deny_port_groups.lock(&np.namespace).await;
        let (shared, existed) = guard.load_or_store(DefaultDenyPortGroups::default);
        if !existed {
            if let Err(error) = self
                .create_default_deny_pg_and_acls(&np.namespace, acl_logging)
                .await
            {
                guard.remove();
                return Err(error).context("failed to create default deny port groups");
            }
        }
        shared.join(np.key());
        Ok(())
    }

    /// Removes `np` from the shared record, deleting the deny port groups
    /// when it was the last policy in the namespace.
    pub(crate) async fn del_policy_from_default_port_groups(
        &self,
        np: &NetworkPolicy,
    ) -> Result<()> {
        let guard = self.shared_deny_port_groups.lock(&np.namespace).await;
        let shared = match guard.load() {
            Some(shared) => shared,
            None => return Ok(()),
        };
        if shared.leave(&np.key()) {
            self.delete_default_deny_pg_and_acls(&np.namespace)
                .await
                .context("failed to delete default deny port groups")?;
            guard.remove();
        }
        Ok(())
    }

    /// Adds ports to the deny groups, bumping reference counts, and submits
    /// `ops` along with whatever membership changes are needed. The keyed
    /// lock spans counter mutation and submission; on failure the counters
    /// are reverted.
    pub(crate) async fn deny_pg_add_ports(
        &self,
        np: &NetworkPolicy,
        ports: &HashMap<String, String>,
        mut ops: Vec<NbOp>,
    ) -> Result<()> {
        let guard = self.shared_deny_port_groups.lock(&np.namespace).await;
        let shared = guard
            .load()
            .with_context(|| format!("default deny port groups for {} do not exist", np.namespace))?;

        let (ingress_new, egress_new) = shared.add_ports_for_policy(np, ports);
        let mut locked = Some(guard);
        if ingress_new.is_empty() && egress_new.is_empty() {
            // Only reference counts moved; the transaction does not touch
            // deny membership, so the key can be released early.
            locked = None;
        } else {
            if !ingress_new.is_empty() {
                ops.push(NbOp::AddPortsToPortGroup {
                    group: default_deny_port_group_name(&np.namespace, INGRESS_DEFAULT_DENY_SUFFIX),
                    ports: ingress_new,
                });
            }
            if !egress_new.is_empty() {
                ops.push(NbOp::AddPortsToPortGroup {
                    group: default_deny_port_group_name(&np.namespace, EGRESS_DEFAULT_DENY_SUFFIX),
                    ports: egress_new,
                });
            }
        }

        if let Err(error) = self.nb.transact(ops).await {
            // Revert the counters under the key; reacquire it if it was
            // released on the counters-only path.
            let guard = match locked.take() {
                Some(guard) => guard,
                None => self.shared_deny_port_groups.lock(&np.namespace).await,
            };
            if let Some(shared) = guard.load() {
                shared.delete_ports_for_policy(np, ports);
            }
            return Err(error).context("failed to add ports to default deny port groups");
        }
        Ok(())
    }

    /// Removes ports from the deny groups, dropping reference counts. With
    /// `use_local_pods`, the port set is taken from the policy's own
    /// `localPods` (cleanup path). `ops` is submitted in the same
    /// transaction regardless of whether membership changed.
    pub(crate) async fn deny_pg_delete_ports(
        &self,
        np: &NetworkPolicy,
        state: &crate::policy::PolicyState,
        ports: Option<&HashMap<String, String>>,
        use_local_pods: bool,
        mut ops: Vec<NbOp>,
    ) -> Result<()> {
        let ports: HashMap<String, String> = if use_local_pods {
            state.local_pods.lock().clone()
        } else {
            ports.cloned().unwrap_or_default()
        };

        if ports.is_empty() {
            return self
                .nb
                .transact(ops)
                .await
                .context("failed to transact delete ports from default deny port groups");
        }

        let ports = &ports;
        let guard = self.shared_deny_port_groups.lock(&np.namespace).await;
        match guard.load() {
            None => {
                // Nothing to count down; the record died with the last
                // policy of the namespace.
                info!(namespace = %np.namespace, "Skipping default deny counters: record does not exist");
                drop(guard);
                self.nb
                    .transact(ops)
                    .await
                    .context("failed to transact delete ports from default deny port groups")
            }
            Some(shared) => {
                let (ingress_freed, egress_freed) = shared.delete_ports_for_policy(np, ports);
                let mut locked = Some(guard);
                if ingress_freed.is_empty() && egress_freed.is_empty() {
                    locked = None;
                } else {
                    if !ingress_freed.is_empty() {
                        ops.push(NbOp::DeletePortsFromPortGroup {
                            group: default_deny_port_group_name(
                                &np.namespace,
                                INGRESS_DEFAULT_DENY_SUFFIX,
                            ),
                            ports: ingress_freed,
                        });
                    }
                    if !egress_freed.is_empty() {
                        ops.push(NbOp::DeletePortsFromPortGroup {
                            group: default_deny_port_group_name(
                                &np.namespace,
                                EGRESS_DEFAULT_DENY_SUFFIX,
                            ),
                            ports: egress_freed,
                        });
                    }
                }

                if let Err(error) = self.nb.transact(ops).await {
                    let guard = match locked.take() {
                        Some(guard) => guard,
                        None => self.shared_deny_port_groups.lock(&np.namespace).await,
                    };
                    if let Some(shared) = guard.load() {
                        shared.add_ports_for_policy(np, ports);
                    }
                    return Err(error)
                        .context("failed to delete ports from default deny port groups");
                }
                Ok(())
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn deny_record(
        &self,
        namespace: &str,
    ) -> Option<std::sync::Arc<DefaultDenyPortGroups>> {
        self.shared_deny_port_groups.lock(namespace).await.load()
    }
}
