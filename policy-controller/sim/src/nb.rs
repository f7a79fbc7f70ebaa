//! In-memory northbound store.
//!
//! Applies a transaction's operations against a copy of the state and
//! commits only when every operation succeeds, so callers observe the same
//! all-or-nothing behavior the real database provides. ACL rows referenced
//! by no port group and no switch are garbage collected at commit, matching
//! the database's strong-reference semantics.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use ovn_policy_controller_core::{Acl, AclPredicate, NbClient, NbOp, PortGroupRecord};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, Default)]
struct PortGroupRow {
    external_name: String,
    ports: BTreeSet<String>,
    acls: BTreeSet<String>,
}

#[derive(Clone, Debug, Default)]
struct State {
    acls: BTreeMap<String, Acl>,
    port_groups: BTreeMap<String, PortGroupRow>,
    switch_acls: BTreeMap<String, BTreeSet<String>>,
    fail_next_transact: bool,
}

#[derive(Debug, Default)]
pub struct MemNb {
    state: Mutex<State>,
}

// === impl MemNb ===

impl MemNb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `transact` fail without applying anything. Used to
    /// exercise rollback paths.
    pub fn fail_next_transact(&self) {
        self.state.lock().fail_next_transact = true;
    }

    /// Port UUIDs currently in the named group, or `None` if the group does
    /// not exist.
    pub fn port_group_ports(&self, name: &str) -> Option<BTreeSet<String>> {
        self.state
            .lock()
            .port_groups
            .get(name)
            .map(|pg| pg.ports.clone())
    }

    /// ACLs attached to the named group.
    pub fn port_group_acls(&self, name: &str) -> Option<Vec<Acl>> {
        let state = self.state.lock();
        let pg = state.port_groups.get(name)?;
        Some(
            pg.acls
                .iter()
                .filter_map(|key| state.acls.get(key).cloned())
                .collect(),
        )
    }

    pub fn has_port_group(&self, name: &str) -> bool {
        self.state.lock().port_groups.contains_key(name)
    }

    pub fn port_group_names(&self) -> BTreeSet<String> {
        self.state.lock().port_groups.keys().cloned().collect()
    }

    pub fn all_acls(&self) -> Vec<Acl> {
        self.state.lock().acls.values().cloned().collect()
    }

    pub fn switch_acls(&self, switch: &str) -> Vec<Acl> {
        let state = self.state.lock();
        state
            .switch_acls
            .get(switch)
            .into_iter()
            .flatten()
            .filter_map(|key| state.acls.get(key).cloned())
            .collect()
    }

    /// True when no policy-derived state remains.
    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.acls.is_empty() && state.port_groups.is_empty()
    }

    fn apply(state: &mut State, op: NbOp) -> Result<()> {
        match op {
            NbOp::CreateOrUpdateAcls(acls) => {
                for acl in acls {
                    state.acls.insert(acl.ids.primary_key(), acl);
                }
            }
            NbOp::CreateOrUpdatePortGroups(groups) => {
                for pg in groups {
                    for key in &pg.acls {
                        if !state.acls.contains_key(key) {
                            bail!("port group {} references unknown ACL {}", pg.name, key);
                        }
                    }
                    let row = state.port_groups.entry(pg.name).or_default();
                    row.external_name = pg.external_name;
                    row.ports.extend(pg.ports);
                    row.acls = pg.acls.into_iter().collect();
                }
            }
            NbOp::DeletePortGroups(names) => {
                for name in names {
                    state.port_groups.remove(&name);
                }
            }
            NbOp::AddPortsToPortGroup { group, ports } => {
                let row = state
                    .port_groups
                    .get_mut(&group)
                    .ok_or_else(|| anyhow!("port group {} does not exist", group))?;
                row.ports.extend(ports);
            }
            NbOp::DeletePortsFromPortGroup { group, ports } => {
                // Tolerated on a missing group: deletes race with group GC.
                if let Some(row) = state.port_groups.get_mut(&group) {
                    for port in ports {
                        row.ports.remove(&port);
                    }
                }
            }
            NbOp::AddAclsToPortGroup { group, acls } => {
                for key in &acls {
                    if !state.acls.contains_key(key) {
                        bail!("cannot attach unknown ACL {} to {}", key, group);
                    }
                }
                let row = state
                    .port_groups
                    .get_mut(&group)
                    .ok_or_else(|| anyhow!("port group {} does not exist", group))?;
                row.acls.extend(acls);
            }
            NbOp::DeleteAclsFromPortGroup { group, acls } => {
                if let Some(row) = state.port_groups.get_mut(&group) {
                    for key in acls {
                        row.acls.remove(&key);
                    }
                }
            }
            NbOp::AddAclsToSwitch { switch, acls } => {
                for key in &acls {
                    if !state.acls.contains_key(key) {
                        bail!("cannot attach unknown ACL {} to switch {}", key, switch);
                    }
                }
                state.switch_acls.entry(switch).or_default().extend(acls);
            }
        }
        Ok(())
    }

    fn collect_garbage(state: &mut State) {
        let mut referenced = BTreeSet::new();
        for pg in state.port_groups.values() {
            referenced.extend(pg.acls.iter().cloned());
        }
        for acls in state.switch_acls.values() {
            referenced.extend(acls.iter().cloned());
        }
        state.acls.retain(|key, _| referenced.contains(key));
    }
}

#[async_trait]
impl NbClient for MemNb {
    async fn transact(&self, ops: Vec<NbOp>) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_next_transact {
            state.fail_next_transact = false;
            bail!("injected transaction failure");
        }

        let mut next = state.clone();
        for op in ops {
            Self::apply(&mut next, op)?;
        }
        Self::collect_garbage(&mut next);
        *state = next;
        Ok(())
    }

    async fn find_acls(&self, predicate: &AclPredicate) -> Result<Vec<Acl>> {
        Ok(self
            .state
            .lock()
            .acls
            .values()
            .filter(|acl| predicate.matches(&acl.ids))
            .cloned()
            .collect())
    }

    async fn get_port_group(&self, name: &str) -> Result<Option<PortGroupRecord>> {
        Ok(self
            .state
            .lock()
            .port_groups
            .get(name)
            .map(|row| PortGroupRecord {
                name: name.to_string(),
                external_name: row.external_name.clone(),
                ports: row.ports.iter().cloned().collect(),
                acls: row.acls.iter().cloned().collect(),
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ovn_policy_controller_core::{
        AclAction, AclOwner, AclPipeline, DbIds, ExternalIdKey, PortGroup,
    };

    fn acl(name: &str) -> Acl {
        Acl::new(
            DbIds::new(AclOwner::NetworkPolicy, "test")
                .with(ExternalIdKey::ObjectName, name.to_string()),
            1001,
            "ip4".to_string(),
            AclAction::AllowRelated,
            None,
            AclPipeline::ToLport,
        )
    }

    #[tokio::test]
    async fn transactions_are_atomic() {
        let nb = MemNb::new();
        let a = acl("ns:a");
        nb.transact(vec![
            NbOp::CreateOrUpdateAcls(vec![a.clone()]),
            NbOp::CreateOrUpdatePortGroups(vec![PortGroup::new(
                "pg1",
                "pg1",
                vec![],
                std::slice::from_ref(&a),
            )]),
        ])
        .await
        .unwrap();

        // A failing op in the middle leaves prior ops unapplied.
        let err = nb
            .transact(vec![
                NbOp::AddPortsToPortGroup {
                    group: "pg1".to_string(),
                    ports: vec!["u1".to_string()],
                },
                NbOp::AddPortsToPortGroup {
                    group: "missing".to_string(),
                    ports: vec!["u2".to_string()],
                },
            ])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
        assert!(nb.port_group_ports("pg1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn acls_are_garbage_collected_with_their_group() {
        let nb = MemNb::new();
        let a = acl("ns:a");
        nb.transact(vec![
            NbOp::CreateOrUpdateAcls(vec![a.clone()]),
            NbOp::CreateOrUpdatePortGroups(vec![PortGroup::new(
                "pg1",
                "pg1",
                vec![],
                std::slice::from_ref(&a),
            )]),
        ])
        .await
        .unwrap();
        assert_eq!(nb.all_acls().len(), 1);

        nb.transact(vec![NbOp::DeletePortGroups(vec!["pg1".to_string()])])
            .await
            .unwrap();
        assert!(nb.is_empty());
    }
}
