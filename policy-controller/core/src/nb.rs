use crate::acl::{Acl, AclOwner, DbIds, ExternalIdKey};
use crate::port_group::PortGroup;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// One deferred northbound operation.
///
/// Callers accumulate a `Vec<NbOp>` describing everything one logical change
/// needs and hand the batch to [`NbClient::transact`], which applies it
/// atomically. ACLs are referenced from membership ops by the primary key of
/// their ids.
#[derive(Clone, Debug)]
pub enum NbOp {
    CreateOrUpdateAcls(Vec<Acl>),
    CreateOrUpdatePortGroups(Vec<PortGroup>),
    /// Idempotent: unknown names are skipped. Attached ACLs are garbage
    /// collected with their containing group.
    DeletePortGroups(Vec<String>),
    AddPortsToPortGroup {
        group: String,
        ports: Vec<String>,
    },
    DeletePortsFromPortGroup {
        group: String,
        ports: Vec<String>,
    },
    AddAclsToPortGroup {
        group: String,
        acls: Vec<String>,
    },
    DeleteAclsFromPortGroup {
        group: String,
        acls: Vec<String>,
    },
    AddAclsToSwitch {
        switch: String,
        acls: Vec<String>,
    },
}

impl NbOp {
    pub fn add_acls_to_port_group(group: impl Into<String>, acls: &[Acl]) -> Self {
        NbOp::AddAclsToPortGroup {
            group: group.into(),
            acls: acls.iter().map(|acl| acl.ids.primary_key()).collect(),
        }
    }

    pub fn delete_acls_from_port_group(group: impl Into<String>, acls: &[Acl]) -> Self {
        NbOp::DeleteAclsFromPortGroup {
            group: group.into(),
            acls: acls.iter().map(|acl| acl.ids.primary_key()).collect(),
        }
    }

    pub fn add_acls_to_switch(switch: impl Into<String>, acls: &[Acl]) -> Self {
        NbOp::AddAclsToSwitch {
            switch: switch.into(),
            acls: acls.iter().map(|acl| acl.ids.primary_key()).collect(),
        }
    }
}

/// Subset match over ACL external ids, used to enumerate rows by owner.
#[derive(Clone, Debug)]
pub struct AclPredicate {
    owner: AclOwner,
    controller: String,
    ids: BTreeMap<ExternalIdKey, String>,
}

impl AclPredicate {
    pub fn new(owner: AclOwner, controller: impl Into<String>) -> Self {
        Self {
            owner,
            controller: controller.into(),
            ids: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: ExternalIdKey, value: impl Into<String>) -> Self {
        self.ids.insert(key, value.into());
        self
    }

    pub fn matches(&self, ids: &DbIds) -> bool {
        if ids.owner() != self.owner || ids.controller() != self.controller {
            return false;
        }
        self.ids
            .iter()
            .all(|(k, v)| ids.get(*k) == Some(v.as_str()))
    }
}

/// A northbound port-group row as returned by lookups.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortGroupRecord {
    pub name: String,
    pub external_name: String,
    pub ports: Vec<String>,
    pub acls: Vec<String>,
}

/// The northbound database, consumed as an opaque transactional store.
#[async_trait]
pub trait NbClient: Send + Sync + 'static {
    /// Applies the operations atomically; either all take effect or none.
    async fn transact(&self, ops: Vec<NbOp>) -> Result<()>;

    async fn find_acls(&self, predicate: &AclPredicate) -> Result<Vec<Acl>>;

    async fn get_port_group(&self, name: &str) -> Result<Option<PortGroupRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::AclOwner;

    #[test]
    fn predicate_matches_subsets() {
        let ids = DbIds::new(AclOwner::NetworkPolicy, "default")
            .with(ExternalIdKey::ObjectName, "ns:np")
            .with(ExternalIdKey::PolicyDirection, "ingress");

        assert!(AclPredicate::new(AclOwner::NetworkPolicy, "default").matches(&ids));
        assert!(AclPredicate::new(AclOwner::NetworkPolicy, "default")
            .with(ExternalIdKey::ObjectName, "ns:np")
            .matches(&ids));
        assert!(!AclPredicate::new(AclOwner::NetworkPolicy, "default")
            .with(ExternalIdKey::ObjectName, "other:np")
            .matches(&ids));
        assert!(!AclPredicate::new(AclOwner::NetpolNamespace, "default").matches(&ids));
        assert!(!AclPredicate::new(AclOwner::NetworkPolicy, "other-controller").matches(&ids));
    }
}
