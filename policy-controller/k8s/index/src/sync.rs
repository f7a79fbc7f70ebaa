//! Startup reconciliation of the database against the live policy set.
//!
//! Previous controller incarnations may have left rows behind: policies
//! deleted while the controller was down still have their ACLs, port
//! groups, and deny groups in the database. Sync enumerates policy-owned
//! ACLs by external id, maps each back to its owning policy key, and drops
//! the port groups of owners that no longer exist. Port groups must go
//! before any address-set cleanup elsewhere: ACLs referencing a missing
//! set are a data-plane error, the reverse order is safe.

use crate::Controller;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use anyhow::{Context, Result};
use ovn_policy_controller_core::acl::{
    DEFAULT_ALLOW_PRIORITY, V4_SERVICE_HAIRPIN_IP, V6_SERVICE_HAIRPIN_IP,
};
use ovn_policy_controller_core::{
    default_deny_port_group_name, policy_port_group_name, Acl, AclAction, AclDirection, AclOwner,
    AclPipeline, AclPredicate, DbIds, ExternalIdKey, NbOp, parse_acl_policy_key,
    EGRESS_DEFAULT_DENY_SUFFIX, INGRESS_DEFAULT_DENY_SUFFIX,
};
use ovn_policy_controller_k8s_api::{self as k8s, ResourceExt};
use std::collections::BTreeSet;
use std::net::IpAddr;
use tracing::info;

const HAIRPIN_ACL_NAME: &str = "allow-hairpinning";

impl Controller {
    /// Reconciles policy-owned database state against the given live
    /// policies and installs the cluster-wide hairpin-allow ACLs. Run once
    /// at startup, before event handling begins.
    pub async fn sync_network_policies(&self, policies: &[k8s::NetworkPolicy]) -> Result<()> {
        let mut expected: HashMap<String, HashSet<String>> = HashMap::new();
        for policy in policies {
            let (Some(namespace), Some(name)) = (policy.namespace(), policy.metadata.name.clone())
            else {
                continue;
            };
            expected.entry(namespace).or_default().insert(name);
        }

        let mut stale = BTreeSet::new();

        // Per-policy port groups, found through their ACLs' owner ids. An
        // id that does not decode is a row this controller cannot account
        // for; surface it rather than guessing.
        let predicate =
            AclPredicate::new(AclOwner::NetworkPolicy, &self.config.controller_name);
        for acl in self
            .nb
            .find_acls(&predicate)
            .await
            .context("cannot find NetworkPolicy ACLs")?
        {
            let object_name = acl
                .ids
                .get(ExternalIdKey::ObjectName)
                .unwrap_or_default();
            let (namespace, name) = parse_acl_policy_key(object_name)
                .context("failed to sync stale network policies")?;
            let alive = expected
                .get(&namespace)
                .map(|names| names.contains(&name))
                .unwrap_or(false);
            if !alive {
                stale.insert(policy_port_group_name(&namespace, &name).0);
            }
        }

        // Default-deny port groups of namespaces with no surviving policy.
        let predicate =
            AclPredicate::new(AclOwner::NetpolNamespace, &self.config.controller_name);
        for acl in self
            .nb
            .find_acls(&predicate)
            .await
            .context("cannot find default deny NetworkPolicy ACLs")?
        {
            let namespace = acl
                .ids
                .get(ExternalIdKey::ObjectName)
                .unwrap_or_default();
            if !expected.contains_key(namespace) {
                stale.insert(default_deny_port_group_name(
                    namespace,
                    INGRESS_DEFAULT_DENY_SUFFIX,
                ));
                stale.insert(default_deny_port_group_name(
                    namespace,
                    EGRESS_DEFAULT_DENY_SUFFIX,
                ));
            }
        }

        if !stale.is_empty() {
            let count = stale.len();
            self.nb
                .transact(vec![NbOp::DeletePortGroups(stale.into_iter().collect())])
                .await
                .context("error removing stale port groups")?;
            info!(count, "Network policy sync cleaned up stale port groups");
        }

        self.add_hairpin_allow_acl()
            .await
            .context("failed to create hairpin allow ACL")
    }

    fn hairpin_acl_ids(&self, direction: AclDirection) -> DbIds {
        DbIds::new(AclOwner::NetpolDefault, &self.config.controller_name)
            .with(ExternalIdKey::ObjectName, HAIRPIN_ACL_NAME)
            .with(ExternalIdKey::PolicyDirection, direction.as_str())
    }

    /// Hairpinned service traffic originates from the reserved masquerade
    /// addresses and must bypass default deny in both pipelines.
    async fn add_hairpin_allow_acl(&self) -> Result<()> {
        let v4 = format!("ip4.src == {}", V4_SERVICE_HAIRPIN_IP);
        let v6 = format!("ip6.src == {}", V6_SERVICE_HAIRPIN_IP);
        let hairpin_match = match (self.config.ipv4_mode, self.config.ipv6_mode) {
            (true, true) => format!("({} || {})", v4, v6),
            (false, true) => v6,
            _ => v4,
        };

        let ingress = Acl::new(
            self.hairpin_acl_ids(AclDirection::Ingress),
            DEFAULT_ALLOW_PRIORITY,
            hairpin_match.clone(),
            AclAction::AllowRelated,
            None,
            AclPipeline::ToLport,
        );
        let egress = Acl::new(
            self.hairpin_acl_ids(AclDirection::Egress),
            DEFAULT_ALLOW_PRIORITY,
            hairpin_match,
            AclAction::AllowRelated,
            None,
            AclPipeline::FromLport,
        );

        let acls = vec![ingress, egress];
        self.nb
            .transact(vec![
                NbOp::CreateOrUpdateAcls(acls.clone()),
                NbOp::add_acls_to_port_group(self.config.cluster_port_group.clone(), &acls),
            ])
            .await
    }

    /// Admits traffic from a node's management port to workloads on its
    /// switch. There is no delete path: the ACL is garbage collected with
    /// the node's switch.
    pub async fn add_allow_acl_from_node(
        &self,
        node_name: &str,
        mgmt_port_ip: IpAddr,
    ) -> Result<()> {
        let family = match mgmt_port_ip {
            IpAddr::V4(_) => "ip4",
            IpAddr::V6(_) => "ip6",
        };
        let acl = Acl::new(
            DbIds::new(AclOwner::NetpolNode, &self.config.controller_name)
                .with(ExternalIdKey::ObjectName, node_name)
                .with(ExternalIdKey::Ip, mgmt_port_ip.to_string()),
            DEFAULT_ALLOW_PRIORITY,
            format!("{}.src == {}", family, mgmt_port_ip),
            AclAction::AllowRelated,
            None,
            AclPipeline::ToLport,
        );
        self.nb
            .transact(vec![
                NbOp::CreateOrUpdateAcls(vec![acl.clone()]),
                NbOp::add_acls_to_switch(node_name, std::slice::from_ref(&acl)),
            ])
            .await
            .with_context(|| format!("failed to add allow ACL for node {}", node_name))
    }
}
