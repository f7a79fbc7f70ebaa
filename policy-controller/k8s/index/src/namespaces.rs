//! Namespace registry and ACL-logging propagation.
//!
//! Policies subscribe to their namespace by key; a namespace's record holds
//! the ACL log levels and the keys of every policy whose compiled ACLs
//! depend on them. The record's mutex is the top of the lock hierarchy: it
//! is never acquired while a policy key lock or a policy RW-lock is held.

use crate::{Controller, Errors};
use ahash::AHashSet as HashSet;
use anyhow::{anyhow, Context, Result};
use ovn_policy_controller_core::{
    acl_policy_key, AclLogging, AclOwner, AclPredicate, AclSeverity, ExternalIdKey, NbOp,
};
use ovn_policy_controller_k8s_api::{self as k8s, ResourceExt};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Annotation carrying a namespace's ACL log levels, e.g.
/// `{"deny": "alert", "allow": "notice"}`.
pub const ACL_LOGGING_ANNOTATION: &str = "k8s.ovn.org/acl-logging";

#[derive(Default)]
pub(crate) struct NamespaceInfo {
    pub(crate) acl_logging: AclLogging,
    /// Keys of policies to update when this namespace's log levels change.
    pub(crate) related_network_policies: HashSet<String>,
}

pub(crate) struct NamespaceRecord {
    pub(crate) name: String,
    pub(crate) info: tokio::sync::Mutex<NamespaceInfo>,
}

/// Registry of known namespaces.
#[derive(Default)]
pub(crate) struct Namespaces {
    map: Mutex<ahash::AHashMap<String, Arc<NamespaceRecord>>>,
}

// === impl Namespaces ===

impl Namespaces {
    pub(crate) fn get(&self, name: &str) -> Option<Arc<NamespaceRecord>> {
        self.map.lock().get(name).cloned()
    }

    pub(crate) fn ensure(&self, name: &str) -> Arc<NamespaceRecord> {
        self.map
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(NamespaceRecord {
                    name: name.to_string(),
                    info: tokio::sync::Mutex::new(NamespaceInfo::default()),
                })
            })
            .clone()
    }

    pub(crate) fn remove(&self, name: &str) -> Option<Arc<NamespaceRecord>> {
        self.map.lock().remove(name)
    }
}

#[derive(serde::Deserialize)]
struct RawAclLogging {
    #[serde(default)]
    allow: String,
    #[serde(default)]
    deny: String,
}

fn parse_severity(s: &str) -> Result<Option<AclSeverity>> {
    if s.is_empty() {
        return Ok(None);
    }
    s.parse().map(Some)
}

/// Parses [`ACL_LOGGING_ANNOTATION`] from a namespace's annotations. An
/// absent annotation disables logging; empty severities disable one class.
pub(crate) fn acl_logging_from_annotations(
    annotations: &BTreeMap<String, String>,
) -> Result<AclLogging> {
    let raw = match annotations.get(ACL_LOGGING_ANNOTATION) {
        None => return Ok(AclLogging::default()),
        Some(raw) => raw,
    };
    let parsed: RawAclLogging =
        serde_json::from_str(raw).with_context(|| format!("parsing {}", ACL_LOGGING_ANNOTATION))?;
    Ok(AclLogging {
        allow: parse_severity(&parsed.allow)?,
        deny: parse_severity(&parsed.deny)?,
    })
}

// === impl Controller: namespace events ===

impl Controller {
    /// Handles a namespace add/update: records the namespace and, when its
    /// ACL log levels changed, rewrites the affected ACLs.
    pub async fn apply_namespace(&self, namespace: &k8s::Namespace) -> Result<()> {
        let name = namespace
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| anyhow!("namespace with no name"))?;
        let acl_logging = match namespace.annotations().is_empty() {
            true => AclLogging::default(),
            false => acl_logging_from_annotations(namespace.annotations()).unwrap_or_else(
                |error| {
                    warn!(namespace = %name, %error, "Ignoring invalid ACL logging annotation");
                    AclLogging::default()
                },
            ),
        };

        let record = self.namespaces.ensure(name);
        let mut info = record.info.lock().await;
        if info.acl_logging == acl_logging {
            return Ok(());
        }
        info.acl_logging = acl_logging;
        self.handle_netpol_namespace_update(name, &info).await
    }

    pub async fn delete_namespace(&self, name: &str) {
        self.namespaces.remove(name);
    }

    /// Re-applies the namespace's log levels to its default-deny ACLs and to
    /// every related policy's ACLs. Must be called with the namespace record
    /// locked; retriable.
    pub(crate) async fn handle_netpol_namespace_update(
        &self,
        namespace: &str,
        info: &NamespaceInfo,
    ) -> Result<()> {
        self.update_acl_logging_for_default_acls(namespace, &info.acl_logging)
            .await
            .with_context(|| format!("failed to update default deny ACLs for {}", namespace))?;

        let mut errors = Vec::new();
        for np_key in &info.related_network_policies {
            let guard = self.network_policies.lock(np_key).await;
            let res = match guard.load() {
                Some(np) => self.update_acl_logging_for_policy(&np, &info.acl_logging).await,
                None => {
                    // The policy left the registry but not the namespace's
                    // related set; cleanup will converge, nothing to update.
                    warn!(policy = %np_key, "Policy deleted from registry but still related to namespace");
                    Ok(())
                }
            };
            if let Err(error) = res {
                errors.push(error.context(format!("updating ACLs of policy {}", np_key)));
            } else {
                info!(policy = %np_key, ?info.acl_logging, "ACL logging updated");
            }
        }
        Errors::ok_if_empty(errors)
    }

    /// Rewrites the log level on the namespace's two default-deny drop ACLs,
    /// found by predicate on their external ids.
    pub(crate) async fn update_acl_logging_for_default_acls(
        &self,
        namespace: &str,
        acl_logging: &AclLogging,
    ) -> Result<()> {
        let guard = self.shared_deny_port_groups.lock(namespace).await;
        if guard.load().is_none() {
            // No policies in this namespace: no default-deny ACLs to update.
            return Ok(());
        }
        let predicate = AclPredicate::new(AclOwner::NetpolNamespace, &self.config.controller_name)
            .with(ExternalIdKey::ObjectName, namespace)
            .with(ExternalIdKey::Type, crate::default_deny::DEFAULT_DENY_ACL_TYPE);
        let mut acls = self.nb.find_acls(&predicate).await?;
        if acls.is_empty() {
            return Ok(());
        }
        for acl in &mut acls {
            acl.log = acl_logging.deny;
        }
        self.nb.transact(vec![NbOp::CreateOrUpdateAcls(acls)]).await
    }

    /// Rewrites the log level on every allow ACL owned by the policy. Skips
    /// policies already flagged deleted.
    pub(crate) async fn update_acl_logging_for_policy(
        &self,
        np: &crate::policy::NetworkPolicy,
        acl_logging: &AclLogging,
    ) -> Result<()> {
        let state = np.state.read().await;
        if state.deleted {
            return Ok(());
        }
        let predicate = AclPredicate::new(AclOwner::NetworkPolicy, &self.config.controller_name)
            .with(
                ExternalIdKey::ObjectName,
                acl_policy_key(&np.namespace, &np.name),
            );
        let mut acls = self.nb.find_acls(&predicate).await?;
        if acls.is_empty() {
            return Ok(());
        }
        for acl in &mut acls {
            acl.log = acl_logging.allow;
        }
        self.nb.transact(vec![NbOp::CreateOrUpdateAcls(acls)]).await
    }
}
