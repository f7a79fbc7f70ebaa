use std::collections::BTreeMap;

/// Priority of the per-namespace default-deny drop ACLs.
pub const DEFAULT_DENY_PRIORITY: i32 = 1000;

/// Priority of allow ACLs: ARP/ND pass-through under blanket deny, compiled
/// allow rules, and the cluster hairpin exemption.
pub const DEFAULT_ALLOW_PRIORITY: i32 = 1001;

/// Reserved masquerade sources for hairpinned service traffic. Traffic from
/// these addresses must be allowed even in namespaces under default deny.
pub const V4_SERVICE_HAIRPIN_IP: &str = "169.254.169.5";
pub const V6_SERVICE_HAIRPIN_IP: &str = "fd69::5";

/// What an ACL does with matching traffic.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AclAction {
    /// Stateful allow; reply traffic is admitted by the connection tracker.
    AllowRelated,
    /// Stateless allow without connection tracking.
    AllowStateless,
    Allow,
    Drop,
}

impl AclAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AclAction::AllowRelated => "allow-related",
            AclAction::AllowStateless => "allow-stateless",
            AclAction::Allow => "allow",
            AclAction::Drop => "drop",
        }
    }
}

/// Which logical-flow stage evaluates the ACL.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AclPipeline {
    FromLport,
    ToLport,
}

impl AclPipeline {
    pub fn as_str(&self) -> &'static str {
        match self {
            AclPipeline::FromLport => "from-lport",
            AclPipeline::ToLport => "to-lport",
        }
    }
}

/// Direction of a policy rule or default-deny group.
///
/// Ingress rules constrain traffic *to* the selected pods, so their ACLs match
/// on `outport` and run in the `to-lport` pipeline; egress is the mirror.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AclDirection {
    Ingress,
    Egress,
}

impl AclDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            AclDirection::Ingress => "ingress",
            AclDirection::Egress => "egress",
        }
    }

    pub fn pipeline(&self) -> AclPipeline {
        match self {
            AclDirection::Ingress => AclPipeline::ToLport,
            AclDirection::Egress => AclPipeline::FromLport,
        }
    }

    /// Match fragment binding an ACL to the members of a port group.
    pub fn port_group_match(&self, port_group: &str) -> String {
        match self {
            AclDirection::Ingress => format!("outport == @{}", port_group),
            AclDirection::Egress => format!("inport == @{}", port_group),
        }
    }
}

impl std::fmt::Display for AclDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Syslog severity attached to a logged ACL.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AclSeverity {
    Alert,
    Warning,
    Notice,
    Info,
    Debug,
}

impl AclSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AclSeverity::Alert => "alert",
            AclSeverity::Warning => "warning",
            AclSeverity::Notice => "notice",
            AclSeverity::Info => "info",
            AclSeverity::Debug => "debug",
        }
    }
}

impl std::str::FromStr for AclSeverity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "alert" => Ok(AclSeverity::Alert),
            "warning" => Ok(AclSeverity::Warning),
            "notice" => Ok(AclSeverity::Notice),
            "info" => Ok(AclSeverity::Info),
            "debug" => Ok(AclSeverity::Debug),
            s => anyhow::bail!("invalid ACL log severity {:?}", s),
        }
    }
}

/// Per-namespace ACL logging configuration. `None` disables logging for the
/// corresponding ACL class.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AclLogging {
    pub allow: Option<AclSeverity>,
    pub deny: Option<AclSeverity>,
}

/// The object kind that owns an ACL. Stamped into external ids, this is the
/// root of the garbage-collection key space: sync enumerates ACLs by owner
/// kind to find rows whose owner no longer exists.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AclOwner {
    /// Allow ACLs compiled from a NetworkPolicy's rules.
    NetworkPolicy,
    /// Per-namespace default-deny and ARP-allow ACLs.
    NetpolNamespace,
    /// Cluster-wide NetworkPolicy infrastructure (hairpin allow).
    NetpolDefault,
    /// Per-node management-port allow ACLs.
    NetpolNode,
}

impl AclOwner {
    pub fn as_str(&self) -> &'static str {
        match self {
            AclOwner::NetworkPolicy => "NetworkPolicy",
            AclOwner::NetpolNamespace => "NetpolNamespace",
            AclOwner::NetpolDefault => "NetpolDefault",
            AclOwner::NetpolNode => "NetpolNode",
        }
    }
}

/// Keys of the structured external-id map.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExternalIdKey {
    /// The owner's name: `"<namespace>:<name>"` for policy-owned ACLs, the
    /// bare namespace for default-deny ACLs.
    ObjectName,
    PolicyDirection,
    /// Rule index within the policy.
    GressIdx,
    /// Sub-index distinguishing IPBlock ACLs of one rule; `-1` marks the
    /// peer-selector ACL.
    IpBlockIdx,
    /// L4 protocol of the ACL's port filter, or `none`.
    PortProtocol,
    /// Distinguishes rows sharing the other ids, e.g. `defaultDeny` vs
    /// `arpAllow` on the same namespace and direction.
    Type,
    Ip,
}

impl ExternalIdKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExternalIdKey::ObjectName => "name",
            ExternalIdKey::PolicyDirection => "direction",
            ExternalIdKey::GressIdx => "gress-index",
            ExternalIdKey::IpBlockIdx => "ip-block-index",
            ExternalIdKey::PortProtocol => "protocol",
            ExternalIdKey::Type => "type",
            ExternalIdKey::Ip => "ip",
        }
    }
}

/// Stable external identifiers of a northbound row.
///
/// Two ACLs with equal ids are the same row: create-or-update keys on the
/// ids, and predicate search matches on subsets of them.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DbIds {
    owner: AclOwner,
    controller: String,
    ids: BTreeMap<ExternalIdKey, String>,
}

impl DbIds {
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

    pub fn owner(&self) -> AclOwner {
        self.owner
    }

    pub fn controller(&self) -> &str {
        &self.controller
    }

    pub fn get(&self, key: ExternalIdKey) -> Option<&str> {
        self.ids.get(&key).map(|s| s.as_str())
    }

    /// Canonical row key. `BTreeMap` ordering makes this deterministic for a
    /// given id set, so it doubles as a primary key in stores and tests.
    pub fn primary_key(&self) -> String {
        let mut key = format!("{}:{}", self.owner.as_str(), self.controller);
        for (k, v) in &self.ids {
            key.push(':');
            key.push_str(k.as_str());
            key.push('=');
            key.push_str(v);
        }
        key
    }

    /// The ids as they are written to the row's `external_ids` column.
    pub fn external_ids(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        out.insert("owner-type".to_string(), self.owner.as_str().to_string());
        out.insert("owner-controller".to_string(), self.controller.clone());
        for (k, v) in &self.ids {
            out.insert(k.as_str().to_string(), v.clone());
        }
        out
    }
}

/// One access-control rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Acl {
    pub ids: DbIds,
    pub priority: i32,
    pub match_expr: String,
    pub action: AclAction,
    pub log: Option<AclSeverity>,
    pub pipeline: AclPipeline,
}

impl Acl {
    pub fn new(
        ids: DbIds,
        priority: i32,
        match_expr: String,
        action: AclAction,
        log: Option<AclSeverity>,
        pipeline: AclPipeline,
    ) -> Self {
        Self {
            ids,
            priority,
            match_expr,
            action,
            log,
            pipeline,
        }
    }
}

/// `ObjectName` id of an ACL owned by a policy.
pub fn acl_policy_key(namespace: &str, name: &str) -> String {
    format!("{}:{}", namespace, name)
}

#[derive(Clone, Debug, thiserror::Error)]
#[error("malformed policy ACL id {0:?}: expected \"<namespace>:<name>\"")]
pub struct MalformedPolicyKey(pub String);

/// Decodes the `(namespace, name)` of the policy that owns an ACL. The
/// inverse of [`acl_policy_key`]; failure means the database holds a row this
/// controller version cannot account for.
pub fn parse_acl_policy_key(key: &str) -> Result<(String, String), MalformedPolicyKey> {
    match key.split_once(':') {
        Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
            Ok((namespace.to_string(), name.to_string()))
        }
        _ => Err(MalformedPolicyKey(key.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_key_roundtrip() {
        let key = acl_policy_key("ns1", "allow-db");
        assert_eq!(key, "ns1:allow-db");
        let (ns, name) = parse_acl_policy_key(&key).unwrap();
        assert_eq!(ns, "ns1");
        assert_eq!(name, "allow-db");

        assert!(parse_acl_policy_key("no-separator").is_err());
        assert!(parse_acl_policy_key(":empty-ns").is_err());
        assert!(parse_acl_policy_key("empty-name:").is_err());
    }

    #[test]
    fn primary_key_is_order_independent() {
        let a = DbIds::new(AclOwner::NetworkPolicy, "default")
            .with(ExternalIdKey::ObjectName, "ns:np")
            .with(ExternalIdKey::PolicyDirection, "ingress");
        let b = DbIds::new(AclOwner::NetworkPolicy, "default")
            .with(ExternalIdKey::PolicyDirection, "ingress")
            .with(ExternalIdKey::ObjectName, "ns:np");
        assert_eq!(a.primary_key(), b.primary_key());
        assert_ne!(
            a.primary_key(),
            DbIds::new(AclOwner::NetpolNamespace, "default")
                .with(ExternalIdKey::ObjectName, "ns:np")
                .with(ExternalIdKey::PolicyDirection, "ingress")
                .primary_key(),
        );
    }
}
