use crate::acl::Acl;
use sha2::{Digest, Sha256};

/// Suffixes of the two per-namespace default-deny port groups.
pub const INGRESS_DEFAULT_DENY_SUFFIX: &str = "ingressDefaultDeny";
pub const EGRESS_DEFAULT_DENY_SUFFIX: &str = "egressDefaultDeny";

/// Derives a database-safe name from a free-form identifier.
///
/// Northbound names must start with a letter and namespaces/policy names can
/// exceed the length the database accepts, so names are a truncated digest
/// with a letter prefix. The format is compatibility-relevant: it must stay
/// stable across controller restarts and upgrades, since sync matches rows
/// written by previous incarnations by name.
pub fn hashed_name(s: &str) -> String {
    let digest = Sha256::digest(s.as_bytes());
    let mut out = String::with_capacity(33);
    out.push('a');
    for b in &digest[..16] {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Name of a namespace's default-deny port group for one direction.
pub fn default_deny_port_group_name(namespace: &str, direction_suffix: &str) -> String {
    format!("{}_{}", hashed_name(namespace), direction_suffix)
}

/// Names of a policy's own port group: the database name and the
/// human-readable secondary name retained for observability.
pub fn policy_port_group_name(namespace: &str, name: &str) -> (String, String) {
    let readable = format!("{}_{}", namespace, name);
    (hashed_name(&readable), readable)
}

/// A named container of logical-switch-port UUIDs with attached ACLs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortGroup {
    pub name: String,
    pub external_name: String,
    pub ports: Vec<String>,
    /// Primary keys of the ACLs constraining this group's members.
    pub acls: Vec<String>,
}

impl PortGroup {
    pub fn new(
        name: impl Into<String>,
        external_name: impl Into<String>,
        ports: Vec<String>,
        acls: &[Acl],
    ) -> Self {
        Self {
            name: name.into(),
            external_name: external_name.into(),
            ports,
            acls: acls.iter().map(|acl| acl.ids.primary_key()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashed_names_are_stable_and_db_safe() {
        let name = hashed_name("ns1_allow-db");
        assert_eq!(name, hashed_name("ns1_allow-db"));
        assert_ne!(name, hashed_name("ns1_allow-db2"));
        assert_eq!(name.len(), 33);
        assert!(name.starts_with('a'));
        assert!(name[1..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn default_deny_names_share_the_namespace_hash() {
        let ingress = default_deny_port_group_name("ns1", INGRESS_DEFAULT_DENY_SUFFIX);
        let egress = default_deny_port_group_name("ns1", EGRESS_DEFAULT_DENY_SUFFIX);
        assert!(ingress.ends_with("_ingressDefaultDeny"));
        assert!(egress.ends_with("_egressDefaultDeny"));
        assert_eq!(
            ingress.trim_end_matches("_ingressDefaultDeny"),
            egress.trim_end_matches("_egressDefaultDeny"),
        );
    }

    #[test]
    fn policy_port_group_keeps_readable_name() {
        let (hashed, readable) = policy_port_group_name("ns1", "p1");
        assert_eq!(readable, "ns1_p1");
        assert_eq!(hashed, hashed_name("ns1_p1"));
    }
}
