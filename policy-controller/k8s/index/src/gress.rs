//! Compiled form of one ingress or egress NetworkPolicy rule.
//!
//! A rule compiles to port-match fragments, IPBlock fragments, and address-
//! set references. Bound to the policy's port group it produces allow ACLs:
//! one per L4 protocol variant for the peer selectors (or for everything,
//! when the rule names no peers), plus one per IPBlock. Peer-selector ACLs
//! reference address sets by name, so set membership changes never rewrite
//! match text; only the appearance or disappearance of an ACL does.

use anyhow::{Context, Result};
use ipnet::IpNet;
use ovn_policy_controller_core::acl::DEFAULT_ALLOW_PRIORITY;
use ovn_policy_controller_core::{
    acl_policy_key, Acl, AclAction, AclDirection, AclLogging, AclOwner, DbIds, ExternalIdKey,
};
use ovn_policy_controller_k8s_api::{self as k8s, AddressSetHandles};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use tracing::warn;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        }
    }

    fn from_spec(s: Option<&str>) -> Self {
        match s {
            None | Some("TCP") => Protocol::Tcp,
            Some("UDP") => Protocol::Udp,
            Some("SCTP") => Protocol::Sctp,
            Some(other) => {
                warn!(protocol = %other, "Unknown policy port protocol, assuming TCP");
                Protocol::Tcp
            }
        }
    }
}

#[derive(Clone, Debug)]
struct PortMatch {
    protocol: Protocol,
    port: Option<i32>,
    end_port: Option<i32>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Family {
    V4,
    V6,
}

impl Family {
    fn prefix(&self) -> &'static str {
        match self {
            Family::V4 => "ip4",
            Family::V6 => "ip6",
        }
    }
}

#[derive(Clone, Debug)]
struct IpBlockMatch {
    family: Family,
    cidr: String,
    except: Vec<String>,
}

/// Peer address-set state. Pod-selector and own-namespace set names are
/// fixed at compile time; the per-rule union set and its namespace
/// membership are maintained by the peer-namespace watcher, concurrently
/// with ACL rebuilds, hence the mutex.
#[derive(Default)]
struct PeerSets {
    v4: BTreeSet<String>,
    v6: BTreeSet<String>,
    union: Option<(String, AddressSetHandles)>,
    namespaces: BTreeSet<String>,
}

pub(crate) struct GressPolicy {
    pub(crate) direction: AclDirection,
    pub(crate) idx: usize,
    policy_namespace: String,
    policy_name: String,
    controller: String,
    stateless: bool,
    ipv4_mode: bool,
    ipv6_mode: bool,
    port_matches: Vec<PortMatch>,
    ip_blocks: Vec<IpBlockMatch>,
    pub(crate) has_peer_selector: bool,
    peers: Mutex<PeerSets>,
}

// === impl GressPolicy ===

impl GressPolicy {
    pub(crate) fn new(
        direction: AclDirection,
        idx: usize,
        policy_namespace: &str,
        policy_name: &str,
        config: &crate::Config,
        stateless: bool,
    ) -> Self {
        Self {
            direction,
            idx,
            policy_namespace: policy_namespace.to_string(),
            policy_name: policy_name.to_string(),
            controller: config.controller_name.clone(),
            stateless,
            ipv4_mode: config.ipv4_mode,
            ipv6_mode: config.ipv6_mode,
            port_matches: Vec::new(),
            ip_blocks: Vec::new(),
            has_peer_selector: false,
            peers: Mutex::new(PeerSets::default()),
        }
    }

    /// Records one port spec. Named ports cannot be compiled to a match
    /// fragment without per-pod resolution and are skipped.
    pub(crate) fn add_port_policy(&mut self, port: &k8s::NetworkPolicyPort) {
        let protocol = Protocol::from_spec(port.protocol.as_deref());
        let port_number = match &port.port {
            None => None,
            Some(k8s::IntOrString::Int(n)) => Some(*n),
            Some(k8s::IntOrString::String(name)) => {
                warn!(
                    port = %name,
                    policy = %acl_policy_key(&self.policy_namespace, &self.policy_name),
                    "Named ports are not supported, skipping port match",
                );
                return;
            }
        };
        self.port_matches.push(PortMatch {
            protocol,
            port: port_number,
            end_port: port_number.and(port.end_port),
        });
    }

    pub(crate) fn add_ip_block(&mut self, block: &k8s::IPBlock) -> Result<()> {
        let net: IpNet = block
            .cidr
            .parse()
            .with_context(|| format!("invalid IPBlock cidr {:?}", block.cidr))?;
        let family = match net {
            IpNet::V4(_) => Family::V4,
            IpNet::V6(_) => Family::V6,
        };
        for except in block.except.iter().flatten() {
            let _: IpNet = except
                .parse()
                .with_context(|| format!("invalid IPBlock except {:?}", except))?;
        }
        self.ip_blocks.push(IpBlockMatch {
            family,
            cidr: block.cidr.clone(),
            except: block.except.clone().unwrap_or_default(),
        });
        Ok(())
    }

    /// Adds the v4/v6 set names of a pod-selector or own-namespace peer.
    pub(crate) fn add_peer_address_sets(&self, handles: &AddressSetHandles) {
        let mut peers = self.peers.lock();
        peers.v4.insert(handles.v4.clone());
        peers.v6.insert(handles.v6.clone());
    }

    /// Installs the rule's peer-namespaces union set. Only the first
    /// namespace-selector peer of a rule creates it; later peers share it.
    pub(crate) fn set_peer_namespaces_set(&self, key: String, handles: AddressSetHandles) -> bool {
        let mut peers = self.peers.lock();
        if peers.union.is_some() {
            return false;
        }
        peers.union = Some((key, handles));
        true
    }

    pub(crate) fn peer_namespaces_key(&self) -> Option<String> {
        self.peers.lock().union.as_ref().map(|(key, _)| key.clone())
    }

    /// Records a namespace as merged into the union set; false when it
    /// already was.
    pub(crate) fn add_namespace(&self, namespace: &str) -> bool {
        self.peers.lock().namespaces.insert(namespace.to_string())
    }

    pub(crate) fn remove_namespace(&self, namespace: &str) -> bool {
        self.peers.lock().namespaces.remove(namespace)
    }

    fn acl_ids(&self, block_idx: i64, protocol: &str) -> DbIds {
        DbIds::new(AclOwner::NetworkPolicy, &self.controller)
            .with(
                ExternalIdKey::ObjectName,
                acl_policy_key(&self.policy_namespace, &self.policy_name),
            )
            .with(ExternalIdKey::PolicyDirection, self.direction.as_str())
            .with(ExternalIdKey::GressIdx, self.idx.to_string())
            .with(ExternalIdKey::IpBlockIdx, block_idx.to_string())
            .with(ExternalIdKey::PortProtocol, protocol)
    }

    /// L4 variants of this rule: one entry per protocol carrying port specs,
    /// or a single unconstrained entry when the rule names no ports.
    fn l4_variants(&self) -> Vec<(String, Option<String>)> {
        if self.port_matches.is_empty() {
            return vec![("none".to_string(), None)];
        }
        let mut variants = Vec::new();
        for protocol in [Protocol::Tcp, Protocol::Udp, Protocol::Sctp] {
            let specs: Vec<&PortMatch> = self
                .port_matches
                .iter()
                .filter(|p| p.protocol == protocol)
                .collect();
            if specs.is_empty() {
                continue;
            }
            let proto = protocol.as_str();
            // A spec with no port number admits the whole protocol.
            let fragments: Vec<String> = if specs.iter().any(|p| p.port.is_none()) {
                Vec::new()
            } else {
                specs
                    .iter()
                    .map(|p| match (p.port, p.end_port) {
                        (Some(port), Some(end)) => {
                            format!("({proto}.dst >= {port} && {proto}.dst <= {end})")
                        }
                        (Some(port), None) => format!("{proto}.dst == {port}"),
                        (None, _) => unreachable!("filtered above"),
                    })
                    .collect()
            };
            let l4 = match fragments.len() {
                0 => proto.to_string(),
                1 => format!("{} && {}", proto, fragments[0]),
                _ => format!("{} && ({})", proto, fragments.join(" || ")),
            };
            variants.push((proto.to_string(), Some(l4)));
        }
        variants
    }

    /// Traffic field constrained by peers: sources for ingress, destinations
    /// for egress.
    fn peer_field(&self) -> &'static str {
        match self.direction {
            AclDirection::Ingress => "src",
            AclDirection::Egress => "dst",
        }
    }

    /// Match over every enabled address family; used by rules with no peers,
    /// which allow all traffic on their ports.
    fn all_families_match(&self) -> String {
        match (self.ipv4_mode, self.ipv6_mode) {
            (true, true) => "(ip4 || ip6)".to_string(),
            (false, true) => "ip6".to_string(),
            // v4-only is also the fallback for a misconfigured mode pair.
            _ => "ip4".to_string(),
        }
    }

    fn selector_l3_match(&self, peers: &PeerSets) -> String {
        let field = self.peer_field();
        let union = peers.union.as_ref().map(|(_, handles)| handles);
        let mut clauses = Vec::new();
        if self.ipv4_mode {
            let names: BTreeSet<&str> = peers
                .v4
                .iter()
                .map(|s| s.as_str())
                .chain(union.map(|h| h.v4.as_str()))
                .collect();
            if !names.is_empty() {
                let sets: Vec<String> = names.iter().map(|n| format!("${}", n)).collect();
                clauses.push(format!("ip4.{} == {{{}}}", field, sets.join(", ")));
            }
        }
        if self.ipv6_mode {
            let names: BTreeSet<&str> = peers
                .v6
                .iter()
                .map(|s| s.as_str())
                .chain(union.map(|h| h.v6.as_str()))
                .collect();
            if !names.is_empty() {
                let sets: Vec<String> = names.iter().map(|n| format!("${}", n)).collect();
                clauses.push(format!("ip6.{} == {{{}}}", field, sets.join(", ")));
            }
        }
        match clauses.len() {
            0 => self.all_families_match(),
            1 => clauses.remove(0),
            _ => format!("({})", clauses.join(" || ")),
        }
    }

    fn block_l3_match(&self, block: &IpBlockMatch) -> String {
        let prefix = block.family.prefix();
        let field = self.peer_field();
        let base = format!("{}.{} == {}", prefix, field, block.cidr);
        if block.except.is_empty() {
            base
        } else {
            format!(
                "{} && {}.{} != {{{}}}",
                base,
                prefix,
                field,
                block.except.join(", ")
            )
        }
    }

    fn action(&self) -> AclAction {
        if self.stateless {
            AclAction::AllowStateless
        } else {
            AclAction::AllowRelated
        }
    }

    /// The ACLs that, installed in `port_group`, implement this rule:
    /// `current` is the desired set, `removed` holds ACLs from this rule's
    /// id space that must not remain installed. A peer-selector ACL whose
    /// address sets are all absent matches nothing and is emitted as
    /// removed.
    pub(crate) fn build_local_pod_acls(
        &self,
        port_group: &str,
        acl_logging: &AclLogging,
    ) -> (Vec<Acl>, Vec<Acl>) {
        let peers = self.peers.lock();
        let pipeline = self.direction.pipeline();
        let pg_match = self.direction.port_group_match(port_group);
        let no_peers = !self.has_peer_selector && self.ip_blocks.is_empty();
        let static_sets_present = !peers.v4.is_empty() || !peers.v6.is_empty();
        let selector_active =
            no_peers || (self.has_peer_selector && (static_sets_present || !peers.namespaces.is_empty()));

        let mut current = Vec::new();
        let mut removed = Vec::new();
        for (protocol, l4) in self.l4_variants() {
            if no_peers || self.has_peer_selector {
                let l3 = if no_peers {
                    self.all_families_match()
                } else {
                    self.selector_l3_match(&peers)
                };
                let mut parts = vec![l3];
                parts.extend(l4.clone());
                parts.push(pg_match.clone());
                let acl = Acl::new(
                    self.acl_ids(-1, &protocol),
                    DEFAULT_ALLOW_PRIORITY,
                    parts.join(" && "),
                    self.action(),
                    acl_logging.allow,
                    pipeline,
                );
                if selector_active {
                    current.push(acl);
                } else {
                    removed.push(acl);
                }
            }

            for (i, block) in self.ip_blocks.iter().enumerate() {
                let mut parts = vec![self.block_l3_match(block)];
                parts.extend(l4.clone());
                parts.push(pg_match.clone());
                current.push(Acl::new(
                    self.acl_ids(i as i64, &protocol),
                    DEFAULT_ALLOW_PRIORITY,
                    parts.join(" && "),
                    self.action(),
                    acl_logging.allow,
                    pipeline,
                ));
            }
        }
        (current, removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ovn_policy_controller_core::AclPipeline;

    fn config() -> crate::Config {
        crate::Config::default()
    }

    fn handles(tag: &str) -> AddressSetHandles {
        AddressSetHandles {
            v4: format!("{}v4", tag),
            v6: format!("{}v6", tag),
        }
    }

    #[test]
    fn empty_rule_allows_everything_on_the_port_group() {
        let gp = GressPolicy::new(AclDirection::Ingress, 0, "ns1", "p1", &config(), false);
        let (current, removed) = gp.build_local_pod_acls("pg", &AclLogging::default());
        assert!(removed.is_empty());
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].match_expr, "ip4 && outport == @pg");
        assert_eq!(current[0].action, AclAction::AllowRelated);
        assert_eq!(current[0].pipeline, AclPipeline::ToLport);
    }

    #[test]
    fn port_specs_group_by_protocol() {
        let mut gp = GressPolicy::new(AclDirection::Ingress, 0, "ns1", "p1", &config(), false);
        gp.add_port_policy(&k8s::NetworkPolicyPort {
            protocol: Some("TCP".to_string()),
            port: Some(k8s::IntOrString::Int(80)),
            end_port: None,
        });
        gp.add_port_policy(&k8s::NetworkPolicyPort {
            protocol: Some("TCP".to_string()),
            port: Some(k8s::IntOrString::Int(8000)),
            end_port: Some(8080),
        });
        gp.add_port_policy(&k8s::NetworkPolicyPort {
            protocol: Some("UDP".to_string()),
            port: Some(k8s::IntOrString::Int(53)),
            end_port: None,
        });
        let (current, _) = gp.build_local_pod_acls("pg", &AclLogging::default());
        assert_eq!(current.len(), 2);
        assert_eq!(
            current[0].match_expr,
            "ip4 && tcp && (tcp.dst == 80 || (tcp.dst >= 8000 && tcp.dst <= 8080)) && outport == @pg",
        );
        assert_eq!(
            current[1].match_expr,
            "ip4 && udp && udp.dst == 53 && outport == @pg",
        );
    }

    #[test]
    fn ip_block_with_except() {
        let mut gp = GressPolicy::new(AclDirection::Egress, 0, "ns1", "p1", &config(), false);
        gp.add_ip_block(&k8s::IPBlock {
            cidr: "10.0.0.0/8".to_string(),
            except: Some(vec!["10.1.0.0/16".to_string(), "10.2.0.0/16".to_string()]),
        })
        .unwrap();
        assert!(gp
            .add_ip_block(&k8s::IPBlock {
                cidr: "not-a-cidr".to_string(),
                except: None,
            })
            .is_err());

        let (current, removed) = gp.build_local_pod_acls("pg", &AclLogging::default());
        assert!(removed.is_empty());
        assert_eq!(current.len(), 1);
        assert_eq!(
            current[0].match_expr,
            "ip4.dst == 10.0.0.0/8 && ip4.dst != {10.1.0.0/16, 10.2.0.0/16} && inport == @pg",
        );
        assert_eq!(current[0].pipeline, AclPipeline::FromLport);
    }

    #[test]
    fn selector_acl_follows_union_membership() {
        let gp = {
            let mut gp = GressPolicy::new(AclDirection::Ingress, 0, "ns1", "p1", &config(), false);
            gp.has_peer_selector = true;
            gp
        };
        assert!(gp.set_peer_namespaces_set("key".to_string(), handles("u")));
        assert!(!gp.set_peer_namespaces_set("other".to_string(), handles("x")));

        // No namespaces merged yet: the ACL matches nothing and is removed.
        let (current, removed) = gp.build_local_pod_acls("pg", &AclLogging::default());
        assert!(current.is_empty());
        assert_eq!(removed.len(), 1);

        assert!(gp.add_namespace("prod-1"));
        assert!(!gp.add_namespace("prod-1"));
        let (current, removed) = gp.build_local_pod_acls("pg", &AclLogging::default());
        assert!(removed.is_empty());
        assert_eq!(current.len(), 1);
        let match_one = current[0].match_expr.clone();
        assert_eq!(match_one, "ip4.src == {$uv4} && outport == @pg");

        // More namespaces change set membership, never the match text.
        gp.add_namespace("prod-2");
        let (current, _) = gp.build_local_pod_acls("pg", &AclLogging::default());
        assert_eq!(current[0].match_expr, match_one);

        assert!(gp.remove_namespace("prod-1"));
        gp.remove_namespace("prod-2");
        let (current, removed) = gp.build_local_pod_acls("pg", &AclLogging::default());
        assert!(current.is_empty());
        assert_eq!(removed.len(), 1);
    }

    #[test]
    fn stateless_rules_emit_stateless_allows() {
        let gp = GressPolicy::new(AclDirection::Ingress, 0, "ns1", "p1", &config(), true);
        let (current, _) = gp.build_local_pod_acls("pg", &AclLogging::default());
        assert_eq!(current[0].action, AclAction::AllowStateless);
    }
}
