use super::{mk_policy, TestConfig};
use crate::default_deny::DefaultDenyPortGroups;
use crate::policy::NetworkPolicy;
use ahash::AHashMap as HashMap;
use ovn_policy_controller_core::{
    default_deny_port_group_name, EGRESS_DEFAULT_DENY_SUFFIX, INGRESS_DEFAULT_DENY_SUFFIX,
};

fn mk_np(ns: &str, name: &str, policy_types: &[&str]) -> NetworkPolicy {
    let policy = mk_policy(ns, name, policy_types, None, None);
    NetworkPolicy::new(
        ns.to_string(),
        name.to_string(),
        policy.spec.as_ref().unwrap(),
    )
}

fn ports(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(name, uuid)| (name.to_string(), uuid.to_string()))
        .collect()
}

#[test]
fn ports_are_reference_counted_per_direction() {
    let shared = DefaultDenyPortGroups::default();
    let p1 = mk_np("ns1", "p1", &["Ingress"]);
    let p2 = mk_np("ns1", "p2", &["Ingress", "Egress"]);
    let pod = ports(&[("ns1_pod-a", "u-A")]);

    // First ingress reference emits the port; the egress map is untouched
    // for an ingress-only policy.
    let (ingress, egress) = shared.add_ports_for_policy(&p1, &pod);
    assert_eq!(ingress, vec!["u-A".to_string()]);
    assert!(egress.is_empty());
    assert_eq!(shared.ingress_ref_count("ns1_pod-a"), 1);
    assert_eq!(shared.egress_ref_count("ns1_pod-a"), 0);

    // Second policy only bumps the ingress count but opens egress.
    let (ingress, egress) = shared.add_ports_for_policy(&p2, &pod);
    assert!(ingress.is_empty());
    assert_eq!(egress, vec!["u-A".to_string()]);
    assert_eq!(shared.ingress_ref_count("ns1_pod-a"), 2);

    // Dropping one reference frees nothing; dropping the last frees the
    // port and removes the entry.
    let (freed_in, freed_eg) = shared.delete_ports_for_policy(&p2, &pod);
    assert!(freed_in.is_empty());
    assert_eq!(freed_eg, vec!["u-A".to_string()]);
    let (freed_in, _) = shared.delete_ports_for_policy(&p1, &pod);
    assert_eq!(freed_in, vec!["u-A".to_string()]);
    assert_eq!(shared.ingress_ref_count("ns1_pod-a"), 0);
}

#[test]
fn delete_of_unknown_port_is_a_noop() {
    let shared = DefaultDenyPortGroups::default();
    let p1 = mk_np("ns1", "p1", &["Ingress"]);
    let (ingress, egress) = shared.delete_ports_for_policy(&p1, &ports(&[("ns1_pod-a", "u-A")]));
    assert!(ingress.is_empty() && egress.is_empty());
}

/// The shared record and both port groups exist exactly while at least one
/// policy of the namespace is registered.
#[tokio::test]
async fn deny_port_groups_follow_policy_count() {
    let test = TestConfig::new();
    test.add_namespace("ns1").await;
    let ingress_pg = default_deny_port_group_name("ns1", INGRESS_DEFAULT_DENY_SUFFIX);
    let egress_pg = default_deny_port_group_name("ns1", EGRESS_DEFAULT_DENY_SUFFIX);

    test.controller
        .add_network_policy(&mk_policy("ns1", "p1", &["Ingress"], None, None))
        .await
        .unwrap();
    assert!(test.nb.has_port_group(&ingress_pg));
    assert!(test.nb.has_port_group(&egress_pg));
    assert!(test.controller.deny_record("ns1").await.is_some());

    test.controller
        .add_network_policy(&mk_policy("ns1", "p2", &["Ingress"], None, None))
        .await
        .unwrap();

    // Two joined policies: the first delete keeps the groups alive.
    test.controller
        .delete_network_policy("ns1", "p1")
        .await
        .unwrap();
    assert!(test.nb.has_port_group(&ingress_pg));

    test.controller
        .delete_network_policy("ns1", "p2")
        .await
        .unwrap();
    assert!(!test.nb.has_port_group(&ingress_pg));
    assert!(!test.nb.has_port_group(&egress_pg));
    assert!(test.controller.deny_record("ns1").await.is_none());
}

/// A failed transaction reverts the in-memory counters so retries observe a
/// consistent baseline.
#[tokio::test]
async fn counters_roll_back_when_the_transaction_fails() {
    let test = TestConfig::new();
    test.add_namespace("ns1").await;
    test.seed_pod("ns1", "pod-a", "u-A");
    test.controller
        .add_network_policy(&mk_policy("ns1", "p1", &["Ingress"], None, None))
        .await
        .unwrap();
    let shared = test.controller.deny_record("ns1").await.unwrap();
    assert_eq!(shared.ingress_ref_count("ns1_pod-a"), 1);

    // A second pod appears but the transaction installing it fails.
    test.port_cache.add("ns1", "pod-b", "u-B");
    test.nb.fail_next_transact();
    let err = test.pods.apply(super::mk_pod("ns1", "pod-b", &[])).await;
    assert!(err.is_err());
    assert_eq!(shared.ingress_ref_count("ns1_pod-b"), 0);
    let ingress_pg = default_deny_port_group_name("ns1", INGRESS_DEFAULT_DENY_SUFFIX);
    assert!(!test
        .nb
        .port_group_ports(&ingress_pg)
        .unwrap()
        .contains("u-B"));

    // The retried event converges.
    test.pods
        .apply(super::mk_pod("ns1", "pod-b", &[]))
        .await
        .unwrap();
    assert_eq!(shared.ingress_ref_count("ns1_pod-b"), 1);
    assert!(test
        .nb
        .port_group_ports(&ingress_pg)
        .unwrap()
        .contains("u-B"));
}
