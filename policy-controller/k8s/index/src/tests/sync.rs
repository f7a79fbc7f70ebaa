use super::{mk_policy, TestConfig};
use ovn_policy_controller_core::acl::DEFAULT_ALLOW_PRIORITY;
use ovn_policy_controller_core::{
    acl_policy_key, default_deny_port_group_name, policy_port_group_name, Acl, AclAction,
    AclOwner, AclPipeline, DbIds, ExternalIdKey, NbClient, NbOp, PortGroup,
    EGRESS_DEFAULT_DENY_SUFFIX, INGRESS_DEFAULT_DENY_SUFFIX,
};

fn policy_acl(namespace: &str, name: &str) -> Acl {
    Acl::new(
        DbIds::new(AclOwner::NetworkPolicy, "default")
            .with(ExternalIdKey::ObjectName, acl_policy_key(namespace, name))
            .with(ExternalIdKey::PolicyDirection, "ingress")
            .with(ExternalIdKey::GressIdx, "0"),
        DEFAULT_ALLOW_PRIORITY,
        "ip4".to_string(),
        AclAction::AllowRelated,
        None,
        AclPipeline::ToLport,
    )
}

fn deny_acl(namespace: &str, direction: &str) -> Acl {
    Acl::new(
        DbIds::new(AclOwner::NetpolNamespace, "default")
            .with(ExternalIdKey::ObjectName, namespace)
            .with(ExternalIdKey::PolicyDirection, direction)
            .with(ExternalIdKey::Type, "defaultDeny"),
        1000,
        "drop-everything".to_string(),
        AclAction::Drop,
        None,
        AclPipeline::ToLport,
    )
}

/// Seeds database rows as a previous controller incarnation would have left
/// them: per-policy and default-deny ACLs attached to their port groups.
async fn seed_previous_incarnation(test: &TestConfig) {
    let alive = policy_acl("ns1", "p1");
    let gone = policy_acl("ns2", "p-gone");
    let ns2_ingress_deny = deny_acl("ns2", "ingress");
    let ns2_egress_deny = deny_acl("ns2", "egress");

    let (alive_pg, alive_readable) = policy_port_group_name("ns1", "p1");
    let (gone_pg, gone_readable) = policy_port_group_name("ns2", "p-gone");
    test.nb
        .transact(vec![
            NbOp::CreateOrUpdateAcls(vec![
                alive.clone(),
                gone.clone(),
                ns2_ingress_deny.clone(),
                ns2_egress_deny.clone(),
            ]),
            NbOp::CreateOrUpdatePortGroups(vec![
                PortGroup::new(alive_pg, alive_readable, vec![], std::slice::from_ref(&alive)),
                PortGroup::new(gone_pg, gone_readable, vec![], std::slice::from_ref(&gone)),
                PortGroup::new(
                    default_deny_port_group_name("ns2", INGRESS_DEFAULT_DENY_SUFFIX),
                    "ns2-ingress-deny",
                    vec![],
                    std::slice::from_ref(&ns2_ingress_deny),
                ),
                PortGroup::new(
                    default_deny_port_group_name("ns2", EGRESS_DEFAULT_DENY_SUFFIX),
                    "ns2-egress-deny",
                    vec![],
                    std::slice::from_ref(&ns2_egress_deny),
                ),
                // The cluster-wide group exists from cluster bring-up.
                PortGroup::new("clusterPortGroup", "clusterPortGroup", vec![], &[]),
            ]),
        ])
        .await
        .unwrap();
}

/// Startup GC deletes exactly the port groups whose owners no longer exist
/// and installs the hairpin exemption on the cluster port group.
#[tokio::test]
async fn startup_gc_removes_stale_port_groups() {
    let test = TestConfig::new();
    seed_previous_incarnation(&test).await;

    let expected = vec![mk_policy("ns1", "p1", &["Ingress"], None, None)];
    test.controller
        .sync_network_policies(&expected)
        .await
        .unwrap();

    let (alive_pg, _) = policy_port_group_name("ns1", "p1");
    let (gone_pg, _) = policy_port_group_name("ns2", "p-gone");
    assert!(test.nb.has_port_group(&alive_pg), "live policy untouched");
    assert_eq!(test.nb.port_group_acls(&alive_pg).unwrap().len(), 1);
    assert!(!test.nb.has_port_group(&gone_pg));
    assert!(!test
        .nb
        .has_port_group(&default_deny_port_group_name("ns2", INGRESS_DEFAULT_DENY_SUFFIX)));
    assert!(!test
        .nb
        .has_port_group(&default_deny_port_group_name("ns2", EGRESS_DEFAULT_DENY_SUFFIX)));

    // Stale ACLs went with their groups.
    let orphaned: Vec<_> = test
        .nb
        .all_acls()
        .into_iter()
        .filter(|acl| acl.ids.get(ExternalIdKey::ObjectName) == Some("ns2:p-gone"))
        .collect();
    assert!(orphaned.is_empty());

    let hairpin = test.nb.port_group_acls("clusterPortGroup").unwrap();
    assert_eq!(hairpin.len(), 2);
    assert!(hairpin
        .iter()
        .all(|acl| acl.action == AclAction::AllowRelated
            && acl.match_expr == "ip4.src == 169.254.169.5"));

    // Sync is idempotent: a second run changes nothing and installs no
    // duplicate hairpin ACLs.
    test.controller
        .sync_network_policies(&expected)
        .await
        .unwrap();
    assert_eq!(test.nb.port_group_acls("clusterPortGroup").unwrap().len(), 2);
}

/// An ACL whose owner id cannot be decoded aborts the sync for operator
/// inspection.
#[tokio::test]
async fn undecodable_policy_acl_id_fails_sync() {
    let test = TestConfig::new();
    let bad = Acl::new(
        DbIds::new(AclOwner::NetworkPolicy, "default")
            .with(ExternalIdKey::ObjectName, "no-separator"),
        DEFAULT_ALLOW_PRIORITY,
        "ip4".to_string(),
        AclAction::AllowRelated,
        None,
        AclPipeline::ToLport,
    );
    test.nb
        .transact(vec![
            NbOp::CreateOrUpdateAcls(vec![bad.clone()]),
            NbOp::CreateOrUpdatePortGroups(vec![PortGroup::new(
                "pg-bad",
                "pg-bad",
                vec![],
                std::slice::from_ref(&bad),
            )]),
        ])
        .await
        .unwrap();

    assert!(test.controller.sync_network_policies(&[]).await.is_err());
}

/// Rows written by another controller are out of scope for sync.
#[tokio::test]
async fn sync_ignores_other_controllers() {
    let test = TestConfig::new();
    let foreign = Acl::new(
        DbIds::new(AclOwner::NetworkPolicy, "other-controller")
            .with(ExternalIdKey::ObjectName, "ns9:p9"),
        DEFAULT_ALLOW_PRIORITY,
        "ip4".to_string(),
        AclAction::AllowRelated,
        None,
        AclPipeline::ToLport,
    );
    let (pg, readable) = policy_port_group_name("ns9", "p9");
    test.nb
        .transact(vec![
            NbOp::CreateOrUpdateAcls(vec![foreign.clone()]),
            NbOp::CreateOrUpdatePortGroups(vec![
                PortGroup::new(pg.clone(), readable, vec![], std::slice::from_ref(&foreign)),
                PortGroup::new("clusterPortGroup", "clusterPortGroup", vec![], &[]),
            ]),
        ])
        .await
        .unwrap();

    test.controller.sync_network_policies(&[]).await.unwrap();
    assert!(test.nb.has_port_group(&pg));
}

/// Management-port traffic from a node is admitted on that node's switch.
#[tokio::test]
async fn node_management_port_allow() {
    let test = TestConfig::new();
    test.controller
        .add_allow_acl_from_node("node-1", "10.64.0.2".parse().unwrap())
        .await
        .unwrap();

    let acls = test.nb.switch_acls("node-1");
    assert_eq!(acls.len(), 1);
    assert_eq!(acls[0].match_expr, "ip4.src == 10.64.0.2");
    assert_eq!(acls[0].action, AclAction::AllowRelated);
    assert_eq!(acls[0].ids.get(ExternalIdKey::Ip), Some("10.64.0.2"));
}
