//! Domain model for the OVN NetworkPolicy controller.
//!
//! This crate holds the northbound-database vocabulary shared by every other
//! crate in the workspace: ACLs and their stable external identifiers, port
//! groups and their naming scheme, the deferred-operation transaction model,
//! and the logical-port cache contract. It is deliberately free of Kubernetes
//! types; everything here speaks in names, UUIDs, and match expressions.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod acl;
pub mod nb;
pub mod port_cache;
pub mod port_group;

pub use self::acl::{
    acl_policy_key, parse_acl_policy_key, Acl, AclAction, AclDirection, AclLogging, AclOwner,
    AclPipeline, AclSeverity, DbIds, ExternalIdKey,
};
pub use self::nb::{AclPredicate, NbClient, NbOp, PortGroupRecord};
pub use self::port_cache::{logical_port_name, LogicalPortCache, PortInfo};
pub use self::port_group::{
    default_deny_port_group_name, hashed_name, policy_port_group_name, PortGroup,
    EGRESS_DEFAULT_DENY_SUFFIX, INGRESS_DEFAULT_DENY_SUFFIX,
};
