//! NetworkPolicy controller daemon.
//!
//! Watches NetworkPolicy and Namespace resources and compiles them through
//! the index crate. The northbound side runs against the in-process store
//! from the `sim` crate, so this binary doubles as a compilation prototype:
//! point it at a cluster and it reconciles policies end to end without an
//! OVN deployment. A real northbound client plugs in through the same
//! [`NbClient`] trait.
//!
//! [`NbClient`]: ovn_policy_controller_core::NbClient

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use clap::Parser;
use ovn_policy_controller_core::{NbClient, NbOp, PortGroup};
use ovn_policy_controller_k8s_api::{
    self as k8s, EventHandler, LabelSelector, ResourceExt, WatchFactory,
};
use ovn_policy_controller_k8s_index::{metrics::Metrics, watch::KubeWatches, Config, Controller};
use ovn_policy_controller_sim::{MemAddressSets, MemNb, MemPortCache};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[clap(name = "policy", about = "An OVN NetworkPolicy controller prototype")]
struct Args {
    #[clap(
        long,
        default_value = "ovn_policy_controller=info,warn",
        env = "OVN_POLICY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Name stamped into owned database rows.
    #[clap(long, default_value = "default")]
    controller_name: String,

    #[clap(long, action = clap::ArgAction::Set, default_value_t = true)]
    ipv4_mode: bool,

    #[clap(long, action = clap::ArgAction::Set, default_value_t = false)]
    ipv6_mode: bool,

    /// Honor the `k8s.ovn.org/acl-stateless` policy annotation.
    #[clap(long)]
    enable_stateless_netpol: bool,

    /// The cluster-wide port group carrying the hairpin-allow ACLs.
    #[clap(long, default_value = "clusterPortGroup")]
    cluster_port_group: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        log_level,
        log_format,
        client,
        admin,
        controller_name,
        ipv4_mode,
        ipv6_mode,
        enable_stateless_netpol,
        cluster_port_group,
    } = Args::parse();

    let mut prom = prometheus_client::registry::Registry::default();
    let metrics = Metrics::default();
    metrics.register(&mut prom);

    let runtime = kubert::Runtime::builder()
        .with_log(log_level, log_format)
        .with_admin(admin.into_builder().with_prometheus(prom))
        .with_client(client)
        .build()
        .await?;
    let kube_client = runtime.client();

    // The in-process northbound substrate; see the module docs above.
    info!("Using the in-process northbound store; transactions are not persisted");
    let nb = Arc::new(MemNb::new());
    nb.transact(vec![NbOp::CreateOrUpdatePortGroups(vec![PortGroup::new(
        cluster_port_group.clone(),
        cluster_port_group.clone(),
        vec![],
        &[],
    )])])
    .await?;

    let config = Config {
        controller_name,
        ipv4_mode,
        ipv6_mode,
        enable_stateless_netpol,
        cluster_port_group,
    };
    let controller = Controller::new(
        config,
        nb,
        Arc::new(MemAddressSets::new()),
        Arc::new(MemPortCache::new()),
        Arc::new(KubeWatches::new(kube_client.clone())),
        Arc::new(KubeWatches::new(kube_client.clone())),
        metrics,
    );

    // Namespaces must index before policies: adding a policy requires its
    // namespace's record.
    let namespace_watch = KubeWatches::<k8s::Namespace>::new(kube_client.clone())
        .watch_filtered(
            None,
            &LabelSelector::default(),
            Arc::new(NamespaceEvents {
                controller: controller.clone(),
            }),
        )
        .await?;

    // The policy watch's initial sync garbage-collects rows from previous
    // incarnations, then applies the live set.
    let policy_watch = KubeWatches::<k8s::NetworkPolicy>::new(kube_client)
        .watch_filtered(
            None,
            &LabelSelector::default(),
            Arc::new(PolicyEvents {
                controller: controller.clone(),
            }),
        )
        .await?;
    info!("Watching network policies");

    if runtime.run().await.is_err() {
        bail!("aborted");
    }
    drop((namespace_watch, policy_watch));
    Ok(())
}

struct NamespaceEvents {
    controller: Arc<Controller>,
}

#[async_trait]
impl EventHandler<k8s::Namespace> for NamespaceEvents {
    async fn sync(&self, namespaces: Vec<k8s::Namespace>) -> Result<()> {
        for namespace in &namespaces {
            if let Err(error) = self.controller.apply_namespace(namespace).await {
                warn!(%error, "Failed to apply namespace, leaving to retry");
            }
        }
        Ok(())
    }

    async fn add(&self, namespace: k8s::Namespace) -> Result<()> {
        self.controller.apply_namespace(&namespace).await
    }

    async fn delete(&self, namespace: k8s::Namespace) -> Result<()> {
        if let Some(name) = namespace.metadata.name.as_deref() {
            self.controller.delete_namespace(name).await;
        }
        Ok(())
    }
}

struct PolicyEvents {
    controller: Arc<Controller>,
}

#[async_trait]
impl EventHandler<k8s::NetworkPolicy> for PolicyEvents {
    async fn sync(&self, policies: Vec<k8s::NetworkPolicy>) -> Result<()> {
        self.controller.sync_network_policies(&policies).await?;
        for policy in &policies {
            if let Err(error) = self.controller.add_network_policy(policy).await {
                warn!(%error, "Failed to add network policy, leaving to retry");
            }
        }
        Ok(())
    }

    async fn add(&self, policy: k8s::NetworkPolicy) -> Result<()> {
        // An update recompiles from scratch: add cleans up any previous
        // incarnation under the same key first.
        self.controller.add_network_policy(&policy).await
    }

    async fn delete(&self, policy: k8s::NetworkPolicy) -> Result<()> {
        let (Some(namespace), Some(name)) = (policy.namespace(), policy.metadata.name.as_deref())
        else {
            return Ok(());
        };
        self.controller.delete_network_policy(&namespace, name).await
    }
}
