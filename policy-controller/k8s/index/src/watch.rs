//! API-server-backed event framework.
//!
//! Each registered watch runs on its own task: an initial list satisfies the
//! handler's `sync` before registration returns, then watch events stream
//! in. Failed callbacks are retried a few times with a delay before the
//! event is dropped; idempotent handlers converge on the next event or
//! relist either way. Disconnects are absorbed by the kube watcher, which
//! relists and emits a restart that is fed back through `sync`.

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use kube::api::ListParams;
use kube::runtime::watcher;
use kube::Api;
use ovn_policy_controller_k8s_api::{labels, EventHandler, LabelSelector, WatchFactory, WatchHandle};
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::time;
use tracing::{error, info_span, warn, Instrument};

const CALLBACK_RETRIES: usize = 3;
const CALLBACK_RETRY_DELAY: time::Duration = time::Duration::from_secs(1);

/// Starts filtered watches against the API server.
pub struct KubeWatches<T> {
    client: kube::Client,
    _marker: PhantomData<fn() -> T>,
}

// === impl KubeWatches ===

impl<T> KubeWatches<T> {
    pub fn new(client: kube::Client) -> Self {
        Self {
            client,
            _marker: PhantomData,
        }
    }
}

enum Delivery<T> {
    Apply(T),
    Delete(T),
}

async fn deliver<T: Clone + Send + Sync + 'static>(handler: &Arc<dyn EventHandler<T>>, event: Delivery<T>) {
    let what = match &event {
        Delivery::Apply(_) => "apply",
        Delivery::Delete(_) => "delete",
    };
    for attempt in 1..=CALLBACK_RETRIES {
        let res = match &event {
            Delivery::Apply(obj) => handler.add(obj.clone()).await,
            Delivery::Delete(obj) => handler.delete(obj.clone()).await,
        };
        match res {
            Ok(()) => return,
            Err(error) if attempt == CALLBACK_RETRIES => {
                error!(%what, %error, "Dropping event after retries");
            }
            Err(error) => {
                warn!(%what, %error, attempt, "Event callback failed, retrying");
                time::sleep(CALLBACK_RETRY_DELAY).await;
            }
        }
    }
}

#[async_trait]
impl<T> WatchFactory<T> for KubeWatches<T>
where
    T: kube::Resource<DynamicType = ()>
        + Clone
        + DeserializeOwned
        + std::fmt::Debug
        + Send
        + Sync
        + 'static,
{
    async fn watch_filtered(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
        handler: Arc<dyn EventHandler<T>>,
    ) -> Result<WatchHandle> {
        let api: Api<T> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let query = labels::to_query(selector)?;

        let mut list_params = ListParams::default();
        let mut config = watcher::Config::default();
        if !query.is_empty() {
            list_params = list_params.labels(&query);
            config = config.labels(&query);
        }

        let initial = api.list(&list_params).await?.items;
        handler.sync(initial).await?;

        let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
        let span = info_span!("watch", kind = %T::kind(&()), selector = %query);
        let stream = watcher(api, config);
        tokio::spawn(
            async move {
                tokio::pin!(stream);
                loop {
                    let event = tokio::select! {
                        _ = stop_rx.changed() => return,
                        event = stream.next() => event,
                    };
                    match event {
                        None => return,
                        Some(Ok(watcher::Event::Applied(obj))) => {
                            deliver(&handler, Delivery::Apply(obj)).await;
                        }
                        Some(Ok(watcher::Event::Deleted(obj))) => {
                            deliver(&handler, Delivery::Delete(obj)).await;
                        }
                        Some(Ok(watcher::Event::Restarted(objs))) => {
                            if let Err(error) = handler.sync(objs).await {
                                warn!(%error, "Re-sync after watch restart failed");
                            }
                        }
                        Some(Err(error)) => {
                            warn!(%error, "Disconnected");
                            time::sleep(time::Duration::from_secs(1)).await;
                        }
                    }
                }
            }
            .instrument(span),
        );

        Ok(WatchHandle::new(move || {
            let _ = stop_tx.send(true);
        }))
    }
}
