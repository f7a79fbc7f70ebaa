//! The event-framework contract.
//!
//! A [`WatchFactory`] starts filtered watches over one resource type and
//! drives an [`EventHandler`] with an initial sync followed by individual
//! events. Handlers are required to be idempotent: the framework retries a
//! failed callback and re-syncs on stream resets.

use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use std::sync::Arc;

/// Callbacks invoked by a watch. `sync` runs once with the initial object
/// set before individual events are delivered.
#[async_trait]
pub trait EventHandler<T: Send + Sync + 'static>: Send + Sync + 'static {
    async fn sync(&self, objs: Vec<T>) -> Result<()>;

    async fn add(&self, obj: T) -> Result<()>;

    async fn update(&self, _old: T, new: T) -> Result<()> {
        self.add(new).await
    }

    async fn delete(&self, obj: T) -> Result<()>;
}

/// Tears down a running watch.
///
/// Stopping takes effect between callbacks: an in-flight callback runs to
/// completion, so handlers never observe resources torn down underneath a
/// live invocation. Dropping the handle stops the watch as well.
pub struct WatchHandle {
    stop: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchHandle {
    pub fn new(stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            stop: Some(Box::new(stop)),
        }
    }

    pub fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle").finish_non_exhaustive()
    }
}

/// Starts filtered watches for one resource type.
#[async_trait]
pub trait WatchFactory<T: Send + Sync + 'static>: Send + Sync + 'static {
    /// Watches objects matching `selector`, scoped to `namespace` when given.
    /// The handler's `sync` completes with the current object set before this
    /// returns; failures there fail the watch registration.
    async fn watch_filtered(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
        handler: Arc<dyn EventHandler<T>>,
    ) -> Result<WatchHandle>;
}
