//! In-process event framework.
//!
//! A `SimWatches<T>` is a hub holding the current object set and the active
//! registrations. `watch_filtered` delivers the initial sync from the held
//! objects; `apply`/`delete` update the set and fan events out to every
//! registration whose namespace scope and selector match, which is how the
//! test suites stand in for the API server.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use ovn_policy_controller_k8s_api::labels;
use ovn_policy_controller_k8s_api::{EventHandler, WatchFactory, WatchHandle};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

struct Registration<T> {
    namespace: Option<String>,
    selector: LabelSelector,
    handler: Arc<dyn EventHandler<T>>,
}

struct Inner<T> {
    objects: BTreeMap<(String, String), T>,
    watches: BTreeMap<u64, Registration<T>>,
    next_id: u64,
}

pub struct SimWatches<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Default for SimWatches<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                objects: BTreeMap::new(),
                watches: BTreeMap::new(),
                next_id: 0,
            })),
        }
    }
}

// === impl SimWatches ===

impl<T> SimWatches<T>
where
    T: kube::Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn object_key(obj: &T) -> (String, String) {
        (obj.namespace().unwrap_or_default(), obj.name_unchecked())
    }

    fn matches(reg: &Registration<T>, obj: &T) -> bool {
        if let Some(ns) = &reg.namespace {
            if obj.namespace().as_deref() != Some(ns.as_str()) {
                return false;
            }
        }
        labels::matches(&reg.selector, obj.labels())
    }

    /// Seeds an object without dispatching events; part of setting up the
    /// initial cluster state before any watch is registered.
    pub fn insert(&self, obj: T) {
        let key = Self::object_key(&obj);
        self.inner.lock().objects.insert(key, obj);
    }

    /// Upserts an object and delivers add/update events to matching watches.
    pub async fn apply(&self, obj: T) -> Result<()> {
        let (previous, handlers) = {
            let mut inner = self.inner.lock();
            let previous = inner.objects.insert(Self::object_key(&obj), obj.clone());
            let handlers: Vec<_> = inner
                .watches
                .values()
                .filter(|reg| Self::matches(reg, &obj))
                .map(|reg| reg.handler.clone())
                .collect();
            (previous, handlers)
        };

        let mut errors = Vec::new();
        for handler in handlers {
            let res = match previous.clone() {
                Some(old) => handler.update(old, obj.clone()).await,
                None => handler.add(obj.clone()).await,
            };
            if let Err(error) = res {
                errors.push(error);
            }
        }
        aggregate(errors)
    }

    /// Removes an object and delivers delete events to matching watches.
    pub async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let (obj, handlers) = {
            let mut inner = self.inner.lock();
            let obj = match inner
                .objects
                .remove(&(namespace.to_string(), name.to_string()))
            {
                Some(obj) => obj,
                None => return Ok(()),
            };
            let handlers: Vec<_> = inner
                .watches
                .values()
                .filter(|reg| Self::matches(reg, &obj))
                .map(|reg| reg.handler.clone())
                .collect();
            (obj, handlers)
        };

        let mut errors = Vec::new();
        for handler in handlers {
            if let Err(error) = handler.delete(obj.clone()).await {
                errors.push(error);
            }
        }
        aggregate(errors)
    }

    pub fn watch_count(&self) -> usize {
        self.inner.lock().watches.len()
    }
}

fn aggregate(errors: Vec<anyhow::Error>) -> Result<()> {
    if errors.is_empty() {
        return Ok(());
    }
    let msg = errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; and ");
    Err(anyhow!(msg))
}

#[async_trait]
impl<T> WatchFactory<T> for SimWatches<T>
where
    T: kube::Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    async fn watch_filtered(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
        handler: Arc<dyn EventHandler<T>>,
    ) -> Result<WatchHandle> {
        let reg = Registration {
            namespace: namespace.map(|ns| ns.to_string()),
            selector: selector.clone(),
            handler: handler.clone(),
        };

        let initial: Vec<T> = {
            let inner = self.inner.lock();
            inner
                .objects
                .values()
                .filter(|obj| Self::matches(&reg, obj))
                .cloned()
                .collect()
        };
        handler.sync(initial).await?;

        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.watches.insert(id, reg);
            id
        };

        let inner = self.inner.clone();
        Ok(WatchHandle::new(move || {
            inner.lock().watches.remove(&id);
        }))
    }
}
