//! Event counters for the controller's reconciliation paths.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct EventLabels {
    resource: String,
    event: String,
}

/// Counters by resource and event kind, mirroring the handler entry points.
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    events: Family<EventLabels, Counter>,
}

// === impl Metrics ===

impl Metrics {
    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "network_policy_events",
            "Events handled by the network policy controller",
            self.events.clone(),
        );
    }

    fn record(&self, resource: &str, event: &str) {
        self.events
            .get_or_create(&EventLabels {
                resource: resource.to_string(),
                event: event.to_string(),
            })
            .inc();
    }

    pub(crate) fn record_policy_event(&self, event: &str) {
        self.record("networkpolicy", event);
    }

    pub(crate) fn record_pod_event(&self, event: &str) {
        self.record("localpod", event);
    }

    pub(crate) fn record_peer_namespace_event(&self, event: &str) {
        self.record("peernamespace", event);
    }
}
