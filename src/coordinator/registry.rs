use std::sync::Arc;

use dashmap::DashMap;

use crate::coordinator::tracker::SubscriptionTracker;

/// Per-stream index of live trackers.
///
/// Slot tables only know trackers currently hosted on a connection; this
/// index also covers trackers that are between managers while recovering,
/// which is what shutdown and diagnostics need.
pub(crate) struct SubscriptionRegistry {
    streams: DashMap<String, Vec<Arc<SubscriptionTracker>>>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        SubscriptionRegistry {
            streams: DashMap::new(),
        }
    }

    pub(crate) fn add(&self, tracker: &Arc<SubscriptionTracker>) {
        self.streams
            .entry(tracker.stream().to_owned())
            .or_insert_with(Vec::new)
            .push(Arc::clone(tracker));
    }

    pub(crate) fn remove(&self, tracker: &Arc<SubscriptionTracker>) {
        if let Some(mut trackers) = self.streams.get_mut(tracker.stream()) {
            trackers.retain(|candidate| candidate.id() != tracker.id());
        }
    }

    pub(crate) fn tracker_count(&self) -> usize {
        self.streams.iter().map(|entry| entry.value().len()).sum()
    }

    pub(crate) fn trackers(&self) -> Vec<Arc<SubscriptionTracker>> {
        self.streams
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect()
    }
}
