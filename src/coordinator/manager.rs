use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rabbitmq_stream_protocol::{message::Message, Broker, ResponseCode};
use tracing::{debug, trace, warn};

use crate::client::{
    Client, ClientListeners, MessageListener, MetadataListener, ShutdownContext, ShutdownListener,
    MAX_SUBSCRIPTIONS_PER_CLIENT,
};
use crate::consumer::MessageContext;
use crate::coordinator::pool::PoolKey;
use crate::coordinator::tracker::SubscriptionTracker;
use crate::coordinator::CoordinatorInner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ManagerState {
    Open,
    Closing,
    Closed,
}

struct SlotTable {
    entries: Vec<Option<Arc<SubscriptionTracker>>>,
    occupied: usize,
    state: ManagerState,
}

/// Owns one broker connection and up to [`MAX_SUBSCRIPTIONS_PER_CLIENT`]
/// subscriptions. Slot *i* of the table is subscription id *i* on the wire.
pub(crate) struct SubscriptionManager {
    id: u64,
    key: PoolKey,
    client: Arc<dyn Client>,
    slots: Mutex<SlotTable>,
}

impl SubscriptionManager {
    pub(crate) fn new(id: u64, key: PoolKey, client: Arc<dyn Client>) -> Self {
        SubscriptionManager {
            id,
            key,
            client,
            slots: Mutex::new(SlotTable {
                entries: vec![None; MAX_SUBSCRIPTIONS_PER_CLIENT],
                occupied: 0,
                state: ManagerState::Open,
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn key(&self) -> &PoolKey {
        &self.key
    }

    pub(crate) fn broker(&self) -> &Broker {
        &self.key.broker
    }

    pub(crate) fn client(&self) -> Arc<dyn Client> {
        Arc::clone(&self.client)
    }

    /// Claims the lowest free slot for the tracker and records the
    /// assignment. `None` when full or no longer open.
    pub(crate) fn try_reserve(self: &Arc<Self>, tracker: &Arc<SubscriptionTracker>) -> Option<u8> {
        let mut slots = self.slots.lock();
        if slots.state != ManagerState::Open {
            return None;
        }
        let free = slots.entries.iter().position(|slot| slot.is_none())?;
        slots.entries[free] = Some(Arc::clone(tracker));
        slots.occupied += 1;
        let subscription_id = free as u8;
        tracker.set_assignment(self, subscription_id);
        Some(subscription_id)
    }

    /// Clears the slot if it still holds this tracker. Returns the occupied
    /// count after the release.
    pub(crate) fn release(&self, subscription_id: u8, tracker: &Arc<SubscriptionTracker>) -> usize {
        let mut slots = self.slots.lock();
        let index = subscription_id as usize;
        let held = slots
            .entries
            .get(index)
            .and_then(|slot| slot.as_ref())
            .map(|current| current.id() == tracker.id())
            .unwrap_or(false);
        if held {
            slots.entries[index] = None;
            slots.occupied -= 1;
        }
        tracker.clear_assignment_if(self.id, subscription_id);
        slots.occupied
    }

    /// Flips the tracker to active, provided its slot survived until now and
    /// nothing closed it meanwhile. The slot check runs under the slot lock
    /// so a concurrent drain cannot slip in; the state transition itself is
    /// a compare-and-set, so a closer landing between the two loses nothing.
    pub(crate) fn confirm_active(
        &self,
        subscription_id: u8,
        tracker: &Arc<SubscriptionTracker>,
    ) -> bool {
        let slots = self.slots.lock();
        if slots.state != ManagerState::Open {
            return false;
        }
        let held = slots
            .entries
            .get(subscription_id as usize)
            .and_then(|slot| slot.as_ref())
            .map(|current| current.id() == tracker.id())
            .unwrap_or(false);
        held && tracker.try_activate()
    }

    /// Marks the manager closed when it has no live slots. Pool removal
    /// happens under the pool lock around this call.
    pub(crate) fn begin_close_if_empty(&self) -> bool {
        let mut slots = self.slots.lock();
        if slots.state == ManagerState::Open && slots.occupied == 0 {
            slots.state = ManagerState::Closed;
            true
        } else {
            false
        }
    }

    /// Empties the slot table after the connection died. The manager is done
    /// hosting anything.
    pub(crate) fn drain_all(&self) -> Vec<(u8, Arc<SubscriptionTracker>)> {
        let mut slots = self.slots.lock();
        slots.state = ManagerState::Closed;
        Self::take_matching(&mut slots, |_| true, self.id)
    }

    /// Removes only the trackers of one stream; the manager keeps serving
    /// the rest.
    pub(crate) fn drain_stream(&self, stream: &str) -> Vec<(u8, Arc<SubscriptionTracker>)> {
        let mut slots = self.slots.lock();
        Self::take_matching(&mut slots, |tracker| tracker.stream() == stream, self.id)
    }

    /// Coordinator shutdown: stop accepting reservations, hand back whatever
    /// is still hosted.
    pub(crate) fn drain_for_shutdown(&self) -> Vec<(u8, Arc<SubscriptionTracker>)> {
        let mut slots = self.slots.lock();
        slots.state = ManagerState::Closing;
        Self::take_matching(&mut slots, |_| true, self.id)
    }

    pub(crate) fn mark_closed(&self) {
        self.slots.lock().state = ManagerState::Closed;
    }

    fn take_matching(
        slots: &mut SlotTable,
        matches: impl Fn(&SubscriptionTracker) -> bool,
        manager_id: u64,
    ) -> Vec<(u8, Arc<SubscriptionTracker>)> {
        let mut taken = Vec::new();
        for index in 0..slots.entries.len() {
            let hit = slots.entries[index]
                .as_ref()
                .map(|tracker| matches(tracker))
                .unwrap_or(false);
            if hit {
                if let Some(tracker) = slots.entries[index].take() {
                    slots.occupied -= 1;
                    tracker.clear_assignment_if(manager_id, index as u8);
                    taken.push((index as u8, tracker));
                }
            }
        }
        taken
    }

    pub(crate) fn live_trackers(&self) -> Vec<(u8, Arc<SubscriptionTracker>)> {
        let slots = self.slots.lock();
        slots
            .entries
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.as_ref()
                    .map(|tracker| (index as u8, Arc::clone(tracker)))
            })
            .collect()
    }

    /// Delivery path: slot lookup, offset bookkeeping, flow strategy, user
    /// handler. Never blocks on anything but the handler itself, and holds
    /// no lock while user code runs.
    pub(crate) async fn dispatch(
        &self,
        subscription_id: u8,
        offset: u64,
        chunk_timestamp: i64,
        committed_offset: u64,
        message: Message,
    ) {
        let tracker = {
            let slots = self.slots.lock();
            slots
                .entries
                .get(subscription_id as usize)
                .and_then(|slot| slot.clone())
        };
        let tracker = match tracker {
            Some(tracker) => tracker,
            None => {
                trace!(
                    manager = self.id,
                    subscription_id,
                    "delivery for an empty slot, dropping frame"
                );
                return;
            }
        };
        if tracker.is_closed() {
            return;
        }
        tracker.record_offset(offset);
        if let Some(strategy) = tracker.flow_strategy() {
            strategy
                .handle_message(offset, chunk_timestamp, committed_offset, &message)
                .await;
        }
        let context = MessageContext::new(
            tracker.stream().to_owned(),
            subscription_id,
            offset,
            chunk_timestamp,
            committed_offset,
        );
        if let Err(err) = tracker
            .message_handler()
            .handle_message(context, message)
            .await
        {
            warn!(
                stream = tracker.stream(),
                subscription_id,
                ?err,
                "message handler failed"
            );
        }
    }
}

/// Shared target of the three connection listeners. The manager cannot exist
/// before its connection, so the listeners are wired to this link first and
/// the manager is attached right after construction.
pub(crate) struct ManagerLink {
    coordinator: Weak<CoordinatorInner>,
    manager: Mutex<Weak<SubscriptionManager>>,
}

impl ManagerLink {
    pub(crate) fn new(coordinator: &Arc<CoordinatorInner>) -> Arc<Self> {
        Arc::new(ManagerLink {
            coordinator: Arc::downgrade(coordinator),
            manager: Mutex::new(Weak::new()),
        })
    }

    pub(crate) fn attach(&self, manager: &Arc<SubscriptionManager>) {
        *self.manager.lock() = Arc::downgrade(manager);
    }

    pub(crate) fn listeners(self: &Arc<Self>) -> ClientListeners {
        ClientListeners {
            message_listener: Arc::new(LinkMessageListener(Arc::clone(self))),
            shutdown_listener: Arc::new(LinkShutdownListener(Arc::clone(self))),
            metadata_listener: Arc::new(LinkMetadataListener(Arc::clone(self))),
        }
    }

    fn manager(&self) -> Option<Arc<SubscriptionManager>> {
        self.manager.lock().upgrade()
    }

    fn coordinator(&self) -> Option<Arc<CoordinatorInner>> {
        self.coordinator.upgrade()
    }
}

struct LinkMessageListener(Arc<ManagerLink>);

#[async_trait::async_trait]
impl MessageListener for LinkMessageListener {
    async fn on_message(
        &self,
        subscription_id: u8,
        offset: u64,
        chunk_timestamp: i64,
        committed_offset: u64,
        message: Message,
    ) {
        match self.0.manager() {
            Some(manager) => {
                manager
                    .dispatch(
                        subscription_id,
                        offset,
                        chunk_timestamp,
                        committed_offset,
                        message,
                    )
                    .await
            }
            None => trace!(subscription_id, "delivery before manager attach, dropping"),
        }
    }
}

struct LinkShutdownListener(Arc<ManagerLink>);

#[async_trait::async_trait]
impl ShutdownListener for LinkShutdownListener {
    async fn on_shutdown(&self, context: ShutdownContext) {
        if !context.is_shutdown_unexpected() {
            debug!("connection closed by the client, nothing to recover");
            return;
        }
        if let (Some(coordinator), Some(manager)) = (self.0.coordinator(), self.0.manager()) {
            coordinator
                .handle_connection_lost(manager, context.reason())
                .await;
        }
    }
}

struct LinkMetadataListener(Arc<ManagerLink>);

#[async_trait::async_trait]
impl MetadataListener for LinkMetadataListener {
    async fn on_metadata_update(&self, stream: &str, code: ResponseCode) {
        if code.is_ok() {
            return;
        }
        if let (Some(coordinator), Some(manager)) = (self.0.coordinator(), self.0.manager()) {
            coordinator.handle_metadata_update(manager, stream, code).await;
        }
    }
}
