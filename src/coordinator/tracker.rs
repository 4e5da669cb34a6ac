use std::sync::{
    atomic::{
        AtomicBool, AtomicU64, AtomicU8,
        Ordering::{Relaxed, SeqCst},
    },
    Arc,
};

use parking_lot::Mutex;
use rabbitmq_stream_protocol::commands::subscribe::OffsetSpecification;

use crate::client::{Client, SubscriptionProperties};
use crate::consumer::{
    MessageHandler, StreamConsumer, SubscriptionContext, SubscriptionListener,
    TrackingClosingCallback,
};
use crate::coordinator::manager::SubscriptionManager;
use crate::coordinator::SubscriptionRequest;
use crate::flow::{ConsumerFlowStrategy, ConsumerFlowStrategyBuilder};

const STATE_ACTIVE: u8 = 0;
const STATE_RECOVERING: u8 = 1;
const STATE_CLOSED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubscriptionState {
    Active,
    Recovering,
    Closed,
}

impl SubscriptionState {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            SubscriptionState::Active => "active",
            SubscriptionState::Recovering => "recovering",
            SubscriptionState::Closed => "closed",
        }
    }
}

/// Where a tracker currently lives: the manager hosting it and the
/// subscription id of its slot.
pub(crate) struct Assignment {
    pub(crate) manager: Arc<SubscriptionManager>,
    pub(crate) subscription_id: u8,
}

/// The coordinator's record of one logical consumer.
///
/// Created by `subscribe`, moved between managers by recovery, destroyed by
/// the closer, by stream deletion, or by coordinator shutdown.
pub(crate) struct SubscriptionTracker {
    id: u64,
    stream: String,
    consumer_name: Option<String>,
    initial_offset_specification: OffsetSpecification,
    properties: SubscriptionProperties,
    consumer: Arc<dyn StreamConsumer>,
    message_handler: Arc<dyn MessageHandler>,
    subscription_listener: Option<Arc<dyn SubscriptionListener>>,
    tracking_closing_callback: Option<TrackingClosingCallback>,
    flow_strategy_builder: Arc<dyn ConsumerFlowStrategyBuilder>,
    flow_strategy: Mutex<Option<Arc<dyn ConsumerFlowStrategy>>>,
    state: AtomicU8,
    has_received: AtomicBool,
    last_received_offset: AtomicU64,
    assignment: Mutex<Option<Assignment>>,
}

impl SubscriptionTracker {
    pub(crate) fn new(id: u64, request: SubscriptionRequest) -> Self {
        let SubscriptionRequest {
            consumer,
            stream,
            offset_specification,
            consumer_name,
            subscription_listener,
            tracking_closing_callback,
            message_handler,
            flow_strategy_builder,
            mut properties,
        } = request;
        if let Some(name) = consumer_name.as_ref() {
            properties.insert("name".to_owned(), name.clone());
        }
        SubscriptionTracker {
            id,
            stream,
            consumer_name,
            initial_offset_specification: offset_specification,
            properties,
            consumer,
            message_handler,
            subscription_listener,
            tracking_closing_callback,
            flow_strategy_builder,
            flow_strategy: Mutex::new(None),
            // not active until the first subscribe is confirmed
            state: AtomicU8::new(STATE_RECOVERING),
            has_received: AtomicBool::new(false),
            last_received_offset: AtomicU64::new(0),
            assignment: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn stream(&self) -> &str {
        &self.stream
    }

    pub(crate) fn consumer_name(&self) -> Option<&str> {
        self.consumer_name.as_deref()
    }

    pub(crate) fn initial_offset_specification(&self) -> &OffsetSpecification {
        &self.initial_offset_specification
    }

    pub(crate) fn consumer(&self) -> &Arc<dyn StreamConsumer> {
        &self.consumer
    }

    pub(crate) fn message_handler(&self) -> &Arc<dyn MessageHandler> {
        &self.message_handler
    }

    pub(crate) fn subscription_properties(&self) -> SubscriptionProperties {
        self.properties.clone()
    }

    pub(crate) fn tracking_closing_callback(&self) -> Option<TrackingClosingCallback> {
        self.tracking_closing_callback.clone()
    }

    /// Runs the pre-subscribe hook, which may override the offset the
    /// subscribe command will carry.
    pub(crate) fn pre_subscribe(
        &self,
        offset_specification: OffsetSpecification,
    ) -> OffsetSpecification {
        match self.subscription_listener.as_ref() {
            Some(listener) => {
                let mut context =
                    SubscriptionContext::new(self.stream.clone(), offset_specification);
                listener.pre_subscribe(&mut context);
                context.into_offset_specification()
            }
            None => offset_specification,
        }
    }

    /// Builds a strategy bound to the given connection and slot, replacing
    /// the one from the previous incarnation of the subscription.
    pub(crate) fn build_flow_strategy(
        &self,
        client: Arc<dyn Client>,
        subscription_id: u8,
    ) -> Arc<dyn ConsumerFlowStrategy> {
        let strategy = self.flow_strategy_builder.build(client, subscription_id);
        *self.flow_strategy.lock() = Some(Arc::clone(&strategy));
        strategy
    }

    pub(crate) fn flow_strategy(&self) -> Option<Arc<dyn ConsumerFlowStrategy>> {
        self.flow_strategy.lock().clone()
    }

    pub(crate) fn record_offset(&self, offset: u64) {
        if !self.has_received.load(Relaxed) {
            self.last_received_offset.store(offset, Relaxed);
            self.has_received.store(true, Relaxed);
        } else if offset > self.last_received_offset.load(Relaxed) {
            self.last_received_offset.store(offset, Relaxed);
        }
    }

    pub(crate) fn last_received_offset(&self) -> Option<u64> {
        if self.has_received.load(Relaxed) {
            Some(self.last_received_offset.load(Relaxed))
        } else {
            None
        }
    }

    pub(crate) fn state(&self) -> SubscriptionState {
        match self.state.load(SeqCst) {
            STATE_ACTIVE => SubscriptionState::Active,
            STATE_RECOVERING => SubscriptionState::Recovering,
            _ => SubscriptionState::Closed,
        }
    }

    /// Claims the tracker for a recovery run. Fails when a recovery is
    /// already in flight or the tracker is gone, coalescing the trigger.
    pub(crate) fn begin_recovery(&self) -> bool {
        self.state
            .compare_exchange(STATE_ACTIVE, STATE_RECOVERING, SeqCst, SeqCst)
            .is_ok()
    }

    /// Flips a pending tracker to active. A single compare-and-set, so a
    /// closer racing in from another thread can never be overwritten and a
    /// closed tracker never comes back to life. Called under the slot lock
    /// of the hosting manager.
    pub(crate) fn try_activate(&self) -> bool {
        self.state
            .compare_exchange(STATE_RECOVERING, STATE_ACTIVE, SeqCst, SeqCst)
            .is_ok()
    }

    /// One-shot close guard. The first caller tears the subscription down
    /// and runs the tracking-closing callback.
    pub(crate) fn mark_closed(&self) -> bool {
        self.state.swap(STATE_CLOSED, SeqCst) != STATE_CLOSED
    }

    /// Close without the teardown duties; used when the owning consumer
    /// already went away on its own.
    pub(crate) fn abandon(&self) {
        self.state.store(STATE_CLOSED, SeqCst);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.load(SeqCst) == STATE_CLOSED
    }

    /// Only called under the slot lock of the hosting manager.
    pub(crate) fn set_assignment(&self, manager: &Arc<SubscriptionManager>, subscription_id: u8) {
        *self.assignment.lock() = Some(Assignment {
            manager: Arc::clone(manager),
            subscription_id,
        });
    }

    pub(crate) fn clear_assignment_if(&self, manager_id: u64, subscription_id: u8) {
        let mut assignment = self.assignment.lock();
        if let Some(current) = assignment.as_ref() {
            if current.manager.id() == manager_id && current.subscription_id == subscription_id {
                *assignment = None;
            }
        }
    }

    pub(crate) fn take_assignment(&self) -> Option<Assignment> {
        self.assignment.lock().take()
    }
}
