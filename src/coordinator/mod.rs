//! The consumer coordinator.
//!
//! Multiplexes logical consumers over pooled broker connections, keeps their
//! subscriptions alive across connection loss and topology changes, and
//! resumes them at the right offset.

mod directory;
mod manager;
mod pool;
mod recovery;
mod registry;
mod tracker;

use std::fmt;
use std::sync::{
    atomic::{
        AtomicBool, AtomicU64,
        Ordering::{Relaxed, SeqCst},
    },
    Arc,
};
use std::time::Duration;

use rabbitmq_stream_protocol::{commands::subscribe::OffsetSpecification, Broker};
use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::debug;

use crate::backoff::{BackOffDelayPolicy, FixedWithInitialDelay};
use crate::client::{Client, ClientFactory, ClientOptions, SubscriptionProperties};
use crate::consumer::{
    MessageHandler, StreamConsumer, SubscriptionListener, TrackingClosingCallback,
};
use crate::error::{ClientError, ConsumerCreateError};
use crate::flow::{ConsumerFlowStrategyBuilder, CreditOnChunkArrivalStrategyBuilder};

use directory::{BrokerDirectory, DirectoryError};
use pool::ManagerPool;
use registry::SubscriptionRegistry;
use tracker::SubscriptionTracker;

/// Everything the coordinator needs to open one subscription.
pub struct SubscriptionRequest {
    pub(crate) consumer: Arc<dyn StreamConsumer>,
    pub(crate) stream: String,
    pub(crate) offset_specification: OffsetSpecification,
    pub(crate) consumer_name: Option<String>,
    pub(crate) subscription_listener: Option<Arc<dyn SubscriptionListener>>,
    pub(crate) tracking_closing_callback: Option<TrackingClosingCallback>,
    pub(crate) message_handler: Arc<dyn MessageHandler>,
    pub(crate) flow_strategy_builder: Arc<dyn ConsumerFlowStrategyBuilder>,
    pub(crate) properties: SubscriptionProperties,
}

impl SubscriptionRequest {
    pub fn new(
        consumer: Arc<dyn StreamConsumer>,
        stream: &str,
        message_handler: Arc<dyn MessageHandler>,
    ) -> Self {
        SubscriptionRequest {
            consumer,
            stream: stream.to_owned(),
            offset_specification: OffsetSpecification::Next,
            consumer_name: None,
            subscription_listener: None,
            tracking_closing_callback: None,
            message_handler,
            flow_strategy_builder: Arc::new(CreditOnChunkArrivalStrategyBuilder::default()),
            properties: SubscriptionProperties::new(),
        }
    }

    pub fn offset_specification(mut self, offset_specification: OffsetSpecification) -> Self {
        self.offset_specification = offset_specification;
        self
    }

    /// Server-side offset key. Also sent as the `name` subscription property.
    pub fn consumer_name(mut self, consumer_name: &str) -> Self {
        self.consumer_name = Some(consumer_name.to_owned());
        self
    }

    pub fn subscription_listener(mut self, listener: Arc<dyn SubscriptionListener>) -> Self {
        self.subscription_listener = Some(listener);
        self
    }

    pub fn tracking_closing_callback(mut self, callback: TrackingClosingCallback) -> Self {
        self.tracking_closing_callback = Some(callback);
        self
    }

    pub fn flow_strategy_builder(mut self, builder: Arc<dyn ConsumerFlowStrategyBuilder>) -> Self {
        self.flow_strategy_builder = builder;
        self
    }

    pub fn properties(mut self, properties: SubscriptionProperties) -> Self {
        self.properties = properties;
        self
    }
}

pub struct CoordinatorOptions {
    pub client_options: ClientOptions,
    /// Connection-name category; also the pool-bucket tag.
    pub connection_name: String,
    pub recovery_back_off_delay_policy: Arc<dyn BackOffDelayPolicy>,
    pub topology_update_back_off_delay_policy: Arc<dyn BackOffDelayPolicy>,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        CoordinatorOptions {
            client_options: ClientOptions::default(),
            connection_name: "rabbitmq-stream-consumer".to_owned(),
            recovery_back_off_delay_policy: Arc::new(FixedWithInitialDelay::new(
                Duration::from_secs(5),
                Duration::from_secs(5),
            )),
            topology_update_back_off_delay_policy: Arc::new(FixedWithInitialDelay::new(
                Duration::from_secs(5),
                Duration::from_secs(1),
            )),
        }
    }
}

pub(crate) struct CoordinatorInner {
    locator: Arc<dyn Client>,
    directory: BrokerDirectory,
    pool: ManagerPool,
    registry: SubscriptionRegistry,
    recovery_back_off_delay_policy: Arc<dyn BackOffDelayPolicy>,
    topology_update_back_off_delay_policy: Arc<dyn BackOffDelayPolicy>,
    tracker_sequence: AtomicU64,
    closed: AtomicBool,
}

/// Public entry point. Cheap to clone; all clones share the same pool.
#[derive(Clone)]
pub struct ConsumerCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl ConsumerCoordinator {
    pub fn new(
        locator: Arc<dyn Client>,
        client_factory: Arc<dyn ClientFactory>,
        options: CoordinatorOptions,
    ) -> Self {
        let inner = Arc::new(CoordinatorInner {
            directory: BrokerDirectory::new(Arc::clone(&locator)),
            locator,
            pool: ManagerPool::new(
                client_factory,
                options.client_options,
                options.connection_name,
            ),
            registry: SubscriptionRegistry::new(),
            recovery_back_off_delay_policy: options.recovery_back_off_delay_policy,
            topology_update_back_off_delay_policy: options.topology_update_back_off_delay_policy,
            tracker_sequence: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        ConsumerCoordinator { inner }
    }

    /// Opens a subscription and returns its closer handle.
    pub async fn subscribe(
        &self,
        request: SubscriptionRequest,
    ) -> Result<SubscriptionHandle, ConsumerCreateError> {
        if self.inner.closed.load(SeqCst) {
            return Err(ConsumerCreateError::Closed);
        }
        let stream = request.stream.clone();
        let candidates = self
            .inner
            .directory
            .find_brokers_for_stream(&stream)
            .await
            .map_err(|err| match err {
                DirectoryError::StreamDoesNotExist => ConsumerCreateError::StreamDoesNotExist {
                    stream: stream.clone(),
                },
                DirectoryError::MetadataFailure(code) => ConsumerCreateError::MetadataFailure {
                    stream: stream.clone(),
                    status: code,
                },
                DirectoryError::NoBrokerAvailable => ConsumerCreateError::NoBrokerAvailable {
                    stream: stream.clone(),
                },
                DirectoryError::Client(err) => ConsumerCreateError::Client(err),
            })?;
        let broker = match pick_candidate(&candidates) {
            Some(broker) => broker.clone(),
            None => {
                return Err(ConsumerCreateError::NoBrokerAvailable { stream });
            }
        };
        let tracker = Arc::new(SubscriptionTracker::new(
            self.inner.tracker_sequence.fetch_add(1, Relaxed),
            request,
        ));
        self.inner.registry.add(&tracker);
        let (manager, subscription_id) =
            match self.inner.pool.place(&self.inner, &broker, &tracker).await {
                Ok(placement) => placement,
                Err(err) => {
                    self.inner.registry.remove(&tracker);
                    return Err(err);
                }
            };
        let strategy = tracker.build_flow_strategy(manager.client(), subscription_id);
        let offset_specification =
            tracker.pre_subscribe(tracker.initial_offset_specification().clone());
        let credits = strategy.initial_credits(&offset_specification, true);
        debug!(
            stream = %stream,
            subscription_id,
            manager = manager.id(),
            broker = %manager.broker(),
            "subscribing"
        );
        let outcome = manager
            .client()
            .subscribe(
                subscription_id,
                &stream,
                offset_specification,
                credits,
                tracker.subscription_properties(),
            )
            .await;
        match outcome {
            Ok(response) if response.is_ok() => {
                tracker
                    .consumer()
                    .set_subscription_client(Some(manager.client()));
                if manager.confirm_active(subscription_id, &tracker) {
                    Ok(SubscriptionHandle {
                        inner: Arc::clone(&self.inner),
                        tracker,
                    })
                } else {
                    self.inner.registry.remove(&tracker);
                    self.inner
                        .release_placement(&manager, subscription_id, &tracker, true)
                        .await;
                    Err(ConsumerCreateError::Client(ClientError::Disconnected))
                }
            }
            Ok(response) => {
                self.inner.registry.remove(&tracker);
                self.inner
                    .release_placement(&manager, subscription_id, &tracker, false)
                    .await;
                Err(ConsumerCreateError::Create {
                    stream,
                    status: response.code(),
                })
            }
            Err(err) => {
                self.inner.registry.remove(&tracker);
                self.inner
                    .release_placement(&manager, subscription_id, &tracker, false)
                    .await;
                Err(ConsumerCreateError::Client(err))
            }
        }
    }

    /// Tears everything down: remaining subscriptions are unsubscribed
    /// best-effort and every pooled connection is closed. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, SeqCst) {
            return;
        }
        let managers = self.inner.pool.drain_all_managers().await;
        for manager in managers {
            for (subscription_id, tracker) in manager.drain_for_shutdown() {
                if tracker.mark_closed() {
                    self.inner.registry.remove(&tracker);
                    match manager.client().unsubscribe(subscription_id).await {
                        Ok(response) if !response.is_ok() => debug!(
                            subscription_id,
                            code = ?response.code(),
                            "unsubscribe rejected during shutdown"
                        ),
                        Err(err) => {
                            debug!(subscription_id, ?err, "unsubscribe failed during shutdown")
                        }
                        _ => {}
                    }
                    if let Some(callback) = tracker.tracking_closing_callback() {
                        callback().await;
                    }
                }
            }
            manager.mark_closed();
            if let Err(err) = manager.client().close().await {
                debug!(manager = manager.id(), ?err, "closing connection failed");
            }
        }
        // trackers caught between managers by an in-flight recovery live
        // only in the registry
        for tracker in self.inner.registry.trackers() {
            if tracker.mark_closed() {
                self.inner.registry.remove(&tracker);
                if let Some(callback) = tracker.tracking_closing_callback() {
                    callback().await;
                }
            }
        }
    }

    pub async fn manager_count(&self) -> usize {
        self.inner.pool.manager_count().await
    }

    pub fn tracker_count(&self) -> usize {
        self.inner.registry.tracker_count()
    }

    /// Diagnostic view of the pool; serializes to JSON.
    pub async fn snapshot(&self) -> CoordinatorSnapshot {
        let managers = self.inner.pool.managers().await;
        let mut rows = Vec::with_capacity(managers.len());
        for manager in managers {
            let trackers: Vec<TrackerSnapshot> = manager
                .live_trackers()
                .into_iter()
                .map(|(subscription_id, tracker)| TrackerSnapshot {
                    id: tracker.id(),
                    stream: tracker.stream().to_owned(),
                    subscription_id,
                    state: tracker.state().name(),
                    consumer_name: tracker.consumer_name().map(|name| name.to_owned()),
                })
                .collect();
            rows.push(ManagerSnapshot {
                id: manager.id(),
                broker: manager.broker().to_string(),
                connection_name: manager.key().connection_name.clone(),
                tracker_count: trackers.len(),
                trackers,
            });
        }
        CoordinatorSnapshot {
            managers: rows,
            tracker_count: self.inner.registry.tracker_count(),
        }
    }
}

/// Closer for one subscription. Clones close the same subscription; every
/// call after the first is a no-op.
#[derive(Clone)]
pub struct SubscriptionHandle {
    inner: Arc<CoordinatorInner>,
    tracker: Arc<SubscriptionTracker>,
}

impl SubscriptionHandle {
    pub fn stream(&self) -> &str {
        self.tracker.stream()
    }

    pub fn is_closed(&self) -> bool {
        self.tracker.is_closed()
    }

    /// Unsubscribes on the broker, frees the slot, runs the tracking-closing
    /// callback, and drops the manager when it ends up empty. Never fails.
    pub async fn close(&self) {
        if !self.tracker.mark_closed() {
            return;
        }
        self.inner.registry.remove(&self.tracker);
        if let Some(assignment) = self.tracker.take_assignment() {
            let manager = assignment.manager;
            let subscription_id = assignment.subscription_id;
            let remaining = manager.release(subscription_id, &self.tracker);
            match manager.client().unsubscribe(subscription_id).await {
                Ok(response) if !response.is_ok() => {
                    debug!(
                        stream = self.tracker.stream(),
                        subscription_id,
                        code = ?response.code(),
                        "unsubscribe rejected"
                    )
                }
                Err(err) => debug!(
                    stream = self.tracker.stream(),
                    subscription_id,
                    ?err,
                    "unsubscribe failed"
                ),
                _ => {}
            }
            if remaining == 0 && self.inner.pool.try_retire(&manager).await {
                if let Err(err) = manager.client().close().await {
                    debug!(manager = manager.id(), ?err, "closing connection failed");
                }
            }
        }
        if let Some(callback) = self.tracker.tracking_closing_callback() {
            callback().await;
        }
    }
}

/// Spreads subscriptions across candidates the way the consumer side always
/// has: uniformly at random.
pub(crate) fn pick_candidate(candidates: &[Broker]) -> Option<&Broker> {
    candidates.choose(&mut rand::rngs::OsRng)
}

#[derive(Debug, Serialize)]
pub struct CoordinatorSnapshot {
    pub managers: Vec<ManagerSnapshot>,
    pub tracker_count: usize,
}

#[derive(Debug, Serialize)]
pub struct ManagerSnapshot {
    pub id: u64,
    pub broker: String,
    pub connection_name: String,
    pub tracker_count: usize,
    pub trackers: Vec<TrackerSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct TrackerSnapshot {
    pub id: u64,
    pub stream: String,
    pub subscription_id: u8,
    pub state: &'static str,
    pub consumer_name: Option<String>,
}

impl fmt::Display for CoordinatorSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => Err(fmt::Error),
        }
    }
}
