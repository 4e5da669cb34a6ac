use std::sync::Arc;

use rabbitmq_stream_protocol::{commands::subscribe::OffsetSpecification, ResponseCode};
use tracing::{debug, trace, warn};

use crate::backoff::{BackOffDelayPolicy, Delay};
use crate::client::ShutdownReason;
use crate::coordinator::directory::DirectoryError;
use crate::coordinator::manager::SubscriptionManager;
use crate::coordinator::tracker::SubscriptionTracker;
use crate::coordinator::{pick_candidate, CoordinatorInner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum RecoveryTrigger {
    ConnectionLost,
    TopologyUpdate,
}

enum AttemptError {
    /// The stream is gone; close the consumer, stop retrying.
    StreamGone,
    /// Metadata failure that retrying will not fix.
    Fatal(ResponseCode),
    /// The tracker was closed while the attempt ran.
    TrackerClosed,
    /// Transient; retry under the active policy.
    Retry(String),
}

impl CoordinatorInner {
    /// E1: the connection under a manager died. Every tracker it hosted is a
    /// recovery candidate and the manager leaves the pool immediately.
    pub(super) async fn handle_connection_lost(
        self: &Arc<Self>,
        manager: Arc<SubscriptionManager>,
        reason: ShutdownReason,
    ) {
        warn!(
            manager = manager.id(),
            broker = %manager.broker(),
            ?reason,
            "connection lost, redistributing its subscriptions"
        );
        self.pool.remove(&manager).await;
        for (_, tracker) in manager.drain_all() {
            self.schedule_recovery(tracker, RecoveryTrigger::ConnectionLost);
        }
    }

    /// E2: stream-scoped topology change. Only that stream's trackers move;
    /// the manager stays unless that leaves it empty.
    pub(super) async fn handle_metadata_update(
        self: &Arc<Self>,
        manager: Arc<SubscriptionManager>,
        stream: &str,
        code: ResponseCode,
    ) {
        debug!(manager = manager.id(), stream, ?code, "stream topology changed");
        let affected = manager.drain_stream(stream);
        if affected.is_empty() {
            return;
        }
        if self.pool.try_retire(&manager).await {
            if let Err(err) = manager.client().close().await {
                trace!(?err, "closing drained connection failed");
            }
        }
        for (_, tracker) in affected {
            self.schedule_recovery(tracker, RecoveryTrigger::TopologyUpdate);
        }
    }

    pub(super) fn schedule_recovery(
        self: &Arc<Self>,
        tracker: Arc<SubscriptionTracker>,
        trigger: RecoveryTrigger,
    ) {
        if !tracker.begin_recovery() {
            debug!(
                stream = tracker.stream(),
                tracker = tracker.id(),
                "recovery already in flight, coalescing trigger"
            );
            return;
        }
        tracker.consumer().set_subscription_client(None);
        if !tracker.consumer().is_open() {
            debug!(
                stream = tracker.stream(),
                tracker = tracker.id(),
                "consumer already closed, dropping tracker"
            );
            tracker.abandon();
            self.registry.remove(&tracker);
            return;
        }
        let policy = match trigger {
            RecoveryTrigger::ConnectionLost => Arc::clone(&self.recovery_back_off_delay_policy),
            RecoveryTrigger::TopologyUpdate => {
                Arc::clone(&self.topology_update_back_off_delay_policy)
            }
        };
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.recovery_loop(tracker, policy).await;
        });
    }

    async fn recovery_loop(
        self: Arc<Self>,
        tracker: Arc<SubscriptionTracker>,
        policy: Arc<dyn BackOffDelayPolicy>,
    ) {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match policy.delay(attempt) {
                Delay::Terminate => {
                    warn!(
                        stream = tracker.stream(),
                        tracker = tracker.id(),
                        attempt,
                        "recovery budget exhausted, closing consumer"
                    );
                    self.close_tracker_after_stream_deletion(&tracker).await;
                    return;
                }
                Delay::Wait(delay) => tokio::time::sleep(delay).await,
            }
            if tracker.is_closed() {
                return;
            }
            if !tracker.consumer().is_open() {
                tracker.abandon();
                self.registry.remove(&tracker);
                return;
            }
            match self.recovery_attempt(&tracker).await {
                Ok(()) => {
                    debug!(
                        stream = tracker.stream(),
                        tracker = tracker.id(),
                        attempt,
                        "subscription recovered"
                    );
                    return;
                }
                Err(AttemptError::StreamGone) => {
                    debug!(
                        stream = tracker.stream(),
                        tracker = tracker.id(),
                        "stream is gone, closing consumer"
                    );
                    self.close_tracker_after_stream_deletion(&tracker).await;
                    return;
                }
                Err(AttemptError::Fatal(code)) => {
                    warn!(
                        stream = tracker.stream(),
                        tracker = tracker.id(),
                        ?code,
                        "unrecoverable metadata failure, closing consumer"
                    );
                    self.close_tracker_after_stream_deletion(&tracker).await;
                    return;
                }
                Err(AttemptError::TrackerClosed) => return,
                Err(AttemptError::Retry(reason)) => {
                    debug!(
                        stream = tracker.stream(),
                        tracker = tracker.id(),
                        attempt,
                        %reason,
                        "recovery attempt failed"
                    );
                }
            }
        }
    }

    async fn recovery_attempt(
        self: &Arc<Self>,
        tracker: &Arc<SubscriptionTracker>,
    ) -> Result<(), AttemptError> {
        let candidates = match self.directory.find_brokers_for_stream(tracker.stream()).await {
            Ok(candidates) => candidates,
            Err(DirectoryError::StreamDoesNotExist) => return Err(AttemptError::StreamGone),
            // an OK answer with an empty topology is transient here, even
            // though subscribe treats the same answer as terminal
            Err(DirectoryError::NoBrokerAvailable) => {
                return Err(AttemptError::Retry(
                    "metadata has no candidate broker".to_owned(),
                ))
            }
            Err(DirectoryError::MetadataFailure(ResponseCode::StreamNotAvailable)) => {
                return Err(AttemptError::Retry("stream not available".to_owned()))
            }
            Err(DirectoryError::MetadataFailure(code)) => return Err(AttemptError::Fatal(code)),
            Err(DirectoryError::Client(err)) => {
                return Err(AttemptError::Retry(format!("metadata query failed: {}", err)))
            }
        };

        let offset_specification = self.resume_offset(tracker).await?;
        let offset_specification = tracker.pre_subscribe(offset_specification);

        let broker = match pick_candidate(&candidates) {
            Some(broker) => broker.clone(),
            None => return Err(AttemptError::Retry("no candidate broker".to_owned())),
        };

        let (manager, subscription_id) = match self.pool.place(self, &broker, tracker).await {
            Ok(placement) => placement,
            Err(err) => {
                return Err(AttemptError::Retry(format!(
                    "placing subscription failed: {}",
                    err
                )))
            }
        };

        let strategy = tracker.build_flow_strategy(manager.client(), subscription_id);
        let credits = strategy.initial_credits(&offset_specification, false);
        let outcome = manager
            .client()
            .subscribe(
                subscription_id,
                tracker.stream(),
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
                if manager.confirm_active(subscription_id, tracker) {
                    Ok(())
                } else if tracker.is_closed() {
                    self.release_placement(&manager, subscription_id, tracker, true)
                        .await;
                    Err(AttemptError::TrackerClosed)
                } else {
                    self.release_placement(&manager, subscription_id, tracker, true)
                        .await;
                    Err(AttemptError::Retry(
                        "connection died before activation".to_owned(),
                    ))
                }
            }
            Ok(response) => {
                self.release_placement(&manager, subscription_id, tracker, false)
                    .await;
                Err(AttemptError::Retry(format!(
                    "broker rejected subscribe: {:?}",
                    response.code()
                )))
            }
            Err(err) => {
                self.release_placement(&manager, subscription_id, tracker, false)
                    .await;
                Err(AttemptError::Retry(format!("subscribe failed: {}", err)))
            }
        }
    }

    /// Resume position per the offset-resume rules: the server-stored offset
    /// plus one for named consumers, the last dispatched offset when
    /// something was received, the original specification otherwise.
    async fn resume_offset(
        &self,
        tracker: &Arc<SubscriptionTracker>,
    ) -> Result<OffsetSpecification, AttemptError> {
        if let Some(reference) = tracker.consumer_name() {
            return match self.locator.query_offset(reference, tracker.stream()).await {
                Ok(response) if response.is_ok() => {
                    Ok(OffsetSpecification::Offset(response.offset() + 1))
                }
                Ok(response) => Err(AttemptError::Retry(format!(
                    "stored offset query returned {:?}",
                    response.code()
                ))),
                Err(err) => Err(AttemptError::Retry(format!(
                    "stored offset query failed: {}",
                    err
                ))),
            };
        }
        if let Some(offset) = tracker.last_received_offset() {
            // not +1: the broker filters below the requested offset
            return Ok(OffsetSpecification::Offset(offset));
        }
        Ok(tracker.initial_offset_specification().clone())
    }

    /// Terminal teardown shared by stream deletion and budget exhaustion.
    pub(super) async fn close_tracker_after_stream_deletion(
        &self,
        tracker: &Arc<SubscriptionTracker>,
    ) {
        if tracker.mark_closed() {
            self.registry.remove(tracker);
            if let Some(callback) = tracker.tracking_closing_callback() {
                callback().await;
            }
            tracker.consumer().close_after_stream_deletion();
        }
    }

    /// Undo a slot reservation, optionally telling the broker, and garbage
    /// collect the manager when that left it empty.
    pub(super) async fn release_placement(
        &self,
        manager: &Arc<SubscriptionManager>,
        subscription_id: u8,
        tracker: &Arc<SubscriptionTracker>,
        unsubscribe: bool,
    ) {
        let remaining = manager.release(subscription_id, tracker);
        if unsubscribe {
            match manager.client().unsubscribe(subscription_id).await {
                Ok(response) if !response.is_ok() => {
                    trace!(subscription_id, code = ?response.code(), "unsubscribe rejected")
                }
                Err(err) => trace!(subscription_id, ?err, "unsubscribe failed"),
                _ => {}
            }
        }
        if remaining == 0 && self.pool.try_retire(manager).await {
            if let Err(err) = manager.client().close().await {
                trace!(?err, "closing empty connection failed");
            }
        }
    }
}
