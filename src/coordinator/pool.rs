use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering::Relaxed},
    Arc,
};
use std::time::Duration;

use rabbitmq_stream_protocol::Broker;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, trace};

use crate::client::{Client, ClientFactory, ClientListeners, ClientOptions};
use crate::coordinator::manager::{ManagerLink, SubscriptionManager};
use crate::coordinator::tracker::SubscriptionTracker;
use crate::coordinator::CoordinatorInner;
use crate::error::{ClientError, ConsumerCreateError};

/// A load balancer may keep handing out the wrong node; give up after a few
/// rounds.
const ADVERTISED_NODE_RETRIES: usize = 5;
const ADVERTISED_NODE_RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Pool bucket identity: broker plus the connection-name category, so
/// consumer connections never share a bucket with other connection kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct PoolKey {
    pub(crate) broker: Broker,
    pub(crate) connection_name: String,
}

/// Per-broker buckets of managers. The bucket lock is the coordinator-wide
/// lock of the locking order; it guards pool mutation only and is never held
/// across a connection attempt, so one slow broker cannot stall placements
/// for unrelated buckets.
pub(crate) struct ManagerPool {
    factory: Arc<dyn ClientFactory>,
    client_options: ClientOptions,
    connection_name: String,
    buckets: Mutex<HashMap<PoolKey, Vec<Arc<SubscriptionManager>>>>,
    connection_sequence: AtomicU64,
    manager_sequence: AtomicU64,
}

impl ManagerPool {
    pub(crate) fn new(
        factory: Arc<dyn ClientFactory>,
        client_options: ClientOptions,
        connection_name: String,
    ) -> Self {
        ManagerPool {
            factory,
            client_options,
            connection_name,
            buckets: Mutex::new(HashMap::new()),
            connection_sequence: AtomicU64::new(0),
            manager_sequence: AtomicU64::new(0),
        }
    }

    /// Puts the tracker into the first manager of the broker's bucket with a
    /// free slot, creating a manager when all are full.
    pub(crate) async fn place(
        &self,
        coordinator: &Arc<CoordinatorInner>,
        broker: &Broker,
        tracker: &Arc<SubscriptionTracker>,
    ) -> Result<(Arc<SubscriptionManager>, u8), ConsumerCreateError> {
        let key = PoolKey {
            broker: broker.clone(),
            connection_name: self.connection_name.clone(),
        };
        if let Some(placement) = self.reserve_existing(&key, tracker).await {
            return Ok(placement);
        }
        // connect with the pool unlocked; only the insert below retakes it
        let link = ManagerLink::new(coordinator);
        let client = self
            .connect_to_advertised_node(broker, link.listeners())
            .await?;
        let manager = Arc::new(SubscriptionManager::new(
            self.manager_sequence.fetch_add(1, Relaxed),
            key.clone(),
            client,
        ));
        link.attach(&manager);
        let reused = {
            let mut buckets = self.buckets.lock().await;
            let bucket = buckets.entry(key).or_insert_with(Vec::new);
            // a racing placement may have added capacity while we were
            // connecting; prefer it over growing the bucket
            let mut reused = None;
            for existing in bucket.iter() {
                if let Some(subscription_id) = existing.try_reserve(tracker) {
                    reused = Some((Arc::clone(existing), subscription_id));
                    break;
                }
            }
            if reused.is_none() {
                if let Some(subscription_id) = manager.try_reserve(tracker) {
                    debug!(
                        manager = manager.id(),
                        broker = %broker,
                        "created subscription manager"
                    );
                    bucket.push(Arc::clone(&manager));
                    return Ok((manager, subscription_id));
                }
            }
            reused
        };
        match reused {
            Some((existing, subscription_id)) => {
                if let Err(err) = manager.client().close().await {
                    trace!(?err, "closing redundant connection failed");
                }
                Ok((existing, subscription_id))
            }
            // a freshly built manager always has room; only a racing close
            // could take it away
            None => Err(ConsumerCreateError::Client(ClientError::Closed)),
        }
    }

    async fn reserve_existing(
        &self,
        key: &PoolKey,
        tracker: &Arc<SubscriptionTracker>,
    ) -> Option<(Arc<SubscriptionManager>, u8)> {
        let buckets = self.buckets.lock().await;
        let bucket = buckets.get(key)?;
        for manager in bucket.iter() {
            if let Some(subscription_id) = manager.try_reserve(tracker) {
                return Some((Arc::clone(manager), subscription_id));
            }
        }
        None
    }

    /// Connects to the broker, retrying while the node that answers is not
    /// the node the metadata promised.
    async fn connect_to_advertised_node(
        &self,
        broker: &Broker,
        listeners: ClientListeners,
    ) -> Result<Arc<dyn Client>, ConsumerCreateError> {
        let mut attempt = 0;
        loop {
            let mut options = self.client_options.for_broker(broker);
            options.client_provided_name = format!(
                "{}-{}",
                self.connection_name,
                self.connection_sequence.fetch_add(1, Relaxed)
            );
            let client = self.factory.create(options, listeners.clone()).await?;
            if client.server_advertised_host() == broker.host
                && client.server_advertised_port() == broker.port
            {
                return Ok(client);
            }
            attempt += 1;
            debug!(
                intended = %broker,
                advertised_host = %client.server_advertised_host(),
                advertised_port = client.server_advertised_port(),
                attempt,
                "connected to a node other than the intended one, retrying"
            );
            if let Err(err) = client.close().await {
                trace!(?err, "closing mismatched connection failed");
            }
            if attempt >= ADVERTISED_NODE_RETRIES {
                return Err(ConsumerCreateError::AdvertisedNodeUnreachable {
                    host: broker.host.clone(),
                    port: broker.port,
                });
            }
            sleep(ADVERTISED_NODE_RETRY_INTERVAL).await;
        }
    }

    /// Drops a manager whose connection died.
    pub(crate) async fn remove(&self, manager: &Arc<SubscriptionManager>) -> bool {
        let mut buckets = self.buckets.lock().await;
        match buckets.get_mut(manager.key()) {
            Some(bucket) => {
                let before = bucket.len();
                bucket.retain(|candidate| candidate.id() != manager.id());
                let removed = bucket.len() < before;
                if bucket.is_empty() {
                    buckets.remove(manager.key());
                }
                removed
            }
            None => false,
        }
    }

    /// Removes the manager if it is empty, marking it closed under the pool
    /// lock so no reservation can sneak in. The caller closes the connection
    /// afterwards, outside the lock.
    pub(crate) async fn try_retire(&self, manager: &Arc<SubscriptionManager>) -> bool {
        let mut buckets = self.buckets.lock().await;
        if !manager.begin_close_if_empty() {
            return false;
        }
        if let Some(bucket) = buckets.get_mut(manager.key()) {
            bucket.retain(|candidate| candidate.id() != manager.id());
            if bucket.is_empty() {
                buckets.remove(manager.key());
            }
        }
        true
    }

    pub(crate) async fn manager_count(&self) -> usize {
        let buckets = self.buckets.lock().await;
        buckets.values().map(|bucket| bucket.len()).sum()
    }

    pub(crate) async fn managers(&self) -> Vec<Arc<SubscriptionManager>> {
        let buckets = self.buckets.lock().await;
        buckets.values().flatten().cloned().collect()
    }

    pub(crate) async fn drain_all_managers(&self) -> Vec<Arc<SubscriptionManager>> {
        let mut buckets = self.buckets.lock().await;
        buckets.drain().flat_map(|(_, bucket)| bucket).collect()
    }
}
