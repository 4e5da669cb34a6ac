//! Consumer-side contract of the coordinator.
//!
//! A logical consumer hands the coordinator a [`StreamConsumer`] control
//! surface plus a [`MessageHandler`]; the coordinator keeps the subscription
//! alive and feeds deliveries back through the handler.

use std::sync::Arc;

use futures::future::BoxFuture;
use rabbitmq_stream_protocol::{commands::subscribe::OffsetSpecification, message::Message};

use crate::client::Client;
use crate::RabbitMQStreamResult;

/// Control surface of one logical consumer, owned by user code.
///
/// The coordinator pushes the connection currently serving the subscription
/// through `set_subscription_client` (reset to `None` while disconnected) and
/// closes the consumer when its stream disappears.
pub trait StreamConsumer: Send + Sync {
    fn is_open(&self) -> bool;

    fn set_subscription_client(&self, client: Option<Arc<dyn Client>>);

    fn close_after_stream_deletion(&self);
}

/// Per-delivery context handed to the [`MessageHandler`].
#[derive(Debug, Clone)]
pub struct MessageContext {
    stream: String,
    subscription_id: u8,
    offset: u64,
    chunk_timestamp: i64,
    committed_offset: u64,
}

impl MessageContext {
    pub(crate) fn new(
        stream: String,
        subscription_id: u8,
        offset: u64,
        chunk_timestamp: i64,
        committed_offset: u64,
    ) -> Self {
        MessageContext {
            stream,
            subscription_id,
            offset,
            chunk_timestamp,
            committed_offset,
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn subscription_id(&self) -> u8 {
        self.subscription_id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn chunk_timestamp(&self) -> i64 {
        self.chunk_timestamp
    }

    pub fn committed_offset(&self) -> u64 {
        self.committed_offset
    }
}

#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(
        &self,
        context: MessageContext,
        message: Message,
    ) -> RabbitMQStreamResult<()>;
}

/// Mutable view of the subscription about to be sent to the broker.
#[derive(Debug)]
pub struct SubscriptionContext {
    stream: String,
    offset_specification: OffsetSpecification,
}

impl SubscriptionContext {
    pub(crate) fn new(stream: String, offset_specification: OffsetSpecification) -> Self {
        SubscriptionContext {
            stream,
            offset_specification,
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn offset_specification(&self) -> &OffsetSpecification {
        &self.offset_specification
    }

    /// Override where the subscription starts. Runs before the initial
    /// subscribe and before every recovery re-subscribe.
    pub fn set_offset_specification(&mut self, offset_specification: OffsetSpecification) {
        self.offset_specification = offset_specification;
    }

    pub(crate) fn into_offset_specification(self) -> OffsetSpecification {
        self.offset_specification
    }
}

/// Hook invoked just before each subscribe command is issued.
pub trait SubscriptionListener: Send + Sync {
    fn pre_subscribe(&self, context: &mut SubscriptionContext);
}

/// Callback run once when the subscription is torn down, so server-side offset
/// tracking can flush its last position.
pub type TrackingClosingCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;
