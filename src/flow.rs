//! Flow-control strategies.
//!
//! The coordinator forwards every delivered chunk to the strategy of the
//! subscription it belongs to; the strategy decides how many credits the
//! subscribe command carries and when to grant more through the client.

use std::sync::Arc;

use rabbitmq_stream_protocol::{commands::subscribe::OffsetSpecification, message::Message};
use tracing::trace;

use crate::client::Client;

#[async_trait::async_trait]
pub trait ConsumerFlowStrategy: Send + Sync {
    /// Credit count the subscribe command carries. `first_time` is false on
    /// recovery re-subscribes.
    fn initial_credits(&self, offset_specification: &OffsetSpecification, first_time: bool)
        -> u16;

    /// Called for every delivered message, in broker order.
    async fn handle_message(
        &self,
        offset: u64,
        chunk_timestamp: i64,
        committed_offset: u64,
        message: &Message,
    );
}

/// Builds a strategy bound to the connection currently hosting the
/// subscription. Rebuilt on every recovery since both change.
pub trait ConsumerFlowStrategyBuilder: Send + Sync {
    fn build(&self, client: Arc<dyn Client>, subscription_id: u8) -> Arc<dyn ConsumerFlowStrategy>;
}

/// Synchronous default: one credit back for each delivered chunk.
pub struct CreditOnChunkArrivalStrategy {
    client: Arc<dyn Client>,
    subscription_id: u8,
    initial_credits: u16,
}

#[async_trait::async_trait]
impl ConsumerFlowStrategy for CreditOnChunkArrivalStrategy {
    fn initial_credits(
        &self,
        _offset_specification: &OffsetSpecification,
        _first_time: bool,
    ) -> u16 {
        self.initial_credits
    }

    async fn handle_message(
        &self,
        offset: u64,
        _chunk_timestamp: i64,
        _committed_offset: u64,
        _message: &Message,
    ) {
        if let Err(err) = self.client.credit(self.subscription_id, 1).await {
            trace!(
                subscription_id = self.subscription_id,
                offset,
                ?err,
                "credit request failed"
            );
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreditOnChunkArrivalStrategyBuilder {
    pub initial_credits: u16,
}

impl Default for CreditOnChunkArrivalStrategyBuilder {
    fn default() -> Self {
        CreditOnChunkArrivalStrategyBuilder { initial_credits: 10 }
    }
}

impl ConsumerFlowStrategyBuilder for CreditOnChunkArrivalStrategyBuilder {
    fn build(&self, client: Arc<dyn Client>, subscription_id: u8) -> Arc<dyn ConsumerFlowStrategy> {
        Arc::new(CreditOnChunkArrivalStrategy {
            client,
            subscription_id,
            initial_credits: self.initial_credits,
        })
    }
}
