//! Consumer coordinator for RabbitMQ Stream.
//!
//! Many logical consumers share a small pool of broker connections, capped at
//! [`client::MAX_SUBSCRIPTIONS_PER_CLIENT`] subscriptions each. The
//! coordinator allocates the slots, dispatches deliveries, and rebuilds
//! subscriptions at the right offset when connections die or stream topology
//! shifts.

mod backoff;
pub mod client;
mod consumer;
mod coordinator;
pub mod error;
mod flow;

pub type RabbitMQStreamResult<T> = Result<T, error::ClientError>;

pub use backoff::{BackOffDelayPolicy, Delay, FixedWithInitialDelay};
pub use client::{
    Client, ClientFactory, ClientListeners, ClientOptions, MessageListener, MetadataListener,
    ShutdownContext, ShutdownListener, ShutdownReason, SubscriptionProperties,
    MAX_SUBSCRIPTIONS_PER_CLIENT,
};
pub use consumer::{
    MessageContext, MessageHandler, StreamConsumer, SubscriptionContext, SubscriptionListener,
    TrackingClosingCallback,
};
pub use coordinator::{
    ConsumerCoordinator, CoordinatorOptions, CoordinatorSnapshot, ManagerSnapshot,
    SubscriptionHandle, SubscriptionRequest, TrackerSnapshot,
};
pub use error::{ClientError, ConsumerCreateError};
pub use flow::{
    ConsumerFlowStrategy, ConsumerFlowStrategyBuilder, CreditOnChunkArrivalStrategy,
    CreditOnChunkArrivalStrategyBuilder,
};
