//! Interface to the connection-level broker client.
//!
//! The coordinator never touches sockets or frames; it drives connections
//! through [`Client`] handles produced by a [`ClientFactory`]. Inbound broker
//! events fan out to the listeners installed when the connection is built;
//! listeners are never swapped afterwards.

mod options;

use std::collections::HashMap;
use std::sync::Arc;

use rabbitmq_stream_protocol::{
    commands::query_offset::QueryOffsetResponse, commands::subscribe::OffsetSpecification,
    message::Message, Response, ResponseCode, StreamMetadata,
};

use crate::error::ClientError;

pub use options::ClientOptions;

/// Hard fan-out limit of one connection: subscription ids are a single byte.
pub const MAX_SUBSCRIPTIONS_PER_CLIENT: usize = 256;

/// Key/value pairs sent with a subscribe command.
pub type SubscriptionProperties = HashMap<String, String>;

/// Why a connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    ClientClose,
    ServerClose,
    HeartbeatFailure,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ShutdownContext {
    reason: ShutdownReason,
}

impl ShutdownContext {
    pub fn new(reason: ShutdownReason) -> Self {
        ShutdownContext { reason }
    }

    pub fn reason(&self) -> ShutdownReason {
        self.reason
    }

    /// A deliberate client-side close is the only shutdown that must not
    /// trigger recovery.
    pub fn is_shutdown_unexpected(&self) -> bool {
        !matches!(self.reason, ShutdownReason::ClientClose)
    }
}

/// Delivery callback for inbound chunks, one invocation per message.
#[async_trait::async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(
        &self,
        subscription_id: u8,
        offset: u64,
        chunk_timestamp: i64,
        committed_offset: u64,
        message: Message,
    );
}

#[async_trait::async_trait]
pub trait ShutdownListener: Send + Sync {
    async fn on_shutdown(&self, context: ShutdownContext);
}

/// Stream-scoped topology change notification.
#[async_trait::async_trait]
pub trait MetadataListener: Send + Sync {
    async fn on_metadata_update(&self, stream: &str, code: ResponseCode);
}

/// The listener set wired into a connection at build time.
#[derive(Clone)]
pub struct ClientListeners {
    pub message_listener: Arc<dyn MessageListener>,
    pub shutdown_listener: Arc<dyn ShutdownListener>,
    pub metadata_listener: Arc<dyn MetadataListener>,
}

/// Connection-level RPC surface of one broker connection.
#[async_trait::async_trait]
pub trait Client: Send + Sync {
    async fn subscribe(
        &self,
        subscription_id: u8,
        stream: &str,
        offset_specification: OffsetSpecification,
        credit: u16,
        properties: SubscriptionProperties,
    ) -> Result<Response, ClientError>;

    async fn unsubscribe(&self, subscription_id: u8) -> Result<Response, ClientError>;

    async fn credit(&self, subscription_id: u8, credit: u16) -> Result<(), ClientError>;

    async fn metadata(
        &self,
        streams: Vec<String>,
    ) -> Result<HashMap<String, StreamMetadata>, ClientError>;

    async fn query_offset(
        &self,
        reference: &str,
        stream: &str,
    ) -> Result<QueryOffsetResponse, ClientError>;

    /// Partition streams of a super-stream. Used by the publishing side.
    async fn partitions(&self, super_stream: &str) -> Result<Vec<String>, ClientError>;

    /// Streams a routing key maps to within a super-stream. Used by the
    /// publishing side.
    async fn route(&self, routing_key: &str, super_stream: &str)
        -> Result<Vec<String>, ClientError>;

    /// Host this node advertises to clients, which may differ from the one
    /// dialled when a load balancer sits in front of the cluster.
    fn server_advertised_host(&self) -> String;

    fn server_advertised_port(&self) -> i32;

    async fn close(&self) -> Result<(), ClientError>;
}

/// Builds connections for the manager pool.
#[async_trait::async_trait]
pub trait ClientFactory: Send + Sync {
    async fn create(
        &self,
        options: ClientOptions,
        listeners: ClientListeners,
    ) -> Result<Arc<dyn Client>, ClientError>;
}
