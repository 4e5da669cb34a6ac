use rabbitmq_stream_protocol::ResponseCode;
use thiserror::Error;

/// Connection-level failures surfaced by the broker client.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("request timed out waiting for a broker response")]
    Timeout,
    #[error("connection to the broker was lost")]
    Disconnected,
    #[error("client is closed")]
    Closed,
    #[error(transparent)]
    GenericError(#[from] Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Error, Debug)]
pub enum ConsumerCreateError {
    #[error("stream {stream} does not exist")]
    StreamDoesNotExist { stream: String },

    #[error("metadata query for stream {stream} failed with {status:?}")]
    MetadataFailure {
        stream: String,
        status: ResponseCode,
    },

    #[error("no broker available for stream {stream}")]
    NoBrokerAvailable { stream: String },

    #[error("subscribing to stream {stream} failed with {status:?}")]
    Create {
        stream: String,
        status: ResponseCode,
    },

    #[error("could not connect to advertised node {host}:{port}")]
    AdvertisedNodeUnreachable { host: String, port: i32 },

    #[error("coordinator is closed")]
    Closed,

    #[error(transparent)]
    Client(#[from] ClientError),
}
