use std::sync::Arc;

use rabbitmq_stream_protocol::{Broker, ResponseCode};
use tracing::debug;

use crate::client::Client;
use crate::error::ClientError;

/// How a candidate lookup failed. The façade and the recovery engine map
/// these differently: at subscribe time every variant is terminal, while
/// recovery retries everything but a missing stream and fatal codes.
#[derive(Debug)]
pub(crate) enum DirectoryError {
    StreamDoesNotExist,
    MetadataFailure(ResponseCode),
    NoBrokerAvailable,
    Client(ClientError),
}

/// Resolves stream topology through the locator connection.
pub(crate) struct BrokerDirectory {
    locator: Arc<dyn Client>,
}

impl BrokerDirectory {
    pub(crate) fn new(locator: Arc<dyn Client>) -> Self {
        BrokerDirectory { locator }
    }

    /// Candidate nodes for a subscription: the replicas when there are any,
    /// else the leader. Consumers stay off leaders when they can.
    pub(crate) async fn find_brokers_for_stream(
        &self,
        stream: &str,
    ) -> Result<Vec<Broker>, DirectoryError> {
        let mut metadata = self
            .locator
            .metadata(vec![stream.to_owned()])
            .await
            .map_err(DirectoryError::Client)?;
        let metadata = metadata
            .remove(stream)
            .ok_or(DirectoryError::StreamDoesNotExist)?;
        match metadata.code {
            ResponseCode::Ok => {}
            ResponseCode::StreamDoesNotExist => return Err(DirectoryError::StreamDoesNotExist),
            code => return Err(DirectoryError::MetadataFailure(code)),
        }
        if !metadata.replicas.is_empty() {
            debug!(
                stream,
                replicas = metadata.replicas.len(),
                "resolved candidates from replicas"
            );
            return Ok(metadata.replicas);
        }
        match metadata.leader {
            Some(leader) => Ok(vec![leader]),
            None => Err(DirectoryError::NoBrokerAvailable),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rabbitmq_stream_protocol::{
        commands::query_offset::QueryOffsetResponse, commands::subscribe::OffsetSpecification,
        Response, StreamMetadata,
    };

    use super::*;
    use crate::client::SubscriptionProperties;

    struct MetadataOnlyClient {
        metadata: HashMap<String, StreamMetadata>,
    }

    #[async_trait::async_trait]
    impl Client for MetadataOnlyClient {
        async fn subscribe(
            &self,
            _subscription_id: u8,
            _stream: &str,
            _offset_specification: OffsetSpecification,
            _credit: u16,
            _properties: SubscriptionProperties,
        ) -> Result<Response, ClientError> {
            Err(ClientError::Closed)
        }

        async fn unsubscribe(&self, _subscription_id: u8) -> Result<Response, ClientError> {
            Err(ClientError::Closed)
        }

        async fn credit(&self, _subscription_id: u8, _credit: u16) -> Result<(), ClientError> {
            Err(ClientError::Closed)
        }

        async fn metadata(
            &self,
            _streams: Vec<String>,
        ) -> Result<HashMap<String, StreamMetadata>, ClientError> {
            Ok(self.metadata.clone())
        }

        async fn query_offset(
            &self,
            _reference: &str,
            _stream: &str,
        ) -> Result<QueryOffsetResponse, ClientError> {
            Err(ClientError::Closed)
        }

        async fn partitions(&self, _super_stream: &str) -> Result<Vec<String>, ClientError> {
            Err(ClientError::Closed)
        }

        async fn route(
            &self,
            _routing_key: &str,
            _super_stream: &str,
        ) -> Result<Vec<String>, ClientError> {
            Err(ClientError::Closed)
        }

        fn server_advertised_host(&self) -> String {
            "localhost".to_owned()
        }

        fn server_advertised_port(&self) -> i32 {
            5552
        }

        async fn close(&self) -> Result<(), ClientError> {
            Ok(())
        }
    }

    fn directory_with(metadata: HashMap<String, StreamMetadata>) -> BrokerDirectory {
        BrokerDirectory::new(Arc::new(MetadataOnlyClient { metadata }))
    }

    #[tokio::test]
    async fn missing_metadata_means_no_such_stream() {
        let directory = directory_with(HashMap::new());
        let result = directory.find_brokers_for_stream("events").await;
        assert!(matches!(result, Err(DirectoryError::StreamDoesNotExist)));
    }

    #[tokio::test]
    async fn stream_does_not_exist_code_means_no_such_stream() {
        let mut metadata = HashMap::new();
        metadata.insert(
            "events".to_owned(),
            StreamMetadata::new(ResponseCode::StreamDoesNotExist, None, vec![]),
        );
        let directory = directory_with(metadata);
        let result = directory.find_brokers_for_stream("events").await;
        assert!(matches!(result, Err(DirectoryError::StreamDoesNotExist)));
    }

    #[tokio::test]
    async fn other_codes_are_metadata_failures() {
        let mut metadata = HashMap::new();
        metadata.insert(
            "events".to_owned(),
            StreamMetadata::new(ResponseCode::AccessRefused, None, vec![]),
        );
        let directory = directory_with(metadata);
        match directory.find_brokers_for_stream("events").await {
            Err(DirectoryError::MetadataFailure(code)) => {
                assert_eq!(code, ResponseCode::AccessRefused)
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn replicas_win_over_the_leader() {
        let mut metadata = HashMap::new();
        metadata.insert(
            "events".to_owned(),
            StreamMetadata::new(
                ResponseCode::Ok,
                Some(Broker::new("leader", 5552)),
                vec![Broker::new("replica1", 5552), Broker::new("replica2", 5552)],
            ),
        );
        let directory = directory_with(metadata);
        let brokers = directory
            .find_brokers_for_stream("events")
            .await
            .expect("candidates");
        assert_eq!(
            brokers,
            vec![Broker::new("replica1", 5552), Broker::new("replica2", 5552)]
        );
    }

    #[tokio::test]
    async fn leader_is_the_fallback() {
        let mut metadata = HashMap::new();
        metadata.insert(
            "events".to_owned(),
            StreamMetadata::new(ResponseCode::Ok, Some(Broker::new("leader", 5552)), vec![]),
        );
        let directory = directory_with(metadata);
        let brokers = directory
            .find_brokers_for_stream("events")
            .await
            .expect("candidates");
        assert_eq!(brokers, vec![Broker::new("leader", 5552)]);
    }

    #[tokio::test]
    async fn empty_topology_has_no_broker() {
        let mut metadata = HashMap::new();
        metadata.insert(
            "events".to_owned(),
            StreamMetadata::new(ResponseCode::Ok, None, vec![]),
        );
        let directory = directory_with(metadata);
        let result = directory.find_brokers_for_stream("events").await;
        assert!(matches!(result, Err(DirectoryError::NoBrokerAvailable)));
    }
}
