#![allow(dead_code)]

//! Scripted doubles for the broker side: a client factory producing
//! recording clients, a shared script of broker answers, and counting
//! consumer/handler implementations.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rabbitmq_stream_coordinator::{
    Client, ClientError, ClientFactory, ClientListeners, ClientOptions, ConsumerCoordinator,
    CoordinatorOptions, FixedWithInitialDelay, MessageContext, MessageHandler, RabbitMQStreamResult,
    ShutdownContext, ShutdownReason, StreamConsumer, SubscriptionProperties, SubscriptionRequest,
};
use rabbitmq_stream_protocol::{
    commands::query_offset::QueryOffsetResponse, commands::subscribe::OffsetSpecification,
    message::Message, Broker, Response, ResponseCode, StreamMetadata,
};

/// Queued broker answers shared by every connection of a test, the locator
/// included. Queues win over defaults; an empty queue falls back.
#[derive(Default)]
pub struct BrokerScript {
    metadata_queue: Mutex<VecDeque<HashMap<String, StreamMetadata>>>,
    default_metadata: Mutex<HashMap<String, StreamMetadata>>,
    subscribe_responses: Mutex<VecDeque<Result<Response, ClientError>>>,
    query_offset_responses: Mutex<VecDeque<Result<QueryOffsetResponse, ClientError>>>,
}

impl BrokerScript {
    pub fn set_metadata(&self, stream: &str, metadata: StreamMetadata) {
        self.default_metadata
            .lock()
            .unwrap()
            .insert(stream.to_owned(), metadata);
    }

    pub fn forget_stream(&self, stream: &str) {
        self.default_metadata.lock().unwrap().remove(stream);
    }

    pub fn push_metadata_for(&self, stream: &str, metadata: StreamMetadata) {
        let mut entry = HashMap::new();
        entry.insert(stream.to_owned(), metadata);
        self.metadata_queue.lock().unwrap().push_back(entry);
    }

    pub fn push_subscribe_response(&self, response: Result<Response, ClientError>) {
        self.subscribe_responses.lock().unwrap().push_back(response);
    }

    pub fn push_query_offset(&self, response: Result<QueryOffsetResponse, ClientError>) {
        self.query_offset_responses
            .lock()
            .unwrap()
            .push_back(response);
    }

    fn next_metadata(&self) -> HashMap<String, StreamMetadata> {
        match self.metadata_queue.lock().unwrap().pop_front() {
            Some(entry) => entry,
            None => self.default_metadata.lock().unwrap().clone(),
        }
    }

    fn next_subscribe_response(&self) -> Result<Response, ClientError> {
        self.subscribe_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Response::ok()))
    }

    fn next_query_offset(&self) -> Result<QueryOffsetResponse, ClientError> {
        self.query_offset_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(QueryOffsetResponse::new(ResponseCode::Ok, 0)))
    }
}

#[derive(Clone, Debug)]
pub struct SubscribeCall {
    pub client_id: usize,
    pub subscription_id: u8,
    pub stream: String,
    pub offset_specification: OffsetSpecification,
    pub credit: u16,
    pub properties: SubscriptionProperties,
}

/// Counters aggregated across every client a test creates.
#[derive(Default)]
pub struct CallLog {
    subscribe_calls: Mutex<Vec<SubscribeCall>>,
    unsubscribe_count: AtomicUsize,
    metadata_count: AtomicUsize,
    query_offset_count: AtomicUsize,
}

impl CallLog {
    pub fn subscribe_count(&self) -> usize {
        self.subscribe_calls.lock().unwrap().len()
    }

    pub fn subscribe_calls(&self) -> Vec<SubscribeCall> {
        self.subscribe_calls.lock().unwrap().clone()
    }

    pub fn last_subscribe(&self) -> Option<SubscribeCall> {
        self.subscribe_calls.lock().unwrap().last().cloned()
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.unsubscribe_count.load(SeqCst)
    }

    pub fn query_offset_count(&self) -> usize {
        self.query_offset_count.load(SeqCst)
    }
}

pub struct MockClient {
    id: usize,
    options: ClientOptions,
    advertised: (String, i32),
    script: Arc<BrokerScript>,
    calls: Arc<CallLog>,
    listeners: Mutex<Option<ClientListeners>>,
    subscribe_calls: Mutex<Vec<SubscribeCall>>,
    unsubscribe_calls: Mutex<Vec<u8>>,
    credit_calls: Mutex<Vec<(u8, u16)>>,
    close_count: AtomicUsize,
}

impl MockClient {
    fn new(
        id: usize,
        options: ClientOptions,
        advertised: (String, i32),
        script: Arc<BrokerScript>,
        calls: Arc<CallLog>,
        listeners: Option<ClientListeners>,
    ) -> Self {
        MockClient {
            id,
            options,
            advertised,
            script,
            calls,
            listeners: Mutex::new(listeners),
            subscribe_calls: Mutex::new(Vec::new()),
            unsubscribe_calls: Mutex::new(Vec::new()),
            credit_calls: Mutex::new(Vec::new()),
            close_count: AtomicUsize::new(0),
        }
    }

    /// Stand-alone locator connection, no listeners.
    pub fn locator(script: Arc<BrokerScript>, calls: Arc<CallLog>) -> Arc<Self> {
        Arc::new(MockClient::new(
            usize::MAX,
            ClientOptions::default(),
            ("localhost".to_owned(), 5552),
            script,
            calls,
            None,
        ))
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn subscribe_calls(&self) -> Vec<SubscribeCall> {
        self.subscribe_calls.lock().unwrap().clone()
    }

    pub fn unsubscribe_calls(&self) -> Vec<u8> {
        self.unsubscribe_calls.lock().unwrap().clone()
    }

    pub fn credit_calls(&self) -> Vec<(u8, u16)> {
        self.credit_calls.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(SeqCst)
    }

    fn listeners(&self) -> ClientListeners {
        self.listeners
            .lock()
            .unwrap()
            .clone()
            .expect("client has no listeners")
    }

    pub async fn fire_message(&self, subscription_id: u8, offset: u64) {
        self.listeners()
            .message_listener
            .on_message(subscription_id, offset, 0, 0, Message::from("payload"))
            .await;
    }

    pub async fn fire_shutdown(&self, reason: ShutdownReason) {
        self.listeners()
            .shutdown_listener
            .on_shutdown(ShutdownContext::new(reason))
            .await;
    }

    pub async fn fire_metadata_update(&self, stream: &str, code: ResponseCode) {
        self.listeners()
            .metadata_listener
            .on_metadata_update(stream, code)
            .await;
    }
}

#[async_trait::async_trait]
impl Client for MockClient {
    async fn subscribe(
        &self,
        subscription_id: u8,
        stream: &str,
        offset_specification: OffsetSpecification,
        credit: u16,
        properties: SubscriptionProperties,
    ) -> Result<Response, ClientError> {
        let call = SubscribeCall {
            client_id: self.id,
            subscription_id,
            stream: stream.to_owned(),
            offset_specification,
            credit,
            properties,
        };
        self.subscribe_calls.lock().unwrap().push(call.clone());
        self.calls.subscribe_calls.lock().unwrap().push(call);
        self.script.next_subscribe_response()
    }

    async fn unsubscribe(&self, subscription_id: u8) -> Result<Response, ClientError> {
        self.unsubscribe_calls.lock().unwrap().push(subscription_id);
        self.calls.unsubscribe_count.fetch_add(1, SeqCst);
        Ok(Response::ok())
    }

    async fn credit(&self, subscription_id: u8, credit: u16) -> Result<(), ClientError> {
        self.credit_calls
            .lock()
            .unwrap()
            .push((subscription_id, credit));
        Ok(())
    }

    async fn metadata(
        &self,
        _streams: Vec<String>,
    ) -> Result<HashMap<String, StreamMetadata>, ClientError> {
        self.calls.metadata_count.fetch_add(1, SeqCst);
        Ok(self.script.next_metadata())
    }

    async fn query_offset(
        &self,
        _reference: &str,
        _stream: &str,
    ) -> Result<QueryOffsetResponse, ClientError> {
        self.calls.query_offset_count.fetch_add(1, SeqCst);
        self.script.next_query_offset()
    }

    async fn partitions(&self, _super_stream: &str) -> Result<Vec<String>, ClientError> {
        Ok(Vec::new())
    }

    async fn route(
        &self,
        _routing_key: &str,
        _super_stream: &str,
    ) -> Result<Vec<String>, ClientError> {
        Ok(Vec::new())
    }

    fn server_advertised_host(&self) -> String {
        self.advertised.0.clone()
    }

    fn server_advertised_port(&self) -> i32 {
        self.advertised.1
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.close_count.fetch_add(1, SeqCst);
        Ok(())
    }
}

pub struct MockClientFactory {
    script: Arc<BrokerScript>,
    calls: Arc<CallLog>,
    advertised_queue: Mutex<VecDeque<(String, i32)>>,
    clients: Mutex<Vec<Arc<MockClient>>>,
    next_id: AtomicUsize,
}

impl MockClientFactory {
    pub fn new(script: Arc<BrokerScript>, calls: Arc<CallLog>) -> Arc<Self> {
        Arc::new(MockClientFactory {
            script,
            calls,
            advertised_queue: Mutex::new(VecDeque::new()),
            clients: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        })
    }

    /// Scripts the advertised node of the next created connection.
    pub fn push_advertised(&self, host: &str, port: i32) {
        self.advertised_queue
            .lock()
            .unwrap()
            .push_back((host.to_owned(), port));
    }

    pub fn create_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    pub fn client(&self, index: usize) -> Arc<MockClient> {
        self.clients.lock().unwrap()[index].clone()
    }

    pub fn clients(&self) -> Vec<Arc<MockClient>> {
        self.clients.lock().unwrap().clone()
    }

    pub fn total_close_count(&self) -> usize {
        self.clients
            .lock()
            .unwrap()
            .iter()
            .map(|client| client.close_count())
            .sum()
    }
}

#[async_trait::async_trait]
impl ClientFactory for MockClientFactory {
    async fn create(
        &self,
        options: ClientOptions,
        listeners: ClientListeners,
    ) -> Result<Arc<dyn Client>, ClientError> {
        let advertised = self
            .advertised_queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| (options.host.clone(), i32::from(options.port)));
        let client = Arc::new(MockClient::new(
            self.next_id.fetch_add(1, SeqCst),
            options,
            advertised,
            Arc::clone(&self.script),
            Arc::clone(&self.calls),
            Some(listeners),
        ));
        self.clients.lock().unwrap().push(Arc::clone(&client));
        Ok(client)
    }
}

/// Consumer double counting the coordination handshakes.
pub struct MockConsumer {
    open: AtomicBool,
    client_reset_count: AtomicUsize,
    client_set_count: AtomicUsize,
    deleted_count: AtomicUsize,
}

impl MockConsumer {
    pub fn new() -> Arc<Self> {
        Arc::new(MockConsumer {
            open: AtomicBool::new(true),
            client_reset_count: AtomicUsize::new(0),
            client_set_count: AtomicUsize::new(0),
            deleted_count: AtomicUsize::new(0),
        })
    }

    pub fn close(&self) {
        self.open.store(false, SeqCst);
    }

    pub fn subscription_client_reset_count(&self) -> usize {
        self.client_reset_count.load(SeqCst)
    }

    pub fn subscription_client_set_count(&self) -> usize {
        self.client_set_count.load(SeqCst)
    }

    pub fn close_after_stream_deletion_count(&self) -> usize {
        self.deleted_count.load(SeqCst)
    }
}

impl StreamConsumer for MockConsumer {
    fn is_open(&self) -> bool {
        self.open.load(SeqCst)
    }

    fn set_subscription_client(&self, client: Option<Arc<dyn Client>>) {
        match client {
            Some(_) => self.client_set_count.fetch_add(1, SeqCst),
            None => self.client_reset_count.fetch_add(1, SeqCst),
        };
    }

    fn close_after_stream_deletion(&self) {
        self.deleted_count.fetch_add(1, SeqCst);
        self.open.store(false, SeqCst);
    }
}

pub struct CountingHandler {
    count: AtomicUsize,
}

impl CountingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(CountingHandler {
            count: AtomicUsize::new(0),
        })
    }

    pub fn count(&self) -> usize {
        self.count.load(SeqCst)
    }
}

#[async_trait::async_trait]
impl MessageHandler for CountingHandler {
    async fn handle_message(
        &self,
        _context: MessageContext,
        _message: Message,
    ) -> RabbitMQStreamResult<()> {
        self.count.fetch_add(1, SeqCst);
        Ok(())
    }
}

/// A coordinator wired to scripted doubles with millisecond back-off, so
/// recovery runs fast under test.
pub struct TestRig {
    pub script: Arc<BrokerScript>,
    pub calls: Arc<CallLog>,
    pub factory: Arc<MockClientFactory>,
    pub locator: Arc<MockClient>,
    pub coordinator: ConsumerCoordinator,
}

impl TestRig {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt::try_init();
        let script = Arc::new(BrokerScript::default());
        let calls = Arc::new(CallLog::default());
        let factory = MockClientFactory::new(Arc::clone(&script), Arc::clone(&calls));
        let locator = MockClient::locator(Arc::clone(&script), Arc::clone(&calls));
        let options = CoordinatorOptions {
            recovery_back_off_delay_policy: Arc::new(FixedWithInitialDelay::new(
                Duration::from_millis(5),
                Duration::from_millis(5),
            )),
            topology_update_back_off_delay_policy: Arc::new(FixedWithInitialDelay::new(
                Duration::from_millis(5),
                Duration::from_millis(5),
            )),
            ..CoordinatorOptions::default()
        };
        let locator_client: Arc<dyn Client> = locator.clone();
        let factory_client: Arc<dyn ClientFactory> = factory.clone();
        let coordinator = ConsumerCoordinator::new(locator_client, factory_client, options);
        TestRig {
            script,
            calls,
            factory,
            locator,
            coordinator,
        }
    }
}

pub fn metadata_ok(leader: Option<Broker>, replicas: Vec<Broker>) -> StreamMetadata {
    StreamMetadata::new(ResponseCode::Ok, leader, replicas)
}

pub fn request(
    consumer: &Arc<MockConsumer>,
    stream: &str,
    handler: &Arc<CountingHandler>,
) -> SubscriptionRequest {
    let consumer: Arc<dyn StreamConsumer> = consumer.clone();
    let handler: Arc<dyn MessageHandler> = handler.clone();
    SubscriptionRequest::new(consumer, stream, handler)
}

/// Polls the condition until it holds or the timeout passes.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
