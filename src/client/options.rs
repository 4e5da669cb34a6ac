use rabbitmq_stream_protocol::Broker;

#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub v_host: String,
    pub heartbeat: u32,
    pub max_frame_size: u32,
    pub client_provided_name: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            host: "localhost".to_owned(),
            port: 5552,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            v_host: "/".to_owned(),
            heartbeat: 60,
            max_frame_size: 1048576,
            client_provided_name: "rabbitmq-stream-coordinator".to_owned(),
        }
    }
}

impl ClientOptions {
    /// Same credentials and tuning, pointed at another node.
    pub fn for_broker(&self, broker: &Broker) -> Self {
        ClientOptions {
            host: broker.host.clone(),
            port: broker.port as u16,
            ..self.clone()
        }
    }
}
