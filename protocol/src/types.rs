use std::fmt;

use crate::ResponseCode;

/// A broker node as reported by stream metadata.
///
/// The port is kept as reported by the broker; metadata may advertise `-1`
/// when a node has no reachable stream port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Broker {
    pub host: String,
    pub port: i32,
}

impl Broker {
    pub fn new(host: impl Into<String>, port: i32) -> Self {
        Broker {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Topology of one stream: leader, replicas, and the response code of the
/// metadata query that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMetadata {
    pub code: ResponseCode,
    pub leader: Option<Broker>,
    pub replicas: Vec<Broker>,
}

impl StreamMetadata {
    pub fn new(code: ResponseCode, leader: Option<Broker>, replicas: Vec<Broker>) -> Self {
        StreamMetadata {
            code,
            leader,
            replicas,
        }
    }
}
