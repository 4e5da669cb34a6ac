use bytes::Bytes;

/// A single message as delivered inside a chunk.
///
/// Payload encoding (AMQP 1.0 sections, compression) is handled by the codec
/// layer; the coordinator only moves the bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    data: Bytes,
}

impl Message {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Message { data: data.into() }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Message::new(data)
    }
}

impl From<&'static str> for Message {
    fn from(data: &'static str) -> Self {
        Message::new(data.as_bytes())
    }
}
