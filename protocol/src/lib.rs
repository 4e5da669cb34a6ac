//! Protocol-level types shared by the RabbitMQ Stream consumer coordinator and
//! the connection-level client it drives. Wire encoding and framing live in
//! the transport layer, not here.

pub mod commands;
pub mod message;

mod response;
mod types;

pub use response::{Response, ResponseCode};
pub use types::{Broker, StreamMetadata};
