//! Publish/subscribe transport carrying job payloads.
//!
//! Subscribers receive every envelope on the channel, including the
//! transport's own control traffic. Only [`MessageKind::Message`] carries a
//! job; everything else is for the consumer to skip.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

mod memory;
mod redis_bus;

pub use memory::MemoryBus;
pub use redis_bus::RedisBus;

/// Discriminator of a bus envelope, mirroring the pubsub `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Message,
    Subscribe,
    Unsubscribe,
    Other,
}

impl MessageKind {
    pub fn from_wire(kind: &str) -> Self {
        match kind {
            "message" | "pmessage" => Self::Message,
            "subscribe" | "psubscribe" => Self::Subscribe,
            "unsubscribe" | "punsubscribe" => Self::Unsubscribe,
            _ => Self::Other,
        }
    }

    pub fn carries_payload(&self) -> bool {
        matches!(self, Self::Message)
    }
}

#[derive(Debug, Clone)]
pub struct BusMessage {
    pub kind: MessageKind,
    pub channel: String,
    pub data: Vec<u8>,
}

impl BusMessage {
    pub fn payload(channel: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: MessageKind::Message,
            channel: channel.into(),
            data: data.into(),
        }
    }

    pub fn control(kind: MessageKind, channel: impl Into<String>) -> Self {
        Self {
            kind,
            channel: channel.into(),
            data: Vec::new(),
        }
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Open a subscription. The stream ends when the transport disconnects.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, BusMessage>>;
}
