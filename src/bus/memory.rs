use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::warn;

use super::{BusMessage, MessageBus, MessageKind};
use crate::error::Result;

const CHANNEL_CAPACITY: usize = 1024;

/// In-process bus for a single daemon and for tests.
///
/// Behaves like a pubsub server: publishes with no subscriber are lost and
/// each subscription opens with a `subscribe` control envelope.
#[derive(Default)]
pub struct MemoryBus {
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        // No receivers is not an error for pubsub.
        let _ = self.sender(channel).send(payload.as_bytes().to_vec());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, BusMessage>> {
        let rx = self.sender(channel).subscribe();
        let name = channel.to_string();

        let confirmation = stream::once({
            let name = name.clone();
            async move { BusMessage::control(MessageKind::Subscribe, name) }
        });

        let messages = stream::unfold((rx, name), |(mut rx, name)| async move {
            loop {
                match rx.recv().await {
                    Ok(data) => {
                        let msg = BusMessage::payload(name.clone(), data);
                        return Some((msg, (rx, name)));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel = %name, skipped, "Subscriber lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(confirmation.chain(messages).boxed())
    }
}
