use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use redis::AsyncCommands;
use tracing::{debug, info};

use super::{BusMessage, MessageBus};
use crate::config::BusSettings;
use crate::error::Result;

/// Redis pubsub transport.
pub struct RedisBus {
    client: redis::Client,
}

impl RedisBus {
    pub fn new(settings: &BusSettings) -> Result<Self> {
        let url = settings.redis_url()?;
        let client = redis::Client::open(url.as_str())?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let receivers: i64 = conn.publish(channel, payload).await?;
        debug!(channel, receivers, "Published job payload");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, BusMessage>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        info!(channel, "Subscribed to redis channel");

        // The subscribe confirmation is consumed by the client, so every
        // item on this stream is a data message.
        let stream = pubsub.into_on_message().map(|msg| {
            BusMessage::payload(msg.get_channel_name(), msg.get_payload_bytes())
        });
        Ok(stream.boxed())
    }
}
