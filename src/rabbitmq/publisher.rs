// src/rabbitmq/publisher.rs

use super::channel_manager::ChannelRegistry;
use super::errors::Result;
use crate::message::{self, MessageProperties};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Hands JSON bodies to the broker, one queue at a time.
#[derive(Clone)]
pub struct Publisher {
    channels: Arc<ChannelRegistry>,
}

impl Publisher {
    pub fn new(channels: Arc<ChannelRegistry>) -> Self {
        Publisher { channels }
    }

    /// Serializes `message` and sends it to `queue` without waiting for a
    /// broker confirmation.
    pub async fn publish<T: Serialize + ?Sized>(&self, queue: &str, message: &T) -> Result<()> {
        // Encode first so a bad message never opens a connection.
        let payload = message::encode(message)?;
        let channel = self.channels.get_channel(queue).await?;
        let properties = MessageProperties::json();

        channel
            .broker()
            .publish(queue, &payload, &properties)
            .await?;

        debug!(
            queue,
            message_id = %properties.message_id,
            bytes = payload.len(),
            "Published message"
        );
        Ok(())
    }
}
