// src/rabbitmq/channel_manager.rs

use super::connection::ConnectionManager;
use super::errors::{QueueError, Result};
use super::transport::BrokerChannel;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// A broker channel bound to one declared queue.
#[derive(Clone)]
pub struct QueueChannel {
    queue: Arc<str>,
    channel: Arc<dyn BrokerChannel>,
}

impl QueueChannel {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn id(&self) -> u64 {
        self.channel.id()
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    /// True when both handles point at the same broker channel.
    pub fn same_channel(&self, other: &QueueChannel) -> bool {
        Arc::ptr_eq(&self.channel, &other.channel)
    }

    pub(crate) fn broker(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }
}

impl fmt::Debug for QueueChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueChannel")
            .field("queue", &self.queue)
            .field("id", &self.channel.id())
            .finish()
    }
}

type ChannelSlot = Arc<OnceCell<QueueChannel>>;

/// Caches one channel per queue name, creating and declaring on first access.
pub struct ChannelRegistry {
    connections: Arc<ConnectionManager>,
    channels: Mutex<HashMap<String, ChannelSlot>>,
}

impl ChannelRegistry {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        ChannelRegistry {
            connections,
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Returns the channel for `queue`, opening it and declaring the queue on
    /// first access. Concurrent first accesses to one queue share a single
    /// creation; a failed creation leaves nothing cached.
    pub async fn get_channel(&self, queue: &str) -> Result<QueueChannel> {
        let slot = self.slot(queue)?;
        let channel = slot.get_or_try_init(|| self.open_channel(queue)).await?;
        Ok(channel.clone())
    }

    fn slot(&self, queue: &str) -> Result<ChannelSlot> {
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| QueueError::ChannelError("Channel registry lock poisoned".to_string()))?;

        Ok(channels.entry(queue.to_string()).or_default().clone())
    }

    async fn open_channel(&self, queue: &str) -> Result<QueueChannel> {
        let connection = self.connections.get_connection().await?;
        let channel = connection.create_channel().await?;

        let durable = self.connections.config().durable_queues;
        if let Err(err) = channel.declare_queue(queue, durable).await {
            warn!(queue, error = %err, "Queue declaration failed");
            close_quietly(&channel).await;
            return Err(err);
        }

        info!(queue, channel_id = channel.id(), "Channel created for queue");
        Ok(QueueChannel {
            queue: Arc::from(queue),
            channel,
        })
    }

    /// Names of the queues that currently have a channel.
    pub fn queues(&self) -> Vec<String> {
        match self.channels.lock() {
            Ok(channels) => channels
                .iter()
                .filter(|(_, slot)| slot.initialized())
                .map(|(name, _)| name.clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Closes every cached channel and empties the cache.
    pub async fn close_all(&self) -> Result<()> {
        let drained: Vec<(String, ChannelSlot)> = {
            let mut channels = self.channels.lock().map_err(|_| {
                QueueError::ChannelError("Channel registry lock poisoned".to_string())
            })?;
            channels.drain().collect()
        };

        let mut first_error = None;
        for (queue, slot) in drained {
            let Some(channel) = slot.get() else {
                continue;
            };
            debug!(queue = %queue, "Closing channel");
            if let Err(err) = channel.channel.close().await {
                warn!(queue = %queue, error = %err, "Channel did not close cleanly");
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn close_quietly(channel: &Arc<dyn BrokerChannel>) {
    if let Err(err) = channel.close().await {
        debug!(error = %err, "Ignoring close failure on discarded channel");
    }
}
