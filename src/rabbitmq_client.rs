// src/rabbitmq_client.rs
// One client = one connection, one channel per queue.

use crate::env::BrokerConfig;
use crate::rabbitmq::{
    BrokerConnection, ChannelRegistry, ConnectionManager, Consumer, LapinTransport, MemoryBroker,
    MessageHandler, Publisher, QueueChannel, Result, Subscription, Transport,
};
use once_cell::sync::OnceCell;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::info;

static GLOBAL: OnceCell<QueueClient> = OnceCell::new();

#[derive(Clone)]
pub struct QueueClient {
    channels: Arc<ChannelRegistry>,
    publisher: Publisher,
    consumer: Consumer,
}

impl QueueClient {
    pub fn new(config: BrokerConfig, transport: Arc<dyn Transport>) -> Self {
        let connections = Arc::new(ConnectionManager::new(transport, config));
        let channels = Arc::new(ChannelRegistry::new(connections));

        QueueClient {
            publisher: Publisher::new(channels.clone()),
            consumer: Consumer::new(channels.clone()),
            channels,
        }
    }

    /// Client over AMQP. Nothing is opened until the first operation.
    pub fn connect_lazy(config: BrokerConfig) -> Self {
        Self::new(config, Arc::new(LapinTransport::new()))
    }

    pub fn in_memory(config: BrokerConfig, broker: MemoryBroker) -> Self {
        Self::new(config, Arc::new(broker))
    }

    /// Process-wide client configured from the environment on first use.
    pub fn global() -> Result<&'static QueueClient> {
        GLOBAL.get_or_try_init(|| {
            let config = BrokerConfig::load()?;
            info!(connection_name = %config.connection_name, "Initialising broker client");
            Ok(Self::connect_lazy(config))
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        self.channels.connections().config()
    }

    pub async fn publish<T: Serialize + ?Sized>(&self, queue: &str, message: &T) -> Result<()> {
        self.publisher.publish(queue, message).await
    }

    pub async fn subscribe<T, H>(
        &self,
        queue: &str,
        handler: H,
        prefetch_limit: u16,
    ) -> Result<Subscription>
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T>,
    {
        self.consumer
            .subscribe::<T, H>(queue, handler, prefetch_limit)
            .await
    }

    pub async fn get_channel(&self, queue: &str) -> Result<QueueChannel> {
        self.channels.get_channel(queue).await
    }

    /// The shared broker connection, opened if needed.
    pub async fn connection(&self) -> Result<Arc<dyn BrokerConnection>> {
        self.channels.connections().get_connection().await
    }

    pub async fn is_connected(&self) -> bool {
        self.channels.connections().is_connected().await
    }

    /// Closes all channels, then the connection. Running subscriptions end and
    /// the broker requeues whatever they had not acknowledged. The client stays
    /// usable: the next operation connects again.
    pub async fn shutdown(&self) -> Result<()> {
        info!(queues = self.channels.queues().len(), "Shutting down broker client");
        let channels = self.channels.close_all().await;
        let connection = self.channels.connections().close().await;
        channels.and(connection)
    }
}

pub async fn publish<T: Serialize + ?Sized>(queue: &str, message: &T) -> Result<()> {
    QueueClient::global()?.publish(queue, message).await
}

pub async fn subscribe<T, H>(queue: &str, handler: H, prefetch_limit: u16) -> Result<Subscription>
where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T>,
{
    QueueClient::global()?
        .subscribe::<T, H>(queue, handler, prefetch_limit)
        .await
}

pub async fn get_channel(queue: &str) -> Result<QueueChannel> {
    QueueClient::global()?.get_channel(queue).await
}

/// Shuts the global client down, if it was ever created.
pub async fn shutdown() -> Result<()> {
    match GLOBAL.get() {
        Some(client) => client.shutdown().await,
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn shutdown_closes_everything_and_allows_reuse() {
        let broker = MemoryBroker::new();
        let client = QueueClient::in_memory(BrokerConfig::new("memory://localhost"), broker.clone());

        client.publish("jobs", &json!({"id": 1})).await.unwrap();
        client.get_channel("reports").await.unwrap();
        assert!(client.is_connected().await);
        assert_eq!(broker.open_channels(), 2);

        client.shutdown().await.unwrap();
        assert!(!client.is_connected().await);
        assert_eq!(broker.open_channels(), 0);

        client.publish("jobs", &json!({"id": 2})).await.unwrap();
        assert_eq!(broker.connections_opened(), 2);
        assert_eq!(broker.stats("jobs").unwrap().ready, 2);
    }

    #[tokio::test]
    async fn shutdown_before_first_use_is_a_no_op() {
        let broker = MemoryBroker::new();
        let client = QueueClient::in_memory(BrokerConfig::new("memory://localhost"), broker.clone());
        client.shutdown().await.unwrap();
        assert_eq!(broker.connections_opened(), 0);
    }

    #[tokio::test]
    async fn clones_share_connection_and_channels() {
        let broker = MemoryBroker::new();
        let client = QueueClient::in_memory(BrokerConfig::new("memory://localhost"), broker.clone());
        let clone = client.clone();

        let a = client.get_channel("jobs").await.unwrap();
        let b = clone.get_channel("jobs").await.unwrap();
        assert!(a.same_channel(&b));
        let first = client.connection().await.unwrap();
        let second = clone.connection().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(broker.connections_opened(), 1);

        let _sub = clone
            .subscribe::<Value, _>("jobs", |_v: Value| async { anyhow::Ok(()) }, 0)
            .await
            .unwrap();
        assert_eq!(broker.channels_opened(), 1);
    }
}
