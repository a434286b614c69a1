// src/rabbitmq/transport/amqp.rs

use super::{
    Acknowledger, BrokerChannel, BrokerConnection, Delivery, DeliveryHandle, DeliveryStream,
    Transport,
};
use crate::message::MessageProperties;
use crate::rabbitmq::errors::{QueueError, Result};
use async_trait::async_trait;
use futures_lite::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        QueueDeclareOptions,
    },
    types::{FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, error, info};

const REPLY_SUCCESS: u16 = 200;

/// AMQP 0-9-1 transport backed by lapin.
#[derive(Debug, Default, Clone)]
pub struct LapinTransport;

impl LapinTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(&self, addr: &str, connection_name: &str) -> Result<Arc<dyn BrokerConnection>> {
        let properties = ConnectionProperties::default()
            .with_connection_name(LongString::from(connection_name.to_string()));

        let connection = Connection::connect(addr, properties).await.map_err(|e| {
            error!(error = %e, "failed to connect to broker");
            QueueError::ConnectionError(e.to_string())
        })?;

        Ok(Arc::new(LapinConnection { connection }))
    }
}

struct LapinConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| QueueError::ChannelError(format!("Failed to create channel: {}", e)))?;

        debug!(channel_id = channel.id(), "amqp channel opened");
        Ok(Arc::new(LapinChannel { channel }))
    }

    async fn close(&self) -> Result<()> {
        if !self.connection.status().connected() {
            return Ok(());
        }

        info!("closing broker connection");
        self.connection
            .close(REPLY_SUCCESS, "Closing connection")
            .await
            .map_err(|e| QueueError::ConnectionError(e.to_string()))
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }
}

struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn id(&self) -> u64 {
        u64::from(self.channel.id())
    }

    async fn declare_queue(&self, queue: &str, durable: bool) -> Result<()> {
        let declared = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::DeclareError {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        debug!(
            queue,
            messages = declared.message_count(),
            consumers = declared.consumer_count(),
            "queue declared"
        );
        Ok(())
    }

    async fn set_prefetch(&self, limit: u16) -> Result<()> {
        self.channel
            .basic_qos(limit, BasicQosOptions::default())
            .await
            .map_err(|e| QueueError::ChannelError(format!("Failed to set QoS: {}", e)))
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(properties.content_type.clone()))
            .with_message_id(ShortString::from(properties.message_id.clone()))
            .with_timestamp(properties.timestamp);

        // The returned confirmation is dropped: the channel is not in confirm mode.
        self.channel
            .basic_publish("", queue, BasicPublishOptions::default(), payload, properties)
            .await
            .map_err(|e| QueueError::PublishError(e.to_string()))?;

        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::ConsumeError(e.to_string()))?;

        let stream = consumer.map(|delivery| {
            delivery
                .map(|delivery| {
                    let handle = DeliveryHandle::new(
                        delivery.delivery_tag,
                        Box::new(LapinAcker(delivery.acker)),
                    );
                    Delivery {
                        data: delivery.data,
                        redelivered: delivery.redelivered,
                        handle,
                    }
                })
                .map_err(|e| QueueError::ConsumeError(e.to_string()))
        });

        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        if !self.channel.status().connected() {
            return Ok(());
        }

        self.channel
            .close(REPLY_SUCCESS, "Closing channel")
            .await
            .map_err(|e| QueueError::ChannelError(e.to_string()))
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    // lapin's acker already carries the delivery tag.
    async fn ack(&self, _delivery_tag: u64) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| QueueError::AckError(e.to_string()))
    }
}
