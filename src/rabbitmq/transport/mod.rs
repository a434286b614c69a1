// src/rabbitmq/transport/mod.rs
// Broker seam: everything above this module talks to these traits only.

mod amqp;
mod memory;

pub use amqp::LapinTransport;
pub use memory::{MemoryBroker, QueueStats};

use super::errors::Result;
use crate::message::MessageProperties;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;

pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Opens broker sessions.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, addr: &str, connection_name: &str) -> Result<Arc<dyn BrokerConnection>>;
}

/// One broker session.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;
}

/// A multiplexed session over a [`BrokerConnection`].
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn id(&self) -> u64;

    /// Declares `queue`; repeating the call with the same arguments is a no-op.
    async fn declare_queue(&self, queue: &str, durable: bool) -> Result<()>;

    /// Caps unacknowledged deliveries on this channel, 0 meaning no cap.
    async fn set_prefetch(&self, limit: u16) -> Result<()>;

    /// Routes `payload` to `queue` through the default exchange.
    async fn publish(&self, queue: &str, payload: &[u8], properties: &MessageProperties)
        -> Result<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;
}

/// Sends the acknowledgment for one delivery tag.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<()>;
}

/// Token handed out with each delivery. Acking consumes it.
pub struct DeliveryHandle {
    delivery_tag: u64,
    acker: Box<dyn Acknowledger>,
}

impl DeliveryHandle {
    pub fn new(delivery_tag: u64, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            delivery_tag,
            acker,
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack(self.delivery_tag).await
    }
}

impl fmt::Debug for DeliveryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryHandle")
            .field("delivery_tag", &self.delivery_tag)
            .finish()
    }
}

#[derive(Debug)]
pub struct Delivery {
    pub data: Vec<u8>,
    pub redelivered: bool,
    pub handle: DeliveryHandle,
}
