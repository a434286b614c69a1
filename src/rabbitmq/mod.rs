// src/rabbitmq/mod.rs
// Connection, channel cache, publisher and consumer over a pluggable transport.

pub mod errors;
pub mod transport;

mod channel_manager;
mod connection;
mod consumer;
mod publisher;

// Re-export specific items to simplify imports elsewhere
pub use channel_manager::{ChannelRegistry, QueueChannel};
pub use connection::ConnectionManager;
pub use consumer::{Consumer, DeliveryFailure, MessageHandler, Subscription};
pub use errors::{QueueError, Result};
pub use publisher::Publisher;
pub use transport::{
    BrokerChannel, BrokerConnection, Delivery, DeliveryHandle, LapinTransport, MemoryBroker,
    QueueStats, Transport,
};
