//! Publish and consume JSON messages over RabbitMQ without hand-managing
//! connections and channels.
//!
//! A [`QueueClient`] owns one broker connection, opened on first use, and one
//! channel per queue, created (and the queue declared) on first access.
//! Consumers acknowledge a message only after their handler returns `Ok`.
//!
//! ```rust,no_run
//! use rabbit_relay::{BrokerConfig, QueueClient};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Job {
//!     id: String,
//!     payload: String,
//! }
//!
//! # async fn run() -> Result<(), rabbit_relay::QueueError> {
//! let client = QueueClient::connect_lazy(BrokerConfig::load()?);
//!
//! let _subscription = client
//!     .subscribe::<Job, _>(
//!         "jobs",
//!         |job: Job| async move {
//!             println!("processing {}", job.payload);
//!             anyhow::Ok(())
//!         },
//!         1,
//!     )
//!     .await?;
//!
//! client
//!     .publish("jobs", &Job { id: "x1".into(), payload: "hello".into() })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod env;
pub mod logging;
pub mod message;
pub mod rabbitmq;
pub mod rabbitmq_client;

pub use env::BrokerConfig;
pub use rabbitmq::{
    DeliveryFailure, MemoryBroker, MessageHandler, QueueChannel, QueueError, Result, Subscription,
};
pub use rabbitmq_client::{get_channel, publish, shutdown, subscribe, QueueClient};
