// src/rabbitmq/errors.rs

use serde_json::Error as SerdeError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Broker connection error: {0}")]
    ConnectionError(String),

    #[error("Connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Failed to declare queue '{queue}': {reason}")]
    DeclareError { queue: String, reason: String },

    #[error("Broker channel error: {0}")]
    ChannelError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(#[source] SerdeError),

    #[error("Message deserialization error: {0}")]
    DeserializationError(#[source] SerdeError),

    #[error("Publish error: {0}")]
    PublishError(String),

    #[error("Consume error: {0}")]
    ConsumeError(String),

    #[error("Acknowledge error: {0}")]
    AckError(String),

    #[error("Handler failed for message {message_id}: {source}")]
    HandlerError {
        message_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Handler panicked while processing message {0}")]
    HandlerPanic(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

// Custom Result type for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;

impl QueueError {
    /// True for failures that leave the connection itself unusable.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            QueueError::ConnectionError(_) | QueueError::ConnectTimeout(_)
        )
    }
}

impl From<std::env::VarError> for QueueError {
    fn from(err: std::env::VarError) -> Self {
        QueueError::ConfigError(format!("Environment variable error: {}", err))
    }
}

impl From<std::num::ParseIntError> for QueueError {
    fn from(err: std::num::ParseIntError) -> Self {
        QueueError::ConfigError(format!("Parse error: {}", err))
    }
}
