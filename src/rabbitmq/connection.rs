// src/rabbitmq/connection.rs

use super::errors::{QueueError, Result};
use super::transport::{BrokerConnection, Transport};
use crate::env::BrokerConfig;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Owns the one broker session of a client.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    config: BrokerConfig,
    // Held across the connect so concurrent first callers share one attempt.
    connection: Mutex<Option<Arc<dyn BrokerConnection>>>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, config: BrokerConfig) -> Self {
        ConnectionManager {
            transport,
            config,
            connection: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Returns the shared connection, connecting on the first call.
    ///
    /// A failed attempt is not remembered; the next call tries again. A
    /// connection that dropped after being established is returned as is:
    /// reconnecting is left to the caller.
    pub async fn get_connection(&self) -> Result<Arc<dyn BrokerConnection>> {
        let mut guard = self.connection.lock().await;

        if let Some(connection) = guard.as_ref() {
            return Ok(connection.clone());
        }

        let connection = self.establish_connection().await?;
        *guard = Some(connection.clone());
        Ok(connection)
    }

    async fn establish_connection(&self) -> Result<Arc<dyn BrokerConnection>> {
        info!(
            connection_name = %self.config.connection_name,
            "Connecting to broker"
        );

        let connect_timeout = self.config.connect_timeout();
        let attempt = self
            .transport
            .connect(&self.config.amqp_addr, &self.config.connection_name);

        match timeout(connect_timeout, attempt).await {
            Ok(Ok(connection)) => {
                info!("Connected to broker");
                Ok(connection)
            }
            Ok(Err(err)) => {
                error!(error = %err, "Failed to connect to broker");
                Err(err)
            }
            Err(_) => {
                error!(timeout = ?connect_timeout, "Timed out connecting to broker");
                Err(QueueError::ConnectTimeout(connect_timeout))
            }
        }
    }

    pub async fn is_connected(&self) -> bool {
        match self.connection.lock().await.as_ref() {
            Some(connection) => connection.is_open(),
            None => false,
        }
    }

    /// Closes the connection, if any. The next `get_connection` opens a new one.
    pub async fn close(&self) -> Result<()> {
        let connection = self.connection.lock().await.take();

        if let Some(connection) = connection {
            info!("Closing broker connection");
            if let Err(err) = connection.close().await {
                warn!(error = %err, "Broker connection did not close cleanly");
                return Err(err);
            }
        }
        Ok(())
    }
}
