use crate::rabbitmq::{QueueError, Result};
use dotenv::dotenv;
use std::collections::HashSet;
use std::env;
use std::time::Duration;

pub const ADDR_VAR: &str = "RABBITMQ_IP";
pub const FALLBACK_ADDR_VAR: &str = "AMQP_ADDR";
pub const CONNECTION_NAME_VAR: &str = "RABBITMQ_CONNECTION_NAME";
pub const CONNECT_TIMEOUT_VAR: &str = "RABBITMQ_CONNECT_TIMEOUT_SECONDS";
pub const DURABLE_QUEUES_VAR: &str = "RABBITMQ_DURABLE_QUEUES";
pub const QUIET_QUEUES_VAR: &str = "RABBITMQ_QUIET_QUEUES";

/// Broker settings, read once when the client is built.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub amqp_addr: String,
    pub connection_name: String,
    pub connect_timeout_seconds: u64,
    pub durable_queues: bool,
    /// Queues whose per-message timing is logged at debug level only.
    pub quiet_queues: HashSet<String>,
}

fn default_connection_name() -> String {
    "rabbit_relay".to_string()
}

fn default_connect_timeout_seconds() -> u64 {
    10
}

fn default_durable_queues() -> bool {
    true
}

impl BrokerConfig {
    pub fn new(amqp_addr: impl Into<String>) -> Self {
        BrokerConfig {
            amqp_addr: amqp_addr.into(),
            connection_name: default_connection_name(),
            connect_timeout_seconds: default_connect_timeout_seconds(),
            durable_queues: default_durable_queues(),
            quiet_queues: HashSet::new(),
        }
    }

    pub fn load() -> Result<Self> {
        dotenv().ok();
        Self::from_env()
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key/value source; `from_env` passes the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let amqp_addr = lookup(ADDR_VAR)
            .or_else(|| lookup(FALLBACK_ADDR_VAR))
            .filter(|addr| !addr.trim().is_empty())
            .ok_or_else(|| {
                QueueError::ConfigError(format!(
                    "{} (or {}) must be set to the broker address",
                    ADDR_VAR, FALLBACK_ADDR_VAR
                ))
            })?;

        Ok(BrokerConfig {
            amqp_addr,
            connection_name: lookup(CONNECTION_NAME_VAR).unwrap_or_else(default_connection_name),
            connect_timeout_seconds: match lookup(CONNECT_TIMEOUT_VAR) {
                Some(val) => val.trim().parse()?,
                None => default_connect_timeout_seconds(),
            },
            durable_queues: match lookup(DURABLE_QUEUES_VAR) {
                Some(val) => parse_bool(DURABLE_QUEUES_VAR, &val)?,
                None => default_durable_queues(),
            },
            quiet_queues: lookup(QUIET_QUEUES_VAR)
                .map(|val| parse_list(&val))
                .unwrap_or_default(),
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_seconds = timeout.as_secs().max(1);
        self
    }

    pub fn with_quiet_queue(mut self, queue: impl Into<String>) -> Self {
        self.quiet_queues.insert(queue.into());
        self
    }

    pub fn is_quiet(&self, queue: &str) -> bool {
        self.quiet_queues.contains(queue)
    }
}

fn parse_bool(key: &str, val: &str) -> Result<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(QueueError::ConfigError(format!(
            "{} must be a boolean, got '{}'",
            key, other
        ))),
    }
}

fn parse_list(val: &str) -> HashSet<String> {
    val.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}
