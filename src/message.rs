use crate::rabbitmq::{QueueError, Result};
use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Field the consumer reads from incoming bodies for log lines.
pub const ID_FIELD: &str = "id";

/// Metadata attached to every published body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: String,
    pub message_id: String,
    pub timestamp: u64,
}

impl MessageProperties {
    /// Creates properties with a generated message id and the current timestamp.
    pub fn json() -> Self {
        MessageProperties {
            content_type: JSON_CONTENT_TYPE.to_string(),
            message_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().timestamp().max(0) as u64,
        }
    }
}

/// A body decoded from the wire, along with its `id` when it carries one.
#[derive(Debug)]
pub struct Decoded<T> {
    pub message: T,
    pub message_id: Option<String>,
}

pub fn encode<T: Serialize + ?Sized>(message: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(message).map_err(QueueError::SerializationError)
}

pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<Decoded<T>> {
    let value: Value = serde_json::from_slice(payload).map_err(QueueError::DeserializationError)?;
    let message_id = message_id(&value);
    let message = serde_json::from_value(value).map_err(QueueError::DeserializationError)?;

    Ok(Decoded {
        message,
        message_id,
    })
}

fn message_id(value: &Value) -> Option<String> {
    match value.get(ID_FIELD)? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Best-effort id lookup on a raw body, used when the body did not decode.
pub fn peek_id(payload: &[u8]) -> Option<String> {
    serde_json::from_slice::<Value>(payload)
        .ok()
        .and_then(|value| message_id(&value))
}
