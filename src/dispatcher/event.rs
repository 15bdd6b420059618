use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known event names on the push channel
pub mod names {
    pub const NEW_MESSAGE: &str = "new_message";
    pub const NEW_NOTIFICATION: &str = "new_notification";
    pub const NOTIFICATION_READ: &str = "notification_read";
    pub const ANNOUNCEMENT: &str = "announcement";
    pub const VIDEO_STATUS_UPDATE: &str = "video_status_update";

    /// Keepalive frames; consumed by the connection manager, never dispatched
    pub const HEARTBEAT: &str = "heartbeat";
    pub const PONG: &str = "pong";
}

/// Immutable named event received from the push channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub body: Value,
}

/// Errors when turning a text frame into an [`Event`]
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame has no event name")]
    MissingName,
}

impl Event {
    pub fn new(name: impl Into<String>, body: Value) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }

    /// Decode a text frame.
    ///
    /// Accepted shapes:
    /// - `{"event": "name", "data": {...}}`
    /// - `{"type": "name", "payload": {...}}` (remaining fields become the body when
    ///   neither `data` nor `payload` is present)
    /// - `["name", {...}]`
    pub fn from_frame(frame: &str) -> Result<Self, FrameError> {
        match serde_json::from_str::<Value>(frame)? {
            Value::Array(mut items) => {
                if items.is_empty() {
                    return Err(FrameError::MissingName);
                }
                let name = match items.remove(0) {
                    Value::String(name) => name,
                    _ => return Err(FrameError::MissingName),
                };
                let body = if items.is_empty() {
                    Value::Null
                } else {
                    items.remove(0)
                };
                Ok(Self::new(name, body))
            }
            Value::Object(mut map) => {
                let name = match map.remove("event").or_else(|| map.remove("type")) {
                    Some(Value::String(name)) => name,
                    _ => return Err(FrameError::MissingName),
                };
                let body = match map.remove("data").or_else(|| map.remove("payload")) {
                    Some(body) => body,
                    None if map.is_empty() => Value::Null,
                    None => Value::Object(map),
                };
                Ok(Self::new(name, body))
            }
            _ => Err(FrameError::MissingName),
        }
    }

    /// Encode in the canonical `{"event", "data"}` shape
    pub fn to_frame(&self) -> String {
        serde_json::json!({ "event": self.name, "data": self.body }).to_string()
    }

    /// Deserialize the body into a typed payload
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.body)
    }

    pub fn is_keepalive(&self) -> bool {
        self.name == names::HEARTBEAT || self.name == names::PONG
    }
}
