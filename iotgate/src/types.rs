//! Common types for iotgate.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Device identity record as stored in the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Directory row id.
    pub id: u64,
    /// Hardware identity presented at registration.
    pub uuid: String,
    /// Registration secret paired with `uuid`.
    pub token: String,
    /// Key issued at registration, used to request connection credentials.
    pub auth_key: String,
    /// MQTT client identifier, set once credentials are issued.
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Token issued alongside the MQTT credentials.
    pub iot_token: Option<String>,
}

impl Device {
    /// Check a username/password pair against the stored credentials.
    ///
    /// A device without issued credentials never matches.
    pub fn credentials_match(&self, username: &str, password: &[u8]) -> bool {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => u == username && p.as_bytes() == password,
            _ => false,
        }
    }
}

/// Named device group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: u64,
    pub name: String,
}

/// Connection credentials written back to the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub iot_token: String,
}

/// How a device receives forwarded messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionMode {
    /// Persistent MQTT connection; messages are pushed over the transport.
    #[default]
    #[serde(rename = "mqtt", alias = "live")]
    Live,
    /// No persistent connection; messages are staged until the device polls.
    #[serde(rename = "http", alias = "polling")]
    Polling,
}

impl ConnectionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionMode::Live => "mqtt",
            ConnectionMode::Polling => "http",
        }
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "mqtt" | "live" => Ok(ConnectionMode::Live),
            "http" | "polling" => Ok(ConnectionMode::Polling),
            other => Err(format!("unknown connection mode: {}", other)),
        }
    }
}

/// Topic action checked by the ACL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Publish,
    Subscribe,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Publish => f.write_str("publish"),
            Action::Subscribe => f.write_str("subscribe"),
        }
    }
}

/// Envelope delivered to a recipient, either pushed or staged.
///
/// Device forwards serialize as `{fromDevice, data}`, group forwards as
/// `{fromGroup, fromDevice, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_group: Option<String>,
    pub from_device: String,
    pub data: serde_json::Value,
}

impl ForwardMessage {
    /// Envelope for a device-to-device forward.
    pub fn from_device(from_device: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            from_group: None,
            from_device: from_device.into(),
            data,
        }
    }

    /// Envelope for a group fan-out.
    pub fn from_group(
        from_group: impl Into<String>,
        from_device: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            from_group: Some(from_group.into()),
            from_device: from_device.into(),
            data,
        }
    }
}

/// Cache counters for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub cached_devices: usize,
    pub online_clients: usize,
    pub pending_messages: usize,
}

/// A live transport connection bound to one client identifier.
pub trait Session: Send + Sync {
    /// Tear the connection down.
    fn close(&self);
}

/// Function-based session.
impl<F> Session for F
where
    F: Fn() + Send + Sync,
{
    fn close(&self) {
        self()
    }
}

/// Shared session handle held by the cache.
pub type SessionHandle = Arc<dyn Session>;

/// Outbound side of the transport engine.
pub trait Transport: Send + Sync {
    /// Publish a payload to every subscriber of `topic`.
    fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;
}

/// Function-based transport.
impl<F> Transport for F
where
    F: Fn(&str, Bytes) -> Result<()> + Send + Sync,
{
    fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self(topic, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn device() -> Device {
        Device {
            id: 1,
            uuid: "u-1".to_string(),
            token: "t".to_string(),
            auth_key: "ak".to_string(),
            client_id: Some("D1".to_string()),
            username: Some("user".to_string()),
            password: Some("secret".to_string()),
            iot_token: None,
        }
    }

    #[test]
    fn test_credentials_match() {
        let d = device();
        assert!(d.credentials_match("user", b"secret"));
        assert!(!d.credentials_match("user", b"wrong"));
        assert!(!d.credentials_match("other", b"secret"));

        let mut bare = device();
        bare.username = None;
        bare.password = None;
        assert!(!bare.credentials_match("", b""));
    }

    #[test]
    fn test_forward_message_shape() {
        let msg = ForwardMessage::from_device("D1", json!("y"));
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"fromDevice": "D1", "data": "y"})
        );

        let msg = ForwardMessage::from_group("G", "D2", json!({"k": 1}));
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"fromGroup": "G", "fromDevice": "D2", "data": {"k": 1}})
        );
    }

    #[test]
    fn test_connection_mode() {
        assert_eq!(ConnectionMode::default(), ConnectionMode::Live);
        assert_eq!("http".parse::<ConnectionMode>(), Ok(ConnectionMode::Polling));
        assert_eq!("live".parse::<ConnectionMode>(), Ok(ConnectionMode::Live));
        assert!("carrier-pigeon".parse::<ConnectionMode>().is_err());

        let mode: ConnectionMode = serde_json::from_value(json!("polling")).unwrap();
        assert_eq!(mode, ConnectionMode::Polling);
        assert_eq!(serde_json::to_value(mode).unwrap(), json!("http"));
    }
}
