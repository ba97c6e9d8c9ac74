//! Peer cache wire protocol
//!
//! One request frame, one reply frame. Frames are length delimited
//! (`tokio_util::codec::LengthDelimitedCodec`) and carry JSON bodies.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const MSG_SUCCESS: &str = "success";
pub const MSG_NOT_AVAILABLE: &str = "not available";
pub const ERR_NO_SUCH_DATA_PATH: &str = "no such data path";
pub const ERR_MALFORMED_REQUEST: &str = "malformed request";

/// Network address a peer cache is reachable at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discovery {
    pub host: String,
    #[serde(deserialize_with = "deserialize_port")]
    pub port: u16,
}

impl Discovery {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Discovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Workers send ports both as numbers and as strings
fn deserialize_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid port {:?}", text))),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRequest {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_path: Option<String>,
}

/// Reply frame; exactly one of the three shapes below
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Decoded meaning of a `PeerReply`
#[derive(Debug, Clone, PartialEq)]
pub enum PeerOutcome {
    Success(Value),
    NotAvailable(String),
    NoSuchDataPath(String),
    Malformed,
}

impl PeerReply {
    pub fn success(data: Value) -> Self {
        Self {
            message: Some(MSG_SUCCESS.to_string()),
            error: None,
            reason: None,
            data: Some(data),
        }
    }

    pub fn not_available(current_task: Option<&str>) -> Self {
        Self {
            message: Some(MSG_NOT_AVAILABLE.to_string()),
            error: None,
            reason: Some(format!("Current taskId is {}", current_task.unwrap_or("null"))),
            data: None,
        }
    }

    pub fn no_such_data_path(data_path: &str) -> Self {
        Self {
            message: None,
            error: Some(ERR_NO_SUCH_DATA_PATH.to_string()),
            reason: Some(format!("{} does not exist in data", data_path)),
            data: None,
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self {
            message: None,
            error: Some(ERR_MALFORMED_REQUEST.to_string()),
            reason: Some(reason.into()),
            data: None,
        }
    }

    pub fn outcome(self) -> PeerOutcome {
        let reason = self.reason.unwrap_or_default();
        match (self.message.as_deref(), self.error.as_deref()) {
            (Some(MSG_SUCCESS), None) => PeerOutcome::Success(self.data.unwrap_or(Value::Null)),
            (Some(MSG_NOT_AVAILABLE), _) => PeerOutcome::NotAvailable(reason),
            (_, Some(ERR_NO_SUCH_DATA_PATH)) => PeerOutcome::NoSuchDataPath(reason),
            _ => PeerOutcome::Malformed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reply_wire_shapes() {
        assert_eq!(
            serde_json::to_value(PeerReply::success(json!([1, 2]))).unwrap(),
            json!({"message": "success", "data": [1, 2]})
        );
        assert_eq!(
            serde_json::to_value(PeerReply::not_available(Some("task-b"))).unwrap(),
            json!({"message": "not available", "reason": "Current taskId is task-b"})
        );
        assert_eq!(
            serde_json::to_value(PeerReply::no_such_data_path("a.b")).unwrap(),
            json!({"error": "no such data path", "reason": "a.b does not exist in data"})
        );
    }

    #[test]
    fn test_outcome() {
        assert_eq!(PeerReply::success(json!(1)).outcome(), PeerOutcome::Success(json!(1)));
        assert!(matches!(PeerReply::not_available(None).outcome(), PeerOutcome::NotAvailable(_)));
        assert!(matches!(PeerReply::no_such_data_path("x").outcome(), PeerOutcome::NoSuchDataPath(_)));
    }

    #[test]
    fn test_discovery_port_as_string_or_number() {
        let a: Discovery = serde_json::from_value(json!({"host": "h", "port": "19020"})).unwrap();
        let b: Discovery = serde_json::from_value(json!({"host": "h", "port": 19020})).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.address(), "h:19020");
    }
}
