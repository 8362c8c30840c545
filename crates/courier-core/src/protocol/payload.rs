//! JSON payloads of the control-plane messages.
//!
//! Key names are part of the wire contract and must not change.

use crate::config::AckMode;
use serde::{Deserialize, Serialize};

/// Client half of the `CLIENT_CONFIG` exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientConfigRequest {
    #[serde(rename = "ackMode", default)]
    pub ack_mode: AckMode,
}

/// Server half of the `CLIENT_CONFIG` exchange: the negotiated session settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfigResponse {
    #[serde(rename = "max-msg-size")]
    pub max_message_size: usize,
    #[serde(rename = "compress-cutoff-size")]
    pub compress_cutoff_size: i64,
    #[serde(rename = "permit-client-queue-mgmt")]
    pub permit_client_queue_mgmt: bool,
    pub encrypt: bool,
    #[serde(rename = "heartbeat-interval")]
    pub heartbeat_interval_secs: u64,
    pub authentication: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateQueueRequest {
    pub name: String,
    pub capacity: usize,
    #[serde(default = "default_true")]
    pub bounded: bool,
    #[serde(default)]
    pub durable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTempQueueRequest {
    pub capacity: usize,
    #[serde(default = "default_true")]
    pub bounded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTempQueueResponse {
    pub name: String,
}

/// Payload of `REMOVE_QUEUE` and `STATUS_QUEUE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueNameRequest {
    pub name: String,
}

/// Reply to `STATUS_QUEUE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub name: String,
    pub exists: bool,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub queue_type: Option<String>,
    #[serde(default)]
    pub bounded: bool,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub temporary: bool,
    #[serde(default)]
    pub capacity: usize,
    #[serde(default)]
    pub size: usize,
}

impl QueueStatus {
    pub fn missing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exists: false,
            queue_type: None,
            bounded: false,
            durable: false,
            temporary: false,
            capacity: 0,
            size: 0,
        }
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_response_key_names() {
        let response = ClientConfigResponse {
            max_message_size: 1024,
            compress_cutoff_size: -1,
            permit_client_queue_mgmt: true,
            encrypt: true,
            heartbeat_interval_secs: 5,
            authentication: false,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["max-msg-size"], 1024);
        assert_eq!(json["compress-cutoff-size"], -1);
        assert_eq!(json["permit-client-queue-mgmt"], true);
        assert_eq!(json["encrypt"], true);
        assert_eq!(json["heartbeat-interval"], 5);
        assert_eq!(json["authentication"], false);
    }

    #[test]
    fn test_create_queue_defaults() {
        let request: CreateQueueRequest =
            serde_json::from_str(r#"{"name": "orders", "capacity": 10}"#).unwrap();
        assert!(request.bounded);
        assert!(!request.durable);
    }

    #[test]
    fn test_missing_queue_status_omits_type() {
        let json = serde_json::to_value(QueueStatus::missing("gone")).unwrap();
        assert_eq!(json["exists"], false);
        assert!(json.get("type").is_none());
    }

    #[test]
    fn test_ack_mode_key() {
        let json = serde_json::to_value(ClientConfigRequest::default()).unwrap();
        assert_eq!(json["ackMode"], "NO_ACK");
    }
}
