//! The message envelope exchanged between clients and the broker.
//!
//! A `Message` is immutable once built. The `with_*` methods return modified
//! copies, and the payload is held in `Bytes` so copies made during
//! publish fan-out share the underlying buffer.

use crate::{CourierError, Result};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Kind of envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Request,
    Response,
    Subscribe,
    Unsubscribe,
    Publish,
    Offer,
    Poll,
    CreateQueue,
    CreateTempQueue,
    RemoveQueue,
    StatusQueue,
    ClientConfig,
    DiffieHellmanKeyRequest,
    Authentication,
    Heartbeat,
    Test,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Request => "REQUEST",
            MessageType::Response => "RESPONSE",
            MessageType::Subscribe => "SUBSCRIBE",
            MessageType::Unsubscribe => "UNSUBSCRIBE",
            MessageType::Publish => "PUBLISH",
            MessageType::Offer => "OFFER",
            MessageType::Poll => "POLL",
            MessageType::CreateQueue => "CREATE_QUEUE",
            MessageType::CreateTempQueue => "CREATE_TEMP_QUEUE",
            MessageType::RemoveQueue => "REMOVE_QUEUE",
            MessageType::StatusQueue => "STATUS_QUEUE",
            MessageType::ClientConfig => "CLIENT_CONFIG",
            MessageType::DiffieHellmanKeyRequest => "DIFFIE_HELLMAN_KEY_REQUEST",
            MessageType::Authentication => "AUTHENTICATION",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::Test => "TEST",
        }
    }

    /// Types a client may send before it has authenticated.
    pub fn allowed_before_authentication(&self) -> bool {
        matches!(
            self,
            MessageType::ClientConfig
                | MessageType::DiffieHellmanKeyRequest
                | MessageType::Authentication
        )
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome carried by a response. `Null` on anything that is not a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    #[default]
    Null,
    Ok,
    BadRequest,
    NoPermission,
    HandlerError,
    QueueFull,
    QueueEmpty,
    QueueNotFound,
    QueueAccessInterrupted,
    DiffieHellmanAck,
    DiffieHellmanNak,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Null => "NULL",
            ResponseStatus::Ok => "OK",
            ResponseStatus::BadRequest => "BAD_REQUEST",
            ResponseStatus::NoPermission => "NO_PERMISSION",
            ResponseStatus::HandlerError => "HANDLER_ERROR",
            ResponseStatus::QueueFull => "QUEUE_FULL",
            ResponseStatus::QueueEmpty => "QUEUE_EMPTY",
            ResponseStatus::QueueNotFound => "QUEUE_NOT_FOUND",
            ResponseStatus::QueueAccessInterrupted => "QUEUE_ACCESS_INTERRUPTED",
            ResponseStatus::DiffieHellmanAck => "DIFFIE_HELLMAN_ACK",
            ResponseStatus::DiffieHellmanNak => "DIFFIE_HELLMAN_NAK",
        }
    }
}

impl std::fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered set of topic names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topics(Vec<String>);

impl Topics {
    pub const MAX_TOPIC_LEN: usize = 255;

    pub fn of(topic: impl Into<String>) -> Self {
        Topics(vec![topic.into()])
    }

    pub fn first(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.0.iter().any(|t| t == topic)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check a single topic name: non-blank, bounded length, no whitespace.
    pub fn validate_name(topic: &str) -> Result<()> {
        if topic.is_empty() {
            return Err(CourierError::validation("topic", "topic name must not be empty"));
        }
        if topic.len() > Self::MAX_TOPIC_LEN {
            return Err(CourierError::validation(
                "topic",
                format!("topic name exceeds {} characters", Self::MAX_TOPIC_LEN),
            ));
        }
        if topic.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(CourierError::validation(
                "topic",
                format!("topic name '{}' contains whitespace", topic),
            ));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(CourierError::validation("topics", "at least one topic is required"));
        }
        self.0.iter().try_for_each(|t| Self::validate_name(t))
    }
}

impl<S: Into<String>> FromIterator<S> for Topics {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut topics: Vec<String> = Vec::new();
        for topic in iter {
            let topic = topic.into();
            if !topics.contains(&topic) {
                topics.push(topic);
            }
        }
        Topics(topics)
    }
}

/// An immutable message envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub(crate) id: Uuid,
    pub(crate) request_id: Option<Uuid>,
    pub(crate) msg_type: MessageType,
    pub(crate) response_status: ResponseStatus,
    pub(crate) oneway: bool,
    pub(crate) transient: bool,
    pub(crate) subscription_reply: bool,
    pub(crate) timestamp: i64,
    pub(crate) expires_at: i64,
    pub(crate) timeout: i64,
    pub(crate) topics: Topics,
    pub(crate) mimetype: String,
    pub(crate) charset: Option<String>,
    pub(crate) data: Bytes,
}

impl Message {
    /// `expires_at` value of a message that never expires.
    pub const EXPIRES_NEVER: i64 = -1;
    /// `timeout` value meaning "do not wait".
    pub const NO_TIMEOUT: i64 = -1;

    pub const MIMETYPE_TEXT: &'static str = "text/plain";
    pub const MIMETYPE_JSON: &'static str = "application/json";
    pub const MIMETYPE_BINARY: &'static str = "application/octet-stream";
    pub const CHARSET_UTF8: &'static str = "UTF-8";

    pub fn new(
        msg_type: MessageType,
        topics: Topics,
        mimetype: impl Into<String>,
        charset: Option<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_id: None,
            msg_type,
            response_status: ResponseStatus::Null,
            oneway: false,
            transient: false,
            subscription_reply: false,
            timestamp: Utc::now().timestamp_millis(),
            expires_at: Self::EXPIRES_NEVER,
            timeout: Self::NO_TIMEOUT,
            topics,
            mimetype: mimetype.into(),
            charset,
            data: data.into(),
        }
    }

    /// A plain-text request on `topic`.
    pub fn text(topic: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(
            MessageType::Request,
            Topics::of(topic),
            Self::MIMETYPE_TEXT,
            Some(Self::CHARSET_UTF8.to_string()),
            Bytes::from(text.into()),
        )
    }

    /// A JSON request on `topic`.
    pub fn json(topic: impl Into<String>, value: &serde_json::Value) -> Self {
        Self::new(
            MessageType::Request,
            Topics::of(topic),
            Self::MIMETYPE_JSON,
            Some(Self::CHARSET_UTF8.to_string()),
            Bytes::from(value.to_string()),
        )
    }

    /// A binary request on `topic`.
    pub fn binary(
        topic: impl Into<String>,
        mimetype: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self::new(MessageType::Request, Topics::of(topic), mimetype, None, data)
    }

    /// A control-plane message whose payload is a JSON object.
    pub(crate) fn control(msg_type: MessageType, topic: &str, payload: &serde_json::Value) -> Self {
        Self::json(topic, payload).with_type(msg_type)
    }

    /// A response answering `request`.
    pub fn response_to(
        request: &Message,
        status: ResponseStatus,
        mimetype: impl Into<String>,
        charset: Option<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        let mut response = Self::new(
            MessageType::Response,
            request.topics.clone(),
            mimetype,
            charset,
            data,
        );
        response.request_id = Some(request.id);
        response.response_status = status;
        response
    }

    /// A response answering `request` with a text payload.
    pub fn text_response(
        request: &Message,
        status: ResponseStatus,
        text: impl Into<String>,
    ) -> Self {
        Self::response_to(
            request,
            status,
            Self::MIMETYPE_TEXT,
            Some(Self::CHARSET_UTF8.to_string()),
            Bytes::from(text.into()),
        )
    }

    /// A response answering `request` with a JSON payload.
    pub fn json_response(
        request: &Message,
        status: ResponseStatus,
        value: &serde_json::Value,
    ) -> Self {
        Self::response_to(
            request,
            status,
            Self::MIMETYPE_JSON,
            Some(Self::CHARSET_UTF8.to_string()),
            Bytes::from(value.to_string()),
        )
    }

    // Accessors

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn request_id(&self) -> Option<Uuid> {
        self.request_id
    }

    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    pub fn response_status(&self) -> ResponseStatus {
        self.response_status
    }

    pub fn is_oneway(&self) -> bool {
        self.oneway
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }

    pub fn is_subscription_reply(&self) -> bool {
        self.subscription_reply
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    /// Caller-supplied wait budget in milliseconds, `NO_TIMEOUT` if absent.
    pub fn timeout(&self) -> i64 {
        self.timeout
    }

    pub fn timeout_duration(&self) -> Option<Duration> {
        u64::try_from(self.timeout).ok().map(Duration::from_millis)
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// The first topic, used as queue name for point-to-point traffic.
    pub fn topic(&self) -> &str {
        self.topics.first().unwrap_or_default()
    }

    pub fn mimetype(&self) -> &str {
        &self.mimetype
    }

    pub fn charset(&self) -> Option<&str> {
        self.charset.as_deref()
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// The payload as UTF-8 text.
    pub fn as_text(&self) -> Result<&str> {
        std::str::from_utf8(&self.data)
            .map_err(|e| CourierError::invalid_message(format!("payload is not UTF-8: {}", e)))
    }

    /// The payload parsed as JSON.
    pub fn as_json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.data)?)
    }

    pub fn is_ok(&self) -> bool {
        self.response_status == ResponseStatus::Ok
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now().timestamp_millis())
    }

    pub fn is_expired_at(&self, now_millis: i64) -> bool {
        self.expires_at != Self::EXPIRES_NEVER && self.expires_at <= now_millis
    }

    // Copies

    pub fn with_type(&self, msg_type: MessageType) -> Self {
        Self {
            msg_type,
            ..self.clone()
        }
    }

    pub fn with_oneway(&self, oneway: bool) -> Self {
        Self {
            oneway,
            ..self.clone()
        }
    }

    pub fn with_transient(&self, transient: bool) -> Self {
        Self {
            transient,
            ..self.clone()
        }
    }

    pub fn with_subscription_reply(&self, subscription_reply: bool) -> Self {
        Self {
            subscription_reply,
            ..self.clone()
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout: i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX),
            ..self.clone()
        }
    }

    pub fn with_no_timeout(&self) -> Self {
        Self {
            timeout: Self::NO_TIMEOUT,
            ..self.clone()
        }
    }

    /// Copy that expires `ttl` from now.
    pub fn with_ttl(&self, ttl: Duration) -> Self {
        let ttl_millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        Self {
            expires_at: Utc::now().timestamp_millis().saturating_add(ttl_millis),
            ..self.clone()
        }
    }

    pub fn with_expires_at(&self, expires_at: i64) -> Self {
        Self {
            expires_at,
            ..self.clone()
        }
    }

    pub fn with_topics(&self, topics: Topics) -> Self {
        Self {
            topics,
            ..self.clone()
        }
    }

    /// Copy with a fresh id, keeping type, flags, topics and payload.
    pub fn with_new_id(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            ..self.clone()
        }
    }

    /// Basic structural checks applied before a message is sent.
    pub fn validate(&self) -> Result<()> {
        self.topics.validate()?;
        if self.msg_type == MessageType::Response && self.request_id.is_none() {
            return Err(CourierError::invalid_message(
                "a response must carry the id of the request it answers",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_message_defaults() {
        let msg = Message::text("hello", "world");
        assert_eq!(msg.msg_type(), MessageType::Request);
        assert_eq!(msg.response_status(), ResponseStatus::Null);
        assert_eq!(msg.topic(), "hello");
        assert_eq!(msg.as_text().unwrap(), "world");
        assert_eq!(msg.timeout(), Message::NO_TIMEOUT);
        assert!(!msg.is_oneway());
        assert!(!msg.is_expired());
    }

    #[test]
    fn test_with_copies_keep_original_untouched() {
        let msg = Message::text("t", "x");
        let oneway = msg.with_oneway(true);
        assert!(oneway.is_oneway());
        assert!(!msg.is_oneway());
        assert_eq!(oneway.id(), msg.id());
        assert_ne!(msg.with_new_id().id(), msg.id());
    }

    #[test]
    fn test_response_carries_request_id() {
        let request = Message::text("echo", "ping");
        let response = Message::text_response(&request, ResponseStatus::Ok, "pong");
        assert_eq!(response.msg_type(), MessageType::Response);
        assert_eq!(response.request_id(), Some(request.id()));
        assert!(response.is_ok());
        assert!(response.validate().is_ok());
    }

    #[test]
    fn test_expiry() {
        let msg = Message::text("t", "x").with_expires_at(1_000);
        assert!(msg.is_expired_at(1_000));
        assert!(!msg.is_expired_at(999));
        assert!(msg.is_expired());

        let fresh = Message::text("t", "x").with_ttl(Duration::from_secs(60));
        assert!(!fresh.is_expired());
    }

    #[test]
    fn test_topics_dedupe_and_validation() {
        let topics: Topics = ["a", "b", "a"].into_iter().collect();
        assert_eq!(topics.len(), 2);
        assert!(topics.contains("b"));
        assert!(topics.validate().is_ok());

        assert!(Topics::validate_name("").is_err());
        assert!(Topics::validate_name("has space").is_err());
        assert!(Topics::validate_name(&"x".repeat(300)).is_err());
        assert!(Topics::default().validate().is_err());
    }

    #[test]
    fn test_timeout_duration() {
        let msg = Message::text("t", "x").with_timeout(Duration::from_millis(250));
        assert_eq!(msg.timeout(), 250);
        assert_eq!(msg.timeout_duration(), Some(Duration::from_millis(250)));
        assert_eq!(msg.with_no_timeout().timeout_duration(), None);
    }

    #[test]
    fn test_type_serialization_names() {
        let json = serde_json::to_string(&MessageType::DiffieHellmanKeyRequest).unwrap();
        assert_eq!(json, "\"DIFFIE_HELLMAN_KEY_REQUEST\"");
        let json = serde_json::to_string(&ResponseStatus::QueueAccessInterrupted).unwrap();
        assert_eq!(json, "\"QUEUE_ACCESS_INTERRUPTED\"");
        assert!(MessageType::Authentication.allowed_before_authentication());
        assert!(!MessageType::Publish.allowed_before_authentication());
    }
}
