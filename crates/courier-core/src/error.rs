//! Error types for the courier broker.
//!
//! Errors fall into three groups: connection-fatal (transport, handshake,
//! key exchange, authentication), request-level (timeouts, queue outcomes,
//! bad or oversized requests) and handler errors raised by application code.
//! Request-level errors leave the connection usable.

use crate::message::ResponseStatus;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the courier library.
#[derive(Debug, Error)]
pub enum CourierError {
    // Transport errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Failed to connect to {endpoint}: {message}")]
    ConnectionFailed { endpoint: String, message: String },

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("End of stream: peer closed the connection")]
    EndOfStream,

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    // Session setup errors
    #[error("Handshake failed: {message}")]
    Handshake { message: String },

    #[error("Diffie-Hellman key exchange failed: {message}")]
    KeyExchange { message: String },

    #[error("Authentication failed: bad credentials")]
    BadCredentials,

    // Frame and payload errors
    #[error("Message size {size} exceeds maximum {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Invalid message: {message}")]
    InvalidMessage { message: String },

    #[error("Encryption error: {message}")]
    Encryption { message: String },

    #[error("Compression error: {message}")]
    Compression { message: String },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Queue errors
    #[error("Queue {name} is full")]
    QueueFull { name: String },

    #[error("Queue {name} is empty")]
    QueueEmpty { name: String },

    #[error("Queue not found: {name}")]
    QueueNotFound { name: String },

    #[error("Access to queue {name} was interrupted")]
    QueueAccessInterrupted { name: String },

    // Request outcome errors
    #[error("No permission: {message}")]
    NoPermission { message: String },

    #[error("Handler error: {message}")]
    Handler { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for courier operations.
pub type Result<T> = std::result::Result<T, CourierError>;

impl From<std::io::Error> for CourierError {
    fn from(err: std::io::Error) -> Self {
        CourierError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for CourierError {
    fn from(err: serde_json::Error) -> Self {
        CourierError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl CourierError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        CourierError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    pub fn invalid_message(message: impl Into<String>) -> Self {
        CourierError::InvalidMessage {
            message: message.into(),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        CourierError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Map an error raised while serving a request to the response status
    /// sent back to the client.
    pub fn to_response_status(&self) -> ResponseStatus {
        match self {
            CourierError::QueueFull { .. } => ResponseStatus::QueueFull,
            CourierError::QueueEmpty { .. } => ResponseStatus::QueueEmpty,
            CourierError::QueueNotFound { .. } => ResponseStatus::QueueNotFound,
            CourierError::QueueAccessInterrupted { .. } => ResponseStatus::QueueAccessInterrupted,

            CourierError::NoPermission { .. } | CourierError::BadCredentials => {
                ResponseStatus::NoPermission
            }

            CourierError::Validation { .. }
            | CourierError::InvalidMessage { .. }
            | CourierError::MessageTooLarge { .. }
            | CourierError::Json { .. } => ResponseStatus::BadRequest,

            CourierError::KeyExchange { .. } => ResponseStatus::DiffieHellmanNak,

            // All other errors surface as handler errors
            _ => ResponseStatus::HandlerError,
        }
    }

    /// True if the connection cannot be used after this error.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            CourierError::Io { .. }
                | CourierError::ConnectionFailed { .. }
                | CourierError::ConnectionClosed
                | CourierError::EndOfStream
                | CourierError::Handshake { .. }
                | CourierError::KeyExchange { .. }
                | CourierError::BadCredentials
                | CourierError::Encryption { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CourierError::QueueNotFound {
            name: "orders".into(),
        };
        assert_eq!(err.to_string(), "Queue not found: orders");
    }

    #[test]
    fn test_response_status_mapping() {
        assert_eq!(
            CourierError::QueueFull { name: "q".into() }.to_response_status(),
            ResponseStatus::QueueFull
        );
        assert_eq!(
            CourierError::validation("name", "blank").to_response_status(),
            ResponseStatus::BadRequest
        );
        assert_eq!(
            CourierError::Other("boom".into()).to_response_status(),
            ResponseStatus::HandlerError
        );
    }

    #[test]
    fn test_connection_fatal_errors() {
        assert!(CourierError::EndOfStream.is_connection_fatal());
        assert!(CourierError::BadCredentials.is_connection_fatal());
        assert!(!CourierError::Timeout(Duration::from_millis(10)).is_connection_fatal());
        assert!(!CourierError::QueueEmpty { name: "q".into() }.is_connection_fatal());
    }
}
