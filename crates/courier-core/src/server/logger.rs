//! Connection-scoped server log lines.

use tracing::{error, info, warn};
use uuid::Uuid;

/// Emits log events tagged with the server name, the connection id and the
/// authenticated principal.
#[derive(Debug, Clone)]
pub struct ServerLogger {
    server: String,
}

impl ServerLogger {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
        }
    }

    pub fn info(&self, conn_id: Uuid, principal: Option<&str>, message: &str) {
        info!(
            server = %self.server,
            conn_id = %conn_id,
            principal = principal.unwrap_or("-"),
            "{}",
            message
        );
    }

    pub fn warn(&self, conn_id: Uuid, principal: Option<&str>, message: &str) {
        warn!(
            server = %self.server,
            conn_id = %conn_id,
            principal = principal.unwrap_or("-"),
            "{}",
            message
        );
    }

    pub fn error(&self, conn_id: Uuid, principal: Option<&str>, message: &str) {
        error!(
            server = %self.server,
            conn_id = %conn_id,
            principal = principal.unwrap_or("-"),
            "{}",
            message
        );
    }
}

impl Default for ServerLogger {
    fn default() -> Self {
        Self::new("courier")
    }
}
