//! Centralized configuration for the courier broker.
//!
//! `IpcConfig` holds protocol constants and defaults. `ServerConfig` and
//! `ClientConfig` are the runtime settings each side starts from.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Protocol-level constants and defaults.
pub struct IpcConfig;

impl IpcConfig {
    pub const DEFAULT_PORT: u16 = 33333;
    pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 20 * 1024 * 1024; // 20MB
    /// Hard cap for any single frame part read from a socket.
    pub const MAX_FRAME_PART_SIZE: usize = 200 * 1024 * 1024;
    /// Compression disabled.
    pub const COMPRESS_CUTOFF_OFF: i64 = -1;
    pub const DEFAULT_MAX_CONNECTIONS: usize = 20;
    pub const DEFAULT_MAX_TEMP_QUEUES_PER_CONNECTION: usize = 50;
    pub const DEFAULT_PUBLISH_QUEUE_CAPACITY: usize = 50;
    pub const ERROR_BUFFER_CAPACITY: usize = 100;

    // Client side
    pub const RECEIVE_QUEUE_CAPACITY: usize = 100;
    pub const LISTENER_POLL_SLICE: Duration = Duration::from_millis(80);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
    pub const HEARTBEAT_SEND_TIMEOUT: Duration = Duration::from_secs(5);
    pub const GRACEFUL_CLOSE_WAIT: Duration = Duration::from_millis(500);
    /// Budget for convenience calls that do not take an explicit timeout.
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    /// Extra time granted to queue calls on top of the server-side wait.
    pub const QUEUE_RESPONSE_GRACE: Duration = Duration::from_secs(2);

    // Server side
    /// Encoded frames waiting for the connection writer.
    pub const WRITER_QUEUE_CAPACITY: usize = 64;
    pub const LISTEN_BACKLOG: u32 = 1024;

    // Key derivation for the AES session cipher
    pub const DEFAULT_KEY_SALT: &'static [u8] = b"courier-ipc-session-key-v1";
    pub const DEFAULT_KEY_ITERATIONS: u32 = 3_000;
}

/// Where a server listens or a client connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix(PathBuf),
}

impl Endpoint {
    pub fn localhost(port: u16) -> Self {
        Endpoint::Tcp(SocketAddr::from(([127, 0, 0, 1], port)))
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::localhost(IpcConfig::DEFAULT_PORT)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            #[cfg(unix)]
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Key derivation parameters used to turn a Diffie-Hellman shared secret
/// into an AES-256 key. Both peers must agree on them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDerivation {
    pub salt: Vec<u8>,
    pub iterations: u32,
}

impl Default for KeyDerivation {
    fn default() -> Self {
        Self {
            salt: IpcConfig::DEFAULT_KEY_SALT.to_vec(),
            iterations: IpcConfig::DEFAULT_KEY_ITERATIONS,
        }
    }
}

/// Runtime configuration of a broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ServerConfig {
    pub endpoint: Endpoint,
    pub max_connections: usize,
    /// Maximum payload size of a single message.
    pub max_message_size: usize,
    /// Payloads at least this large are compressed; -1 disables compression.
    pub compress_cutoff_size: i64,
    /// Clients must perform the key exchange before anything else.
    pub encrypt: bool,
    /// Clients may create and remove standard queues.
    pub permit_client_queue_mgmt: bool,
    /// Heartbeat interval announced to clients; 0 disables heartbeats.
    pub heartbeat_interval_secs: u64,
    pub max_temp_queues_per_connection: usize,
    pub publish_queue_capacity: usize,
    /// Directory for queue write-ahead logs. `None` disables durability.
    pub wal_dir: Option<PathBuf>,
    pub key_derivation: KeyDerivation,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            max_connections: IpcConfig::DEFAULT_MAX_CONNECTIONS,
            max_message_size: IpcConfig::DEFAULT_MAX_MESSAGE_SIZE,
            compress_cutoff_size: IpcConfig::COMPRESS_CUTOFF_OFF,
            encrypt: false,
            permit_client_queue_mgmt: true,
            heartbeat_interval_secs: 0,
            max_temp_queues_per_connection: IpcConfig::DEFAULT_MAX_TEMP_QUEUES_PER_CONNECTION,
            publish_queue_capacity: IpcConfig::DEFAULT_PUBLISH_QUEUE_CAPACITY,
            wal_dir: None,
            key_derivation: KeyDerivation::default(),
        }
    }
}

impl ServerConfig {
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn wal_enabled(&self) -> bool {
        self.wal_dir.is_some()
    }
}

/// Acknowledge mode requested by a client during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckMode {
    #[default]
    NoAck,
    ClientAck,
}

/// Runtime configuration of a client connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: Endpoint,
    pub ack_mode: AckMode,
    /// Request an encrypted session even if the server does not mandate one.
    pub encrypt: bool,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Outbound compression cutoff. `None` uses the value the server announces.
    pub compress_cutoff_size: Option<i64>,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub key_derivation: KeyDerivation,
}

impl ClientConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            ack_mode: AckMode::default(),
            encrypt: false,
            user: None,
            password: None,
            compress_cutoff_size: None,
            connect_timeout: IpcConfig::CONNECT_TIMEOUT,
            handshake_timeout: IpcConfig::HANDSHAKE_TIMEOUT,
            key_derivation: KeyDerivation::default(),
        }
    }

    pub fn with_encryption(mut self, encrypt: bool) -> Self {
        self.encrypt = encrypt;
        self
    }

    pub fn with_credentials(
        mut self,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_compress_cutoff(mut self, cutoff_size: i64) -> Self {
        self.compress_cutoff_size = Some(cutoff_size);
        self
    }

    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    pub(crate) fn has_credentials(&self) -> bool {
        self.user.is_some() || self.password.is_some()
    }
}
