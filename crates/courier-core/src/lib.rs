//! Courier Core - a socket message broker library.
//!
//! One broker process serves request/response calls, topic
//! publish/subscribe and named point-to-point queues over TCP or Unix
//! sockets. Sessions can be encrypted with an in-band Diffie-Hellman key
//! exchange, payloads can be compressed, clients can be required to
//! authenticate, and durable queues survive restarts through a write-ahead
//! log.
//!
//! # Example
//!
//! ```rust,ignore
//! use courier_core::{ClientConfig, ClientConnection, Message, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> courier_core::Result<()> {
//!     let server = Server::new(ServerConfig::default())
//!         .start(|request: Message| -> courier_core::Result<Message> { Ok(request) })
//!         .await?;
//!
//!     let client = ClientConnection::connect(ClientConfig::new(server.endpoint().clone())).await?;
//!     let reply = client
//!         .request(&Message::text("echo", "hello"), std::time::Duration::from_secs(2))
//!         .await?;
//!     println!("{}", reply.as_text()?);
//!
//!     client.close().await;
//!     server.stop().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod subscription;
pub mod transport;

// Re-export commonly used types
pub use client::{ClientConnection, ClientStatistics};
pub use config::{AckMode, ClientConfig, Endpoint, IpcConfig, KeyDerivation, ServerConfig};
pub use error::{CourierError, Result};
pub use message::{Message, MessageType, ResponseStatus, Topics};
pub use protocol::payload::QueueStatus;
pub use queue::{MessageQueue, QueueType, ServerQueueManager, WalQueueManager};
pub use server::{
    Authenticator, ErrorEntry, RequestHandler, Server, ServerConnection, ServerHandle,
    ServerLogger, StatisticsSnapshot,
};
pub use subscription::{PublishReport, Publisher, Subscriptions};
