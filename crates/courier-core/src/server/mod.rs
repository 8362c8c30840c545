//! Broker server.
//!
//! Binds a TCP or Unix socket, accepts client connections and serves each
//! one as a [`ServerConnection`] on its own tasks. Plain `REQUEST` traffic
//! outside the reserved status topics is answered by the application's
//! [`RequestHandler`].
//!
//! # Thread Safety
//!
//! All connections share one [`ServerContext`]. Its queue map is mutated only
//! through `ServerQueueManager::with_queues`, statistics are atomic and the
//! subscription registry is a concurrent map.

pub mod auth;
pub mod connection;
pub mod context;
pub mod logger;
pub mod status;

pub use auth::Authenticator;
pub use connection::ServerConnection;
pub use context::{ErrorBuffer, ErrorEntry, ServerContext, ServerStatistics, StatisticsSnapshot};
pub use logger::ServerLogger;

use crate::config::{Endpoint, ServerConfig};
use crate::message::Message;
use crate::protocol::Compressor;
use crate::queue::{ServerQueueManager, WalQueueManager};
use crate::subscription::{PublishReport, Subscriptions};
use crate::transport::Listener;
use crate::Result;
use chrono::Utc;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};

/// Application callback for plain `REQUEST` messages.
///
/// The returned message becomes the response payload. A returned error, or
/// a panic, is answered with `HANDLER_ERROR` and recorded in the server's
/// error buffer.
#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Message) -> Result<Message>;
}

#[async_trait::async_trait]
impl<F> RequestHandler for F
where
    F: Fn(Message) -> Result<Message> + Send + Sync + 'static,
{
    async fn handle(&self, request: Message) -> Result<Message> {
        (self)(request)
    }
}

/// Handle to a running server. Dropping shuts the server down.
pub struct ServerHandle {
    endpoint: Endpoint,
    context: Arc<ServerContext>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    /// The endpoint clients connect to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.endpoint {
            Endpoint::Tcp(addr) => Some(*addr),
            #[cfg(unix)]
            Endpoint::Unix(_) => None,
        }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.context.statistics.snapshot()
    }

    pub fn queues(&self) -> &ServerQueueManager {
        &self.context.queues
    }

    /// Currently open connections.
    pub fn connections(&self) -> Vec<Arc<ServerConnection>> {
        self.context
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn status(&self) -> serde_json::Value {
        status::server_status(&self.context)
    }

    /// Publish from the server side to every subscriber of the message topic.
    pub fn publish(&self, msg: &Message) -> PublishReport {
        let report = self.context.subscriptions.publish(msg);
        self.context
            .statistics
            .published(report.delivered, report.dropped);
        report
    }

    /// Pop the oldest buffered request failure.
    pub fn next_error(&self) -> Option<ErrorEntry> {
        self.context.errors.pop()
    }

    /// Stop accepting connections, close every session and compact the
    /// durable queue logs.
    pub fn shutdown(&mut self) {
        let Some(tx) = self.shutdown_tx.take() else {
            return;
        };
        // Signal accept loop to stop
        let _ = tx.send(());
        // Signal all connection handlers to close
        let _ = self.conn_shutdown_tx.send(true);
        self.context.queues.shutdown();
    }

    /// Shut down and wait for the accept loop to exit.
    pub async fn stop(mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Server builder.
pub struct Server {
    config: ServerConfig,
    authenticator: Authenticator,
    logger: ServerLogger,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            authenticator: Authenticator::none(),
            logger: ServerLogger::default(),
        }
    }

    /// Require clients to authenticate against `authenticator`. An
    /// authenticator without users leaves authentication off.
    pub fn with_authenticator(mut self, authenticator: Authenticator) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn with_logger(mut self, logger: ServerLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Recover durable queues, bind the endpoint and start accepting
    /// connections in background tasks.
    pub async fn start<H: RequestHandler>(self, handler: H) -> Result<ServerHandle> {
        let wal = match &self.config.wal_dir {
            Some(dir) => WalQueueManager::open(dir)?,
            None => WalQueueManager::disabled(),
        };
        let queues = ServerQueueManager::new(wal);
        let recovered = queues.recover()?;
        if recovered > 0 {
            info!("Recovered {} durable queue(s)", recovered);
        }

        let (listener, socket_buffers) = Listener::bind(&self.config.endpoint).await?;
        let endpoint = listener.local_endpoint()?;
        info!(
            encrypt = self.config.encrypt,
            authentication = self.authenticator.is_active(),
            wal = self.config.wal_enabled(),
            "Courier server listening on {}",
            endpoint
        );

        let context = Arc::new(ServerContext {
            compressor: Compressor::new(self.config.compress_cutoff_size),
            config: self.config,
            endpoint: endpoint.clone(),
            started_at: Utc::now(),
            authenticator: self.authenticator,
            logger: self.logger,
            handler: Arc::new(handler),
            subscriptions: Subscriptions::new(),
            statistics: ServerStatistics::default(),
            queues,
            errors: ErrorBuffer::default(),
            socket_buffers,
            connections: DashMap::new(),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let task_handle = tokio::spawn(accept_loop(
            listener,
            context.clone(),
            shutdown_rx,
            conn_shutdown_rx,
        ));

        Ok(ServerHandle {
            endpoint,
            context,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }
}

async fn accept_loop(
    listener: Listener,
    context: Arc<ServerContext>,
    mut shutdown_rx: oneshot::Receiver<()>,
    conn_shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                info!("Courier server shutting down");
                break;
            }
            accept_result = listener.accept() => {
                match accept_result {
                    Ok(transport) => {
                        let max = context.config.max_connections;
                        if context.statistics.active_connections() >= max {
                            warn!(
                                "Rejecting connection from {}: at max capacity ({})",
                                transport.peer, max
                            );
                            context.statistics.connection_rejected();
                            continue;
                        }
                        context.statistics.connection_opened();
                        tokio::spawn(connection::serve(
                            context.clone(),
                            transport,
                            conn_shutdown_rx.clone(),
                        ));
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
        }
    }
    listener.cleanup();
}
