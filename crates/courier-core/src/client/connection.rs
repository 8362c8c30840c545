//! Client side of one broker session.
//!
//! # Handshake
//!
//! `connect` walks the session through its setup states before any task is
//! started: `CLIENT_CONFIG` negotiation, an optional Diffie-Hellman key
//! exchange and optional authentication. These exchanges read their replies
//! straight from the socket. Only after the session is set up does the
//! [`ChannelListener`] take over the read half.
//!
//! # Thread Safety
//!
//! `ClientConnection` is cheap to clone and safe to share between tasks. A
//! single-permit semaphore keeps at most one request in flight, and the write
//! half sits behind an async mutex so heartbeats never split a frame.

use super::listener::{ChannelListener, ListenerStatistics, SubscriptionHandler};
use crate::config::{ClientConfig, Endpoint, IpcConfig};
use crate::message::{Message, MessageType, ResponseStatus, Topics};
use crate::protocol::frame;
use crate::protocol::payload::{
    ClientConfigRequest, ClientConfigResponse, CreateQueueRequest, CreateTempQueueRequest,
    CreateTempQueueResponse, QueueNameRequest, QueueStatus,
};
use crate::protocol::{Compressor, DiffieHellmanKeys, Encryptor, Protocol};
use crate::server::status::{NEXT_ERROR_TOPIC, STATUS_TOPIC, THREAD_POOL_STATISTICS_TOPIC};
use crate::server::Authenticator;
use crate::subscription::PublishReport;
use crate::transport::{self, BoxedReader, BoxedWriter, Transport};
use crate::{CourierError, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Topic carried by control-plane messages.
const CONTROL_TOPIC: &str = "courier/control";

/// Client-side counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStatistics {
    pub sent: u64,
    pub received: u64,
    pub discarded_responses: u64,
    pub discarded_subscriptions: u64,
    pub subscription_deliveries: u64,
}

struct Inner {
    endpoint: Endpoint,
    settings: ClientConfigResponse,
    compressor: Compressor,
    encryptor: Encryptor,
    writer: tokio::sync::Mutex<BoxedWriter>,
    in_flight: Semaphore,
    listener: ChannelListener,
    open: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    sent: AtomicU64,
}

impl Inner {
    /// Mark the connection closed and signal the background tasks.
    /// Returns `false` if it was already closed.
    fn shutdown(&self) -> bool {
        if self
            .open
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.shutdown_tx.send_replace(true);
        true
    }

    fn ensure_open(&self) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(CourierError::ConnectionClosed);
        }
        if self.listener.is_eof() {
            return Err(CourierError::EndOfStream);
        }
        Ok(())
    }

    /// Encode `msg` and write it before `deadline`. A write that does not
    /// finish in time may have left a partial frame on the wire, so the
    /// connection is closed.
    async fn write(&self, msg: &Message, deadline: Instant, budget: Duration) -> Result<()> {
        let bytes = Protocol::encode(
            msg,
            &self.compressor,
            &self.encryptor,
            self.settings.max_message_size,
        )?;
        let mut writer = tokio::time::timeout_at(deadline, self.writer.lock())
            .await
            .map_err(|_| CourierError::Timeout(budget))?;
        match tokio::time::timeout_at(deadline, frame::write_frame(&mut *writer, &bytes)).await {
            Ok(Ok(())) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                debug!(
                    id = %msg.id(),
                    msg_type = %msg.msg_type(),
                    bytes = bytes.len(),
                    "sent message"
                );
                Ok(())
            }
            Ok(Err(e)) => {
                self.shutdown();
                Err(e)
            }
            Err(_) => {
                warn!("Write timed out mid-frame, closing connection");
                self.shutdown();
                Err(CourierError::Timeout(budget))
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown();
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

/// A connected, fully set up client session.
#[derive(Clone)]
pub struct ClientConnection {
    inner: Arc<Inner>,
}

impl ClientConnection {
    /// Open a session to `config.endpoint`.
    ///
    /// Fails if the socket cannot be opened, the handshake does not finish
    /// within `config.handshake_timeout`, the key exchange is refused or the
    /// credentials are rejected. Nothing is retried.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let Transport {
            mut reader,
            mut writer,
            peer,
        } = transport::connect(&config.endpoint, config.connect_timeout).await?;

        let handshake_timeout = config.handshake_timeout;
        let (settings, encryptor) = tokio::time::timeout(
            handshake_timeout,
            handshake(&config, &mut reader, &mut writer),
        )
        .await
        .map_err(|_| CourierError::Handshake {
            message: format!("timed out after {:?}", handshake_timeout),
        })??;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (listener, listener_task) =
            ChannelListener::start(reader, encryptor.clone(), shutdown_rx.clone());
        let compressor = Compressor::new(
            config
                .compress_cutoff_size
                .unwrap_or(settings.compress_cutoff_size),
        );
        let heartbeat_interval = settings.heartbeat_interval_secs;

        let inner = Arc::new(Inner {
            endpoint: config.endpoint,
            settings,
            compressor,
            encryptor,
            writer: tokio::sync::Mutex::new(writer),
            in_flight: Semaphore::new(1),
            listener,
            open: AtomicBool::new(true),
            shutdown_tx,
            tasks: Mutex::new(vec![listener_task]),
            sent: AtomicU64::new(0),
        });

        if heartbeat_interval > 0 {
            let task = tokio::spawn(heartbeat_loop(
                Arc::downgrade(&inner),
                Duration::from_secs(heartbeat_interval),
                shutdown_rx,
            ));
            inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(task);
        }

        info!(
            encrypted = inner.encryptor.is_active(),
            heartbeat_secs = heartbeat_interval,
            "Connected to {}",
            peer
        );
        Ok(Self { inner })
    }

    /// Send `msg` and wait for its response.
    ///
    /// The whole call, waiting for the in-flight slot included, is bounded
    /// by `timeout`. Oneway messages return `None` once written. A timeout
    /// leaves the connection usable; a late response is discarded by the
    /// next call.
    pub async fn send(&self, msg: &Message, timeout: Duration) -> Result<Option<Message>> {
        let deadline = Instant::now() + timeout;
        self.inner.ensure_open()?;
        msg.validate()?;

        let _permit = tokio::time::timeout_at(deadline, self.inner.in_flight.acquire())
            .await
            .map_err(|_| CourierError::Timeout(timeout))?
            .map_err(|_| CourierError::ConnectionClosed)?;

        self.inner.write(msg, deadline, timeout).await?;
        if msg.is_oneway() {
            return Ok(None);
        }
        let response = self
            .inner
            .listener
            .read_response(msg.id(), deadline, timeout)
            .await?;
        Ok(Some(response))
    }

    /// Run [`send`](Self::send) on its own task.
    pub fn send_async(
        &self,
        msg: Message,
        timeout: Duration,
    ) -> JoinHandle<Result<Option<Message>>> {
        let connection = self.clone();
        tokio::spawn(async move { connection.send(&msg, timeout).await })
    }

    /// Send a two-way request and turn a non-OK status into an error.
    pub async fn request(&self, msg: &Message, timeout: Duration) -> Result<Message> {
        let response = self
            .send(&msg.with_oneway(false), timeout)
            .await?
            .ok_or_else(|| CourierError::invalid_message("no response to a two-way request"))?;
        check_status(response)
    }

    /// Publish `msg` to every subscriber of its topic.
    pub async fn publish(&self, msg: &Message) -> Result<PublishReport> {
        msg.topics().validate()?;
        let response = self
            .request(&msg.with_type(MessageType::Publish), IpcConfig::DEFAULT_REQUEST_TIMEOUT)
            .await?;
        response.as_json()
    }

    /// Subscribe to `topic`. Deliveries are passed to `handler` on the
    /// listener task, so it should return quickly.
    pub async fn subscribe<F>(&self, topic: &str, handler: F) -> Result<()>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        Topics::validate_name(topic)?;
        let handler: SubscriptionHandler = Arc::new(handler);
        // Registered first so a publish racing the response is not lost.
        self.inner.listener.set_handler(topic, handler);
        let request = Message::text(topic, "").with_type(MessageType::Subscribe);
        if let Err(e) = self
            .request(&request, IpcConfig::DEFAULT_REQUEST_TIMEOUT)
            .await
        {
            self.inner.listener.remove_handler(topic);
            return Err(e);
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        Topics::validate_name(topic)?;
        let request = Message::text(topic, "").with_type(MessageType::Unsubscribe);
        let result = self
            .request(&request, IpcConfig::DEFAULT_REQUEST_TIMEOUT)
            .await;
        self.inner.listener.remove_handler(topic);
        result.map(|_| ())
    }

    /// Offer `msg` to `queue`, letting the server wait up to `wait` for room.
    pub async fn offer(&self, queue: &str, msg: &Message, wait: Duration) -> Result<()> {
        let request = msg
            .with_type(MessageType::Offer)
            .with_topics(Topics::of(queue))
            .with_timeout(wait);
        self.request(&request, wait + IpcConfig::QUEUE_RESPONSE_GRACE)
            .await
            .map(|_| ())
    }

    /// Take the next message from `queue`, letting the server wait up to
    /// `wait` for one to arrive.
    pub async fn poll(&self, queue: &str, wait: Duration) -> Result<Message> {
        let request = Message::text(queue, "")
            .with_type(MessageType::Poll)
            .with_timeout(wait);
        self.request(&request, wait + IpcConfig::QUEUE_RESPONSE_GRACE)
            .await
    }

    pub async fn create_queue(
        &self,
        name: &str,
        capacity: usize,
        bounded: bool,
        durable: bool,
    ) -> Result<QueueStatus> {
        let payload = serde_json::to_value(CreateQueueRequest {
            name: name.to_string(),
            capacity,
            bounded,
            durable,
        })?;
        self.control(MessageType::CreateQueue, &payload)
            .await?
            .as_json()
    }

    /// Create a queue owned by this connection. It is removed when the
    /// connection closes. Returns the generated queue name.
    pub async fn create_temporary_queue(&self, capacity: usize, bounded: bool) -> Result<String> {
        let payload = serde_json::to_value(CreateTempQueueRequest { capacity, bounded })?;
        let response: CreateTempQueueResponse = self
            .control(MessageType::CreateTempQueue, &payload)
            .await?
            .as_json()?;
        Ok(response.name)
    }

    pub async fn remove_queue(&self, name: &str) -> Result<()> {
        let payload = serde_json::to_value(QueueNameRequest {
            name: name.to_string(),
        })?;
        self.control(MessageType::RemoveQueue, &payload)
            .await
            .map(|_| ())
    }

    pub async fn queue_status(&self, name: &str) -> Result<QueueStatus> {
        let payload = serde_json::to_value(QueueNameRequest {
            name: name.to_string(),
        })?;
        self.control(MessageType::StatusQueue, &payload)
            .await?
            .as_json()
    }

    pub async fn server_status(&self) -> Result<serde_json::Value> {
        self.request(&Message::text(STATUS_TOPIC, ""), IpcConfig::DEFAULT_REQUEST_TIMEOUT)
            .await?
            .as_json()
    }

    pub async fn server_thread_pool_statistics(&self) -> Result<serde_json::Value> {
        self.request(
            &Message::text(THREAD_POOL_STATISTICS_TOPIC, ""),
            IpcConfig::DEFAULT_REQUEST_TIMEOUT,
        )
        .await?
        .as_json()
    }

    /// Pop the oldest error recorded by the server, if any.
    pub async fn next_server_error(&self) -> Result<Option<serde_json::Value>> {
        match self
            .request(&Message::text(NEXT_ERROR_TOPIC, ""), IpcConfig::DEFAULT_REQUEST_TIMEOUT)
            .await
        {
            Ok(response) => Ok(Some(response.as_json()?)),
            Err(CourierError::QueueEmpty { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Echo `msg` through the server.
    pub async fn test(&self, msg: &Message) -> Result<Message> {
        self.request(&msg.with_type(MessageType::Test), IpcConfig::DEFAULT_REQUEST_TIMEOUT)
            .await
    }

    async fn control(&self, msg_type: MessageType, payload: &serde_json::Value) -> Result<Message> {
        self.request(
            &Message::control(msg_type, CONTROL_TOPIC, payload),
            IpcConfig::DEFAULT_REQUEST_TIMEOUT,
        )
        .await
    }

    pub fn statistics(&self) -> ClientStatistics {
        let ListenerStatistics {
            received,
            subscription_deliveries,
            discarded_subscriptions,
            discarded_responses,
            ..
        } = self.inner.listener.statistics();
        ClientStatistics {
            sent: self.inner.sent.load(Ordering::Relaxed),
            received,
            discarded_responses,
            discarded_subscriptions,
            subscription_deliveries,
        }
    }

    /// True while the connection is open and the server has not hung up.
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst) && !self.inner.listener.is_eof()
    }

    /// True while a handler is registered for `topic`.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.inner.listener.has_handler(topic)
    }

    pub fn is_encrypted(&self) -> bool {
        self.inner.encryptor.is_active()
    }

    /// Session settings announced by the server.
    pub fn settings(&self) -> &ClientConfigResponse {
        &self.inner.settings
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Close the session. Calling it again has no effect.
    pub async fn close(&self) {
        let first = self.inner.shutdown();
        let tasks: Vec<_> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for mut task in tasks {
            if tokio::time::timeout(IpcConfig::GRACEFUL_CLOSE_WAIT, &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
        if let Ok(mut writer) =
            tokio::time::timeout(IpcConfig::GRACEFUL_CLOSE_WAIT, self.inner.writer.lock()).await
        {
            let _ = writer.shutdown().await;
        }
        if first {
            info!("Closed connection to {}", self.inner.endpoint);
        }
    }
}

async fn heartbeat_loop(
    inner: Weak<Inner>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let heartbeat = Message::text(CONTROL_TOPIC, "")
            .with_type(MessageType::Heartbeat)
            .with_oneway(true);
        let budget = IpcConfig::HEARTBEAT_SEND_TIMEOUT;
        if let Err(e) = inner.write(&heartbeat, Instant::now() + budget, budget).await {
            warn!("Heartbeat failed, closing connection: {}", e);
            inner.shutdown();
            break;
        }
    }
}

/// Session setup on the raw socket halves.
async fn handshake(
    config: &ClientConfig,
    reader: &mut BoxedReader,
    writer: &mut BoxedWriter,
) -> Result<(ClientConfigResponse, Encryptor)> {
    let request = Message::control(
        MessageType::ClientConfig,
        CONTROL_TOPIC,
        &serde_json::to_value(ClientConfigRequest {
            ack_mode: config.ack_mode,
        })?,
    );
    let response = exchange(reader, writer, &request, &Encryptor::off()).await?;
    if !response.is_ok() {
        return Err(CourierError::Handshake {
            message: format!(
                "client config rejected with {}: {}",
                response.response_status(),
                response.as_text().unwrap_or_default()
            ),
        });
    }
    let settings: ClientConfigResponse = response.as_json()?;

    // The server's flag wins; a client may only add encryption.
    let mut encryptor = Encryptor::off();
    if settings.encrypt || config.encrypt {
        let keys = DiffieHellmanKeys::generate();
        let request = Message::text(CONTROL_TOPIC, keys.public_key_base64())
            .with_type(MessageType::DiffieHellmanKeyRequest);
        let response = exchange(reader, writer, &request, &Encryptor::off()).await?;
        if response.response_status() != ResponseStatus::DiffieHellmanAck {
            return Err(CourierError::KeyExchange {
                message: format!(
                    "server answered {}: {}",
                    response.response_status(),
                    response.as_text().unwrap_or_default()
                ),
            });
        }
        encryptor = keys.encryptor(response.as_text()?, &config.key_derivation)?;
        debug!("Session encryption enabled");
    }

    if settings.authentication {
        let (Some(user), Some(password)) = (&config.user, &config.password) else {
            return Err(CourierError::Handshake {
                message: "the server requires authentication but no credentials are configured"
                    .to_string(),
            });
        };
        let credentials = Authenticator::encode_credentials(user, password);
        let request =
            Message::text(CONTROL_TOPIC, credentials).with_type(MessageType::Authentication);
        let response = exchange(reader, writer, &request, &encryptor).await?;
        if !response.is_ok() {
            return Err(CourierError::BadCredentials);
        }
        debug!(user = %user, "Authenticated");
    } else if config.has_credentials() {
        return Err(CourierError::Handshake {
            message: "credentials were supplied but the server does not require authentication"
                .to_string(),
        });
    }

    Ok((settings, encryptor))
}

/// Write `request` and read until its response arrives.
async fn exchange(
    reader: &mut BoxedReader,
    writer: &mut BoxedWriter,
    request: &Message,
    encryptor: &Encryptor,
) -> Result<Message> {
    Protocol::send_message(writer, request, &Compressor::off(), encryptor, usize::MAX).await?;
    loop {
        let msg = Protocol::receive_message(reader, encryptor)
            .await?
            .ok_or(CourierError::EndOfStream)?;
        if msg.request_id() == Some(request.id()) {
            return Ok(msg);
        }
        debug!(id = %msg.id(), "Ignoring unrelated message during handshake");
    }
}

/// Map a response status to the matching error.
pub fn check_status(response: Message) -> Result<Message> {
    let status = response.response_status();
    if status == ResponseStatus::Ok {
        return Ok(response);
    }
    let name = response.topic().to_string();
    let message = response.as_text().unwrap_or_default().to_string();
    Err(match status {
        ResponseStatus::QueueFull => CourierError::QueueFull { name },
        ResponseStatus::QueueEmpty => CourierError::QueueEmpty { name },
        ResponseStatus::QueueNotFound => CourierError::QueueNotFound { name },
        ResponseStatus::QueueAccessInterrupted => CourierError::QueueAccessInterrupted { name },
        ResponseStatus::NoPermission => CourierError::NoPermission { message },
        ResponseStatus::BadRequest => CourierError::InvalidMessage { message },
        ResponseStatus::HandlerError => CourierError::Handler { message },
        other => CourierError::invalid_message(format!("unexpected response status {}", other)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_status_maps_queue_outcomes() {
        let request = Message::text("jobs", "");
        let full = Message::text_response(&request, ResponseStatus::QueueFull, "");
        assert!(matches!(
            check_status(full),
            Err(CourierError::QueueFull { name }) if name == "jobs"
        ));

        let handler = Message::text_response(&request, ResponseStatus::HandlerError, "boom");
        assert!(matches!(
            check_status(handler),
            Err(CourierError::Handler { message }) if message == "boom"
        ));

        let ok = Message::text_response(&request, ResponseStatus::Ok, "fine");
        assert_eq!(check_status(ok).unwrap().as_text().unwrap(), "fine");
    }

    #[test]
    fn test_check_status_rejects_key_exchange_status() {
        let request = Message::text("t", "");
        let ack = Message::text_response(&request, ResponseStatus::DiffieHellmanAck, "");
        assert!(matches!(check_status(ack), Err(CourierError::InvalidMessage { .. })));
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = ClientConnection::connect(ClientConfig::new(Endpoint::Tcp(addr))).await;
        assert!(matches!(result, Err(CourierError::ConnectionFailed { .. })));
    }
}
