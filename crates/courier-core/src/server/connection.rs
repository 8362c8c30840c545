//! One accepted client session.
//!
//! # Tasks
//!
//! Every connection runs three tasks:
//!
//! - the **request loop** reads requests, dispatches them and queues the
//!   responses for writing
//! - the **publisher** drains the connection's bounded publish queue, fed by
//!   the subscription registry
//! - the **writer** owns the socket's write half and writes encoded frames
//!   one at a time
//!
//! The request loop and the publisher never touch the socket. They encode a
//! complete frame and hand it to the writer, so two messages can never
//! interleave on the wire.
//!
//! # Session encryption
//!
//! The outbound encryptor only changes while a writer slot is reserved: the
//! key-exchange response is queued unencrypted and the new encryptor is
//! installed under the same lock, so every frame queued afterwards is
//! encrypted and every frame queued before is not.

use super::auth::Authenticator;
use super::context::{ErrorEntry, ServerContext};
use super::status;
use crate::config::{AckMode, IpcConfig};
use crate::message::{Message, MessageType, ResponseStatus};
use crate::protocol::frame;
use crate::protocol::payload::{
    ClientConfigRequest, ClientConfigResponse, CreateQueueRequest, CreateTempQueueRequest,
    CreateTempQueueResponse, QueueNameRequest,
};
use crate::protocol::{Compressor, DiffieHellmanKeys, Encryptor, Inbound, Protocol};
use crate::subscription::Publisher;
use crate::transport::{BoxedReader, BoxedWriter, Transport};
use crate::{CourierError, Result};
use chrono::Utc;
use dashmap::DashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

/// Delivery path registered with the subscription registry.
struct ConnectionPublisher {
    id: Uuid,
    queue: mpsc::Sender<Message>,
}

impl Publisher for ConnectionPublisher {
    fn id(&self) -> Uuid {
        self.id
    }

    fn publish(&self, msg: Message) -> bool {
        self.queue.try_send(msg).is_ok()
    }
}

/// What the request loop sends back for one request.
enum Reply {
    Send(Message),
    /// Sent unencrypted; `encryptor` becomes the session cipher afterwards.
    KeyExchange {
        response: Message,
        encryptor: Option<Encryptor>,
    },
}

pub struct ServerConnection {
    id: Uuid,
    peer: String,
    context: Arc<ServerContext>,
    encryptor: RwLock<Encryptor>,
    principal: RwLock<Option<String>>,
    ack_mode: Mutex<AckMode>,
    temp_queues: DashSet<String>,
    last_heartbeat: AtomicI64,
    frames: mpsc::Sender<Vec<u8>>,
    publisher: Arc<ConnectionPublisher>,
}

/// Run one session until the peer disconnects, a transport error occurs or
/// the server shuts down.
pub(crate) async fn serve(
    context: Arc<ServerContext>,
    transport: Transport,
    shutdown: watch::Receiver<bool>,
) {
    let Transport {
        reader,
        writer,
        peer,
    } = transport;
    let id = Uuid::new_v4();
    let (frames_tx, frames_rx) = mpsc::channel(IpcConfig::WRITER_QUEUE_CAPACITY);
    let (publish_tx, publish_rx) = mpsc::channel(context.config.publish_queue_capacity.max(1));

    let connection = Arc::new(ServerConnection {
        id,
        peer,
        context: context.clone(),
        encryptor: RwLock::new(Encryptor::off()),
        principal: RwLock::new(None),
        ack_mode: Mutex::new(AckMode::default()),
        temp_queues: DashSet::new(),
        last_heartbeat: AtomicI64::new(Utc::now().timestamp_millis()),
        frames: frames_tx,
        publisher: Arc::new(ConnectionPublisher {
            id,
            queue: publish_tx,
        }),
    });
    context.connections.insert(id, connection.clone());
    connection.log_info(&format!("Accepted connection from {}", connection.peer));

    let mut writer_task = tokio::spawn(write_loop(writer, frames_rx));
    let publisher_task = tokio::spawn(connection.clone().publish_loop(publish_rx));

    connection.request_loop(reader, shutdown).await;

    connection.cleanup();
    publisher_task.abort();
    let _ = publisher_task.await;
    drop(connection);

    // The writer flushes queued frames and exits once the last frame sender
    // is gone.
    if tokio::time::timeout(IpcConfig::GRACEFUL_CLOSE_WAIT, &mut writer_task)
        .await
        .is_err()
    {
        debug!(conn_id = %id, "Writer did not finish in time, aborting");
        writer_task.abort();
    }
}

async fn write_loop(mut writer: BoxedWriter, mut frames: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = frames.recv().await {
        if let Err(e) = frame::write_frame(&mut writer, &bytes).await {
            debug!("Connection writer stopped: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

impl ServerConnection {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn principal(&self) -> Option<String> {
        self.principal
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.principal().is_some()
    }

    pub fn is_encrypted(&self) -> bool {
        self.current_encryptor().is_active()
    }

    pub fn ack_mode(&self) -> AckMode {
        *self.ack_mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Names of the temporary queues this connection owns.
    pub fn temporary_queues(&self) -> Vec<String> {
        self.temp_queues.iter().map(|name| name.key().clone()).collect()
    }

    pub fn millis_since_last_heartbeat(&self) -> i64 {
        Utc::now().timestamp_millis() - self.last_heartbeat.load(Ordering::Relaxed)
    }

    fn current_encryptor(&self) -> Encryptor {
        self.encryptor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn request_loop(&self, mut reader: BoxedReader, mut shutdown: watch::Receiver<bool>) {
        let max_message_size = self.context.config.max_message_size;
        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }
            let encryptor = self.current_encryptor();
            let receive = Protocol::receive_limited(&mut reader, &encryptor, max_message_size);
            let inbound = tokio::select! {
                result = receive => result,
                _ = shutdown.changed() => {
                    self.log_info("Server is shutting down, closing connection");
                    break;
                }
            };

            let result = match inbound {
                Ok(None) => {
                    self.log_info("Client closed the connection");
                    break;
                }
                Ok(Some(Inbound::Message(request))) => self.process(request).await,
                Ok(Some(Inbound::Oversized { request, size })) => {
                    self.reject_oversized(request, size).await
                }
                Err(e) => {
                    match e {
                        CourierError::Io { .. } => {
                            self.log_info(&format!("Connection lost: {}", e))
                        }
                        _ => self.log_warn(&format!(
                            "Closing connection after protocol error: {}",
                            e
                        )),
                    }
                    break;
                }
            };
            if let Err(e) = result {
                self.log_warn(&format!("Failed to send response: {}", e));
                break;
            }
        }
    }

    async fn publish_loop(self: Arc<Self>, mut queue: mpsc::Receiver<Message>) {
        while let Some(msg) = queue.recv().await {
            match self.send_frame(&msg).await {
                Ok(()) => {}
                Err(CourierError::MessageTooLarge { size, max }) => {
                    self.context.statistics.publish_dropped();
                    self.log_warn(&format!(
                        "Dropped publish on '{}': size {} exceeds maximum {}",
                        msg.topic(),
                        size,
                        max
                    ));
                }
                Err(e) => {
                    debug!(conn_id = %self.id, "Publisher stopped: {}", e);
                    break;
                }
            }
        }
    }

    async fn process(&self, request: Message) -> Result<()> {
        self.context.statistics.request_received();
        debug!(conn_id = %self.id, id = %request.id(), msg_type = %request.msg_type(), "Request");

        let reply = match self.dispatch(&request).await {
            Ok(reply) => reply,
            Err(e) => {
                let status = e.to_response_status();
                if status == ResponseStatus::HandlerError || request.is_oneway() {
                    self.audit(&request, status, &e);
                }
                Reply::Send(Message::text_response(&request, status, e.to_string()))
            }
        };

        match reply {
            Reply::KeyExchange {
                response,
                encryptor,
            } => self.send_key_exchange_response(&response, encryptor).await,
            Reply::Send(_) if request.is_oneway() => Ok(()),
            Reply::Send(response) => self.send_response(&request, response).await,
        }
    }

    async fn reject_oversized(&self, request: Message, size: usize) -> Result<()> {
        let err = CourierError::MessageTooLarge {
            size,
            max: self.context.config.max_message_size,
        };
        if request.is_oneway() {
            self.audit(&request, ResponseStatus::BadRequest, &err);
            return Ok(());
        }
        self.log_warn(&format!("Rejected {} request: {}", request.msg_type(), err));
        let response =
            Message::text_response(&request, ResponseStatus::BadRequest, err.to_string());
        self.send_response(&request, response).await
    }

    async fn send_response(&self, request: &Message, response: Message) -> Result<()> {
        match self.send_frame(&response).await {
            Ok(()) => {}
            Err(e @ CourierError::MessageTooLarge { .. }) => {
                self.audit(request, ResponseStatus::HandlerError, &e);
                let fallback =
                    Message::text_response(request, ResponseStatus::HandlerError, e.to_string());
                self.send_frame(&fallback).await?;
            }
            Err(e) => return Err(e),
        }
        self.context.statistics.response_sent();
        Ok(())
    }

    /// Encode `msg` with the session settings and queue it for the writer.
    async fn send_frame(&self, msg: &Message) -> Result<()> {
        let permit = self
            .frames
            .reserve()
            .await
            .map_err(|_| CourierError::ConnectionClosed)?;
        self.queue_frame(permit, msg)
    }

    fn queue_frame(&self, permit: mpsc::Permit<'_, Vec<u8>>, msg: &Message) -> Result<()> {
        let encryptor = self.encryptor.read().unwrap_or_else(PoisonError::into_inner);
        let bytes = Protocol::encode(
            msg,
            &self.context.compressor,
            &encryptor,
            self.context.config.max_message_size,
        )?;
        permit.send(bytes);
        Ok(())
    }

    async fn send_key_exchange_response(
        &self,
        response: &Message,
        encryptor: Option<Encryptor>,
    ) -> Result<()> {
        let permit = self
            .frames
            .reserve()
            .await
            .map_err(|_| CourierError::ConnectionClosed)?;
        let switched = encryptor.is_some();
        self.queue_key_exchange_frame(permit, response, encryptor)?;
        if switched {
            self.log_info("Session encryption enabled");
        }
        self.context.statistics.response_sent();
        Ok(())
    }

    /// Queue the response unencrypted, then install the new session cipher
    /// before any other frame can be queued.
    fn queue_key_exchange_frame(
        &self,
        permit: mpsc::Permit<'_, Vec<u8>>,
        response: &Message,
        encryptor: Option<Encryptor>,
    ) -> Result<()> {
        let bytes = Protocol::encode(response, &Compressor::off(), &Encryptor::off(), usize::MAX)?;
        let mut current = self.encryptor.write().unwrap_or_else(PoisonError::into_inner);
        permit.send(bytes);
        if let Some(encryptor) = encryptor {
            *current = encryptor;
        }
        Ok(())
    }

    fn check_session(&self, msg_type: MessageType) -> Result<()> {
        let key_exchange = matches!(
            msg_type,
            MessageType::ClientConfig | MessageType::DiffieHellmanKeyRequest
        );
        if self.context.config.encrypt && !key_exchange && !self.is_encrypted() {
            return Err(CourierError::NoPermission {
                message: "the server requires an encrypted session".to_string(),
            });
        }
        if self.context.authenticator.is_active()
            && !msg_type.allowed_before_authentication()
            && !self.is_authenticated()
        {
            return Err(CourierError::NoPermission {
                message: "authentication required".to_string(),
            });
        }
        Ok(())
    }

    async fn dispatch(&self, request: &Message) -> Result<Reply> {
        self.check_session(request.msg_type())?;
        let response = match request.msg_type() {
            MessageType::Request => self.handle_request(request).await?,
            MessageType::Subscribe => self.handle_subscribe(request)?,
            MessageType::Unsubscribe => self.handle_unsubscribe(request)?,
            MessageType::Publish => self.handle_publish(request)?,
            MessageType::Offer => self.handle_offer(request).await?,
            MessageType::Poll => self.handle_poll(request).await?,
            MessageType::CreateQueue => self.handle_create_queue(request)?,
            MessageType::CreateTempQueue => self.handle_create_temp_queue(request)?,
            MessageType::RemoveQueue => self.handle_remove_queue(request)?,
            MessageType::StatusQueue => self.handle_status_queue(request)?,
            MessageType::ClientConfig => self.handle_client_config(request)?,
            MessageType::DiffieHellmanKeyRequest => return self.handle_key_exchange(request),
            MessageType::Authentication => self.handle_authentication(request)?,
            MessageType::Heartbeat => self.handle_heartbeat(request),
            MessageType::Test => echo(request),
            MessageType::Response => {
                return Err(CourierError::invalid_message("RESPONSE is not a request type"));
            }
        };
        Ok(Reply::Send(response))
    }

    async fn handle_request(&self, request: &Message) -> Result<Message> {
        match request.topic() {
            status::STATUS_TOPIC => Ok(Message::json_response(
                request,
                ResponseStatus::Ok,
                &status::server_status(&self.context),
            )),
            status::THREAD_POOL_STATISTICS_TOPIC => Ok(Message::json_response(
                request,
                ResponseStatus::Ok,
                &status::thread_pool_statistics(&self.context),
            )),
            status::NEXT_ERROR_TOPIC => match self.context.errors.pop() {
                Some(entry) => Ok(Message::json_response(
                    request,
                    ResponseStatus::Ok,
                    &serde_json::to_value(entry)?,
                )),
                None => Err(CourierError::QueueEmpty {
                    name: status::NEXT_ERROR_TOPIC.to_string(),
                }),
            },
            _ => self.call_handler(request).await,
        }
    }

    /// Run the application handler on its own task so a panic becomes a
    /// handler error instead of ending the session.
    async fn call_handler(&self, request: &Message) -> Result<Message> {
        let handler = self.context.handler.clone();
        let owned = request.clone();
        let reply = tokio::spawn(async move { handler.handle(owned).await })
            .await
            .map_err(|e| CourierError::Handler {
                message: if e.is_panic() {
                    "request handler panicked".to_string()
                } else {
                    "request handler was cancelled".to_string()
                },
            })?
            .map_err(|e| match e {
                CourierError::Handler { .. } => e,
                other => CourierError::Handler {
                    message: other.to_string(),
                },
            })?;

        if reply.msg_type() == MessageType::Response && reply.request_id() == Some(request.id()) {
            return Ok(reply);
        }
        Ok(Message::response_to(
            request,
            ResponseStatus::Ok,
            reply.mimetype(),
            reply.charset().map(str::to_string),
            reply.data().clone(),
        ))
    }

    fn handle_subscribe(&self, request: &Message) -> Result<Message> {
        request.topics().validate()?;
        for topic in request.topics().iter() {
            self.context
                .subscriptions
                .add_subscription(topic, self.publisher.clone());
        }
        Ok(ok(request))
    }

    fn handle_unsubscribe(&self, request: &Message) -> Result<Message> {
        request.topics().validate()?;
        for topic in request.topics().iter() {
            self.context.subscriptions.remove_subscription(topic, self.id);
        }
        Ok(ok(request))
    }

    fn handle_publish(&self, request: &Message) -> Result<Message> {
        request.topics().validate()?;
        let report = self.context.subscriptions.publish(request);
        self.context
            .statistics
            .published(report.delivered, report.dropped);
        if report.dropped > 0 {
            debug!(
                conn_id = %self.id,
                topic = request.topic(),
                dropped = report.dropped,
                "Publish queues full, deliveries dropped"
            );
        }
        Ok(Message::json_response(
            request,
            ResponseStatus::Ok,
            &serde_json::to_value(report)?,
        ))
    }

    async fn handle_offer(&self, request: &Message) -> Result<Message> {
        self.context
            .queues
            .offer(request.topic(), request, request.timeout_duration())
            .await?;
        Ok(ok(request))
    }

    async fn handle_poll(&self, request: &Message) -> Result<Message> {
        let msg = self
            .context
            .queues
            .poll(request.topic(), request.timeout_duration())
            .await?;
        Ok(Message::response_to(
            request,
            ResponseStatus::Ok,
            msg.mimetype(),
            msg.charset().map(str::to_string),
            msg.data().clone(),
        ))
    }

    fn handle_create_queue(&self, request: &Message) -> Result<Message> {
        self.require_queue_management()?;
        let params: CreateQueueRequest = request.as_json()?;
        let queue = self.context.queues.create_queue(
            &params.name,
            params.capacity,
            params.bounded,
            params.durable,
        )?;
        self.log_info(&format!("Created queue '{}'", queue.name()));
        Ok(Message::json_response(
            request,
            ResponseStatus::Ok,
            &serde_json::to_value(queue.status())?,
        ))
    }

    fn handle_create_temp_queue(&self, request: &Message) -> Result<Message> {
        let params: CreateTempQueueRequest = request.as_json()?;
        let max = self.context.config.max_temp_queues_per_connection;
        if self.temp_queues.len() >= max {
            return Err(CourierError::validation(
                "temporary queues",
                format!("connection already owns the maximum of {} temporary queues", max),
            ));
        }
        let queue = self
            .context
            .queues
            .create_temporary_queue(params.capacity, params.bounded)?;
        self.temp_queues.insert(queue.name().to_string());
        Ok(Message::json_response(
            request,
            ResponseStatus::Ok,
            &serde_json::to_value(CreateTempQueueResponse {
                name: queue.name().to_string(),
            })?,
        ))
    }

    fn handle_remove_queue(&self, request: &Message) -> Result<Message> {
        let params: QueueNameRequest = request.as_json()?;
        let queues = &self.context.queues;
        if self.temp_queues.remove(&params.name).is_some() {
            queues.remove_queue(&params.name);
            return Ok(ok(request));
        }

        let queue = queues
            .get_queue(&params.name)
            .ok_or_else(|| CourierError::QueueNotFound {
                name: params.name.clone(),
            })?;
        if queue.is_temporary() {
            return Err(CourierError::NoPermission {
                message: format!("temporary queue '{}' belongs to another connection", params.name),
            });
        }
        self.require_queue_management()?;
        queues.remove_queue(&params.name);
        self.log_info(&format!("Removed queue '{}'", params.name));
        Ok(ok(request))
    }

    fn handle_status_queue(&self, request: &Message) -> Result<Message> {
        let params: QueueNameRequest = request.as_json()?;
        let status = self.context.queues.queue_status(&params.name);
        Ok(Message::json_response(
            request,
            ResponseStatus::Ok,
            &serde_json::to_value(status)?,
        ))
    }

    fn handle_client_config(&self, request: &Message) -> Result<Message> {
        let params: ClientConfigRequest = if request.data().is_empty() {
            ClientConfigRequest::default()
        } else {
            request.as_json()?
        };
        *self.ack_mode.lock().unwrap_or_else(PoisonError::into_inner) = params.ack_mode;

        let config = &self.context.config;
        let settings = ClientConfigResponse {
            max_message_size: config.max_message_size,
            compress_cutoff_size: config.compress_cutoff_size,
            permit_client_queue_mgmt: config.permit_client_queue_mgmt,
            encrypt: config.encrypt,
            heartbeat_interval_secs: config.heartbeat_interval_secs,
            authentication: self.context.authenticator.is_active(),
        };
        Ok(Message::json_response(
            request,
            ResponseStatus::Ok,
            &serde_json::to_value(settings)?,
        ))
    }

    fn handle_key_exchange(&self, request: &Message) -> Result<Reply> {
        if self.is_encrypted() {
            return Err(CourierError::invalid_message("the session is already encrypted"));
        }
        let keys = DiffieHellmanKeys::generate();
        let derived = request
            .as_text()
            .and_then(|peer_key| keys.encryptor(peer_key, &self.context.config.key_derivation));
        match derived {
            Ok(encryptor) => Ok(Reply::KeyExchange {
                response: Message::text_response(
                    request,
                    ResponseStatus::DiffieHellmanAck,
                    keys.public_key_base64(),
                ),
                encryptor: Some(encryptor),
            }),
            Err(e) => {
                self.log_warn(&format!("Key exchange failed: {}", e));
                Ok(Reply::KeyExchange {
                    response: Message::text_response(
                        request,
                        ResponseStatus::DiffieHellmanNak,
                        e.to_string(),
                    ),
                    encryptor: None,
                })
            }
        }
    }

    fn handle_authentication(&self, request: &Message) -> Result<Message> {
        let authenticator = &self.context.authenticator;
        if !authenticator.is_active() {
            return Err(CourierError::invalid_message(
                "authentication is not enabled on this server",
            ));
        }
        let (user, password) = Authenticator::parse_credentials(request.as_text()?)?;
        if !authenticator.authenticate(user, password) {
            self.log_warn(&format!("Authentication failed for user '{}'", user));
            return Err(CourierError::BadCredentials);
        }
        *self.principal.write().unwrap_or_else(PoisonError::into_inner) = Some(user.to_string());
        self.log_info("Authenticated");
        Ok(ok(request))
    }

    fn handle_heartbeat(&self, request: &Message) -> Message {
        self.last_heartbeat
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        ok(request)
    }

    fn require_queue_management(&self) -> Result<()> {
        if !self.context.config.permit_client_queue_mgmt {
            return Err(CourierError::NoPermission {
                message: "clients are not permitted to manage queues".to_string(),
            });
        }
        Ok(())
    }

    fn audit(&self, request: &Message, status: ResponseStatus, err: &CourierError) {
        if status == ResponseStatus::HandlerError {
            self.context.statistics.handler_error();
        }
        let principal = self.principal();
        self.context.errors.push(ErrorEntry {
            timestamp: Utc::now(),
            conn_id: self.id,
            principal: principal.clone(),
            request_type: request.msg_type().to_string(),
            topic: request.topic().to_string(),
            status: status.to_string(),
            message: err.to_string(),
        });
        self.context.logger.warn(
            self.id,
            principal.as_deref(),
            &format!("{} request on '{}' failed: {}", request.msg_type(), request.topic(), err),
        );
    }

    fn cleanup(&self) {
        let queues = &self.context.queues;
        for name in self.temporary_queues() {
            queues.remove_queue(&name);
        }
        self.temp_queues.clear();
        self.context.subscriptions.remove_subscriptions(self.id);
        self.context.connections.remove(&self.id);
        self.context.statistics.connection_closed();
        self.log_info("Connection closed");
    }

    fn log_info(&self, message: &str) {
        self.context
            .logger
            .info(self.id, self.principal().as_deref(), message);
    }

    fn log_warn(&self, message: &str) {
        self.context
            .logger
            .warn(self.id, self.principal().as_deref(), message);
    }
}

fn ok(request: &Message) -> Message {
    Message::text_response(request, ResponseStatus::Ok, "")
}

fn echo(request: &Message) -> Message {
    Message::response_to(
        request,
        ResponseStatus::Ok,
        request.mimetype(),
        request.charset().map(str::to_string),
        request.data().clone(),
    )
}
