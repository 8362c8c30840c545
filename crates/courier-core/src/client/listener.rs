//! Inbound demultiplexer of a client connection.
//!
//! A single task reads every inbound envelope. Subscription deliveries go to
//! the handler registered for their topic; everything else is a response and
//! lands in a bounded receive queue that [`ChannelListener::read_response`]
//! scans for the id it is waiting on.

use crate::config::IpcConfig;
use crate::message::Message;
use crate::protocol::{Encryptor, Protocol};
use crate::transport::BoxedReader;
use crate::{CourierError, Result};
use dashmap::DashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Callback for subscription deliveries on one topic.
pub type SubscriptionHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Why the listener loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerStop {
    /// The peer closed the connection.
    Eof,
    /// A read or decode error ended the loop.
    Error(String),
    /// The connection was closed locally.
    Interrupted,
}

/// Listener counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStatistics {
    /// Responses queued for `read_response`. Subscription deliveries are
    /// counted separately.
    pub received: u64,
    pub subscription_deliveries: u64,
    pub discarded_subscriptions: u64,
    pub discarded_responses: u64,
    pub handler_panics: u64,
}

#[derive(Default)]
struct ListenerState {
    handlers: DashMap<String, SubscriptionHandler>,
    eof: AtomicBool,
    err: AtomicBool,
    irq: AtomicBool,
    error: Mutex<Option<String>>,
    received: AtomicU64,
    subscription_deliveries: AtomicU64,
    discarded_subscriptions: AtomicU64,
    discarded_responses: AtomicU64,
    handler_panics: AtomicU64,
}

pub struct ChannelListener {
    state: Arc<ListenerState>,
    responses: tokio::sync::Mutex<mpsc::Receiver<Message>>,
}

impl ChannelListener {
    /// Spawn the listener loop over `reader`. The loop stops when the peer
    /// closes the stream, on the first read error, or when `shutdown` fires.
    pub fn start(
        reader: BoxedReader,
        encryptor: Encryptor,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let state = Arc::new(ListenerState::default());
        let (tx, rx) = mpsc::channel(IpcConfig::RECEIVE_QUEUE_CAPACITY);
        let task = tokio::spawn(listen(reader, encryptor, shutdown, state.clone(), tx));
        (
            Self {
                state,
                responses: tokio::sync::Mutex::new(rx),
            },
            task,
        )
    }

    pub fn set_handler(&self, topic: &str, handler: SubscriptionHandler) {
        self.state.handlers.insert(topic.to_string(), handler);
    }

    pub fn remove_handler(&self, topic: &str) {
        self.state.handlers.remove(topic);
    }

    pub fn has_handler(&self, topic: &str) -> bool {
        self.state.handlers.contains_key(topic)
    }

    /// True once the loop has stopped, whatever the cause.
    pub fn is_eof(&self) -> bool {
        self.state.eof.load(Ordering::SeqCst)
    }

    pub fn is_err(&self) -> bool {
        self.state.err.load(Ordering::SeqCst)
    }

    pub fn is_interrupted(&self) -> bool {
        self.state.irq.load(Ordering::SeqCst)
    }

    pub fn stop_reason(&self) -> Option<ListenerStop> {
        if !self.is_eof() {
            return None;
        }
        if self.is_interrupted() {
            return Some(ListenerStop::Interrupted);
        }
        if self.is_err() {
            let message = self
                .state
                .error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .unwrap_or_default();
            return Some(ListenerStop::Error(message));
        }
        Some(ListenerStop::Eof)
    }

    pub fn statistics(&self) -> ListenerStatistics {
        let state = &self.state;
        ListenerStatistics {
            received: state.received.load(Ordering::Relaxed),
            subscription_deliveries: state.subscription_deliveries.load(Ordering::Relaxed),
            discarded_subscriptions: state.discarded_subscriptions.load(Ordering::Relaxed),
            discarded_responses: state.discarded_responses.load(Ordering::Relaxed),
            handler_panics: state.handler_panics.load(Ordering::Relaxed),
        }
    }

    /// Wait until `deadline` for the response to `request_id`.
    ///
    /// Responses with any other id are stale and dropped. The queue is
    /// polled in short slices so a stopped listener is noticed well before
    /// the deadline.
    pub async fn read_response(
        &self,
        request_id: Uuid,
        deadline: Instant,
        budget: Duration,
    ) -> Result<Message> {
        let mut responses = self.responses.lock().await;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(CourierError::Timeout(budget));
            }
            let slice = IpcConfig::LISTENER_POLL_SLICE.min(deadline - now);
            match tokio::time::timeout(slice, responses.recv()).await {
                Ok(Some(msg)) if msg.request_id() == Some(request_id) => return Ok(msg),
                Ok(Some(msg)) => {
                    self.state.discarded_responses.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        expected = %request_id,
                        got = ?msg.request_id(),
                        "Discarded response that does not match the pending request"
                    );
                }
                Ok(None) => return Err(CourierError::EndOfStream),
                Err(_) => {
                    if self.is_eof() && responses.is_empty() {
                        return Err(CourierError::EndOfStream);
                    }
                }
            }
        }
    }
}

async fn listen(
    mut reader: BoxedReader,
    encryptor: Encryptor,
    mut shutdown: watch::Receiver<bool>,
    state: Arc<ListenerState>,
    responses: mpsc::Sender<Message>,
) {
    loop {
        let inbound = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                state.irq.store(true, Ordering::SeqCst);
                break;
            }
            result = Protocol::receive_message(&mut reader, &encryptor) => result,
        };
        match inbound {
            Ok(Some(msg)) => deliver(&state, &responses, msg),
            Ok(None) => {
                debug!("Server closed the connection");
                break;
            }
            Err(e) => {
                warn!("Listener stopped: {}", e);
                *state.error.lock().unwrap_or_else(PoisonError::into_inner) = Some(e.to_string());
                state.err.store(true, Ordering::SeqCst);
                break;
            }
        }
    }
    state.eof.store(true, Ordering::SeqCst);
}

fn deliver(state: &ListenerState, responses: &mpsc::Sender<Message>, msg: Message) {
    if !msg.is_subscription_reply() {
        match responses.try_send(msg) {
            Ok(()) => {
                state.received.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                state.discarded_responses.fetch_add(1, Ordering::Relaxed);
                warn!("Receive queue full, response discarded");
            }
        }
        return;
    }

    let handler = state
        .handlers
        .get(msg.topic())
        .map(|entry| entry.value().clone());
    match handler {
        Some(handler) => {
            state.subscription_deliveries.fetch_add(1, Ordering::Relaxed);
            if catch_unwind(AssertUnwindSafe(|| handler(msg))).is_err() {
                state.handler_panics.fetch_add(1, Ordering::Relaxed);
                warn!("Subscription handler panicked");
            }
        }
        None => {
            state.discarded_subscriptions.fetch_add(1, Ordering::Relaxed);
        }
    }
}
