//! Named point-to-point queues.
//!
//! - **Queue**: a bounded or circular FIFO of messages with timed offer/poll
//! - **Validator**: name and capacity checks applied before creation
//! - **Manager**: the server-wide queue map and its write-ahead log
//! - **WAL**: per-queue append-only logs that make durable queues survive restarts

pub mod manager;
pub mod validator;
pub mod wal;

pub use manager::ServerQueueManager;
pub use validator::QueueValidator;
pub use wal::WalQueueManager;

use crate::message::Message;
use crate::protocol::payload::QueueStatus;
use crate::{CourierError, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Behaviour of a queue that reached its capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueType {
    /// Offers wait for free space.
    Bounded,
    /// Offers never wait; the oldest message is evicted.
    Circular,
}

impl QueueType {
    pub fn from_bounded(bounded: bool) -> Self {
        if bounded {
            QueueType::Bounded
        } else {
            QueueType::Circular
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueType::Bounded => "bounded",
            QueueType::Circular => "circular",
        }
    }
}

/// A named message queue with blocking offer/poll.
#[derive(Debug)]
pub struct MessageQueue {
    name: String,
    queue_type: QueueType,
    capacity: usize,
    durable: bool,
    temporary: bool,
    items: Mutex<VecDeque<Message>>,
    not_empty: Notify,
    not_full: Notify,
    closed: AtomicBool,
}

impl MessageQueue {
    pub fn new(
        name: impl Into<String>,
        queue_type: QueueType,
        capacity: usize,
        durable: bool,
        temporary: bool,
    ) -> Self {
        Self {
            name: name.into(),
            queue_type,
            capacity: capacity.max(1),
            durable: durable && !temporary,
            temporary,
            items: Mutex::new(VecDeque::new()),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    pub fn is_bounded(&self) -> bool {
        self.queue_type == QueueType::Bounded
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            name: self.name.clone(),
            exists: true,
            queue_type: Some(self.queue_type.as_str().to_string()),
            bounded: self.is_bounded(),
            durable: self.durable,
            temporary: self.temporary,
            capacity: self.capacity,
            size: self.len(),
        }
    }

    /// Offer a message. `wait = None` fails immediately when the queue is
    /// full; otherwise the call waits up to `wait` for free space.
    ///
    /// Returns the message evicted to make room, if any (circular queues only).
    pub async fn offer(&self, msg: Message, wait: Option<Duration>) -> Result<Option<Message>> {
        let deadline = wait.map(|w| Instant::now() + w);
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            self.check_open()?;

            {
                let mut items = self.items();
                if items.len() < self.capacity {
                    items.push_back(msg);
                    drop(items);
                    self.not_empty.notify_one();
                    return Ok(None);
                }
                if self.queue_type == QueueType::Circular {
                    let evicted = items.pop_front();
                    items.push_back(msg);
                    drop(items);
                    self.not_empty.notify_one();
                    return Ok(evicted);
                }
            }

            let Some(deadline) = deadline else {
                return Err(self.full());
            };
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(self.full());
            }
        }
    }

    /// Poll the head message. `wait = None` fails immediately when the queue
    /// is empty; otherwise the call waits up to `wait` for a message.
    pub async fn poll(&self, wait: Option<Duration>) -> Result<Message> {
        let deadline = wait.map(|w| Instant::now() + w);
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            self.check_open()?;

            let head = self.items().pop_front();
            if let Some(msg) = head {
                self.not_full.notify_one();
                return Ok(msg);
            }

            let Some(deadline) = deadline else {
                return Err(self.empty());
            };
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(self.empty());
            }
        }
    }

    /// Append a recovered message without waiting or notifying.
    pub(crate) fn restore(&self, msg: Message) {
        let mut items = self.items();
        if items.len() >= self.capacity {
            items.pop_front();
        }
        items.push_back(msg);
    }

    /// Copy of the current contents, head first.
    pub fn snapshot(&self) -> Vec<Message> {
        self.items().iter().cloned().collect()
    }

    /// Close the queue; pending and future offer/poll calls fail with
    /// `QueueAccessInterrupted`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(CourierError::QueueAccessInterrupted {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    fn full(&self) -> CourierError {
        CourierError::QueueFull {
            name: self.name.clone(),
        }
    }

    fn empty(&self) -> CourierError {
        CourierError::QueueEmpty {
            name: self.name.clone(),
        }
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<Message>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
