//! Server-wide queue map.
//!
//! All structural changes to the map go through [`ServerQueueManager::with_queues`],
//! so concurrent create/remove calls from different connections cannot
//! lose updates. Offer and poll work on a cloned `Arc<MessageQueue>` and do
//! not hold the map lock while waiting. Log writes never happen under the
//! map lock; offers and acks append on the blocking pool.

use crate::message::{Message, MessageType};
use crate::protocol::payload::QueueStatus;
use crate::queue::validator::TEMP_QUEUE_PREFIX;
use crate::queue::{MessageQueue, QueueType, QueueValidator, WalQueueManager};
use crate::{CourierError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct ServerQueueManager {
    queues: Mutex<HashMap<String, Arc<MessageQueue>>>,
    /// Serializes `create_queue` so a durable queue's log is written before
    /// the queue becomes visible.
    create_lock: Mutex<()>,
    wal: Arc<WalQueueManager>,
}

impl ServerQueueManager {
    pub fn new(wal: WalQueueManager) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            create_lock: Mutex::new(()),
            wal: Arc::new(wal),
        }
    }

    pub fn wal(&self) -> &WalQueueManager {
        &self.wal
    }

    /// Run `f` with exclusive access to the queue map.
    pub fn with_queues<R>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Arc<MessageQueue>>) -> R,
    ) -> R {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut queues)
    }

    /// Rebuild durable queues from the write-ahead log.
    ///
    /// Returns the number of queues restored.
    pub fn recover(&self) -> Result<usize> {
        if !self.wal.is_enabled() {
            return Ok(0);
        }
        let recovered = self.wal.recover()?;
        let count = recovered.len();
        self.with_queues(|queues| {
            for entry in recovered {
                let config = entry.config;
                let queue = Arc::new(MessageQueue::new(
                    config.name.clone(),
                    QueueType::from_bounded(config.bounded),
                    config.capacity,
                    true,
                    false,
                ));
                let restored = entry.messages.len();
                for msg in entry.messages {
                    queue.restore(msg);
                }
                info!(queue = %config.name, messages = restored, "Recovered durable queue");
                queues.insert(config.name, queue);
            }
        });
        Ok(count)
    }

    /// Create a standard queue. Creating a queue that already exists returns
    /// the existing one unchanged.
    pub fn create_queue(
        &self,
        name: &str,
        capacity: usize,
        bounded: bool,
        durable: bool,
    ) -> Result<Arc<MessageQueue>> {
        QueueValidator::validate_name(name)?;
        QueueValidator::validate_capacity(capacity)?;

        let durable = durable && self.wal.is_enabled();
        let _creating = self.create_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = self.get_queue(name) {
            return Ok(existing);
        }
        let queue = Arc::new(MessageQueue::new(
            name,
            QueueType::from_bounded(bounded),
            capacity,
            durable,
            false,
        ));
        if queue.is_durable() {
            self.wal.log_config(&queue)?;
        }
        self.with_queues(|queues| queues.insert(name.to_string(), queue.clone()));
        info!(queue = name, capacity, bounded, durable, "Created queue");
        Ok(queue)
    }

    /// Create a temporary queue with a generated unique name.
    pub fn create_temporary_queue(
        &self,
        capacity: usize,
        bounded: bool,
    ) -> Result<Arc<MessageQueue>> {
        QueueValidator::validate_capacity(capacity)?;

        let name = format!("{}{}", TEMP_QUEUE_PREFIX, Uuid::new_v4());
        let queue = Arc::new(MessageQueue::new(
            name.clone(),
            QueueType::from_bounded(bounded),
            capacity,
            false,
            true,
        ));
        self.with_queues(|queues| queues.insert(name, queue.clone()));
        Ok(queue)
    }

    /// Remove a queue, interrupting any waiters and deleting its log.
    pub fn remove_queue(&self, name: &str) -> Option<Arc<MessageQueue>> {
        let removed = self.with_queues(|queues| queues.remove(name))?;
        removed.close();
        if removed.is_durable() {
            if let Err(e) = self.wal.remove_log(name) {
                warn!(queue = name, "Failed to delete queue log: {}", e);
            }
        }
        info!(queue = name, "Removed queue");
        Some(removed)
    }

    pub fn get_queue(&self, name: &str) -> Option<Arc<MessageQueue>> {
        self.with_queues(|queues| queues.get(name).cloned())
    }

    pub fn queue_status(&self, name: &str) -> QueueStatus {
        self.get_queue(name)
            .map(|queue| queue.status())
            .unwrap_or_else(|| QueueStatus::missing(name))
    }

    pub fn queue_count(&self) -> usize {
        self.with_queues(|queues| queues.values().filter(|q| !q.is_temporary()).count())
    }

    pub fn temporary_queue_count(&self) -> usize {
        self.with_queues(|queues| queues.values().filter(|q| q.is_temporary()).count())
    }

    /// Offer a message to the named queue.
    ///
    /// The message is stored as a `REQUEST` so a poller receives a regular
    /// request envelope. Durable queues append it to the WAL unless it is
    /// transient.
    pub async fn offer(&self, name: &str, msg: &Message, wait: Option<Duration>) -> Result<()> {
        let queue = self.require(name)?;
        let stored = msg.with_type(MessageType::Request);
        let persist = self.persists(&queue, &stored);

        let evicted = queue.offer(stored.clone(), wait).await?;
        if persist {
            let wal = self.wal.clone();
            let queue_name = name.to_string();
            run_blocking(move || wal.log_offer(&queue_name, &stored)).await?;
        }
        if let Some(evicted) = evicted {
            self.acknowledge(&queue, &evicted).await;
        }
        Ok(())
    }

    /// Poll the named queue, discarding expired messages.
    ///
    /// `wait` is the budget for the whole call, including any re-polls
    /// after discarded messages.
    pub async fn poll(&self, name: &str, wait: Option<Duration>) -> Result<Message> {
        let queue = self.require(name)?;
        let deadline = wait.map(|w| Instant::now() + w);
        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let msg = queue.poll(remaining).await?;
            self.acknowledge(&queue, &msg).await;
            if !msg.is_expired() {
                return Ok(msg);
            }
            info!(queue = name, id = %msg.id(), "Discarded expired message");
        }
    }

    /// Compact every durable log and close all queues.
    pub fn shutdown(&self) {
        let queues: Vec<Arc<MessageQueue>> =
            self.with_queues(|queues| queues.drain().map(|(_, q)| q).collect());
        for queue in queues {
            if queue.is_durable() {
                if let Err(e) = self.wal.compact(&queue) {
                    error!(queue = queue.name(), "Failed to compact queue log: {}", e);
                }
            }
            queue.close();
        }
    }

    fn require(&self, name: &str) -> Result<Arc<MessageQueue>> {
        self.get_queue(name).ok_or_else(|| CourierError::QueueNotFound {
            name: name.to_string(),
        })
    }

    fn persists(&self, queue: &MessageQueue, msg: &Message) -> bool {
        !msg.is_transient() && queue.is_durable() && self.wal.is_enabled()
    }

    async fn acknowledge(&self, queue: &MessageQueue, msg: &Message) {
        if !self.persists(queue, msg) {
            return;
        }
        let wal = self.wal.clone();
        let queue_name = queue.name().to_string();
        let id = msg.id();
        if let Err(e) = run_blocking(move || wal.log_ack(&queue_name, id)).await {
            error!(queue = queue.name(), id = %id, "Failed to log ack: {}", e);
        }
    }
}

/// Run a blocking log write off the async workers.
async fn run_blocking<F>(f: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CourierError::Other(format!("log write task failed: {}", e)))?
}
