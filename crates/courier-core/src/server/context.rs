//! State shared by every connection of one server.

use super::auth::Authenticator;
use super::connection::ServerConnection;
use super::logger::ServerLogger;
use super::RequestHandler;
use crate::config::{Endpoint, IpcConfig, ServerConfig};
use crate::protocol::Compressor;
use crate::queue::ServerQueueManager;
use crate::subscription::Subscriptions;
use crate::transport::SocketBuffers;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

pub struct ServerContext {
    pub config: ServerConfig,
    pub endpoint: Endpoint,
    pub started_at: DateTime<Utc>,
    pub authenticator: Authenticator,
    pub compressor: Compressor,
    pub logger: ServerLogger,
    pub handler: Arc<dyn RequestHandler>,
    pub subscriptions: Subscriptions,
    pub statistics: ServerStatistics,
    pub queues: ServerQueueManager,
    pub errors: ErrorBuffer,
    pub socket_buffers: SocketBuffers,
    pub(crate) connections: DashMap<Uuid, Arc<ServerConnection>>,
}

impl ServerContext {
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

/// Server-wide counters.
#[derive(Debug, Default)]
pub struct ServerStatistics {
    active_connections: AtomicUsize,
    total_connections: AtomicU64,
    rejected_connections: AtomicU64,
    requests: AtomicU64,
    responses: AtomicU64,
    publishes: AtomicU64,
    publish_deliveries: AtomicU64,
    publish_drops: AtomicU64,
    handler_errors: AtomicU64,
}

/// Point-in-time copy of [`ServerStatistics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    pub active_connections: usize,
    pub total_connections: u64,
    pub rejected_connections: u64,
    pub requests: u64,
    pub responses: u64,
    pub publishes: u64,
    pub publish_deliveries: u64,
    pub publish_drops: u64,
    pub handler_errors: u64,
}

impl ServerStatistics {
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_received(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_sent(&self) {
        self.responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn published(&self, delivered: usize, dropped: usize) {
        self.publishes.fetch_add(1, Ordering::Relaxed);
        self.publish_deliveries.fetch_add(delivered as u64, Ordering::Relaxed);
        self.publish_drops.fetch_add(dropped as u64, Ordering::Relaxed);
    }

    pub fn publish_dropped(&self) {
        self.publish_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            publishes: self.publishes.load(Ordering::Relaxed),
            publish_deliveries: self.publish_deliveries.load(Ordering::Relaxed),
            publish_drops: self.publish_drops.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
        }
    }
}

/// One audited request failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    pub conn_id: Uuid,
    pub principal: Option<String>,
    pub request_type: String,
    pub topic: String,
    pub status: String,
    pub message: String,
}

/// Ring buffer of the most recent request failures. When full, the oldest
/// entry is dropped.
#[derive(Debug)]
pub struct ErrorBuffer {
    capacity: usize,
    entries: Mutex<VecDeque<ErrorEntry>>,
}

impl Default for ErrorBuffer {
    fn default() -> Self {
        Self::new(IpcConfig::ERROR_BUFFER_CAPACITY)
    }
}

impl ErrorBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, entry: ErrorEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Remove and return the oldest entry.
    pub fn pop(&self) -> Option<ErrorEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
