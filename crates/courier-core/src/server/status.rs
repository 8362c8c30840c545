//! Reserved request topics answered by the server itself.

use super::context::ServerContext;
use chrono::Utc;
use serde_json::{json, Value};

/// Snapshot of connections, traffic, queues, socket buffers and the WAL.
pub const STATUS_TOPIC: &str = "server/status";
/// Runtime worker and task counts.
pub const THREAD_POOL_STATISTICS_TOPIC: &str = "server/thread-pool-statistics";
/// Pops the oldest entry of the error buffer.
pub const NEXT_ERROR_TOPIC: &str = "server/error/next";

pub fn server_status(context: &ServerContext) -> Value {
    let config = &context.config;
    let wal = context.queues.wal();
    json!({
        "endpoint": context.endpoint.to_string(),
        "started_at": context.started_at.to_rfc3339(),
        "uptime_secs": (Utc::now() - context.started_at).num_seconds(),
        "statistics": context.statistics.snapshot(),
        "connections": {
            "active": context.connection_count(),
            "max": config.max_connections,
        },
        "queues": {
            "standard": context.queues.queue_count(),
            "temporary": context.queues.temporary_queue_count(),
        },
        "subscription_targets": context.subscriptions.target_count(),
        "socket": context.socket_buffers,
        "wal": {
            "enabled": wal.is_enabled(),
            "dir": wal.dir().map(|d| d.display().to_string()),
            "file_count": wal.file_count(),
            "total_bytes": wal.total_bytes(),
        },
        "error_buffer": {
            "size": context.errors.len(),
            "capacity": context.errors.capacity(),
        },
        "encrypt": config.encrypt,
        "authentication": context.authenticator.is_active(),
        "max_message_size": config.max_message_size,
        "compress_cutoff_size": config.compress_cutoff_size,
        "heartbeat_interval_secs": config.heartbeat_interval_secs,
    })
}

pub fn thread_pool_statistics(context: &ServerContext) -> Value {
    let metrics = tokio::runtime::Handle::current().metrics();
    json!({
        "workers": metrics.num_workers(),
        "alive_tasks": metrics.num_alive_tasks(),
        "active_connections": context.statistics.active_connections(),
        // Each connection runs a request loop, a publisher and a writer task.
        "connection_tasks": context.connection_count() * 3,
        "publish_queue_capacity": context.config.publish_queue_capacity,
    })
}
