//! Integration tests for durable queues and their write-ahead logs.

mod common;

use common::*;
use courier_core::{CourierError, Message, ServerConfig};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

const SHORT: Duration = Duration::from_millis(100);

fn wal_config(dir: &Path) -> ServerConfig {
    let mut config = local_config();
    config.wal_dir = Some(dir.to_path_buf());
    config
}

#[tokio::test]
async fn test_durable_offer_grows_the_log() {
    let dir = TempDir::new().unwrap();
    let server = start_echo_server(wal_config(dir.path())).await;
    let client = connect(&server).await;
    let wal = server.queues().wal();

    let status = client.create_queue("orders", 10, true, true).await.unwrap();
    assert!(status.durable);
    assert_eq!(wal.file_count(), 1);

    let before = wal.total_bytes();
    client.offer("orders", &Message::text("", "order-1"), SHORT).await.unwrap();
    let after_durable = wal.total_bytes();
    assert!(after_durable > before);

    // Transient messages stay in memory only.
    let transient = Message::text("", "order-2").with_transient(true);
    client.offer("orders", &transient, SHORT).await.unwrap();
    assert_eq!(wal.total_bytes(), after_durable);

    // Non-durable queues never touch the log directory.
    client.create_queue("scratch", 10, true, false).await.unwrap();
    client.offer("scratch", &Message::text("", "tmp"), SHORT).await.unwrap();
    assert_eq!(wal.file_count(), 1);

    let status = client.server_status().await.unwrap();
    assert_eq!(status["wal"]["enabled"], true);
    assert_eq!(status["wal"]["file_count"], 1);
}

#[tokio::test]
async fn test_durable_queue_survives_restart() {
    let dir = TempDir::new().unwrap();

    let server = start_echo_server(wal_config(dir.path())).await;
    let client = connect(&server).await;
    client.create_queue("orders", 10, true, true).await.unwrap();
    for text in ["first", "second", "third"] {
        client.offer("orders", &Message::text("", text), SHORT).await.unwrap();
    }
    client
        .offer("orders", &Message::text("", "volatile").with_transient(true), SHORT)
        .await
        .unwrap();
    assert_eq!(client.poll("orders", SHORT).await.unwrap().as_text().unwrap(), "first");
    client.close().await;
    server.stop().await;

    let server = start_echo_server(wal_config(dir.path())).await;
    let client = connect(&server).await;
    let status = client.queue_status("orders").await.unwrap();
    assert!(status.exists);
    assert!(status.durable);
    assert_eq!(status.size, 2);

    assert_eq!(client.poll("orders", SHORT).await.unwrap().as_text().unwrap(), "second");
    assert_eq!(client.poll("orders", SHORT).await.unwrap().as_text().unwrap(), "third");
    let result = client.poll("orders", SHORT).await;
    assert!(matches!(result, Err(CourierError::QueueEmpty { .. })));
}

#[tokio::test]
async fn test_removing_durable_queue_deletes_its_log() {
    let dir = TempDir::new().unwrap();
    let server = start_echo_server(wal_config(dir.path())).await;
    let client = connect(&server).await;

    client.create_queue("orders", 10, true, true).await.unwrap();
    client.offer("orders", &Message::text("", "x"), SHORT).await.unwrap();
    assert_eq!(server.queues().wal().file_count(), 1);

    client.remove_queue("orders").await.unwrap();
    assert_eq!(server.queues().wal().file_count(), 0);
    server.stop().await;

    let server = start_echo_server(wal_config(dir.path())).await;
    assert_eq!(server.queues().queue_count(), 0);
}

#[tokio::test]
async fn test_durable_flag_ignored_without_wal() {
    let server = start_echo_server(local_config()).await;
    let client = connect(&server).await;

    let status = client.create_queue("orders", 10, true, true).await.unwrap();
    assert!(!status.durable);
    assert!(!server.queues().wal().is_enabled());
}

#[tokio::test]
async fn test_durable_queue_with_long_name() {
    let dir = TempDir::new().unwrap();
    let server = start_echo_server(wal_config(dir.path())).await;
    let client = connect(&server).await;
    let name = "n".repeat(220);

    let status = client.create_queue(&name, 10, true, true).await.unwrap();
    assert!(status.durable);
    assert_eq!(server.queues().wal().file_count(), 1);

    client.offer(&name, &Message::text("", "kept"), SHORT).await.unwrap();
    let msg = client.poll(&name, SHORT).await.unwrap();
    assert_eq!(msg.as_text().unwrap(), "kept");
}
