//! Integration tests for request/response, queues and publish/subscribe
//! against a real server on localhost.

mod common;

use common::*;
use courier_core::{
    ClientConfig, ClientConnection, CourierError, Endpoint, Message, MessageType, RequestHandler,
    ResponseStatus, Server,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

struct TestHandler;

#[async_trait::async_trait]
impl RequestHandler for TestHandler {
    async fn handle(&self, request: Message) -> courier_core::Result<Message> {
        match request.topic() {
            "slow" => {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(Message::text("slow", "late"))
            }
            "fail" => Err(CourierError::Other("bad input".to_string())),
            "panic" => panic!("handler bug"),
            _ => Ok(request),
        }
    }
}

async fn start_test_server() -> courier_core::ServerHandle {
    Server::new(local_config()).start(TestHandler).await.unwrap()
}

#[tokio::test]
async fn test_request_response_echo() {
    let server = start_echo_server(local_config()).await;
    let client = connect(&server).await;

    let request = Message::text("greet", "hello");
    let response = client.request(&request, TIMEOUT).await.unwrap();
    assert_eq!(response.msg_type(), MessageType::Response);
    assert_eq!(response.request_id(), Some(request.id()));
    assert_eq!(response.response_status(), ResponseStatus::Ok);
    assert_eq!(response.as_text().unwrap(), "hello");

    let echoed = client.test(&Message::text("t", "ping")).await.unwrap();
    assert_eq!(echoed.as_text().unwrap(), "ping");

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_handler_errors_keep_the_session_alive() {
    let server = start_test_server().await;
    let client = connect(&server).await;

    let result = client.request(&Message::text("fail", ""), TIMEOUT).await;
    assert!(matches!(result, Err(CourierError::Handler { .. })));

    let result = client.request(&Message::text("panic", ""), TIMEOUT).await;
    assert!(matches!(result, Err(CourierError::Handler { .. })));

    let response = client.request(&Message::text("ok", "still here"), TIMEOUT).await.unwrap();
    assert_eq!(response.as_text().unwrap(), "still here");

    let first = client.next_server_error().await.unwrap().unwrap();
    assert_eq!(first["status"], "HANDLER_ERROR");
    assert_eq!(first["topic"], "fail");
    let second = client.next_server_error().await.unwrap().unwrap();
    assert_eq!(second["topic"], "panic");
    assert!(client.next_server_error().await.unwrap().is_none());
    assert_eq!(server.statistics().handler_errors, 2);
}

#[tokio::test]
async fn test_oneway_failure_is_only_recorded() {
    let server = start_test_server().await;
    let client = connect(&server).await;

    let sent = client
        .send(&Message::text("fail", "").with_oneway(true), TIMEOUT)
        .await
        .unwrap();
    assert!(sent.is_none());

    // Requests are served in order, so the oneway failure is recorded first.
    let entry = client.next_server_error().await.unwrap().unwrap();
    assert_eq!(entry["request_type"], "REQUEST");
    assert_eq!(client.statistics().discarded_responses, 0);
}

#[tokio::test]
async fn test_timeout_budget_and_stale_response_discard() {
    let server = start_test_server().await;
    let client = connect(&server).await;

    let budget = Duration::from_millis(200);
    let started = Instant::now();
    let result = client.send(&Message::text("slow", ""), budget).await;
    assert!(matches!(result, Err(CourierError::Timeout(_))));
    assert!(started.elapsed() < budget + Duration::from_millis(150));

    // The late answer to "slow" arrives first and must not be returned here.
    let request = Message::text("fast", "mine");
    let response = client.request(&request, TIMEOUT).await.unwrap();
    assert_eq!(response.request_id(), Some(request.id()));
    assert_eq!(response.as_text().unwrap(), "mine");
    assert_eq!(client.statistics().discarded_responses, 1);
}

#[tokio::test]
async fn test_correlation_skips_injected_responses() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let fake = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        accept_handshake(&mut stream).await;

        let request = read_plain(&mut stream).await.unwrap();
        let stale = Message::text_response(&Message::text("x", ""), ResponseStatus::Ok, "stale");
        let duplicate = Message::text_response(&Message::text("y", ""), ResponseStatus::Ok, "dup");
        write_plain(&mut stream, &stale).await;
        write_plain(&mut stream, &duplicate).await;
        write_plain(
            &mut stream,
            &Message::text_response(&request, ResponseStatus::Ok, "right"),
        )
        .await;
        // Hold the socket until the client hangs up.
        let _ = read_plain(&mut stream).await;
    });

    let client = ClientConnection::connect(ClientConfig::new(Endpoint::Tcp(addr)))
        .await
        .unwrap();
    let response = client.request(&Message::text("q", ""), TIMEOUT).await.unwrap();
    assert_eq!(response.as_text().unwrap(), "right");
    assert_eq!(client.statistics().discarded_responses, 2);

    client.close().await;
    fake.await.unwrap();
}

#[tokio::test]
async fn test_peer_close_ends_wait_early() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        accept_handshake(&mut stream).await;
        let _ = read_plain(&mut stream).await;
        drop(stream);
    });

    let client = ClientConnection::connect(ClientConfig::new(Endpoint::Tcp(addr)))
        .await
        .unwrap();
    let started = Instant::now();
    let result = client.send(&Message::text("q", ""), Duration::from_secs(5)).await;
    assert!(matches!(result, Err(CourierError::EndOfStream)));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!client.is_open());
}

#[tokio::test]
async fn test_send_async_resolves_to_response() {
    let server = start_echo_server(local_config()).await;
    let client = connect(&server).await;

    let handle = client.send_async(Message::text("async", "value"), TIMEOUT);
    let response = handle.await.unwrap().unwrap().unwrap();
    assert_eq!(response.as_text().unwrap(), "value");
}

#[tokio::test]
async fn test_bounded_queue_full_empty_and_expiry() {
    let server = start_echo_server(local_config()).await;
    let client = connect(&server).await;
    let short = Duration::from_millis(100);

    let status = client.create_queue("jobs", 1, true, false).await.unwrap();
    assert!(status.exists);
    assert_eq!(status.capacity, 1);

    client.offer("jobs", &Message::text("", "first"), short).await.unwrap();
    let result = client.offer("jobs", &Message::text("", "second"), short).await;
    assert!(matches!(result, Err(CourierError::QueueFull { name }) if name == "jobs"));

    let polled = client.poll("jobs", short).await.unwrap();
    assert_eq!(polled.as_text().unwrap(), "first");
    let result = client.poll("jobs", short).await;
    assert!(matches!(result, Err(CourierError::QueueEmpty { .. })));

    let expiring = Message::text("", "stale").with_ttl(Duration::from_millis(50));
    client.offer("jobs", &expiring, short).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let result = client.poll("jobs", short).await;
    assert!(matches!(result, Err(CourierError::QueueEmpty { .. })));

    let result = client.offer("missing", &Message::text("", "x"), short).await;
    assert!(matches!(result, Err(CourierError::QueueNotFound { .. })));
}

#[tokio::test]
async fn test_circular_queue_keeps_newest() {
    let server = start_echo_server(local_config()).await;
    let client = connect(&server).await;
    let short = Duration::from_millis(100);

    client.create_queue("ring", 2, false, false).await.unwrap();
    for text in ["a", "b", "c"] {
        client.offer("ring", &Message::text("", text), short).await.unwrap();
    }
    assert_eq!(client.poll("ring", short).await.unwrap().as_text().unwrap(), "b");
    assert_eq!(client.poll("ring", short).await.unwrap().as_text().unwrap(), "c");

    let status = client.queue_status("ring").await.unwrap();
    assert_eq!(status.queue_type.as_deref(), Some("circular"));
    assert_eq!(status.size, 0);
    assert!(!client.queue_status("nowhere").await.unwrap().exists);
}

#[tokio::test]
async fn test_poll_waits_for_offer_from_another_client() {
    let server = start_echo_server(local_config()).await;
    let consumer = connect(&server).await;
    let producer = connect(&server).await;
    producer.create_queue("work", 10, true, false).await.unwrap();

    let waiting = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.poll("work", Duration::from_secs(3)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    producer
        .offer("work", &Message::text("", "job-1"), Duration::from_millis(100))
        .await
        .unwrap();

    let polled = waiting.await.unwrap().unwrap();
    assert_eq!(polled.as_text().unwrap(), "job-1");
}

#[tokio::test]
async fn test_removing_queue_interrupts_pollers() {
    let server = start_echo_server(local_config()).await;
    let consumer = connect(&server).await;
    let admin = connect(&server).await;
    admin.create_queue("doomed", 10, true, false).await.unwrap();

    let waiting = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.poll("doomed", Duration::from_secs(3)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    admin.remove_queue("doomed").await.unwrap();

    let result = waiting.await.unwrap();
    assert!(matches!(result, Err(CourierError::QueueAccessInterrupted { .. })));
    let result = admin.remove_queue("doomed").await;
    assert!(matches!(result, Err(CourierError::QueueNotFound { .. })));
}

#[tokio::test]
async fn test_queue_management_permission() {
    let mut config = local_config();
    config.permit_client_queue_mgmt = false;
    let server = start_echo_server(config).await;
    let client = connect(&server).await;

    assert!(!client.settings().permit_client_queue_mgmt);
    let result = client.create_queue("jobs", 5, true, false).await;
    assert!(matches!(result, Err(CourierError::NoPermission { .. })));

    // Temporary queues stay available.
    let name = client.create_temporary_queue(5, true).await.unwrap();
    client.remove_queue(&name).await.unwrap();
}

#[tokio::test]
async fn test_invalid_queue_names_are_rejected() {
    let server = start_echo_server(local_config()).await;
    let client = connect(&server).await;

    let result = client.create_queue("temp-mine", 5, true, false).await;
    assert!(matches!(result, Err(CourierError::InvalidMessage { .. })));
    let result = client.create_queue("jobs", 0, true, false).await;
    assert!(matches!(result, Err(CourierError::InvalidMessage { .. })));
    assert_eq!(server.queues().queue_count(), 0);
}

#[tokio::test]
async fn test_temporary_queues_die_with_their_connection() {
    let server = start_echo_server(local_config()).await;
    let owner = connect(&server).await;
    let other = connect(&server).await;

    let names = [
        owner.create_temporary_queue(5, true).await.unwrap(),
        owner.create_temporary_queue(5, true).await.unwrap(),
        owner.create_temporary_queue(5, false).await.unwrap(),
    ];
    assert!(names.iter().all(|name| name.starts_with("temp-")));
    assert_eq!(server.queues().temporary_queue_count(), 3);

    let result = other.remove_queue(&names[0]).await;
    assert!(matches!(result, Err(CourierError::NoPermission { .. })));

    // Temporary queues are usable by any connection.
    other
        .offer(&names[1], &Message::text("", "reply"), Duration::from_millis(100))
        .await
        .unwrap();

    owner.remove_queue(&names[0]).await.unwrap();
    assert_eq!(server.queues().temporary_queue_count(), 2);

    owner.close().await;
    assert!(wait_until(TIMEOUT, || server.queues().temporary_queue_count() == 0).await);
}

#[tokio::test]
async fn test_temporary_queue_cap() {
    let mut config = local_config();
    config.max_temp_queues_per_connection = 2;
    let server = start_echo_server(config).await;
    let client = connect(&server).await;

    client.create_temporary_queue(1, true).await.unwrap();
    client.create_temporary_queue(1, true).await.unwrap();
    let result = client.create_temporary_queue(1, true).await;
    assert!(matches!(result, Err(CourierError::InvalidMessage { .. })));
}

fn collector() -> (impl Fn(Message) + Send + Sync + 'static, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |msg: Message| {
            let _ = tx.send(msg);
        },
        rx,
    )
}

async fn expect_one(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_publish_fan_out_and_unsubscribe() {
    let server = start_echo_server(local_config()).await;
    let a = connect(&server).await;
    let b = connect(&server).await;
    let c = connect(&server).await;
    let publisher = connect(&server).await;

    let (handler_a, mut rx_a) = collector();
    let (handler_b, mut rx_b) = collector();
    let (handler_c, mut rx_c) = collector();
    a.subscribe("news", handler_a).await.unwrap();
    b.subscribe("news", handler_b).await.unwrap();
    c.subscribe("sports", handler_c).await.unwrap();
    assert!(a.is_subscribed("news"));
    assert_eq!(server.context().subscriptions.subscriber_count("news"), 2);
    assert_eq!(server.context().subscriptions.subscriber_count("sports"), 1);

    let report = publisher.publish(&Message::text("news", "first")).await.unwrap();
    assert_eq!(report.delivered, 2);
    assert_eq!(report.dropped, 0);

    let got_a = expect_one(&mut rx_a).await;
    let got_b = expect_one(&mut rx_b).await;
    assert!(got_a.is_subscription_reply());
    assert_eq!(got_a.as_text().unwrap(), "first");
    assert_eq!(got_b.as_text().unwrap(), "first");

    a.unsubscribe("news").await.unwrap();
    assert!(!a.is_subscribed("news"));
    assert_eq!(server.context().subscriptions.subscriber_count("news"), 1);
    let report = publisher.publish(&Message::text("news", "second")).await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(expect_one(&mut rx_b).await.as_text().unwrap(), "second");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx_a.try_recv().is_err());
    assert!(rx_b.try_recv().is_err());
    assert!(rx_c.try_recv().is_err());
    assert_eq!(a.statistics().subscription_deliveries, 1);
    assert_eq!(a.statistics().received, 2);
}

#[tokio::test]
async fn test_server_side_publish_reaches_subscribers() {
    let server = start_echo_server(local_config()).await;
    let client = connect(&server).await;
    let (handler, mut rx) = collector();
    client.subscribe("alerts", handler).await.unwrap();

    let report = server.publish(&Message::text("alerts", "disk full"));
    assert_eq!(report.delivered, 1);
    assert_eq!(expect_one(&mut rx).await.as_text().unwrap(), "disk full");
}

#[tokio::test]
async fn test_frames_never_interleave_under_concurrent_publish() {
    let mut config = local_config();
    config.publish_queue_capacity = 1_000;
    let server = start_echo_server(config).await;
    let subscriber = connect(&server).await;
    let publisher = connect(&server).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    subscriber
        .subscribe("flood", move |msg: Message| {
            let _ = tx.send(msg.data().len());
        })
        .await
        .unwrap();

    let payload = "p".repeat(4096);
    let flood = {
        let publisher = publisher.clone();
        let payload = payload.clone();
        tokio::spawn(async move {
            for _ in 0..200 {
                publisher.publish(&Message::text("flood", payload.clone())).await.unwrap();
            }
        })
    };

    let body = "r".repeat(8192);
    for i in 0..50 {
        let request = Message::text("rpc", format!("{}:{}", i, body));
        let response = subscriber.request(&request, TIMEOUT).await.unwrap();
        assert_eq!(response.data(), request.data());
    }
    flood.await.unwrap();

    for _ in 0..200 {
        let len = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(len, payload.len());
    }
    assert!(subscriber.is_open());
}

#[tokio::test]
async fn test_status_topics() {
    let server = start_echo_server(local_config()).await;
    let client = connect(&server).await;

    let status = client.server_status().await.unwrap();
    assert_eq!(status["connections"]["active"], 1);
    assert_eq!(status["wal"]["enabled"], false);
    assert_eq!(status["encrypt"], false);

    let pool = client.server_thread_pool_statistics().await.unwrap();
    assert!(pool["workers"].as_u64().unwrap() >= 1);
    assert_eq!(pool["active_connections"], 1);

    assert!(client.next_server_error().await.unwrap().is_none());
}

#[tokio::test]
async fn test_oversized_messages() {
    let mut config = local_config();
    config.max_message_size = 1024;
    let server = start_echo_server(config).await;
    let client = connect(&server).await;
    assert_eq!(client.settings().max_message_size, 1024);

    let big = Message::text("big", "x".repeat(4096));
    let result = client.request(&big, TIMEOUT).await;
    assert!(matches!(result, Err(CourierError::MessageTooLarge { .. })));
    assert!(client.is_open());
    let small = client.request(&Message::text("small", "ok"), TIMEOUT).await.unwrap();
    assert_eq!(small.as_text().unwrap(), "ok");
}

#[tokio::test]
async fn test_server_skips_oversized_request_payload() {
    let mut config = local_config();
    config.max_message_size = 1024;
    let server = start_echo_server(config).await;
    let Some(addr) = server.local_addr() else {
        panic!("tcp server expected");
    };

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let hello = Message::json("courier/control", &serde_json::json!({}))
        .with_type(MessageType::ClientConfig);
    write_plain(&mut stream, &hello).await;
    assert!(read_plain(&mut stream).await.unwrap().is_ok());

    let big = Message::text("big", "x".repeat(4096));
    write_plain(&mut stream, &big).await;
    let rejected = read_plain(&mut stream).await.unwrap();
    assert_eq!(rejected.request_id(), Some(big.id()));
    assert_eq!(rejected.response_status(), ResponseStatus::BadRequest);

    // The stream stays aligned after the skipped payload.
    let probe = Message::text("probe", "small").with_type(MessageType::Test);
    write_plain(&mut stream, &probe).await;
    let echoed = read_plain(&mut stream).await.unwrap();
    assert_eq!(echoed.request_id(), Some(probe.id()));
    assert_eq!(echoed.as_text().unwrap(), "small");
}

#[tokio::test]
async fn test_connection_limit() {
    let mut config = local_config();
    config.max_connections = 1;
    let server = start_echo_server(config).await;

    let first = connect(&server).await;
    let result = ClientConnection::connect(client_config(&server)).await;
    assert!(result.is_err());
    assert!(first.is_open());
    assert_eq!(server.statistics().rejected_connections, 1);

    first.close().await;
    assert!(wait_until(TIMEOUT, || server.statistics().active_connections == 0).await);
    let again = connect(&server).await;
    assert!(again.is_open());
}

#[tokio::test]
async fn test_subscriber_registry_cleared_on_close() {
    let server = start_echo_server(local_config()).await;
    let client = connect(&server).await;
    let (handler, _rx) = collector();
    client.subscribe("news", handler).await.unwrap();
    assert_eq!(server.context().subscriptions.target_count(), 1);

    client.close().await;
    let context = Arc::clone(server.context());
    assert!(wait_until(TIMEOUT, || context.subscriptions.target_count() == 0).await);
    assert!(wait_until(TIMEOUT, || server.connections().is_empty()).await);
}
