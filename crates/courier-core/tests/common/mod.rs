//! Helpers shared by the integration tests.

#![allow(dead_code)]

use courier_core::protocol::payload::ClientConfigResponse;
use courier_core::protocol::{Compressor, Encryptor, Protocol};
use courier_core::{
    ClientConfig, ClientConnection, Endpoint, Message, ResponseStatus, Result, Server,
    ServerConfig, ServerHandle,
};
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn echo(request: Message) -> Result<Message> {
    Ok(request)
}

/// Config for a server on an ephemeral localhost port.
pub fn local_config() -> ServerConfig {
    ServerConfig::default().with_endpoint(Endpoint::localhost(0))
}

pub async fn start_echo_server(config: ServerConfig) -> ServerHandle {
    Server::new(config).start(echo).await.unwrap()
}

pub fn client_config(server: &ServerHandle) -> ClientConfig {
    ClientConfig::new(server.endpoint().clone())
}

pub async fn connect(server: &ServerHandle) -> ClientConnection {
    ClientConnection::connect(client_config(server)).await.unwrap()
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Like [`wait_until`] for conditions that need to await.
pub async fn wait_until_async<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Session settings a hand-rolled server announces.
pub fn plain_settings() -> ClientConfigResponse {
    ClientConfigResponse {
        max_message_size: 1024 * 1024,
        compress_cutoff_size: -1,
        permit_client_queue_mgmt: true,
        encrypt: false,
        heartbeat_interval_secs: 0,
        authentication: false,
    }
}

pub async fn write_plain(stream: &mut TcpStream, msg: &Message) {
    Protocol::send_message(stream, msg, &Compressor::off(), &Encryptor::off(), usize::MAX)
        .await
        .unwrap();
}

pub async fn read_plain(stream: &mut TcpStream) -> Option<Message> {
    Protocol::receive_message(stream, &Encryptor::off())
        .await
        .unwrap()
}

/// Answer the client's `CLIENT_CONFIG` request on a hand-rolled server.
pub async fn accept_handshake(stream: &mut TcpStream) {
    let request = read_plain(stream).await.unwrap();
    let response = Message::json_response(
        &request,
        ResponseStatus::Ok,
        &serde_json::to_value(plain_settings()).unwrap(),
    );
    write_plain(stream, &response).await;
}
