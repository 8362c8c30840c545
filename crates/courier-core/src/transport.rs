//! Socket plumbing shared by clients and the server.
//!
//! Both TCP and Unix domain sockets are split into owned read and write
//! halves and boxed, so the connection code above this module never names
//! a concrete stream type.

use crate::config::{Endpoint, IpcConfig};
use crate::{CourierError, Result};
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, warn};

#[cfg(unix)]
use std::path::PathBuf;
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The two halves of one connected socket.
pub struct Transport {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    /// Printable peer address for logs.
    pub peer: String,
}

impl Transport {
    fn tcp(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }
        let (reader, writer) = stream.into_split();
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            peer,
        }
    }

    #[cfg(unix)]
    fn unix(stream: UnixStream, peer: String) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            peer,
        }
    }
}

/// Open a connection to `endpoint` within `timeout`.
pub async fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<Transport> {
    let failed = |message: String| CourierError::ConnectionFailed {
        endpoint: endpoint.to_string(),
        message,
    };
    match endpoint {
        Endpoint::Tcp(addr) => {
            let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| failed(format!("timed out after {:?}", timeout)))?
                .map_err(|e| failed(e.to_string()))?;
            Ok(Transport::tcp(stream))
        }
        #[cfg(unix)]
        Endpoint::Unix(path) => {
            let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
                .await
                .map_err(|_| failed(format!("timed out after {:?}", timeout)))?
                .map_err(|e| failed(e.to_string()))?;
            Ok(Transport::unix(stream, endpoint.to_string()))
        }
    }
}

/// Kernel socket buffer sizes of the listening socket, reported in the
/// server status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SocketBuffers {
    pub receive_buffer_size: u32,
    pub send_buffer_size: u32,
}

/// A bound server socket.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

impl Listener {
    pub async fn bind(endpoint: &Endpoint) -> Result<(Self, SocketBuffers)> {
        match endpoint {
            Endpoint::Tcp(addr) => {
                let socket = match addr {
                    SocketAddr::V4(_) => TcpSocket::new_v4()?,
                    SocketAddr::V6(_) => TcpSocket::new_v6()?,
                };
                socket.set_reuseaddr(true)?;
                socket.bind(*addr)?;
                let buffers = SocketBuffers {
                    receive_buffer_size: socket.recv_buffer_size().unwrap_or(0),
                    send_buffer_size: socket.send_buffer_size().unwrap_or(0),
                };
                let listener = socket.listen(IpcConfig::LISTEN_BACKLOG)?;
                Ok((Listener::Tcp(listener), buffers))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                if path.exists() {
                    warn!("Removing stale socket file {}", path.display());
                    std::fs::remove_file(path).map_err(|e| CourierError::io_with_path(e, path))?;
                }
                let listener =
                    UnixListener::bind(path).map_err(|e| CourierError::io_with_path(e, path))?;
                Ok((Listener::Unix(listener, path.clone()), SocketBuffers::default()))
            }
        }
    }

    /// The endpoint clients should connect to. For TCP this carries the
    /// OS-assigned port when binding to port 0.
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        match self {
            Listener::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?)),
            #[cfg(unix)]
            Listener::Unix(_, path) => Ok(Endpoint::Unix(path.clone())),
        }
    }

    pub async fn accept(&self) -> std::io::Result<Transport> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Transport::tcp(stream))
            }
            #[cfg(unix)]
            Listener::Unix(listener, path) => {
                let (stream, _) = listener.accept().await?;
                Ok(Transport::unix(stream, format!("unix://{}", path.display())))
            }
        }
    }

    /// Remove the socket file of a Unix listener.
    pub fn cleanup(&self) {
        #[cfg(unix)]
        if let Listener::Unix(_, path) = self {
            if let Err(e) = std::fs::remove_file(path) {
                debug!("Failed to remove socket file {}: {}", path.display(), e);
            }
        }
    }
}
