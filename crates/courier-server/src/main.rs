//! Courier Server - standalone message broker.
//!
//! Starts a broker whose request handler echoes every plain request back to
//! the caller. Queues, publish/subscribe and the status topics work as in
//! any embedded server.

use anyhow::{bail, Context, Result};
use clap::Parser;
use courier_core::{Authenticator, Endpoint, Message, Server, ServerConfig};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "courier-server")]
#[command(about = "Socket message broker with request/response, pub/sub and queues")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "33333")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Listen on a Unix domain socket instead of TCP
    #[arg(long)]
    unix_socket: Option<PathBuf>,

    /// JSON file with a full server configuration; flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Require encrypted sessions
    #[arg(long)]
    encrypt: bool,

    /// Directory for durable queue logs (enables durable queues)
    #[arg(long)]
    wal_dir: Option<PathBuf>,

    #[arg(long)]
    max_connections: Option<usize>,

    /// Heartbeat interval announced to clients, in seconds
    #[arg(long)]
    heartbeat_interval: Option<u64>,

    /// Compress payloads of at least this many bytes (-1 = off)
    #[arg(long, allow_negative_numbers = true)]
    compress_cutoff: Option<i64>,

    /// Require clients to authenticate as this user
    #[arg(long, requires = "password")]
    user: Option<String>,

    #[arg(long, requires = "user")]
    password: Option<String>,
}

impl Args {
    fn server_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("Invalid server configuration in {}", path.display()))?
            }
            None => ServerConfig::default(),
        };

        config.endpoint = self.endpoint()?;
        config.encrypt |= self.encrypt;
        if let Some(dir) = &self.wal_dir {
            config.wal_dir = Some(dir.clone());
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
        if let Some(secs) = self.heartbeat_interval {
            config.heartbeat_interval_secs = secs;
        }
        if let Some(cutoff) = self.compress_cutoff {
            config.compress_cutoff_size = cutoff;
        }
        Ok(config)
    }

    fn endpoint(&self) -> Result<Endpoint> {
        match &self.unix_socket {
            #[cfg(unix)]
            Some(path) => Ok(Endpoint::Unix(path.clone())),
            #[cfg(not(unix))]
            Some(_) => bail!("Unix domain sockets are not supported on this platform"),
            None => Ok(Endpoint::Tcp(SocketAddr::new(self.host, self.port))),
        }
    }

    fn authenticator(&self) -> Result<Authenticator> {
        match (&self.user, &self.password) {
            (Some(user), Some(password)) => Ok(Authenticator::none().with_user(user, password)),
            (None, None) => Ok(Authenticator::none()),
            _ => bail!("--user and --password must be given together"),
        }
    }
}

fn echo(request: Message) -> courier_core::Result<Message> {
    Ok(request)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting Courier Server");

    let config = args.server_config()?;
    let authenticator = args.authenticator()?;
    let server = Server::new(config)
        .with_authenticator(authenticator)
        .start(echo)
        .await?;

    // Print the bound endpoint for launchers that start with port 0
    println!("COURIER_ENDPOINT={}", server.endpoint());

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    server.stop().await;

    Ok(())
}
