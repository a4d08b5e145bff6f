use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    num::NonZeroUsize,
    time::Duration,
};

use clap::{Args, Parser, Subcommand};

use crate::{line::DEFAULT_MAX_LINE_BYTES, listener::ListenerConfig};

pub const DEFAULT_PORT: u16 = 5000;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, rebroadcasting every received line to all clients.
    Server(ServerArgs),
    /// Connect to a relay server and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Interface address to listen on.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub host: IpAddr,

    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(long, env = "SERVER_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Longest accepted line in bytes; a client sending more is disconnected.
    #[arg(long, default_value_t = DEFAULT_MAX_LINE_BYTES)]
    pub max_line_bytes: usize,

    /// Maximum number of simultaneously connected clients. Unlimited when omitted.
    #[arg(long)]
    pub max_connections: Option<NonZeroUsize>,

    /// Milliseconds to wait for clients to drain on shutdown.
    #[arg(long, default_value_t = 5000)]
    pub drain_timeout_ms: u64,
}

impl ServerArgs {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            max_line_bytes: self.max_line_bytes,
            max_connections: self.max_connections,
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Display name prefixed to every message you send.
    #[arg(long)]
    pub name: String,

    /// Host name or address of the relay server.
    #[arg(long, env = "CHAT_SERVER_HOST", default_value = "localhost")]
    pub host: String,

    /// Port of the relay server.
    #[arg(long, env = "CHAT_SERVER_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,
}

impl ClientArgs {
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
