use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{
    protocol::DEFAULT_MAX_LINE_BYTES,
    server::{DEFAULT_QUEUE_CAPACITY, ServerConfig},
    session::SessionConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, echoing every line to all connected clients.
    Server(ServerArgs),
    /// Connect to a relay server and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address to listen on. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:12345")]
    pub listen: SocketAddr,

    /// Longest line a client may send before it is disconnected.
    #[arg(long, default_value_t = DEFAULT_MAX_LINE_BYTES)]
    pub max_line_bytes: usize,

    /// Messages buffered per client before a slow client is dropped.
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// How long a single write to a client may stall.
    #[arg(long, default_value_t = 5000)]
    pub write_timeout_ms: u64,

    /// Relay the first line too instead of reading it as a display name.
    #[arg(long)]
    pub no_handshake: bool,
}

impl ServerArgs {
    pub fn config(&self) -> ServerConfig {
        ServerConfig {
            queue_capacity: self.queue_capacity,
            session: SessionConfig {
                max_line_bytes: self.max_line_bytes,
                write_timeout: Duration::from_millis(self.write_timeout_ms),
                handshake: !self.no_handshake,
            },
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Host name or address of the relay server.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port of the relay server.
    #[arg(long, default_value_t = 12345)]
    pub port: u16,

    /// Display name sent on connect. Prompted for when omitted.
    #[arg(long)]
    pub name: Option<String>,
}
