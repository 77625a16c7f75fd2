use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::config::{
    DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_OUTBOUND_CAPACITY, DEFAULT_PROGRESS_INTERVAL,
    DEFAULT_WRITE_TIMEOUT, RelayConfig,
};

pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8080/ws";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, accepting WebSocket clients on /ws.
    Serve(ServeArgs),
    /// Send one file to an online user.
    Send(SendArgs),
    /// Stay online and save files other users send.
    Receive(ReceiveArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// Seconds a relayed write may wait on a slow recipient.
    #[arg(long, default_value_t = DEFAULT_WRITE_TIMEOUT.as_secs())]
    pub write_timeout_secs: u64,

    /// Largest WebSocket message accepted from a client, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    pub max_message_size: usize,

    /// Frames buffered per connection before writers wait.
    #[arg(long, default_value_t = DEFAULT_OUTBOUND_CAPACITY)]
    pub outbound_capacity: usize,
}

impl From<&ServeArgs> for RelayConfig {
    fn from(args: &ServeArgs) -> Self {
        RelayConfig {
            write_timeout: Duration::from_secs(args.write_timeout_secs),
            max_message_size: args.max_message_size,
            outbound_capacity: args.outbound_capacity,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct SendArgs {
    /// Username to connect as.
    #[arg(long)]
    pub username: String,

    /// Username of the recipient.
    #[arg(long)]
    pub to: String,

    /// File to send.
    #[arg(long)]
    pub file: PathBuf,

    /// WebSocket URL of the relay.
    #[arg(long, default_value = DEFAULT_SERVER_URL)]
    pub server: String,

    /// Bytes per binary frame; keep below the relay's message limit.
    #[arg(long, default_value_t = 64 * 1024)]
    pub chunk_size: usize,

    /// MIME type announced in file-start.
    #[arg(long, default_value = "application/octet-stream")]
    pub content_type: String,

    /// Seconds to wait for the recipient to show up in the roster.
    #[arg(long, default_value_t = 10)]
    pub wait_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ReceiveArgs {
    /// Username to connect as.
    #[arg(long)]
    pub username: String,

    /// Directory received files are written to.
    #[arg(long, default_value = ".")]
    pub out_dir: PathBuf,

    /// WebSocket URL of the relay.
    #[arg(long, default_value = DEFAULT_SERVER_URL)]
    pub server: String,

    /// Exit after the first complete file.
    #[arg(long)]
    pub once: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_flags_become_relay_config() {
        let cli = Cli::parse_from([
            "file_relay",
            "serve",
            "--listen",
            "0.0.0.0:9000",
            "--write-timeout-secs",
            "3",
        ]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };

        assert_eq!(args.listen, "0.0.0.0:9000".parse::<SocketAddr>().expect("addr"));
        let config = RelayConfig::from(&args);
        assert_eq!(config.write_timeout, Duration::from_secs(3));
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
    }

    #[test]
    fn send_requires_recipient_and_file() {
        assert!(Cli::try_parse_from(["file_relay", "send", "--username", "alice"]).is_err());

        let cli = Cli::parse_from([
            "file_relay",
            "send",
            "--username",
            "alice",
            "--to",
            "bob",
            "--file",
            "notes.txt",
        ]);
        let Command::Send(args) = cli.command else {
            panic!("expected send");
        };
        assert_eq!(args.server, DEFAULT_SERVER_URL);
        assert_eq!(args.chunk_size, 64 * 1024);
    }
}
