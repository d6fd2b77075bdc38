//! `linewire`: interactive line-protocol client.
//!
//! Connects to a CRLF line-oriented server, prints every line it receives,
//! and forwards each line typed on stdin to the server.
//!
//! # Usage
//!
//! ```text
//! linewire [OPTIONS]
//!
//! Options:
//!   --config  <PATH>   TOML config file [default: linewire.toml]
//!   --host    <HOST>   Server host (overrides the config file)
//!   --port    <PORT>   Server port (overrides the config file)
//!   --timeout <SECS>   Connect timeout in seconds (overrides the config file)
//!   --irc              Parse lines as IRC and answer server PINGs
//! ```
//!
//! The session ends on Ctrl-C, on end of stdin, or when the server closes
//! the connection.  There is no automatic reconnect.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use linewire_client::{load_config, ClientConfig, Connection};
use linewire_core::{Decoder, IrcDecoder, IrcMessage, MessageListener, Utf8Decoder};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Interactive client for CRLF line-oriented TCP servers.
#[derive(Debug, Parser)]
#[command(name = "linewire", version)]
struct Cli {
    /// Path to the TOML config file.  A missing file means defaults.
    #[arg(long, default_value = "linewire.toml", env = "LINEWIRE_CONFIG")]
    config: PathBuf,

    /// Server host name or IP address.
    #[arg(long, env = "LINEWIRE_HOST")]
    host: Option<String>,

    /// Server TCP port.
    #[arg(long, env = "LINEWIRE_PORT")]
    port: Option<u16>,

    /// Connect timeout in seconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Decode lines as IRC messages and reply to PING automatically.
    #[arg(long)]
    irc: bool,
}

impl Cli {
    /// Loads the config file and applies command-line overrides on top.
    fn resolve_config(&self) -> anyhow::Result<ClientConfig> {
        let mut cfg = load_config(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))?;
        if let Some(host) = &self.host {
            cfg.server.host = host.clone();
        }
        if let Some(port) = self.port {
            cfg.server.port = port;
        }
        if let Some(timeout) = self.timeout {
            cfg.connection.connect_timeout_secs = timeout;
        }
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = cli.resolve_config()?;

    // Initialise structured logging.  RUST_LOG wins over the config file.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&cfg.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("linewire starting");

    if cli.irc {
        let conn = Connection::with_config(IrcDecoder, cfg.connection.clone());
        add_irc_listeners(&conn);
        run(conn, &cfg).await
    } else {
        let conn = Connection::with_config(Utf8Decoder, cfg.connection.clone());
        conn.add_listener(MessageListener::accept_all(|line: &String| println!("{line}")).shared());
        run(conn, &cfg).await
    }
}

/// Prints every IRC message and answers `PING` with the matching `PONG`.
fn add_irc_listeners(conn: &Connection<IrcDecoder>) {
    conn.add_listener(MessageListener::accept_all(|msg: &IrcMessage| println!("{msg}")).shared());

    let sender = conn.sender();
    conn.add_listener(
        MessageListener::new(
            |msg: &IrcMessage| msg.is_ping(),
            move |msg: &IrcMessage| {
                let token = msg.ping_token().unwrap_or_default().to_string();
                let sender = sender.clone();
                // Listeners run on the receive task and must not block it.
                tokio::spawn(async move {
                    if let Err(e) = sender.send_line(&format!("PONG :{token}")).await {
                        warn!("failed to answer PING: {e}");
                    }
                });
            },
        )
        .shared(),
    );
}

/// Connects, then pumps stdin to the server until the session ends.
async fn run<D: Decoder>(conn: Connection<D>, cfg: &ClientConfig) -> anyhow::Result<()> {
    let host = &cfg.server.host;
    let port = cfg.server.port;

    conn.connect(host, port, cfg.connection.connect_timeout())
        .await
        .with_context(|| format!("connecting to {host}:{port}"))?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut liveness = tokio::time::interval(Duration::from_millis(250));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            line = stdin.next_line() => match line {
                Ok(Some(line)) => {
                    if let Err(e) = conn.send_line(&line).await {
                        error!("send failed: {e}");
                        break;
                    }
                }
                Ok(None) => {
                    info!("stdin closed");
                    break;
                }
                Err(e) => {
                    error!("reading stdin failed: {e}");
                    break;
                }
            },
            _ = liveness.tick() => {
                if !conn.is_alive() {
                    info!("server closed the connection");
                    break;
                }
            }
        }
    }

    conn.disconnect().await;
    info!("linewire stopped");
    Ok(())
}
