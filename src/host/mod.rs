//! # Host Module
//!
//! A minimal host application for the sharing server. It shares whatever is
//! piped into it: every chunk read from stdin is broadcast as terminal output,
//! and input sent by viewers of an interactive session is written to stdout.
//!
//! ```bash
//! # Share a read-only stream
//! tail -f build.log | termshare serve --session-id build --token s3cret
//!
//! # Interactive, password protected, expiring after an hour
//! termshare serve --mode interactive --password pw --expires-in 60
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::select;
use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

use crate::clock::SystemClock;
use crate::config::ServerConfig;
use crate::events::{self, ShareEvent};
use crate::server::SessionSharingServer;
use crate::session::SessionMode;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "termshare host - share piped terminal output with remote viewers"
)]
pub struct Args {
    /// Host to bind the sharing server to
    ///
    /// Use `0.0.0.0` to accept viewers from the local network.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port for the sharing server (`0` picks a free port)
    #[arg(long, default_value_t = 8390)]
    pub port: u16,

    /// Session identifier viewers join with (random when omitted)
    #[arg(long)]
    pub session_id: Option<String>,

    /// Shared token viewers must present (random when omitted)
    #[arg(long)]
    pub token: Option<String>,

    /// Whether viewers may send input
    #[arg(long, value_enum, default_value_t = SessionMode::ReadOnly)]
    pub mode: SessionMode,

    /// Optional password viewers must also present
    #[arg(long)]
    pub password: Option<String>,

    /// Minutes until the session expires
    #[arg(long)]
    pub expires_in: Option<u32>,

    /// Externally reachable URL to advertise, e.g. from a tunnel
    #[arg(long)]
    pub public_url: Option<String>,

    /// Seconds between background sweeps of expired sessions
    #[arg(long)]
    pub sweep_interval: Option<u64>,

    /// Print the configuration without starting the server
    #[arg(long, default_value_t = false)]
    pub no_auto_start: bool,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            sweep_interval: self.sweep_interval.map(Duration::from_secs),
            ..ServerConfig::default()
        }
    }
}

/// Runs the sharing server for one session until stdin ends or Ctrl+C.
pub async fn run_host(args: Args) -> Result<()> {
    if args.no_auto_start {
        println!("Auto-start disabled, not starting the sharing server.");
        println!("Would listen on {}:{} (mode: {})", args.host, args.port, args.mode);
        return Ok(());
    }

    let (events_tx, mut events_rx) = events::channel();
    let server =
        SessionSharingServer::with_config(events_tx, args.server_config(), SystemClock::shared());

    server.start(args.port, &args.host).await?;
    server.set_public_url(args.public_url.clone());

    let session_id = args
        .session_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let token = args
        .token
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    server.register_session(
        &session_id,
        &token,
        args.mode,
        args.password.as_deref(),
        args.expires_in,
    );

    let url = server.websocket_url(true);
    println!("=== termshare Session Shared ===");
    println!("Session ID: {session_id}");
    println!("Token: {token}");
    println!("Mode: {}", args.mode);
    println!("Connect: {url}");
    if let Some(network_url) = server.network_url() {
        println!("Local network: {network_url}");
    }
    println!("View with: termshare view --url {url} --session-id {session_id} --token {token}");
    println!("================================");

    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .unwrap_or_else(|e| {
        eprintln!("Failed to set signal handler: {e}");
    });

    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut buffer = vec![0u8; 4096];

    loop {
        select! {
            read = stdin.read(&mut buffer) => match read {
                Ok(0) => {
                    info!("Input stream ended, closing session {}", session_id);
                    break;
                }
                Ok(n) => server.broadcast_output(&session_id, &buffer[..n]),
                Err(e) => {
                    error!("Failed to read input stream: {}", e);
                    break;
                }
            },
            Some(event) = events_rx.recv() => {
                if event.session_id() != session_id {
                    continue;
                }
                match event {
                    ShareEvent::InputReceived { data, .. } => {
                        stdout
                            .write_all(&data)
                            .await
                            .context("Failed to write viewer input")?;
                        stdout.flush().await?;
                    }
                    ShareEvent::ViewerJoined { session_id, count } => {
                        info!("Viewer joined session {} ({} watching)", session_id, count);
                    }
                    ShareEvent::ViewerLeft { session_id, count } => {
                        info!("Viewer left session {} ({} watching)", session_id, count);
                    }
                }
            }
            _ = stop_rx.recv() => {
                info!("Interrupted, closing session {}", session_id);
                break;
            }
        }
    }

    server.unregister_session(&session_id);
    server.stop().await;
    Ok(())
}
