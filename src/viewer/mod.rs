//! # Viewer Module
//!
//! Terminal client for a shared session. It joins over WebSocket, writes the
//! relayed output straight to stdout in raw mode and, when the session is
//! interactive, forwards every keystroke back as an `input` message.
//!
//! Press `Ctrl+]` to leave the session.

use anyhow::{Context, Result, bail};
use clap::Parser;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::io::{Read, Write};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{info, warn};

use crate::protocol::{ClientMessage, ServerMessage, decode_payload, encode_payload};
use crate::session::SessionMode;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// `Ctrl+]`, the usual telnet-style escape.
const DETACH_KEY: u8 = 0x1d;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "termshare viewer - watch or drive a shared terminal session"
)]
pub struct Args {
    /// WebSocket URL of the sharing server
    #[arg(long, default_value = "ws://127.0.0.1:8390/session")]
    pub url: String,

    /// Session to join
    #[arg(long)]
    pub session_id: String,

    /// Token the host shared for this session
    #[arg(long)]
    pub token: String,

    /// Session password, if the host set one
    #[arg(long)]
    pub password: Option<String>,
}

/// Joins the session and relays it to this terminal until either side closes.
pub async fn run_viewer(args: Args) -> Result<()> {
    info!("Connecting to sharing server: {}", args.url);
    let (ws_stream, _) = connect_async(args.url.as_str())
        .await
        .with_context(|| format!("Failed to connect to {}", args.url))?;
    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    send(
        &mut ws_sink,
        &ClientMessage::Join {
            session_id: args.session_id.clone(),
            token: args.token.clone(),
            password: args.password.clone(),
        },
    )
    .await?;

    let (mode, viewer_count) = wait_for_join(&mut ws_stream).await?;
    info!(
        "Joined session {} (mode: {}, viewers: {})",
        args.session_id, mode, viewer_count
    );

    println!("=== Joined session {} ({}) ===", args.session_id, mode);
    println!("Press Ctrl+] to leave.");
    println!("==============================");

    enable_raw_mode().unwrap_or_else(|e| {
        eprintln!("Failed to enable raw mode: {e}");
    });

    ctrlc::set_handler(move || {
        let _ = disable_raw_mode();
        std::process::exit(0);
    })
    .unwrap_or_else(|e| {
        eprintln!("Failed to set signal handler: {e}");
    });

    let (stdin_tx, stdin_rx) = mpsc::channel::<u8>(1024);
    let stdin_task = tokio::task::spawn_blocking(move || {
        let mut stdin = std::io::stdin();
        let mut buffer = [0u8; 1];
        while stdin.read_exact(&mut buffer).is_ok() {
            if stdin_tx.blocking_send(buffer[0]).is_err() {
                break;
            }
        }
    });

    let result = relay(
        &mut ws_sink,
        &mut ws_stream,
        stdin_rx,
        &args.session_id,
        mode,
    )
    .await;

    stdin_task.abort();
    let _ = ws_sink.send(Message::Close(None)).await;
    let _ = ws_sink.close().await;
    let _ = disable_raw_mode();

    print!("\r\n");
    let _ = std::io::stdout().flush();

    result
}

async fn wait_for_join(ws_stream: &mut SplitStream<WsStream>) -> Result<(SessionMode, usize)> {
    while let Some(msg) = ws_stream.next().await {
        match msg.context("Connection error while joining")? {
            Message::Text(text) => match serde_json::from_str::<ServerMessage>(text.as_str()) {
                Ok(ServerMessage::Joined {
                    mode, viewer_count, ..
                }) => return Ok((mode, viewer_count)),
                Ok(ServerMessage::Error { message }) => bail!("Join rejected: {message}"),
                Ok(ServerMessage::Output { .. }) => {}
                Err(e) => warn!("Ignoring unreadable server message: {}", e),
            },
            Message::Close(frame) => bail!("Server closed the connection{}", describe(frame)),
            _ => {}
        }
    }
    bail!("Connection closed before the session was joined")
}

async fn relay(
    ws_sink: &mut SplitSink<WsStream, Message>,
    ws_stream: &mut SplitStream<WsStream>,
    mut stdin_rx: mpsc::Receiver<u8>,
    session_id: &str,
    mode: SessionMode,
) -> Result<()> {
    let mut stdout = std::io::stdout();

    loop {
        select! {
            msg = ws_stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ServerMessage>(text.as_str()) {
                        Ok(ServerMessage::Output { data }) => match decode_payload(&data) {
                            Ok(bytes) => {
                                stdout.write_all(&bytes)?;
                                stdout.flush()?;
                            }
                            Err(e) => warn!("Dropping undecodable output: {}", e),
                        },
                        Ok(ServerMessage::Error { message }) => {
                            warn!("Server error for session {}: {}", session_id, message);
                        }
                        Ok(ServerMessage::Joined { .. }) => {}
                        Err(e) => warn!("Ignoring unreadable server message: {}", e),
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!("Session {} closed by server{}", session_id, describe(frame));
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e).context("Connection to sharing server failed"),
                None => return Ok(()),
            },
            Some(byte) = stdin_rx.recv() => {
                if byte == DETACH_KEY {
                    info!("Leaving session {}", session_id);
                    return Ok(());
                }
                if mode == SessionMode::Interactive {
                    send(
                        ws_sink,
                        &ClientMessage::Input {
                            session_id: session_id.to_string(),
                            data: encode_payload(&[byte]),
                        },
                    )
                    .await?;
                }
            }
        }
    }
}

async fn send(ws_sink: &mut SplitSink<WsStream, Message>, msg: &ClientMessage) -> Result<()> {
    let text = serde_json::to_string(msg)?;
    ws_sink
        .send(Message::Text(text.into()))
        .await
        .context("Failed to send message to sharing server")
}

fn describe(frame: Option<CloseFrame>) -> String {
    match frame {
        Some(frame) if frame.reason.is_empty() => format!(" (code {})", u16::from(frame.code)),
        Some(frame) => format!(" (code {}: {})", u16::from(frame.code), frame.reason.as_str()),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    #[test]
    fn close_frames_are_described() {
        assert_eq!(describe(None), "");
        assert_eq!(
            describe(Some(CloseFrame {
                code: CloseCode::Policy,
                reason: "Invalid token".into(),
            })),
            " (code 1008: Invalid token)"
        );
        assert_eq!(
            describe(Some(CloseFrame {
                code: CloseCode::Unsupported,
                reason: "".into(),
            })),
            " (code 1003)"
        );
    }

    #[test]
    fn url_defaults_to_local_server() {
        let args = Args::parse_from(["view", "--session-id", "s1", "--token", "t1"]);
        assert_eq!(args.url, "ws://127.0.0.1:8390/session");
        assert!(args.password.is_none());
    }
}
