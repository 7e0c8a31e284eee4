//! # termshare - Terminal Session Sharing Relay
//!
//! termshare lets a host application share a running terminal session with
//! remote viewers. The host registers sessions and pushes terminal output in;
//! viewers connect over WebSocket, authenticate with a token (and optional
//! password), and receive the output stream. Interactive sessions also pass
//! viewer keystrokes back to the host.
//!
//! ## Quick Start
//!
//! ```bash
//! # Share whatever a command prints
//! htop | termshare serve --session-id demo --token secret --mode read-only
//!
//! # Watch it from another terminal
//! termshare view --session-id demo --token secret
//! ```
//!
//! ## Library Usage
//!
//! ```rust,no_run
//! use termshare::events::{self, ShareEvent};
//! use termshare::server::SessionSharingServer;
//! use termshare::session::SessionMode;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let (events_tx, mut events_rx) = events::channel();
//! let server = SessionSharingServer::new(events_tx);
//!
//! let port = server.start(0, "127.0.0.1").await?;
//! server.register_session("s1", "t1", SessionMode::Interactive, None, Some(30));
//! println!("viewers connect to {}", server.websocket_url(false));
//!
//! server.broadcast_output("s1", b"hello");
//!
//! while let Some(event) = events_rx.recv().await {
//!     if let ShareEvent::InputReceived { data, .. } = event {
//!         // write `data` to the real terminal
//!         # let _ = (data, port);
//!     }
//! }
//! server.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`server`]: the WebSocket relay and session registry
//! - [`session`]: shared session state and viewer handles
//! - [`protocol`]: JSON wire messages and close codes
//! - [`events`]: notifications delivered to the host
//! - [`clock`]: time source used for session expiry
//! - [`config`]: server tuning
//! - [`host`]: the `serve` command, a minimal host application
//! - [`viewer`]: the `view` command, a terminal viewer client

pub mod clock;
pub mod config;
pub mod events;
pub mod host;
pub mod protocol;
pub mod server;
pub mod session;
pub mod viewer;
