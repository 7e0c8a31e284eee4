//! # Session Sharing Server
//!
//! Relays the output of locally running terminal sessions to remote viewers
//! over a single WebSocket endpoint, and hands viewer keystrokes back to the
//! host for interactive sessions.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐  register / output  ┌─────────────────┐   WebSocket    ┌─────────────────┐
//! │  Host           │────────────────────►│  Sharing Server │◄──────────────►│  Viewers        │
//! │  Application    │                     │                 │   /session     │                 │
//! │                 │◄────────────────────│  - Registry     │                │  join / input   │
//! └─────────────────┘   ShareEvent chan   │  - Auth & Mode  │                └─────────────────┘
//!                                         │  - Fan-out      │
//!                                         └─────────────────┘
//! ```
//!
//! ## Sessions
//!
//! - **Registration**: the host registers an id, token, mode and optional
//!   password/TTL. Registering an existing id replaces it.
//! - **Expiry**: checked when a session is touched (join, broadcast, input,
//!   disconnect) and swept before every registration and active-count query.
//!   An optional periodic sweep can be enabled through [`ServerConfig`].
//! - **Teardown**: unregistering closes every viewer before the entry goes away.
//!
//! ## Concurrency
//!
//! The registry is a [`DashMap`]; each session's viewer set lives inside its
//! entry and is only touched under that entry's lock. No registry guard is held
//! across an `.await`, and every public registry operation is synchronous.

mod connection;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::get;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::fmt;
use std::net::{IpAddr, UdpSocket};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::clock::{SharedClock, SystemClock};
use crate::config::ServerConfig;
use crate::events::{EventSender, ShareEvent};
use crate::protocol::{SESSION_PATH, ServerMessage};
use crate::session::{SessionMode, SharedSession, ViewerHandle, ViewerId};

use connection::{AppState, handle_session_ws};

type SessionMap = DashMap<String, SharedSession>;

/// Reasons a `join` is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinRejection {
    NotFound,
    InvalidToken,
    Expired,
    InvalidPassword,
    AlreadyJoined,
}

impl JoinRejection {
    /// Text carried in the `error` reply.
    pub fn message(&self) -> &'static str {
        match self {
            JoinRejection::NotFound => "Session not found",
            JoinRejection::InvalidToken => "Invalid token",
            JoinRejection::Expired => "Session expired",
            JoinRejection::InvalidPassword => "Invalid password",
            JoinRejection::AlreadyJoined => "Already joined a session",
        }
    }

    /// Every rejection except a repeated join ends the connection.
    pub fn closes_connection(&self) -> bool {
        !matches!(self, JoinRejection::AlreadyJoined)
    }
}

impl fmt::Display for JoinRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for JoinRejection {}

#[derive(Debug, Default)]
struct Status {
    started: bool,
    port: u16,
    host: String,
    public_url: Option<String>,
}

/// Everything `stop` needs to tear a running listener down.
struct Listener {
    shutdown: watch::Sender<bool>,
    serve_task: JoinHandle<()>,
    sweep_task: Option<JoinHandle<()>>,
    /// Yields `None` once the router and every connection task have dropped
    /// their drain sender.
    drained: mpsc::Receiver<()>,
}

struct Inner {
    sessions: SessionMap,
    events: EventSender,
    clock: SharedClock,
    config: ServerConfig,
    listener: Mutex<Option<Listener>>,
    status: RwLock<Status>,
}

/// Handle to the sharing server. Cloning is cheap and every clone drives the
/// same registry and listener.
#[derive(Clone)]
pub struct SessionSharingServer {
    inner: Arc<Inner>,
}

impl SessionSharingServer {
    pub fn new(events: EventSender) -> Self {
        Self::with_config(events, ServerConfig::default(), SystemClock::shared())
    }

    pub fn with_config(events: EventSender, config: ServerConfig, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: DashMap::new(),
                events,
                clock,
                config,
                listener: Mutex::new(None),
                status: RwLock::new(Status::default()),
            }),
        }
    }

    /// Binds the WebSocket endpoint and starts accepting viewers.
    ///
    /// Calling this while already started returns the bound port without
    /// rebinding. Pass port `0` for an OS-assigned port.
    pub async fn start(&self, port: u16, host: &str) -> Result<u16> {
        let mut slot = self.inner.listener.lock().await;
        if slot.is_some() {
            return Ok(self.port());
        }

        let listener = TcpListener::bind((host, port))
            .await
            .with_context(|| format!("Failed to bind session sharing server to {host}:{port}"))?;
        let bound_port = listener
            .local_addr()
            .context("Failed to read bound address")?
            .port();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (drain_tx, drained) = mpsc::channel(1);

        let app = Router::new()
            .route(SESSION_PATH, get(handle_session_ws))
            .with_state(AppState {
                server: self.clone(),
                shutdown: shutdown_rx.clone(),
                drain: drain_tx,
            });

        let mut serve_shutdown = shutdown_rx.clone();
        let serve_task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = serve_shutdown.changed().await;
                })
                .await;
            if let Err(e) = result {
                error!("Session sharing server error: {:?}", e);
            }
        });

        let sweep_task = self
            .inner
            .config
            .sweep_interval
            .map(|period| self.spawn_sweeper(period, shutdown_rx));

        {
            let mut status = self.status_mut();
            status.started = true;
            status.port = bound_port;
            status.host = host.to_string();
        }

        *slot = Some(Listener {
            shutdown: shutdown_tx,
            serve_task,
            sweep_task,
            drained,
        });

        info!(
            "Session sharing server listening on ws://localhost:{}{}",
            bound_port, SESSION_PATH
        );
        if is_wildcard(host) {
            match self.network_url() {
                Some(url) => info!("Viewers on the local network can connect to {}", url),
                None => info!(
                    "Viewers on the local network can connect to ws://<your-ip>:{}{}",
                    bound_port, SESSION_PATH
                ),
            }
        }

        Ok(bound_port)
    }

    /// Closes the listener and every connection, then clears the registry.
    ///
    /// Waits for both the HTTP listener and the open WebSocket connections to
    /// finish (bounded by the configured shutdown timeout) before clearing.
    pub async fn stop(&self) {
        let mut slot = self.inner.listener.lock().await;

        if let Some(listener) = slot.take() {
            let Listener {
                shutdown,
                serve_task,
                sweep_task,
                mut drained,
            } = listener;

            let _ = shutdown.send(true);
            if let Some(sweep_task) = sweep_task {
                sweep_task.abort();
            }

            let abort = serve_task.abort_handle();
            let closed = async move {
                if let Err(e) = serve_task.await {
                    warn!("Session sharing listener task ended abnormally: {}", e);
                }
                // Resolves once every connection task has dropped its sender.
                let _ = drained.recv().await;
            };

            if tokio::time::timeout(self.inner.config.shutdown_timeout, closed)
                .await
                .is_err()
            {
                warn!(
                    "Session sharing server did not close within {:?}, aborting listener",
                    self.inner.config.shutdown_timeout
                );
                abort.abort();
            }

            info!("Session sharing server stopped");
        }

        self.clear_sessions();

        let mut status = self.status_mut();
        status.started = false;
        status.port = 0;
        status.public_url = None;
    }

    /// Registers (or replaces) a shared session.
    ///
    /// `expires_in_minutes` sets a TTL measured from now; without it the
    /// session lives until unregistered or the server stops.
    pub fn register_session(
        &self,
        session_id: &str,
        token: &str,
        mode: SessionMode,
        password: Option<&str>,
        expires_in_minutes: Option<u32>,
    ) {
        self.cleanup_expired_sessions();

        let now = self.now();
        let expires_at =
            expires_in_minutes.map(|minutes| now + Duration::minutes(i64::from(minutes)));
        let session = SharedSession::new(
            session_id.to_string(),
            token.to_string(),
            mode,
            password.map(str::to_string),
            now,
            expires_at,
        );
        let has_password = session.has_password();

        if let Some(previous) = self.inner.sessions.insert(session_id.to_string(), session) {
            info!(
                "Replacing existing session {} ({} viewers disconnected)",
                previous.id,
                previous.viewer_count()
            );
            previous.close_viewers();
        }

        info!(
            "Registered session {} (mode: {}, has_password: {}, expires_at: {:?}, total sessions: {})",
            session_id,
            mode,
            has_password,
            expires_at,
            self.inner.sessions.len()
        );
    }

    /// Closes every viewer of the session and forgets it. Unknown ids are ignored.
    pub fn unregister_session(&self, session_id: &str) {
        if let Some((_, session)) = self.inner.sessions.remove(session_id) {
            session.close_viewers();
            info!(
                "Unregistered session {} ({} viewers closed, total sessions: {})",
                session.id,
                session.viewer_count(),
                self.inner.sessions.len()
            );
        }
    }

    /// Sends terminal output to every open viewer of the session.
    pub fn broadcast_output(&self, session_id: &str, data: &[u8]) {
        let now = self.now();
        let expired = {
            let Some(session) = self.inner.sessions.get(session_id) else {
                return;
            };
            if session.viewer_count() == 0 {
                return;
            }

            if session.is_expired(now) {
                true
            } else {
                let text = ServerMessage::output(data).to_json();
                let mut delivered = 0;
                for viewer in session.viewers().filter(|viewer| viewer.is_open()) {
                    if viewer.send_text(text.clone()) {
                        delivered += 1;
                    }
                }
                debug!(
                    "Forwarded {} bytes to {} viewers for session: {}",
                    data.len(),
                    delivered,
                    session_id
                );
                false
            }
        };

        if expired {
            self.expire_session(session_id, now);
        }
    }

    /// Passes viewer input on to the host.
    ///
    /// Returns whether the input was accepted: the session must exist, be
    /// interactive, not be expired, and have `viewer` attached.
    pub fn forward_input(&self, session_id: &str, data: Vec<u8>, viewer: &ViewerId) -> bool {
        let now = self.now();
        let is_member = {
            let Some(session) = self.inner.sessions.get(session_id) else {
                return false;
            };
            if session.mode != SessionMode::Interactive {
                return false;
            }
            if session.is_expired(now) {
                None
            } else {
                Some(session.has_viewer(viewer))
            }
        };

        match is_member {
            None => {
                self.expire_session(session_id, now);
                false
            }
            Some(false) => false,
            Some(true) => {
                debug!(
                    "Received {} bytes of input from viewer {} for session: {}",
                    data.len(),
                    viewer,
                    session_id
                );
                self.emit(ShareEvent::InputReceived {
                    session_id: session_id.to_string(),
                    data,
                });
                true
            }
        }
    }

    /// Number of live viewers. Viewers whose connection already went away are
    /// dropped from the set first.
    pub fn viewer_count(&self, session_id: &str) -> usize {
        match self.inner.sessions.get_mut(session_id) {
            Some(mut session) => {
                let pruned = session.prune_closed_viewers();
                if pruned > 0 {
                    debug!("Pruned {} stale viewers from session {}", pruned, session_id);
                }
                session.viewer_count()
            }
            None => 0,
        }
    }

    pub fn active_session_count(&self) -> usize {
        self.cleanup_expired_sessions();
        self.inner.sessions.len()
    }

    pub fn session_mode(&self, session_id: &str) -> Option<SessionMode> {
        self.inner.sessions.get(session_id).map(|session| session.mode)
    }

    /// Unregisters every session whose expiry has passed. Returns how many went.
    pub fn cleanup_expired_sessions(&self) -> usize {
        let now = self.now();
        let expired: Vec<String> = self
            .inner
            .sessions
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        expired
            .iter()
            .filter(|session_id| self.expire_session(session_id, now))
            .count()
    }

    /// Validates a join and attaches the viewer. Returns the session mode and
    /// the viewer count including the new viewer.
    ///
    /// Checks run in order (existence, token, expiry, password) under the
    /// session's entry lock, and the `joined` reply is queued on `handle`
    /// before that lock is released, so it always reaches the viewer ahead of
    /// any broadcast output.
    pub fn join_session(
        &self,
        session_id: &str,
        token: &str,
        password: Option<&str>,
        viewer_id: ViewerId,
        handle: ViewerHandle,
    ) -> Result<(SessionMode, usize), JoinRejection> {
        let now = self.now();
        let joined = {
            let Some(mut session) = self.inner.sessions.get_mut(session_id) else {
                return Err(JoinRejection::NotFound);
            };
            if !session.token_matches(token) {
                return Err(JoinRejection::InvalidToken);
            }
            if session.is_expired(now) {
                None
            } else {
                if !session.password_matches(password) {
                    return Err(JoinRejection::InvalidPassword);
                }
                let count = session.add_viewer(viewer_id, handle.clone());
                handle.send_text(
                    ServerMessage::Joined {
                        session_id: session_id.to_string(),
                        mode: session.mode,
                        viewer_count: count,
                    }
                    .to_json(),
                );
                Some((session.mode, count))
            }
        };

        let Some((mode, count)) = joined else {
            self.expire_session(session_id, now);
            return Err(JoinRejection::Expired);
        };

        info!(
            "Viewer {} joined session {} (mode: {}, viewers: {})",
            viewer_id, session_id, mode, count
        );
        self.emit(ShareEvent::ViewerJoined {
            session_id: session_id.to_string(),
            count,
        });
        Ok((mode, count))
    }

    /// Detaches a viewer after its connection closed.
    pub(crate) fn leave_session(&self, session_id: &str, viewer_id: &ViewerId) {
        let now = self.now();
        let (count, expired) = {
            let Some(mut session) = self.inner.sessions.get_mut(session_id) else {
                return;
            };
            if !session.remove_viewer(viewer_id) {
                return;
            }
            let count = session.viewer_count();
            (count, count == 0 && session.is_expired(now))
        };

        info!(
            "Viewer {} left session {} (viewers: {})",
            viewer_id, session_id, count
        );
        self.emit(ShareEvent::ViewerLeft {
            session_id: session_id.to_string(),
            count,
        });

        if expired {
            self.expire_session(session_id, now);
        }
    }

    pub fn port(&self) -> u16 {
        self.status().port
    }

    pub fn host(&self) -> String {
        self.status().host.clone()
    }

    pub fn is_started(&self) -> bool {
        self.status().started
    }

    pub fn public_url(&self) -> Option<String> {
        self.status().public_url.clone()
    }

    /// Records an externally reachable URL (for example from a tunnel). Not validated.
    pub fn set_public_url(&self, url: Option<String>) {
        self.status_mut().public_url = url;
    }

    /// URL viewers should connect to.
    ///
    /// With `use_public` and a public URL set, that URL is returned with its
    /// scheme mapped to `ws`/`wss`. Otherwise the local listener address.
    pub fn websocket_url(&self, use_public: bool) -> String {
        if use_public {
            if let Some(public_url) = self.public_url() {
                return to_websocket_url(&public_url);
            }
        }

        let status = self.status();
        let host = if is_wildcard(&status.host) || status.host.is_empty() {
            "localhost".to_string()
        } else {
            bracket_ipv6(&status.host)
        };
        format!("ws://{}:{}{}", host, status.port, SESSION_PATH)
    }

    /// LAN-reachable URL using this machine's outbound IPv4 address.
    pub fn network_url(&self) -> Option<String> {
        let port = {
            let status = self.status();
            if !status.started {
                return None;
            }
            status.port
        };
        lan_address().map(|ip| format!("ws://{ip}:{port}{SESSION_PATH}"))
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    fn emit(&self, event: ShareEvent) {
        if self.inner.events.send(event).is_err() {
            debug!("No host is listening for share events");
        }
    }

    /// Removes the session only if it is still expired at `now`, closing its viewers.
    fn expire_session(&self, session_id: &str, now: DateTime<Utc>) -> bool {
        match self
            .inner
            .sessions
            .remove_if(session_id, |_, session| session.is_expired(now))
        {
            Some((_, session)) => {
                info!(
                    "Session {} expired ({} viewers closed)",
                    session.id,
                    session.viewer_count()
                );
                session.close_viewers();
                true
            }
            None => false,
        }
    }

    fn clear_sessions(&self) {
        let cleared = self.inner.sessions.len();
        self.inner.sessions.retain(|_, session| {
            session.close_viewers();
            false
        });
        if cleared > 0 {
            info!("Cleared {} shared sessions", cleared);
        }
    }

    fn spawn_sweeper(
        &self,
        period: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let expired = server.cleanup_expired_sessions();
                        if expired > 0 {
                            debug!("Periodic sweep removed {} expired sessions", expired);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    fn status(&self) -> RwLockReadGuard<'_, Status> {
        self.inner
            .status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn status_mut(&self) -> std::sync::RwLockWriteGuard<'_, Status> {
        self.inner
            .status
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_wildcard(host: &str) -> bool {
    matches!(host, "0.0.0.0" | "::")
}

fn bracket_ipv6(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

/// Maps `http`/`https` to `ws`/`wss` and points a bare origin at the session path.
/// Anything that does not parse is returned untouched.
fn to_websocket_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return raw.to_string();
    };
    let scheme = match url.scheme() {
        "http" => Some("ws"),
        "https" => Some("wss"),
        "ws" | "wss" => None,
        _ => return raw.to_string(),
    };
    if let Some(scheme) = scheme {
        if url.set_scheme(scheme).is_err() {
            return raw.to_string();
        }
    }
    if url.path() == "/" {
        url.set_path(SESSION_PATH);
    }
    url.to_string()
}

/// Address of the interface the OS would route external traffic through.
/// Connecting a UDP socket sends nothing on the wire.
fn lan_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_loopback() && !ip.is_unspecified()).then_some(ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::{self, EventReceiver};
    use axum::extract::ws::Message;
    use uuid::Uuid;

    fn test_server() -> (SessionSharingServer, EventReceiver, ManualClock) {
        let (tx, rx) = events::channel();
        let clock = ManualClock::default();
        let server = SessionSharingServer::with_config(
            tx,
            ServerConfig::default(),
            Arc::new(clock.clone()),
        );
        (server, rx, clock)
    }

    fn viewer_with_capacity(
        capacity: usize,
    ) -> (ViewerId, ViewerHandle, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Uuid::new_v4(), ViewerHandle::new(tx), rx)
    }

    fn viewer() -> (ViewerId, ViewerHandle, mpsc::Receiver<Message>) {
        viewer_with_capacity(16)
    }

    fn join(
        server: &SessionSharingServer,
        session_id: &str,
        token: &str,
    ) -> (ViewerId, mpsc::Receiver<Message>) {
        let (id, handle, mut rx) = viewer();
        server
            .join_session(session_id, token, None, id, handle)
            .unwrap();
        let joined = expect_text(&mut rx);
        assert!(joined.starts_with(r#"{"type":"joined""#), "{joined}");
        (id, rx)
    }

    fn expect_text(rx: &mut mpsc::Receiver<Message>) -> String {
        match rx.try_recv().unwrap() {
            Message::Text(text) => text.as_str().to_string(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    fn expect_closed(rx: &mut mpsc::Receiver<Message>) {
        assert!(matches!(rx.try_recv(), Ok(Message::Close(_))));
    }

    #[test]
    fn join_returns_registered_mode_and_count() {
        let (server, mut events, _) = test_server();
        server.register_session("s1", "t1", SessionMode::ReadOnly, None, None);

        let (id, handle, mut rx) = viewer();
        let joined = server.join_session("s1", "t1", None, id, handle).unwrap();
        assert_eq!(joined, (SessionMode::ReadOnly, 1));
        assert_eq!(
            expect_text(&mut rx),
            r#"{"type":"joined","sessionId":"s1","mode":"read-only","viewerCount":1}"#
        );
        assert_eq!(
            events.try_recv().unwrap(),
            ShareEvent::ViewerJoined {
                session_id: "s1".to_string(),
                count: 1
            }
        );
    }

    #[test]
    fn join_rejections_in_order() {
        let (server, _events, clock) = test_server();
        server.register_session("s1", "t1", SessionMode::Interactive, Some("pw"), Some(10));

        let attempt = |token: &str, password: Option<&str>, session_id: &str| {
            let (id, handle, _rx) = viewer();
            server.join_session(session_id, token, password, id, handle)
        };

        assert_eq!(attempt("t1", None, "missing"), Err(JoinRejection::NotFound));
        assert_eq!(attempt("nope", Some("pw"), "s1"), Err(JoinRejection::InvalidToken));
        assert_eq!(attempt("t1", None, "s1"), Err(JoinRejection::InvalidPassword));
        assert_eq!(attempt("t1", Some("wrong"), "s1"), Err(JoinRejection::InvalidPassword));
        assert_eq!(server.viewer_count("s1"), 0);
        assert!(attempt("t1", Some("pw"), "s1").is_ok());

        clock.advance(Duration::minutes(11));
        assert_eq!(attempt("t1", Some("pw"), "s1"), Err(JoinRejection::Expired));
        assert_eq!(server.session_mode("s1"), None);
    }

    #[test]
    fn password_must_match_every_byte() {
        let (server, _events, _) = test_server();
        let prefix = "a".repeat(72);
        let password = format!("{prefix}X");
        server.register_session("s1", "t1", SessionMode::Interactive, Some(&password), None);

        let (id, handle, mut rx) = viewer();
        assert_eq!(
            server.join_session("s1", "t1", Some(&format!("{prefix}Y")), id, handle),
            Err(JoinRejection::InvalidPassword)
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(server.viewer_count("s1"), 0);

        let (id, handle, _rx) = viewer();
        assert!(server.join_session("s1", "t1", Some(&password), id, handle).is_ok());
    }

    #[test]
    fn join_checks_credentials_of_the_current_registration() {
        let (server, _events, _) = test_server();
        server.register_session("s1", "old", SessionMode::Interactive, Some("old-pw"), None);
        server.register_session("s1", "new", SessionMode::ReadOnly, Some("new-pw"), None);

        let attempt = |token: &str, password: &str| {
            let (id, handle, _rx) = viewer();
            server.join_session("s1", token, Some(password), id, handle)
        };

        assert_eq!(attempt("old", "old-pw"), Err(JoinRejection::InvalidToken));
        assert_eq!(attempt("new", "old-pw"), Err(JoinRejection::InvalidPassword));
        assert_eq!(server.viewer_count("s1"), 0);
        assert_eq!(attempt("new", "new-pw"), Ok((SessionMode::ReadOnly, 1)));
    }

    #[tokio::test]
    async fn broadcast_evicts_viewers_that_fall_behind() {
        let (server, _events, _) = test_server();
        server.register_session("s1", "t1", SessionMode::ReadOnly, None, None);

        let (slow_id, slow, mut slow_rx) = viewer_with_capacity(2);
        server
            .join_session("s1", "t1", None, slow_id, slow.clone())
            .unwrap();
        expect_text(&mut slow_rx);
        let (_, mut fast) = join(&server, "s1", "t1");

        for _ in 0..3 {
            server.broadcast_output("s1", b"tick");
        }

        tokio::time::timeout(std::time::Duration::from_secs(1), slow.evicted())
            .await
            .expect("slow viewer was not evicted");
        for _ in 0..3 {
            expect_text(&mut fast);
        }
    }

    #[test]
    fn bracketed_hosts_are_not_wildcards() {
        assert!(is_wildcard("0.0.0.0"));
        assert!(is_wildcard("::"));
        assert!(!is_wildcard("[::]"));
        assert!(!is_wildcard("127.0.0.1"));
    }

    #[test]
    fn broadcast_reaches_only_open_viewers_of_that_session() {
        let (server, _events, _) = test_server();
        server.register_session("s1", "t1", SessionMode::ReadOnly, None, None);
        server.register_session("s2", "t2", SessionMode::ReadOnly, None, None);

        let (_, mut first) = join(&server, "s1", "t1");
        let (_, mut second) = join(&server, "s1", "t1");
        let (_, gone) = join(&server, "s1", "t1");
        let (_, mut other) = join(&server, "s2", "t2");
        drop(gone);

        server.broadcast_output("s1", b"hello");

        let expected = r#"{"type":"output","data":"aGVsbG8="}"#;
        assert_eq!(expect_text(&mut first), expected);
        assert_eq!(expect_text(&mut second), expected);
        assert!(other.try_recv().is_err());

        // Skipped but not pruned until counted.
        assert_eq!(server.viewer_count("s1"), 2);
    }

    #[test]
    fn broadcast_to_expired_session_unregisters_it() {
        let (server, _events, clock) = test_server();
        server.register_session("s1", "t1", SessionMode::ReadOnly, None, Some(1));
        let (_, mut rx) = join(&server, "s1", "t1");

        clock.advance(Duration::minutes(2));
        server.broadcast_output("s1", b"late");

        expect_closed(&mut rx);
        assert_eq!(server.session_mode("s1"), None);
    }

    #[test]
    fn broadcast_without_viewers_is_a_no_op() {
        let (server, _events, _) = test_server();
        server.broadcast_output("unknown", b"data");
        server.register_session("s1", "t1", SessionMode::ReadOnly, None, None);
        server.broadcast_output("s1", b"data");
        assert_eq!(server.active_session_count(), 1);
    }

    #[test]
    fn forward_input_requires_interactive_membership() {
        let (server, mut events, _) = test_server();
        server.register_session("ro", "t", SessionMode::ReadOnly, None, None);
        server.register_session("rw", "t", SessionMode::Interactive, None, None);
        let (ro_viewer, _ro_rx) = join(&server, "ro", "t");
        let (rw_viewer, _rw_rx) = join(&server, "rw", "t");
        while events.try_recv().is_ok() {}

        assert!(!server.forward_input("ro", b"x".to_vec(), &ro_viewer));
        assert!(!server.forward_input("rw", b"x".to_vec(), &ro_viewer));
        assert!(!server.forward_input("missing", b"x".to_vec(), &rw_viewer));
        assert!(events.try_recv().is_err());

        assert!(server.forward_input("rw", b"ls\n".to_vec(), &rw_viewer));
        assert_eq!(
            events.try_recv().unwrap(),
            ShareEvent::InputReceived {
                session_id: "rw".to_string(),
                data: b"ls\n".to_vec()
            }
        );
    }

    #[test]
    fn forward_input_to_expired_session_unregisters_it() {
        let (server, mut events, clock) = test_server();
        server.register_session("rw", "t", SessionMode::Interactive, None, Some(5));
        let (id, mut rx) = join(&server, "rw", "t");
        while events.try_recv().is_ok() {}

        clock.advance(Duration::minutes(6));
        assert!(!server.forward_input("rw", b"x".to_vec(), &id));
        assert!(events.try_recv().is_err());
        expect_closed(&mut rx);
        assert_eq!(server.viewer_count("rw"), 0);
    }

    #[test]
    fn unregister_closes_viewers() {
        let (server, _events, _) = test_server();
        server.register_session("s1", "t1", SessionMode::Interactive, None, None);
        let (_, mut rx) = join(&server, "s1", "t1");

        server.unregister_session("s1");
        server.unregister_session("s1");

        expect_closed(&mut rx);
        assert_eq!(server.viewer_count("s1"), 0);
        assert_eq!(server.active_session_count(), 0);
    }

    #[test]
    fn reregistering_replaces_session_and_closes_old_viewers() {
        let (server, _events, _) = test_server();
        server.register_session("s1", "old", SessionMode::Interactive, None, None);
        let (_, mut rx) = join(&server, "s1", "old");

        server.register_session("s1", "new", SessionMode::ReadOnly, None, None);

        expect_closed(&mut rx);
        assert_eq!(server.viewer_count("s1"), 0);
        assert_eq!(server.session_mode("s1"), Some(SessionMode::ReadOnly));
        let (id, handle, _rx) = viewer();
        assert_eq!(
            server.join_session("s1", "old", None, id, handle),
            Err(JoinRejection::InvalidToken)
        );
    }

    #[test]
    fn active_count_never_includes_expired_sessions() {
        let (server, _events, clock) = test_server();
        server.register_session("short", "t", SessionMode::ReadOnly, None, Some(1));
        server.register_session("long", "t", SessionMode::ReadOnly, None, Some(60));
        server.register_session("forever", "t", SessionMode::ReadOnly, None, None);
        assert_eq!(server.active_session_count(), 3);

        clock.advance(Duration::minutes(2));
        assert_eq!(server.active_session_count(), 2);

        clock.advance(Duration::hours(2));
        assert_eq!(server.active_session_count(), 1);
    }

    #[test]
    fn registering_sweeps_expired_sessions() {
        let (server, _events, clock) = test_server();
        server.register_session("old", "t", SessionMode::ReadOnly, None, Some(1));
        let (_, mut rx) = join(&server, "old", "t");

        clock.advance(Duration::minutes(5));
        server.register_session("new", "t", SessionMode::ReadOnly, None, None);

        expect_closed(&mut rx);
        assert_eq!(server.session_mode("old"), None);
    }

    #[test]
    fn last_viewer_leaving_an_expired_session_removes_it() {
        let (server, mut events, clock) = test_server();
        server.register_session("s1", "t1", SessionMode::ReadOnly, None, Some(1));
        let (first, _first_rx) = join(&server, "s1", "t1");
        let (second, _second_rx) = join(&server, "s1", "t1");
        while events.try_recv().is_ok() {}

        clock.advance(Duration::minutes(2));
        server.leave_session("s1", &first);
        assert_eq!(
            events.try_recv().unwrap(),
            ShareEvent::ViewerLeft {
                session_id: "s1".to_string(),
                count: 1
            }
        );
        assert!(server.inner.sessions.contains_key("s1"));

        server.leave_session("s1", &second);
        assert!(!server.inner.sessions.contains_key("s1"));

        // Leaving twice is harmless and emits nothing.
        events.try_recv().unwrap();
        server.leave_session("s1", &second);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn websocket_urls() {
        let (server, _events, _) = test_server();
        {
            let mut status = server.status_mut();
            status.host = "0.0.0.0".to_string();
            status.port = 8390;
        }
        assert_eq!(server.websocket_url(false), "ws://localhost:8390/session");
        assert_eq!(server.websocket_url(true), "ws://localhost:8390/session");

        server.set_public_url(Some("https://share.example.com".to_string()));
        assert_eq!(server.websocket_url(true), "wss://share.example.com/session");
        assert_eq!(server.websocket_url(false), "ws://localhost:8390/session");

        server.set_public_url(Some("http://tunnel.example.com/custom".to_string()));
        assert_eq!(server.websocket_url(true), "ws://tunnel.example.com/custom");

        server.set_public_url(Some("not a url".to_string()));
        assert_eq!(server.websocket_url(true), "not a url");

        server.status_mut().host = "::1".to_string();
        assert_eq!(server.websocket_url(false), "ws://[::1]:8390/session");

        assert_eq!(server.network_url(), None);
    }
}
