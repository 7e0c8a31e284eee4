//! One WebSocket connection: `Connected` until a `join` succeeds, `Joined`
//! afterwards, and detached from its session when the socket closes.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use uuid::Uuid;

use super::{JoinRejection, SessionSharingServer};
use crate::protocol::{
    CLOSE_POLICY_VIOLATION, CLOSE_UNSUPPORTED_DATA, ClientMessage, ServerMessage, decode_payload,
    parse_client_message,
};
use crate::session::{SessionMode, ViewerHandle, ViewerId};

/// How long a closing connection waits for queued frames to reach the socket.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub(super) struct AppState {
    pub(super) server: SessionSharingServer,
    pub(super) shutdown: watch::Receiver<bool>,
    /// Held by every connection task so `stop` can wait for all of them.
    pub(super) drain: mpsc::Sender<()>,
}

pub(super) async fn handle_session_ws(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_viewer_socket(socket, state))
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

struct Connection {
    server: SessionSharingServer,
    viewer_id: ViewerId,
    handle: ViewerHandle,
    joined: Option<String>,
}

async fn handle_viewer_socket(socket: WebSocket, state: AppState) {
    let AppState {
        server,
        mut shutdown,
        drain,
    } = state;
    let _drain = drain;

    let viewer_id = Uuid::new_v4();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let capacity = server.inner.config.viewer_queue_capacity.max(1);
    let (tx, mut rx) = mpsc::channel::<Message>(capacity);

    info!("Viewer connection {} accepted", viewer_id);

    // Everything bound for the socket goes through this queue, so replies and
    // broadcast output keep the order they were produced in.
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut connection = Connection {
        server,
        viewer_id,
        handle: ViewerHandle::new(tx),
        joined: None,
    };

    let evicted = connection.handle.evicted();
    tokio::pin!(evicted);

    let mut flush_writer = true;
    let stopping = *shutdown.borrow();
    if stopping {
        connection.handle.close();
    } else {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if connection.on_text(text.as_str()) == Flow::Close {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!("Viewer {} sent a binary frame, closing", viewer_id);
                        connection
                            .handle
                            .close_with(CLOSE_UNSUPPORTED_DATA, "Binary frames are not supported");
                        break;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Viewer {} WebSocket error: {}", viewer_id, e);
                        break;
                    }
                },
                _ = &mut send_task => {
                    flush_writer = false;
                    break;
                }
                _ = &mut evicted => {
                    warn!("Viewer {} fell too far behind, disconnecting", viewer_id);
                    send_task.abort();
                    flush_writer = false;
                    break;
                }
                _ = shutdown.changed() => {
                    connection.handle.close();
                    break;
                }
            }
        }
    }

    connection.leave();
    drop(connection);

    if flush_writer && tokio::time::timeout(FLUSH_TIMEOUT, &mut send_task).await.is_err() {
        warn!("Viewer {} did not flush before closing", viewer_id);
        send_task.abort();
    }

    info!("Viewer connection {} closed", viewer_id);
}

impl Connection {
    fn on_text(&mut self, text: &str) -> Flow {
        match parse_client_message(text) {
            Ok(ClientMessage::Join {
                session_id,
                token,
                password,
            }) => self.on_join(session_id, &token, password.as_deref()),
            Ok(ClientMessage::Input { session_id, data }) => {
                self.on_input(&session_id, &data);
                Flow::Continue
            }
            Err(err) => match err.reply() {
                Some(message) => {
                    warn!("Viewer {} sent an unusable message: {}", self.viewer_id, message);
                    self.reply(ServerMessage::error(message));
                    Flow::Continue
                }
                None => {
                    warn!("Viewer {} sent malformed JSON, closing", self.viewer_id);
                    self.handle
                        .close_with(CLOSE_UNSUPPORTED_DATA, "Invalid message format");
                    Flow::Close
                }
            },
        }
    }

    fn on_join(&mut self, session_id: String, token: &str, password: Option<&str>) -> Flow {
        let result = if self.joined.is_some() {
            Err(JoinRejection::AlreadyJoined)
        } else {
            self.server.join_session(
                &session_id,
                token,
                password,
                self.viewer_id,
                self.handle.clone(),
            )
        };

        match result {
            Ok(_) => {
                self.joined = Some(session_id);
                Flow::Continue
            }
            Err(rejection) => {
                warn!(
                    "Rejected join from viewer {} for session {}: {}",
                    self.viewer_id, session_id, rejection
                );
                self.reply(ServerMessage::error(rejection.message()));
                if rejection.closes_connection() {
                    self.handle
                        .close_with(CLOSE_POLICY_VIOLATION, rejection.message());
                    Flow::Close
                } else {
                    Flow::Continue
                }
            }
        }
    }

    fn on_input(&mut self, session_id: &str, data: &str) {
        let Some(joined) = self.joined.as_deref() else {
            self.reply(ServerMessage::error("Not joined to a session"));
            return;
        };
        if joined != session_id {
            self.reply(ServerMessage::error("Not a viewer of this session"));
            return;
        }

        match self.server.session_mode(session_id) {
            None => self.reply(ServerMessage::error(JoinRejection::NotFound.message())),
            Some(SessionMode::ReadOnly) => {
                self.reply(ServerMessage::error("Session is read-only"));
            }
            Some(SessionMode::Interactive) => match decode_payload(data) {
                Ok(bytes) => {
                    self.server.forward_input(session_id, bytes, &self.viewer_id);
                }
                Err(e) => warn!(
                    "Failed to decode input from viewer {} for session {}: {}",
                    self.viewer_id, session_id, e
                ),
            },
        }
    }

    fn leave(&mut self) {
        if let Some(session_id) = self.joined.take() {
            self.server.leave_session(&session_id, &self.viewer_id);
        }
    }

    fn reply(&self, msg: ServerMessage) {
        self.handle.send_text(msg.to_json());
    }
}
