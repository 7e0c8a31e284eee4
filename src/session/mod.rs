//! Shared session state: the registration a host makes for one terminal and
//! the viewers currently attached to it.

use axum::extract::ws::{CloseFrame, Message};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc};
use uuid::Uuid;

/// Identity of one accepted WebSocket connection.
pub type ViewerId = Uuid;

/// Access level granted to every viewer of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SessionMode {
    /// Viewers only receive output.
    ReadOnly,
    /// Viewers receive output and may send input.
    Interactive,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::ReadOnly => "read-only",
            SessionMode::Interactive => "interactive",
        }
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sending half of a connection's bounded outbound queue.
///
/// The connection's writer task owns the receiving half and drains it into
/// the socket. Once that task is gone the handle reports closed. A viewer
/// whose queue fills up is evicted: the frame is dropped and [`evicted`]
/// resolves so the connection can shut itself down.
///
/// [`evicted`]: ViewerHandle::evicted
#[derive(Debug, Clone)]
pub struct ViewerHandle {
    tx: mpsc::Sender<Message>,
    evicted: Arc<Notify>,
}

impl ViewerHandle {
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self {
            tx,
            evicted: Arc::new(Notify::new()),
        }
    }

    /// True while the writer task is still accepting frames.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    pub fn send_text(&self, text: String) -> bool {
        self.enqueue(Message::Text(text.into()))
    }

    /// Close with the default (empty) close frame.
    pub fn close(&self) {
        self.enqueue(Message::Close(None));
    }

    pub fn close_with(&self, code: u16, reason: &str) {
        self.enqueue(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })));
    }

    /// Resolves once a frame was dropped because the queue was full.
    pub fn evicted(&self) -> impl Future<Output = ()> + Send + 'static {
        let evicted = self.evicted.clone();
        async move { evicted.notified().await }
    }

    fn enqueue(&self, msg: Message) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.evicted.notify_one();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

pub struct SharedSession {
    pub id: String,
    pub mode: SessionMode,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    token: String,
    password: Option<String>,
    viewers: HashMap<ViewerId, ViewerHandle>,
}

impl SharedSession {
    pub fn new(
        id: String,
        token: String,
        mode: SessionMode,
        password: Option<String>,
        created_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            mode,
            created_at,
            expires_at,
            token,
            password,
            viewers: HashMap::new(),
        }
    }

    pub fn token_matches(&self, token: &str) -> bool {
        constant_time_eq(self.token.as_bytes(), token.as_bytes())
    }

    /// Sessions without a password accept anything; sessions with one need
    /// the exact same string.
    pub fn password_matches(&self, provided: Option<&str>) -> bool {
        match (self.password.as_deref(), provided) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(expected), Some(provided)) => {
                constant_time_eq(expected.as_bytes(), provided.as_bytes())
            }
        }
    }

    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now > expires_at)
    }

    pub fn add_viewer(&mut self, id: ViewerId, handle: ViewerHandle) -> usize {
        self.viewers.insert(id, handle);
        self.viewers.len()
    }

    pub fn remove_viewer(&mut self, id: &ViewerId) -> bool {
        self.viewers.remove(id).is_some()
    }

    pub fn has_viewer(&self, id: &ViewerId) -> bool {
        self.viewers.contains_key(id)
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    pub fn viewers(&self) -> impl Iterator<Item = &ViewerHandle> {
        self.viewers.values()
    }

    /// Drop viewers whose connection has already gone away.
    pub fn prune_closed_viewers(&mut self) -> usize {
        let before = self.viewers.len();
        self.viewers.retain(|_, viewer| viewer.is_open());
        before - self.viewers.len()
    }

    pub fn close_viewers(&self) {
        for viewer in self.viewers.values() {
            viewer.close();
        }
    }
}

/// Byte comparison that takes the same time wherever the first mismatch is.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, byte) in expected.iter().enumerate() {
        diff |= byte ^ provided.get(i).copied().unwrap_or(0xff);
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session(expires_at: Option<DateTime<Utc>>) -> SharedSession {
        SharedSession::new(
            "s1".to_string(),
            "t1".to_string(),
            SessionMode::Interactive,
            None,
            Utc::now(),
            expires_at,
        )
    }

    fn with_password(password: &str) -> SharedSession {
        SharedSession::new(
            "s1".to_string(),
            "t1".to_string(),
            SessionMode::Interactive,
            Some(password.to_string()),
            Utc::now(),
            None,
        )
    }

    #[test]
    fn token_requires_exact_match() {
        let session = session(None);
        assert!(session.token_matches("t1"));
        assert!(!session.token_matches("t"));
        assert!(!session.token_matches("t12"));
        assert!(!session.token_matches(""));
    }

    #[test]
    fn expiry_is_strictly_after_deadline() {
        let deadline = Utc::now();
        let session = session(Some(deadline));
        assert!(!session.is_expired(deadline));
        assert!(session.is_expired(deadline + Duration::seconds(1)));
        assert!(!self::session(None).is_expired(deadline + Duration::days(365)));
    }

    #[test]
    fn password_check() {
        let open = session(None);
        assert!(open.password_matches(None));
        assert!(open.password_matches(Some("anything")));

        let locked = with_password("secret");
        assert!(locked.password_matches(Some("secret")));
        assert!(!locked.password_matches(Some("wrong")));
        assert!(!locked.password_matches(Some("secret ")));
        assert!(!locked.password_matches(None));
    }

    #[test]
    fn long_passwords_compare_every_byte() {
        let prefix = "a".repeat(72);
        let locked = with_password(&format!("{prefix}X"));
        assert!(locked.password_matches(Some(&format!("{prefix}X"))));
        assert!(!locked.password_matches(Some(&format!("{prefix}Y"))));
        assert!(!locked.password_matches(Some(&prefix)));
    }

    #[tokio::test]
    async fn full_queue_evicts_viewer() {
        let (tx, mut rx) = mpsc::channel(2);
        let handle = ViewerHandle::new(tx);

        assert!(handle.send_text("one".to_string()));
        assert!(handle.send_text("two".to_string()));
        assert!(!handle.send_text("three".to_string()));

        tokio::time::timeout(std::time::Duration::from_secs(1), handle.evicted())
            .await
            .expect("viewer was not evicted");
        assert!(handle.is_open());
        assert!(matches!(rx.recv().await, Some(Message::Text(_))));
    }

    #[test]
    fn closed_viewers_are_pruned() {
        let mut session = session(None);
        let (open_tx, _open_rx) = mpsc::channel(8);
        let (gone_tx, gone_rx) = mpsc::channel(8);
        session.add_viewer(Uuid::new_v4(), ViewerHandle::new(open_tx));
        session.add_viewer(Uuid::new_v4(), ViewerHandle::new(gone_tx));
        drop(gone_rx);

        assert_eq!(session.viewer_count(), 2);
        assert_eq!(session.prune_closed_viewers(), 1);
        assert_eq!(session.viewer_count(), 1);
    }

    #[test]
    fn mode_uses_kebab_case_on_the_wire() {
        assert_eq!(
            serde_json::to_string(&SessionMode::ReadOnly).unwrap(),
            r#""read-only""#
        );
        assert_eq!(SessionMode::Interactive.to_string(), "interactive");
    }
}
