//! Notifications the server sends back to the host application.

use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareEvent {
    /// A viewer passed `join`; `count` includes it.
    ViewerJoined { session_id: String, count: usize },
    /// A viewer's connection closed; `count` is what remains.
    ViewerLeft { session_id: String, count: usize },
    /// Decoded keystrokes from a viewer of an interactive session, to be
    /// written to the real terminal by the host.
    InputReceived { session_id: String, data: Vec<u8> },
}

impl ShareEvent {
    pub fn session_id(&self) -> &str {
        match self {
            ShareEvent::ViewerJoined { session_id, .. }
            | ShareEvent::ViewerLeft { session_id, .. }
            | ShareEvent::InputReceived { session_id, .. } => session_id,
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<ShareEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ShareEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_event_names_its_session() {
        let events = [
            ShareEvent::ViewerJoined {
                session_id: "a".to_string(),
                count: 1,
            },
            ShareEvent::ViewerLeft {
                session_id: "b".to_string(),
                count: 0,
            },
            ShareEvent::InputReceived {
                session_id: "c".to_string(),
                data: b"x".to_vec(),
            },
        ];
        let ids: Vec<&str> = events.iter().map(ShareEvent::session_id).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }
}
