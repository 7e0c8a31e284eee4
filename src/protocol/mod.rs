//! # Wire protocol
//!
//! Every application message is a JSON text frame with a `type` field.
//!
//! ## Client → server
//!
//! | type    | fields                           |
//! |---------|----------------------------------|
//! | `join`  | `sessionId`, `token`, `password?`|
//! | `input` | `sessionId`, `data` (base64)     |
//!
//! ## Server → client
//!
//! | type     | fields                                |
//! |----------|---------------------------------------|
//! | `joined` | `sessionId`, `mode`, `viewerCount`    |
//! | `output` | `data` (base64)                       |
//! | `error`  | `message`                             |
//!
//! Payloads that are not JSON at all close the connection with
//! [`CLOSE_UNSUPPORTED_DATA`]; failed joins close with [`CLOSE_POLICY_VIOLATION`].

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::SessionMode;

/// The single path the WebSocket endpoint is mounted on.
pub const SESSION_PATH: &str = "/session";

/// Close code for payloads that are not valid JSON.
pub const CLOSE_UNSUPPORTED_DATA: u16 = 1003;
/// Close code for rejected joins.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Join {
        session_id: String,
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Input { session_id: String, data: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Joined {
        session_id: String,
        mode: SessionMode,
        viewer_count: usize,
    },
    Output {
        data: String,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn output(data: &[u8]) -> Self {
        ServerMessage::Output {
            data: encode_payload(data),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        // Only strings and integers inside, serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Why an incoming text frame could not be turned into a [`ClientMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Not JSON at all.
    Malformed,
    /// JSON, but the `type` is missing or not one we handle.
    UnknownType(Option<String>),
    /// A known `type` with missing or mistyped fields.
    InvalidFields(String),
}

impl ParseError {
    /// Text sent back in the `error` reply. `None` means the connection is closed instead.
    pub fn reply(&self) -> Option<String> {
        match self {
            ParseError::Malformed => None,
            ParseError::UnknownType(Some(kind)) => Some(format!("Unknown message type: {kind}")),
            ParseError::UnknownType(None) => Some("Missing message type".to_string()),
            ParseError::InvalidFields(kind) => Some(format!("Invalid {kind} message")),
        }
    }
}

pub fn parse_client_message(text: &str) -> Result<ClientMessage, ParseError> {
    let value: Value = serde_json::from_str(text).map_err(|_| ParseError::Malformed)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string);

    serde_json::from_value(value).map_err(|_| match kind {
        Some(kind) if kind == "join" || kind == "input" => ParseError::InvalidFields(kind),
        other => ParseError::UnknownType(other),
    })
}

pub fn encode_payload(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub fn decode_payload(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_parses_camel_case_fields() {
        let msg = parse_client_message(r#"{"type":"join","sessionId":"s1","token":"t1"}"#)
            .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Join {
                session_id: "s1".to_string(),
                token: "t1".to_string(),
                password: None,
            }
        );
    }

    #[test]
    fn non_json_is_malformed() {
        assert_eq!(parse_client_message("not json {"), Err(ParseError::Malformed));
        assert_eq!(ParseError::Malformed.reply(), None);
    }

    #[test]
    fn unknown_type_gets_a_reply() {
        let err = parse_client_message(r#"{"type":"resize","cols":80}"#).unwrap_err();
        assert_eq!(err, ParseError::UnknownType(Some("resize".to_string())));
        assert_eq!(err.reply().unwrap(), "Unknown message type: resize");

        let err = parse_client_message("[1,2,3]").unwrap_err();
        assert_eq!(err, ParseError::UnknownType(None));
    }

    #[test]
    fn join_without_token_is_invalid() {
        let err = parse_client_message(r#"{"type":"join","sessionId":"s1"}"#).unwrap_err();
        assert_eq!(err, ParseError::InvalidFields("join".to_string()));
    }

    #[test]
    fn joined_serializes_with_wire_names() {
        let msg = ServerMessage::Joined {
            session_id: "s1".to_string(),
            mode: SessionMode::Interactive,
            viewer_count: 1,
        };
        let value: Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "type": "joined",
                "sessionId": "s1",
                "mode": "interactive",
                "viewerCount": 1
            })
        );
    }

    #[test]
    fn output_is_base64() {
        assert_eq!(
            ServerMessage::output(b"hello").to_json(),
            r#"{"type":"output","data":"aGVsbG8="}"#
        );
        assert_eq!(decode_payload("eA==").unwrap(), b"x");
        assert!(decode_payload("%%%").is_err());
    }
}
