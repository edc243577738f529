//! Wire envelope codec: parse(text) -> Frame, emit(Frame) -> text.
//!
//! Frames are UTF-8 JSON (spec.md §6). The tag is read from the top-level
//! `type` field when present, falling back to `data.type` — the original
//! `server.py`/`client.py` sometimes omit the outer `type` on `hello`-style
//! messages, so the fallback keeps those recognizable without inventing a
//! new wire shape for them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ChatError, Result};

const OUTER_TAGS: &[&str] = &[
    "client_list_request",
    "client_list",
    "client_update_request",
    "client_update",
    "signed_data",
];

const INNER_TAGS: &[&str] = &["hello", "chat", "public_chat", "server_hello"];

/// One entry of a `client_list` response: a server's address and the PEMs
/// of its locally-connected clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerClients {
    pub address: String,
    pub clients: Vec<String>,
}

/// The payload nested inside a `signed_data` envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum SignedPayload {
    #[serde(rename = "hello")]
    Hello { public_key: String },
    #[serde(rename = "server_hello")]
    ServerHello { sender: String },
    #[serde(rename = "chat")]
    Chat {
        destination_servers: Vec<String>,
        iv: String,
        symm_keys: Vec<String>,
        chat: String,
    },
    #[serde(rename = "public_chat")]
    PublicChat { sender: String, message: String },
}

/// Plaintext recovered after decrypting a `chat` payload's `chat` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatPlaintext {
    pub participants: Vec<String>,
    pub message: String,
}

/// A frame as it appears on the wire, at the top level.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "client_list_request")]
    ClientListRequest,
    #[serde(rename = "client_list")]
    ClientList { servers: Vec<ServerClients> },
    #[serde(rename = "client_update_request")]
    ClientUpdateRequest,
    #[serde(rename = "client_update")]
    ClientUpdate {
        clients: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_address: Option<String>,
    },
    #[serde(rename = "signed_data")]
    SignedData {
        data: SignedPayload,
        counter: u64,
        signature: String,
    },
}

/// Parse a JSON text frame, rejecting unknown tags and malformed shapes
/// before `serde` ever sees them, so the distinction between
/// `UnknownFrameType` and `MalformedFrame` (spec.md §7) is preserved.
pub fn parse(text: &str) -> Result<Frame> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ChatError::MalformedFrame(e.to_string()))?;

    let tag = top_level_tag(&value)
        .ok_or_else(|| ChatError::MalformedFrame("missing type field".into()))?;
    if !OUTER_TAGS.contains(&tag.as_str()) {
        return Err(ChatError::UnknownFrameType(tag));
    }
    if tag == "signed_data" {
        if let Some(inner) = value
            .get("data")
            .and_then(|d| d.get("type"))
            .and_then(|t| t.as_str())
        {
            if !INNER_TAGS.contains(&inner) {
                return Err(ChatError::UnknownFrameType(inner.to_string()));
            }
        }
    }

    serde_json::from_value(value).map_err(|e| ChatError::MalformedFrame(e.to_string()))
}

/// Emit a frame as UTF-8 JSON text.
pub fn emit(frame: &Frame) -> Result<String> {
    serde_json::to_string(frame).map_err(ChatError::from)
}

fn top_level_tag(value: &Value) -> Option<String> {
    value
        .get("type")
        .and_then(|t| t.as_str())
        .map(String::from)
        .or_else(|| {
            value
                .get("data")
                .and_then(|d| d.get("type"))
                .and_then(|t| t.as_str())
                .map(String::from)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_client_list_request() {
        let frame = Frame::ClientListRequest;
        let text = emit(&frame).unwrap();
        assert_eq!(parse(&text).unwrap(), frame);
    }

    #[test]
    fn round_trips_signed_chat() {
        let frame = Frame::SignedData {
            data: SignedPayload::Chat {
                destination_servers: vec!["ws://a:1".into()],
                iv: "aXY=".into(),
                symm_keys: vec!["a2V5".into()],
                chat: "Y2lwaGVy".into(),
            },
            counter: 7,
            signature: "c2ln".into(),
        };
        let text = emit(&frame).unwrap();
        assert_eq!(parse(&text).unwrap(), frame);
    }

    #[test]
    fn unknown_outer_tag_is_soft_error() {
        let err = parse(r#"{"type":"frobnicate"}"#).unwrap_err();
        assert!(matches!(err, ChatError::UnknownFrameType(_)));
    }

    #[test]
    fn unknown_inner_tag_is_soft_error() {
        let text = r#"{"type":"signed_data","data":{"type":"mystery"},"counter":1,"signature":"x"}"#;
        let err = parse(text).unwrap_err();
        assert!(matches!(err, ChatError::UnknownFrameType(_)));
    }

    #[test]
    fn missing_required_field_is_malformed() {
        let text = r#"{"type":"signed_data","data":{"type":"hello"},"counter":1}"#;
        let err = parse(text).unwrap_err();
        assert!(matches!(err, ChatError::MalformedFrame(_)));
    }
}
