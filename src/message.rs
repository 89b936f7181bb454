//! Wire message codec.
//!
//! Every payload exchanged on a peer channel is a JSON object with a `type`
//! discriminator and an opaque `body`, mirroring the two message kinds the
//! core ever constructs: a `system` handshake and a `user` application
//! payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::NetError;

pub const TYPE_SYSTEM: &str = "system";
pub const TYPE_USER: &str = "user";

/// Body of a `system` message: the handshake identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SystemBody {
    pub id: String,
    pub ip: String,
}

/// A decoded wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    System(SystemBody),
    User(Value),
}

impl Message {
    pub fn msg_type(&self) -> &'static str {
        match self {
            Message::System(_) => TYPE_SYSTEM,
            Message::User(_) => TYPE_USER,
        }
    }

    /// Serialize to the `{"type": T, "body": B}` envelope, then prefix with
    /// a 4-byte big-endian length to produce a ready-to-write frame.
    pub fn encode_frame(&self) -> Vec<u8> {
        let envelope = self.to_envelope();
        let json = serde_json::to_vec(&envelope).expect("message envelope is always serializable");
        frame_bytes(&json)
    }

    fn to_envelope(&self) -> Envelope {
        match self {
            Message::System(body) => Envelope {
                msg_type: TYPE_SYSTEM.to_string(),
                body: serde_json::to_value(body).expect("system body is always serializable"),
            },
            Message::User(body) => Envelope {
                msg_type: TYPE_USER.to_string(),
                body: body.clone(),
            },
        }
    }

    /// Parse a raw (already length-delimited) payload.
    ///
    /// - Invalid JSON, or JSON that isn't an object, or an object with a
    ///   missing/empty `type` yields `Ok(None)` — a soft failure the caller
    ///   swallows.
    /// - A well-formed envelope whose `type` is neither `"system"` nor
    ///   `"user"` yields `Err(NetError::UnknownMessageType)`.
    /// - Otherwise yields `Ok(Some(message))`.
    pub fn parse(payload: &str) -> Result<Option<Message>, NetError> {
        let envelope: Envelope = match serde_json::from_str(payload) {
            Ok(e) => e,
            Err(_) => return Ok(None),
        };

        if envelope.msg_type.is_empty() {
            return Ok(None);
        }

        match envelope.msg_type.as_str() {
            TYPE_SYSTEM => {
                let body: SystemBody = serde_json::from_value(envelope.body)
                    .map_err(|_| NetError::UnknownMessageType(envelope.msg_type.clone()))?;
                Ok(Some(Message::System(body)))
            }
            TYPE_USER => Ok(Some(Message::User(envelope.body))),
            other => Err(NetError::UnknownMessageType(other.to_string())),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    msg_type: String,
    body: Value,
}

/// Prefix `payload` with its big-endian u32 length.
pub fn frame_bytes(payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// The reserved keepalive filler. Recognized before codec parsing is
/// attempted, never itself treated as a message.
pub const KEEPALIVE: &str = "__keepalive__";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_user_message() {
        let msg = Message::User(json!({"hello": 1}));
        let frame = msg.encode_frame();
        let len = u32::from_be_bytes(frame[0..4].try_into().unwrap()) as usize;
        let payload = std::str::from_utf8(&frame[4..4 + len]).unwrap();
        let parsed = Message::parse(payload).unwrap().unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn round_trips_system_message() {
        let msg = Message::System(SystemBody {
            id: "abc".into(),
            ip: "10.0.0.1".into(),
        });
        let frame = msg.encode_frame();
        let len = u32::from_be_bytes(frame[0..4].try_into().unwrap()) as usize;
        let payload = std::str::from_utf8(&frame[4..4 + len]).unwrap();
        let parsed = Message::parse(payload).unwrap().unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn invalid_json_is_soft_failure() {
        assert_eq!(Message::parse("not json").unwrap(), None);
    }

    #[test]
    fn missing_type_is_soft_failure() {
        assert_eq!(Message::parse(r#"{"body": {}}"#).unwrap(), None);
    }

    #[test]
    fn empty_type_is_soft_failure() {
        assert_eq!(Message::parse(r#"{"type": "", "body": {}}"#).unwrap(), None);
    }

    #[test]
    fn unknown_type_is_hard_error() {
        let err = Message::parse(r#"{"type": "bogus", "body": {}}"#).unwrap_err();
        assert!(matches!(err, NetError::UnknownMessageType(t) if t == "bogus"));
    }

    #[test]
    fn system_type_with_wrong_shape_body_is_hard_error() {
        let err = Message::parse(r#"{"type": "system", "body": {"only_id": 1}}"#).unwrap_err();
        assert!(matches!(err, NetError::UnknownMessageType(_)));
    }
}
