// JSON frames exchanged over the push socket.
//
// Every frame is `{ "event": <name>, "data": <payload> }` in both directions.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Outbound: announce (or re-announce) the bearer credential.
pub const AUTHENTICATE: &str = "authenticate";
/// Outbound: subscribe to a tournament room.
pub const JOIN_ROOM: &str = "join-room";
/// Outbound: unsubscribe from a tournament room.
pub const LEAVE_ROOM: &str = "leave-room";
/// Inbound: the server accepted the credential.
pub const AUTHENTICATED: &str = "authenticated";
/// Inbound: the server rejected the credential.
pub const AUTH_ERROR: &str = "auth-error";

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn authenticate(token: &str) -> Self {
        Self::new(AUTHENTICATE, json!({ "token": token }))
    }

    pub fn join_room(room: &str) -> Self {
        Self::new(JOIN_ROOM, json!({ "tournamentId": room }))
    }

    pub fn leave_room(room: &str) -> Self {
        Self::new(LEAVE_ROOM, json!({ "tournamentId": room }))
    }

    /// Parse an inbound text frame. Anything that is not an object with a
    /// non-empty string `event` is malformed.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let frame: Frame = serde_json::from_str(text)?;
        if frame.event.is_empty() {
            return Err(serde::de::Error::custom("empty event name"));
        }
        Ok(frame)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Human-readable message carried by an error frame, if any.
    pub fn message(&self) -> Option<&str> {
        self.data
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| self.data.as_str())
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data: &dyn std::fmt::Debug = if self.event == AUTHENTICATE {
            &"[REDACTED]"
        } else {
            &self.data
        };
        f.debug_struct("Frame")
            .field("event", &self.event)
            .field("data", data)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_room_frame_shape() {
        let text = Frame::join_room("t1").encode().unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["event"], "join-room");
        assert_eq!(v["data"]["tournamentId"], "t1");
    }

    #[test]
    fn parse_accepts_missing_data() {
        let f = Frame::parse(r#"{"event":"authenticated"}"#).unwrap();
        assert_eq!(f.event, AUTHENTICATED);
        assert!(f.data.is_null());
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(Frame::parse("not json").is_err());
        assert!(Frame::parse(r#"{"data":{}}"#).is_err());
        assert!(Frame::parse(r#"{"event":""}"#).is_err());
        assert!(Frame::parse(r#"{"event":42}"#).is_err());
        assert!(Frame::parse("[1,2]").is_err());
    }

    #[test]
    fn error_message_extraction() {
        let f = Frame::parse(r#"{"event":"auth-error","data":{"message":"expired"}}"#).unwrap();
        assert_eq!(f.message(), Some("expired"));
        let f = Frame::parse(r#"{"event":"auth-error","data":"bad token"}"#).unwrap();
        assert_eq!(f.message(), Some("bad token"));
    }

    #[test]
    fn debug_redacts_token() {
        let dbg = format!("{:?}", Frame::authenticate("secret-token"));
        assert!(!dbg.contains("secret-token"));
        assert!(dbg.contains("REDACTED"));
    }
}
