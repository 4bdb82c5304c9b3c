//! Wire frames exchanged with clients and events carried between shards

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::auth::provider::Action;
use crate::core::ids::{ConnectionId, RoomId, RoomKey, ShardId, TenantId, UserId};
use crate::core::presence::PresenceChanged;
use crate::error::{HubError, Result};

/// Client-to-server frame: `{type, room_id?, payload, client_msg_id?}`.
/// Fields other than the envelope ones are folded into the payload, so
/// `{"type":"message","content":"hi"}` is accepted as well.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_msg_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self> {
        let mut frame: Self =
            serde_json::from_str(text).map_err(|e| HubError::InvalidFrame(e.to_string()))?;
        frame.normalize()?;
        Ok(frame)
    }

    /// Build a routed frame in code (tests, administrative senders)
    pub fn new(kind: impl Into<String>, room_id: impl Into<RoomId>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            room_id: Some(room_id.into()),
            payload,
            client_msg_id: None,
            extra: Map::new(),
        }
    }

    pub fn with_client_msg_id(mut self, id: impl Into<String>) -> Self {
        self.client_msg_id = Some(id.into());
        self
    }

    fn normalize(&mut self) -> Result<()> {
        if self.kind.trim().is_empty() {
            return Err(HubError::InvalidFrame("frame type is empty".to_string()));
        }
        let extra = std::mem::take(&mut self.extra);
        match &mut self.payload {
            Value::Null => self.payload = Value::Object(extra),
            Value::Object(fields) => {
                for (key, value) in extra {
                    fields.entry(key).or_insert(value);
                }
            }
            _ if extra.is_empty() => {}
            _ => {
                return Err(HubError::InvalidFrame(
                    "payload must be an object when extra fields are present".to_string(),
                ))
            }
        }
        Ok(())
    }

    pub fn frame_kind(&self) -> FrameKind {
        FrameKind::parse(&self.kind)
    }

    pub fn require_room(&self) -> Result<RoomId> {
        self.room_id
            .clone()
            .ok_or_else(|| HubError::InvalidFrame(format!("{} frame needs a room_id", self.kind)))
    }

    /// User content carried by the frame, if any
    pub fn content(&self) -> Option<&str> {
        self.payload.get("content").and_then(Value::as_str)
    }

    /// Target user of a kick frame
    pub fn target_user(&self) -> Option<UserId> {
        self.payload
            .get("user_id")
            .and_then(Value::as_str)
            .map(UserId::from)
    }
}

/// Dispatch class of an inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    Join,
    Leave,
    Kick,
    Ping,
    /// message, typing, reaction, or any other type delivered to a room
    Routed(String),
}

impl FrameKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "join" => Self::Join,
            "leave" => Self::Leave,
            "kick" => Self::Kick,
            "ping" => Self::Ping,
            other => Self::Routed(other.to_string()),
        }
    }

    /// Room permission the frame requires
    pub fn required_action(&self) -> Option<Action> {
        match self {
            Self::Join => Some(Action::Read),
            Self::Kick => Some(Action::Moderate),
            Self::Routed(_) => Some(Action::Write),
            Self::Leave | Self::Ping => None,
        }
    }
}

/// A routed event before sequencing; what non-owning shards forward
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutedEvent {
    pub kind: String,
    pub room_id: RoomId,
    pub tenant_id: TenantId,
    pub author_id: UserId,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_msg_id: Option<String>,
    /// Originating connection, excluded from fan-out when echo is off
    pub origin_connection: ConnectionId,
    pub origin_shard: ShardId,
}

impl RoutedEvent {
    pub fn room_key(&self) -> RoomKey {
        RoomKey::new(self.tenant_id.clone(), self.room_id.clone())
    }
}

/// A routed event after the owning shard stamped it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub event: RoutedEvent,
    pub seq: u64,
    pub server_timestamp: DateTime<Utc>,
}

/// Server-to-client frame: `{type, room_id, seq, author_id, payload, server_timestamp}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    /// Only routed events carry a sequence number
    #[serde(default)]
    pub seq: Option<u64>,
    #[serde(default)]
    pub author_id: Option<UserId>,
    pub payload: Value,
    pub server_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_msg_id: Option<String>,
}

impl ServerFrame {
    fn system(kind: &str, room_id: Option<RoomId>, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            room_id,
            seq: None,
            author_id: None,
            payload,
            server_timestamp: Utc::now(),
            client_msg_id: None,
        }
    }

    pub fn routed(sequenced: &SequencedEvent) -> Self {
        let event = &sequenced.event;
        Self {
            kind: event.kind.clone(),
            room_id: Some(event.room_id.clone()),
            seq: Some(sequenced.seq),
            author_id: Some(event.author_id.clone()),
            payload: event.payload.clone(),
            server_timestamp: sequenced.server_timestamp,
            client_msg_id: event.client_msg_id.clone(),
        }
    }

    pub fn joined(room_id: &RoomId, last_seq: u64, members: Vec<UserId>) -> Self {
        Self::system(
            "joined",
            Some(room_id.clone()),
            serde_json::json!({ "last_seq": last_seq, "members": members }),
        )
    }

    pub fn left(room_id: &RoomId) -> Self {
        Self::system("left", Some(room_id.clone()), Value::Object(Map::new()))
    }

    pub fn member_joined(room_id: &RoomId, user_id: &UserId) -> Self {
        Self::system(
            "member_joined",
            Some(room_id.clone()),
            serde_json::json!({ "user_id": user_id }),
        )
    }

    pub fn member_left(room_id: &RoomId, user_id: &UserId, reason: Option<&str>) -> Self {
        let mut payload = serde_json::json!({ "user_id": user_id });
        if let Some(reason) = reason {
            payload["reason"] = Value::from(reason);
        }
        Self::system("member_left", Some(room_id.clone()), payload)
    }

    pub fn presence(room_id: &RoomId, change: &PresenceChanged) -> Self {
        Self::system(
            "presence",
            Some(room_id.clone()),
            serde_json::json!({
                "user_id": change.user_id,
                "status": change.status,
                "last_seen": change.last_seen,
            }),
        )
    }

    /// Receipt for the sender when its own event is not echoed back
    pub fn ack(sequenced: &SequencedEvent) -> Self {
        let mut frame = Self::system(
            "ack",
            Some(sequenced.event.room_id.clone()),
            Value::Object(Map::new()),
        );
        frame.seq = Some(sequenced.seq);
        frame.client_msg_id = sequenced.event.client_msg_id.clone();
        frame.server_timestamp = sequenced.server_timestamp;
        frame
    }

    pub fn pong() -> Self {
        Self::system("pong", None, Value::Object(Map::new()))
    }

    pub fn error(error: &HubError, room_id: Option<RoomId>, client_msg_id: Option<String>) -> Self {
        let mut frame = Self::system(
            "error",
            room_id,
            serde_json::json!({ "code": error.code(), "message": error.client_message() }),
        );
        frame.client_msg_id = client_msg_id;
        frame
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_top_level_fields_fold_into_payload() {
        let frame =
            ClientFrame::parse(r#"{"type":"message","room_id":"general","content":"hi"}"#).unwrap();
        assert_eq!(frame.frame_kind(), FrameKind::Routed("message".to_string()));
        assert_eq!(frame.content(), Some("hi"));
        assert_eq!(frame.require_room().unwrap(), RoomId::from("general"));
    }

    #[test]
    fn test_explicit_payload_wins_over_extras() {
        let frame = ClientFrame::parse(
            r#"{"type":"kick","room_id":"general","payload":{"user_id":"bob"},"user_id":"carol"}"#,
        )
        .unwrap();
        assert_eq!(frame.target_user(), Some(UserId::from("bob")));
        assert_eq!(frame.frame_kind().required_action(), Some(Action::Moderate));
    }

    #[test]
    fn test_invalid_frames() {
        assert!(matches!(ClientFrame::parse("not json"), Err(HubError::InvalidFrame(_))));
        assert!(matches!(ClientFrame::parse(r#"{"type":""}"#), Err(HubError::InvalidFrame(_))));
        assert!(ClientFrame::parse(r#"{"type":"ping"}"#).unwrap().require_room().is_err());
    }

    #[test]
    fn test_routed_frame_shape() {
        let sequenced = SequencedEvent {
            event: RoutedEvent {
                kind: "message".to_string(),
                room_id: "general".into(),
                tenant_id: "acme".into(),
                author_id: "alice".into(),
                payload: json!({ "content": "hi" }),
                client_msg_id: None,
                origin_connection: ConnectionId::new(),
                origin_shard: ShardId(0),
            },
            seq: 1,
            server_timestamp: Utc::now(),
        };
        let encoded = ServerFrame::routed(&sequenced).encode().unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["room_id"], "general");
        assert_eq!(value["seq"], 1);
        assert_eq!(value["author_id"], "alice");
        assert_eq!(value["payload"]["content"], "hi");
        assert!(value.get("client_msg_id").is_none());
    }

    #[test]
    fn test_error_frame_hides_infrastructure_detail() {
        let error = HubError::UpstreamUnavailable("authz at 10.0.0.3 refused".to_string());
        let frame = ServerFrame::error(&error, None, Some("m1".to_string()));
        assert_eq!(frame.payload["code"], "TRY_AGAIN");
        assert!(!frame.payload["message"].as_str().unwrap().contains("10.0.0.3"));
    }
}
