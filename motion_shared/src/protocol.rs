//! Wire protocol.
//!
//! Every message is a JSON object tagged with a `"type"` field
//! (`"JOIN_ROOM"`, `"SNAPSHOT"`, ...) and camelCase field names.
//! Sequence numbers on [`InputCommand`] correlate client predictions with
//! server acknowledgments; frame ids on [`Snapshot`] total-order a room's
//! snapshots.

use std::{
    collections::BTreeMap,
    fmt,
    sync::atomic::{AtomicU32, Ordering},
};

use bitflags::bitflags;
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};

use crate::math::{Quat, Transform, Vec3};

static NEXT_CONNECTION_ID: AtomicU32 = AtomicU32::new(1);

/// Identifies one transport connection for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    pub fn new_unique() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Stable player identifier, also used as the persistence user id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub String);

impl PlayerId {
    const LEN: usize = 12;

    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        let id = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(Self::LEN)
            .map(char::from)
            .collect();
        PlayerId(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerId {
    fn from(s: &str) -> Self {
        PlayerId(s.to_string())
    }
}

/// Room identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn generate() -> Self {
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        RoomId(id.to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        RoomId(s.to_string())
    }
}

bitflags! {
    /// Discrete actions held during an input sample.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Actions: u32 {
        const FIRE = 1 << 0;
        const INTERACT = 1 << 1;
        const SPRINT = 1 << 2;
    }
}

/// One sampled client input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InputCommand {
    /// Horizontal intent in x/z; positive y requests a jump.
    pub movement: Vec3,
    pub rotation: Quat,
    #[serde(default)]
    pub actions: Actions,
    /// Client wall-clock time in milliseconds.
    pub timestamp: i64,
    pub sequence_number: u32,
}

/// Authoritative per-player state as carried in snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    pub id: PlayerId,
    pub name: String,
    pub transform: Transform,
    pub velocity: Vec3,
    /// Last input applied for this player.
    pub input: InputCommand,
}

/// Full room state at one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub frame_id: u64,
    /// Server wall-clock time in milliseconds.
    pub timestamp: i64,
    pub players: BTreeMap<PlayerId, PlayerState>,
    #[serde(default)]
    pub entities: BTreeMap<String, Transform>,
}

/// Client to server messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMsg {
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<RoomId>,
        player_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        spawn_position: Option<Vec3>,
    },
    LeaveRoom,
    PlayerInput(InputCommand),
    #[serde(rename_all = "camelCase")]
    ChannelMessage {
        channel: String,
        #[serde(default)]
        data: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_player_id: Option<PlayerId>,
    },
    Ping {
        timestamp: i64,
    },
}

/// Machine-readable error codes carried by [`ServerMsg::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessage,
    RoomFull,
    NotInRoom,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::RoomFull => "ROOM_FULL",
            ErrorCode::NotInRoom => "NOT_IN_ROOM",
        };
        f.write_str(s)
    }
}

/// Server to client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMsg {
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        player_id: PlayerId,
        room_id: RoomId,
        max_players: u32,
        current_players: u32,
    },
    Snapshot(Snapshot),
    #[serde(rename_all = "camelCase")]
    PlayerJoined {
        player_id: PlayerId,
        player_name: String,
    },
    #[serde(rename_all = "camelCase")]
    PlayerLeft { player_id: PlayerId },
    Error { code: ErrorCode, message: String },
    #[serde(rename_all = "camelCase")]
    ChannelBroadcast {
        channel: String,
        #[serde(default)]
        data: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<PlayerId>,
    },
    Pong {
        timestamp: i64,
    },
}

impl ServerMsg {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMsg::Error {
            code,
            message: message.into(),
        }
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_room_wire_shape() {
        let msg = ClientMsg::JoinRoom {
            room_id: None,
            player_name: "ada".into(),
            spawn_position: Some(Vec3::new(1.0, 2.0, 3.0)),
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            v,
            json!({
                "type": "JOIN_ROOM",
                "playerName": "ada",
                "spawnPosition": {"x": 1.0, "y": 2.0, "z": 3.0}
            })
        );
    }

    #[test]
    fn leave_room_is_bare_tag() {
        let msg: ClientMsg = serde_json::from_str(r#"{"type":"LEAVE_ROOM"}"#).unwrap();
        assert_eq!(msg, ClientMsg::LeaveRoom);
    }

    #[test]
    fn player_input_fields_are_flattened() {
        let raw = json!({
            "type": "PLAYER_INPUT",
            "movement": {"x": 1.0, "y": 0.0, "z": -1.0},
            "rotation": {"x": 0.0, "y": 0.0, "z": 0.0, "w": 1.0},
            "actions": "FIRE",
            "timestamp": 1700000000000i64,
            "sequenceNumber": 42
        });
        let msg: ClientMsg = serde_json::from_value(raw).unwrap();
        match msg {
            ClientMsg::PlayerInput(input) => {
                assert_eq!(input.sequence_number, 42);
                assert_eq!(input.movement, Vec3::new(1.0, 0.0, -1.0));
                assert!(input.actions.contains(Actions::FIRE));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn error_code_serializes_screaming() {
        let v = serde_json::to_value(ServerMsg::error(ErrorCode::RoomFull, "Room is full")).unwrap();
        assert_eq!(v["type"], "ERROR");
        assert_eq!(v["code"], "ROOM_FULL");
    }

    #[test]
    fn snapshot_keys_players_by_id() {
        let id = PlayerId::from("p1");
        let mut players = BTreeMap::new();
        players.insert(
            id.clone(),
            PlayerState {
                id: id.clone(),
                name: "one".into(),
                transform: Transform::default(),
                velocity: Vec3::ZERO,
                input: InputCommand::default(),
            },
        );
        let msg = ServerMsg::Snapshot(Snapshot {
            frame_id: 7,
            timestamp: 0,
            players,
            entities: BTreeMap::new(),
        });
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["frameId"], 7);
        assert_eq!(v["players"]["p1"]["name"], "one");
        let back: ServerMsg = serde_json::from_value(v).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn generated_ids_are_distinct() {
        let a = PlayerId::generate();
        let b = PlayerId::generate();
        assert_eq!(a.as_str().len(), 12);
        assert_ne!(a, b);
        assert_ne!(ConnectionId::new_unique(), ConnectionId::new_unique());
    }
}
