//! Authoritative room simulation.
//!
//! A [`Room`] owns one physics world, its members and the script hooks
//! installed for it. It never touches a socket or a timer: members are
//! reached through their outbox channel, and the owner calls
//! [`Room::tick`] at the room's tick rate while [`Room::status`] is
//! [`RoomStatus::Active`].
//!
//! Frame ids start at 0 and grow by exactly one per tick, so snapshots
//! from one room are totally ordered.

use std::{collections::BTreeMap, fmt, sync::Arc, time::Instant};

use motion_shared::{
    config::EngineConfig,
    math::{Transform, Vec3},
    net::encode_frame,
    physics::{random_spawn, BodyHandle, PhysicsWorld},
    protocol::{
        timestamp_ms, ConnectionId, ErrorCode, InputCommand, PlayerId, PlayerState, RoomId,
        ServerMsg, Snapshot,
    },
    script::ScriptHost,
    store::UserStore,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::connection::Outbox;

/// Per-room limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomConfig {
    pub max_players: u32,
    pub tick_hz: u32,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for RoomConfig {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            max_players: cfg.max_players,
            tick_hz: cfg.tick_hz,
        }
    }
}

/// Whether a room currently wants ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomStatus {
    /// No members; the tick timer must be stopped.
    Empty,
    /// At least one member; the tick timer must be running.
    Active,
}

/// Reasons a join is refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    RoomFull { max_players: u32 },
}

impl JoinError {
    pub fn code(&self) -> ErrorCode {
        match self {
            JoinError::RoomFull { .. } => ErrorCode::RoomFull,
        }
    }
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::RoomFull { max_players } => {
                write!(f, "Room is full ({max_players} players)")
            }
        }
    }
}

impl std::error::Error for JoinError {}

struct Member {
    conn: ConnectionId,
    state: PlayerState,
    body: BodyHandle,
    outbox: Outbox,
}

/// One simulation instance.
pub struct Room {
    id: RoomId,
    cfg: RoomConfig,
    physics: PhysicsWorld,
    members: BTreeMap<PlayerId, Member>,
    scripts: ScriptHost,
    store: Arc<dyn UserStore>,
    next_frame_id: u64,
    status: RoomStatus,
    last_tick: Instant,
}

impl Room {
    pub fn new(id: RoomId, cfg: RoomConfig, store: Arc<dyn UserStore>) -> Self {
        Self {
            id,
            cfg,
            physics: PhysicsWorld::default(),
            members: BTreeMap::new(),
            scripts: ScriptHost::new(),
            store,
            next_frame_id: 0,
            status: RoomStatus::Empty,
            last_tick: Instant::now(),
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn config(&self) -> RoomConfig {
        self.cfg
    }

    pub fn status(&self) -> RoomStatus {
        self.status
    }

    pub fn player_count(&self) -> u32 {
        self.members.len() as u32
    }

    /// True when another player could join.
    pub fn has_free_slot(&self) -> bool {
        self.player_count() < self.cfg.max_players
    }

    /// Frame id the next tick will carry.
    pub fn next_frame_id(&self) -> u64 {
        self.next_frame_id
    }

    pub fn body_count(&self) -> usize {
        self.physics.body_count()
    }

    pub fn player(&self, id: &PlayerId) -> Option<&PlayerState> {
        self.members.get(id).map(|m| &m.state)
    }

    pub fn connection_of(&self, id: &PlayerId) -> Option<ConnectionId> {
        self.members.get(id).map(|m| m.conn)
    }

    pub fn player_ids(&self) -> impl Iterator<Item = &PlayerId> {
        self.members.keys()
    }

    pub fn scripts_mut(&mut self) -> &mut ScriptHost {
        &mut self.scripts
    }

    /// Admits a player. On success the joiner receives `ROOM_JOINED`
    /// followed by a snapshot of the current state, and every other member
    /// receives `PLAYER_JOINED`. A full room is left untouched.
    pub fn add_player(
        &mut self,
        conn: ConnectionId,
        name: &str,
        spawn: Option<Vec3>,
        outbox: Outbox,
    ) -> Result<PlayerId, JoinError> {
        if !self.has_free_slot() {
            return Err(JoinError::RoomFull {
                max_players: self.cfg.max_players,
            });
        }

        let player_id = PlayerId::generate();
        if let Err(e) = self.store.create_user(&player_id, name) {
            warn!(room = %self.id, player = %player_id, error = %e, "Failed to register user");
        }

        let position = match spawn {
            Some(p) if p.is_finite() => p,
            _ => random_spawn(),
        };
        let body = self.physics.create_body(position);
        let state = PlayerState {
            id: player_id.clone(),
            name: name.to_string(),
            transform: Transform::from_position(position),
            velocity: Vec3::ZERO,
            input: InputCommand {
                timestamp: timestamp_ms(),
                ..Default::default()
            },
        };
        self.members.insert(
            player_id.clone(),
            Member {
                conn,
                state,
                body,
                outbox,
            },
        );

        self.send_to(
            &player_id,
            &ServerMsg::RoomJoined {
                player_id: player_id.clone(),
                room_id: self.id.clone(),
                max_players: self.cfg.max_players,
                current_players: self.player_count(),
            },
        );
        self.broadcast(
            &ServerMsg::PlayerJoined {
                player_id: player_id.clone(),
                player_name: name.to_string(),
            },
            Some(&player_id),
        );

        if self.status == RoomStatus::Empty {
            self.status = RoomStatus::Active;
            self.last_tick = Instant::now();
            debug!(room = %self.id, "Room active");
        }

        let snapshot = self.build_snapshot(self.next_frame_id);
        self.send_to(&player_id, &ServerMsg::Snapshot(snapshot));

        info!(
            room = %self.id,
            player = %player_id,
            %conn,
            name,
            ?position,
            players = self.player_count(),
            "Player joined"
        );
        Ok(player_id)
    }

    /// Removes a player, frees its body and notifies the remaining members.
    /// The room goes back to [`RoomStatus::Empty`] with its last member.
    pub fn remove_player(&mut self, id: &PlayerId) -> Option<PlayerState> {
        let member = self.members.remove(id)?;
        self.physics.remove_body(member.body);
        self.broadcast(
            &ServerMsg::PlayerLeft {
                player_id: id.clone(),
            },
            None,
        );
        info!(room = %self.id, player = %id, players = self.player_count(), "Player left");

        if self.members.is_empty() {
            self.status = RoomStatus::Empty;
            debug!(room = %self.id, "Room empty");
        }
        Some(member.state)
    }

    /// Applies an input immediately: the movement intent goes to the
    /// player's body and the command becomes the player's last input.
    ///
    /// Returns false for unknown players and for inputs carrying non-finite
    /// numbers; the latter are answered with `INVALID_MESSAGE` and leave the
    /// player's state untouched.
    pub fn handle_input(&mut self, id: &PlayerId, mut input: InputCommand) -> bool {
        if !self.members.contains_key(id) {
            return false;
        }
        if !input.movement.is_finite() || !input.rotation.is_finite() {
            warn!(room = %self.id, player = %id, "Non-finite input rejected");
            self.send_error(id, ErrorCode::InvalidMessage, "Input values must be finite");
            return false;
        }
        input.rotation = input.rotation.normalize();

        let Some(member) = self.members.get_mut(id) else {
            return false;
        };
        self.physics.apply_movement_intent(member.body, input.movement);
        member.state.input = input;
        true
    }

    /// Runs one simulation step and broadcasts the resulting snapshot.
    /// Returns the frame id used, or `None` when the room is empty.
    pub fn tick(&mut self, now: Instant) -> Option<u64> {
        if self.status == RoomStatus::Empty {
            return None;
        }

        let dt = now.saturating_duration_since(self.last_tick).as_secs_f32();
        self.last_tick = now;
        self.physics.step_fixed(dt);

        for member in self.members.values_mut() {
            if let Some(body) = self.physics.read_state(member.body) {
                member.state.transform.position = body.position;
                member.state.transform.rotation = body.rotation;
                member.state.velocity = body.velocity;
            }
        }

        self.scripts.run_frame(dt, Some(self.store.as_ref()));
        self.flush_script_outbox();

        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;
        let snapshot = self.build_snapshot(frame_id);
        self.broadcast(&ServerMsg::Snapshot(snapshot), None);
        Some(frame_id)
    }

    /// Routes a player's channel message through the room's handlers, then
    /// forwards it to `target` or to every other member.
    pub fn handle_channel_message(
        &mut self,
        sender: &PlayerId,
        channel: &str,
        data: Value,
        target: Option<&PlayerId>,
    ) -> bool {
        if !self.members.contains_key(sender) {
            return false;
        }

        let handled = self
            .scripts
            .dispatch(channel, &data, Some(sender), Some(self.store.as_ref()));
        debug!(room = %self.id, %sender, channel, handled, "Channel message");
        self.flush_script_outbox();

        let msg = ServerMsg::ChannelBroadcast {
            channel: channel.to_string(),
            data,
            sender_id: Some(sender.clone()),
        };
        match target {
            Some(target) => self.send_to(target, &msg),
            None => self.broadcast(&msg, Some(sender)),
        }
        true
    }

    /// Server-originated channel message.
    pub fn send_channel(&mut self, channel: &str, data: Value, target: Option<&PlayerId>) {
        let msg = ServerMsg::ChannelBroadcast {
            channel: channel.to_string(),
            data,
            sender_id: None,
        };
        match target {
            Some(target) => self.send_to(target, &msg),
            None => self.broadcast(&msg, None),
        }
    }

    /// Sends an error to one member.
    pub fn send_error(&self, id: &PlayerId, code: ErrorCode, message: &str) {
        self.send_to(id, &ServerMsg::error(code, message));
    }

    fn flush_script_outbox(&mut self) {
        for out in self.scripts.take_outbox() {
            self.send_channel(&out.channel, out.data, out.target.as_ref());
        }
    }

    fn build_snapshot(&self, frame_id: u64) -> Snapshot {
        Snapshot {
            frame_id,
            timestamp: timestamp_ms(),
            players: self
                .members
                .iter()
                .map(|(id, m)| (id.clone(), m.state.clone()))
                .collect(),
            entities: self.scripts.entities().clone(),
        }
    }

    fn send_to(&self, id: &PlayerId, msg: &ServerMsg) {
        let Some(member) = self.members.get(id) else {
            debug!(room = %self.id, player = %id, "Dropping message for unknown player");
            return;
        };
        match encode_frame(msg) {
            // A closed outbox means the connection is going away; its
            // disconnect event removes the member.
            Ok(frame) => {
                member.outbox.push(frame);
            }
            Err(e) => warn!(room = %self.id, error = %e, "Failed to encode message"),
        }
    }

    /// Encodes once and fans the frame out to every member but `except`.
    fn broadcast(&self, msg: &ServerMsg, except: Option<&PlayerId>) {
        let frame = match encode_frame(msg) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(room = %self.id, error = %e, "Failed to encode broadcast");
                return;
            }
        };
        for (id, member) in &self.members {
            if Some(id) == except {
                continue;
            }
            if !member.outbox.push(frame.clone()) {
                debug!(room = %self.id, player = %id, "Frame dropped");
            }
        }
    }
}
