//! Server implementation.
//!
//! One hub task owns every room and session. Connection tasks and room
//! timers talk to it through [`HubEvent`]s, so room state is only ever
//! touched from a single task:
//! - `Connected` / `Disconnected` track sessions
//! - `Inbound` carries decoded client messages
//! - `Tick` drives one simulation step of one room
//!
//! Each active room has a timer task ticking at the configured rate. The
//! timer starts when the room gains its first player and is aborted when
//! the room empties.

use std::{
    collections::HashMap,
    future::Future,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use motion_shared::{
    config::EngineConfig,
    math::Vec3,
    net::ReliableListener,
    protocol::{ClientMsg, ConnectionId, ErrorCode, InputCommand, PlayerId, RoomId, ServerMsg},
    store::{MemoryUserStore, UserStore},
};
use serde_json::Value;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    connection::{self, Membership, Outbox, Session},
    room::{RoomConfig, RoomStatus},
    rooms::{RoomManager, ScriptInstaller},
};

/// Everything the hub reacts to.
#[derive(Debug)]
pub enum HubEvent {
    Connected { conn: ConnectionId, outbox: Outbox },
    Inbound { conn: ConnectionId, msg: ClientMsg },
    Disconnected { conn: ConnectionId },
    Tick { room: RoomId },
}

/// Owner of rooms, sessions and room timers.
pub struct Hub {
    rooms: RoomManager,
    sessions: HashMap<ConnectionId, Session>,
    timers: HashMap<RoomId, JoinHandle<()>>,
    events: mpsc::UnboundedSender<HubEvent>,
    tick_interval: Duration,
}

impl Hub {
    pub fn new(
        cfg: &EngineConfig,
        store: Arc<dyn UserStore>,
        events: mpsc::UnboundedSender<HubEvent>,
    ) -> Self {
        Self {
            rooms: RoomManager::new(RoomConfig::from(cfg), store),
            sessions: HashMap::new(),
            timers: HashMap::new(),
            events,
            tick_interval: cfg.tick_interval(),
        }
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.rooms
    }

    pub fn rooms_mut(&mut self) -> &mut RoomManager {
        &mut self.rooms
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn membership(&self, conn: ConnectionId) -> Option<&Membership> {
        self.sessions.get(&conn)?.membership.as_ref()
    }

    pub fn timer_running(&self, room: &RoomId) -> bool {
        self.timers.contains_key(room)
    }

    pub fn handle(&mut self, event: HubEvent) {
        match event {
            HubEvent::Connected { conn, outbox } => {
                self.sessions.insert(conn, Session::new(conn, outbox));
            }
            HubEvent::Inbound { conn, msg } => self.on_message(conn, msg),
            HubEvent::Disconnected { conn } => {
                self.leave_room(conn);
                if self.sessions.remove(&conn).is_some() {
                    info!(%conn, "Client disconnected");
                }
            }
            HubEvent::Tick { room } => {
                if let Some(r) = self.rooms.get_mut(&room) {
                    r.tick(Instant::now());
                }
            }
        }
    }

    fn on_message(&mut self, conn: ConnectionId, msg: ClientMsg) {
        match msg {
            ClientMsg::JoinRoom {
                room_id,
                player_name,
                spawn_position,
            } => self.join_room(conn, room_id, &player_name, spawn_position),
            ClientMsg::LeaveRoom => self.leave_room(conn),
            ClientMsg::PlayerInput(input) => self.player_input(conn, input),
            ClientMsg::ChannelMessage {
                channel,
                data,
                target_player_id,
            } => self.channel_message(conn, &channel, data, target_player_id),
            ClientMsg::Ping { timestamp } => {
                if let Some(session) = self.sessions.get(&conn) {
                    session.send(&ServerMsg::Pong { timestamp });
                }
            }
        }
    }

    fn join_room(
        &mut self,
        conn: ConnectionId,
        room_id: Option<RoomId>,
        name: &str,
        spawn: Option<Vec3>,
    ) {
        let Some(outbox) = self.sessions.get(&conn).map(|s| s.outbox.clone()) else {
            return;
        };
        // A connection holds at most one membership.
        self.leave_room(conn);

        let room_id = match room_id {
            Some(id) => id,
            None => self.rooms.find_or_create_available(),
        };
        let room = self.rooms.get_or_create(&room_id);
        match room.add_player(conn, name, spawn, outbox) {
            Ok(player) => {
                if let Some(session) = self.sessions.get_mut(&conn) {
                    session.membership = Some(Membership {
                        room: room_id.clone(),
                        player,
                    });
                }
            }
            Err(e) => {
                warn!(%conn, room = %room_id, error = %e, "Join refused");
                if let Some(session) = self.sessions.get(&conn) {
                    session.send(&ServerMsg::error(e.code(), e.to_string()));
                }
            }
        }
        self.sync_timer(&room_id);
    }

    fn leave_room(&mut self, conn: ConnectionId) {
        let Some(membership) = self
            .sessions
            .get_mut(&conn)
            .and_then(|s| s.membership.take())
        else {
            return;
        };
        if let Some(room) = self.rooms.get_mut(&membership.room) {
            room.remove_player(&membership.player);
        }
        self.sync_timer(&membership.room);
    }

    fn player_input(&mut self, conn: ConnectionId, input: InputCommand) {
        let Some(membership) = self.membership(conn).cloned() else {
            debug!(%conn, "Input outside a room ignored");
            return;
        };
        if let Some(room) = self.rooms.get_mut(&membership.room) {
            room.handle_input(&membership.player, input);
        }
    }

    fn channel_message(
        &mut self,
        conn: ConnectionId,
        channel: &str,
        data: Value,
        target: Option<PlayerId>,
    ) {
        let Some(membership) = self.membership(conn).cloned() else {
            if let Some(session) = self.sessions.get(&conn) {
                session.send(&ServerMsg::error(ErrorCode::NotInRoom, "Not in a room"));
            }
            return;
        };
        if let Some(room) = self.rooms.get_mut(&membership.room) {
            room.handle_channel_message(&membership.player, channel, data, target.as_ref());
        }
    }

    /// Starts or stops the room's timer so it runs exactly while the room
    /// is active.
    fn sync_timer(&mut self, room_id: &RoomId) {
        let active = self
            .rooms
            .get(room_id)
            .map(|r| r.status() == RoomStatus::Active)
            .unwrap_or(false);

        match (active, self.timers.contains_key(room_id)) {
            (true, false) => {
                let handle = spawn_timer(room_id.clone(), self.tick_interval, self.events.clone());
                self.timers.insert(room_id.clone(), handle);
                debug!(room = %room_id, "Room timer started");
            }
            (false, true) => {
                if let Some(handle) = self.timers.remove(room_id) {
                    handle.abort();
                }
                debug!(room = %room_id, "Room timer stopped");
            }
            _ => {}
        }
    }

    /// Drops a room and stops its timer. Its members are detached without
    /// notice and may join again.
    pub fn remove_room(&mut self, room_id: &RoomId) -> bool {
        if let Some(handle) = self.timers.remove(room_id) {
            handle.abort();
        }
        for session in self.sessions.values_mut() {
            if session
                .membership
                .as_ref()
                .is_some_and(|m| &m.room == room_id)
            {
                session.membership = None;
            }
        }
        self.rooms.remove(room_id).is_some()
    }

    /// Stops every timer and drops every room and session.
    pub fn shutdown(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
        self.rooms.shutdown();
        self.sessions.clear();
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }
}

fn spawn_timer(
    room: RoomId,
    period: Duration,
    events: mpsc::UnboundedSender<HubEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if events.send(HubEvent::Tick { room: room.clone() }).is_err() {
                return;
            }
        }
    })
}

/// Game server.
pub struct GameServer {
    pub cfg: EngineConfig,
    listener: ReliableListener,
    hub: Hub,
    events_tx: mpsc::UnboundedSender<HubEvent>,
    events_rx: mpsc::UnboundedReceiver<HubEvent>,
}

impl GameServer {
    /// Binds the listener with an in-memory user store.
    pub async fn bind(cfg: EngineConfig) -> anyhow::Result<Self> {
        Self::bind_with_store(cfg, Arc::new(MemoryUserStore::new())).await
    }

    pub async fn bind_with_store(
        mut cfg: EngineConfig,
        store: Arc<dyn UserStore>,
    ) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let listener = ReliableListener::bind(addr).await?;
        cfg.server_addr = listener.local_addr()?.to_string();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let hub = Hub::new(&cfg, store, events_tx.clone());
        Ok(Self {
            cfg,
            listener,
            hub,
            events_tx,
            events_rx,
        })
    }

    /// Returns the local address (after binding).
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Script hooks installed into every room this server creates.
    pub fn set_script_installer(&mut self, installer: ScriptInstaller) {
        self.hub.rooms_mut().set_script_installer(installer);
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Serves until the process ends.
    pub async fn run(self) -> anyhow::Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serves until `shutdown` resolves, then stops every room.
    pub async fn run_until<F>(mut self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => {
                        let id = ConnectionId::new_unique();
                        let outbox = connection::spawn(conn, id, self.events_tx.clone());
                        self.hub.handle(HubEvent::Connected { conn: id, outbox });
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
                Some(event) = self.events_rx.recv() => self.hub.handle(event),
                _ = &mut shutdown => {
                    info!("Server shutting down");
                    self.hub.shutdown();
                    return Ok(());
                }
            }
        }
    }
}

/// Helper for tests: bind to an ephemeral port.
pub async fn bind_ephemeral(tick_hz: u32) -> anyhow::Result<(GameServer, EngineConfig)> {
    let cfg = EngineConfig {
        server_addr: format!("{}:{}", IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        tick_hz,
        ..Default::default()
    };
    let server = GameServer::bind(cfg).await?;
    let cfg = server.cfg.clone();
    Ok((server, cfg))
}
