//! Client implementation.
//!
//! [`GameClient`] runs one cooperative frame loop. Each call to
//! [`GameClient::frame`]:
//! 1. applies network messages and finished avatar loads
//! 2. samples input and sends it while a movement key is held
//! 3. steps the local physics mirror
//! 4. reconciles against the newest snapshot
//! 5. interpolates remote entities
//! 6. runs client script hooks
//! 7. pushes transforms to the renderer
//!
//! Avatar loads run on spawned tasks; their results come back over a
//! channel and are applied at the start of the next frame.

use std::{collections::VecDeque, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use motion_shared::{
    config::EngineConfig,
    math::{Quat, Vec3},
    protocol::{timestamp_ms, ClientMsg, ErrorCode, PlayerId, RoomId, ServerMsg},
    render::{AvatarLoader, EntityKey, RenderBridge, RenderHandle},
    script::{ChannelSend, ScriptHost},
};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    connection::{Backoff, NetEvent, NetworkManager},
    input::{InputSequencer, InputState},
    prediction::Correction,
    world::ClientWorld,
};

/// Notifications for the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    Joined {
        player_id: PlayerId,
        room_id: RoomId,
        max_players: u32,
        current_players: u32,
    },
    PlayerJoined {
        player_id: PlayerId,
        player_name: String,
    },
    PlayerLeft {
        player_id: PlayerId,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    Channel {
        channel: String,
        data: Value,
        sender_id: Option<PlayerId>,
    },
}

type Creation = (EntityKey, anyhow::Result<RenderHandle>);

/// High-level game client.
pub struct GameClient {
    cfg: EngineConfig,
    net: NetworkManager,
    world: ClientWorld,
    sequencer: InputSequencer,
    renderer: Box<dyn RenderBridge>,
    loader: Arc<dyn AvatarLoader>,
    created_tx: mpsc::UnboundedSender<Creation>,
    created_rx: mpsc::UnboundedReceiver<Creation>,
    events: VecDeque<ClientEvent>,
    room: Option<RoomId>,
    rtt: Option<Duration>,
    last_correction: Option<Correction>,
}

impl GameClient {
    /// Starts connecting to `cfg.server_addr` in the background.
    pub fn connect(
        cfg: EngineConfig,
        renderer: Box<dyn RenderBridge>,
        loader: Arc<dyn AvatarLoader>,
    ) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        info!(server = %addr, name = %cfg.player_name, "Connecting to server");

        let net = NetworkManager::start(addr, Backoff::from_config(&cfg));
        let (created_tx, created_rx) = mpsc::unbounded_channel();
        Ok(Self {
            cfg,
            net,
            world: ClientWorld::new(),
            sequencer: InputSequencer::new(),
            renderer,
            loader,
            created_tx,
            created_rx,
            events: VecDeque::new(),
            room: None,
            rtt: None,
            last_correction: None,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.net.is_connected()
    }

    pub fn player_id(&self) -> Option<&PlayerId> {
        self.world.local_player()
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        self.room.as_ref()
    }

    /// Last measured ping round trip.
    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    pub fn last_correction(&self) -> Option<Correction> {
        self.last_correction
    }

    pub fn world(&self) -> &ClientWorld {
        &self.world
    }

    /// Client script hooks.
    pub fn scripts_mut(&mut self) -> &mut ScriptHost {
        self.world.scripts_mut()
    }

    /// Asks to join `room`, or any room with a free slot.
    pub fn join(&mut self, room: Option<RoomId>, spawn: Option<Vec3>) {
        self.net.send(ClientMsg::JoinRoom {
            room_id: room,
            player_name: self.cfg.player_name.clone(),
            spawn_position: spawn,
        });
    }

    pub fn leave(&mut self) {
        self.net.send(ClientMsg::LeaveRoom);
        self.world.reset(self.renderer.as_mut());
        self.room = None;
    }

    pub fn send_channel(&self, channel: &str, data: Value, target: Option<PlayerId>) {
        self.net.send(ClientMsg::ChannelMessage {
            channel: channel.to_string(),
            data,
            target_player_id: target,
        });
    }

    pub fn ping(&self) {
        self.net.send(ClientMsg::Ping {
            timestamp: timestamp_ms(),
        });
    }

    /// Closes the connection and stops reconnecting.
    pub fn disconnect(&mut self) {
        self.net.disconnect();
        self.world.reset(self.renderer.as_mut());
        self.room = None;
    }

    /// Takes every queued event.
    pub fn drain_events(&mut self) -> Vec<ClientEvent> {
        self.events.drain(..).collect()
    }

    /// Runs one client frame of `dt` seconds.
    pub fn frame(&mut self, input: InputState, dt: f32) {
        self.pump_network();
        self.pump_creations();

        let command = if input.is_active() && self.net.is_connected() && self.world.has_local_body() {
            let cmd = self.sequencer.sample(input, Quat::IDENTITY);
            self.net.send(ClientMsg::PlayerInput(cmd.clone()));
            Some(cmd)
        } else {
            None
        };
        self.world.predict(command.as_ref(), dt);
        if let Some(position) = self.world.local_position() {
            self.net.update_spawn(position);
        }

        if let Some(correction) = self.world.reconcile() {
            if correction != Correction::Stale {
                self.last_correction = Some(correction);
            }
        }
        self.world.interpolate(dt);

        let outgoing = self.world.run_scripts(dt);
        self.send_script_messages(outgoing);

        self.world.render(self.renderer.as_mut());
    }

    fn pump_network(&mut self) {
        while let Some(event) = self.net.try_next_event() {
            match event {
                NetEvent::Connected => self.events.push_back(ClientEvent::Connected),
                NetEvent::Disconnected => {
                    // The server forgets the player; a re-join brings a new id.
                    self.world.reset(self.renderer.as_mut());
                    self.room = None;
                    self.events.push_back(ClientEvent::Disconnected);
                }
                NetEvent::Message(msg) => self.handle_message(msg),
            }
        }
    }

    fn handle_message(&mut self, msg: ServerMsg) {
        match msg {
            ServerMsg::RoomJoined {
                player_id,
                room_id,
                max_players,
                current_players,
            } => {
                info!(player = %player_id, room = %room_id, current_players, "Joined room");
                self.world.set_local_player(player_id.clone(), self.renderer.as_mut());
                self.room = Some(room_id.clone());
                self.events.push_back(ClientEvent::Joined {
                    player_id,
                    room_id,
                    max_players,
                    current_players,
                });
            }
            ServerMsg::Snapshot(snapshot) => {
                if self.room.is_none() {
                    debug!(frame_id = snapshot.frame_id, "Snapshot outside a room ignored");
                    return;
                }
                let pending = self.world.apply_snapshot(snapshot, self.renderer.as_mut());
                for create in pending {
                    self.spawn_creation(create.key, create.is_local);
                }
            }
            ServerMsg::PlayerJoined {
                player_id,
                player_name,
            } => {
                debug!(player = %player_id, name = %player_name, "Player joined");
                self.events.push_back(ClientEvent::PlayerJoined {
                    player_id,
                    player_name,
                });
            }
            ServerMsg::PlayerLeft { player_id } => {
                debug!(player = %player_id, "Player left");
                self.world
                    .remove_entity(&EntityKey::Player(player_id.clone()), self.renderer.as_mut());
                self.events.push_back(ClientEvent::PlayerLeft { player_id });
            }
            ServerMsg::Error { code, message } => {
                warn!(%code, %message, "Server error");
                self.events.push_back(ClientEvent::Error { code, message });
            }
            ServerMsg::ChannelBroadcast {
                channel,
                data,
                sender_id,
            } => {
                let outgoing = self
                    .world
                    .dispatch_channel(&channel, &data, sender_id.as_ref());
                self.send_script_messages(outgoing);
                self.events.push_back(ClientEvent::Channel {
                    channel,
                    data,
                    sender_id,
                });
            }
            ServerMsg::Pong { timestamp } => {
                let elapsed = timestamp_ms().saturating_sub(timestamp).max(0);
                let rtt = Duration::from_millis(elapsed as u64);
                debug!(rtt_ms = elapsed, "Pong");
                self.rtt = Some(rtt);
            }
        }
    }

    fn spawn_creation(&self, key: EntityKey, is_local: bool) {
        let loader = self.loader.clone();
        let tx = self.created_tx.clone();
        tokio::spawn(async move {
            let result = loader.load(key.clone(), is_local).await;
            let _ = tx.send((key, result));
        });
    }

    fn pump_creations(&mut self) {
        while let Ok((key, result)) = self.created_rx.try_recv() {
            self.world
                .complete_creation(key, result, self.renderer.as_mut());
        }
    }

    fn send_script_messages(&self, outgoing: Vec<ChannelSend>) {
        for out in outgoing {
            self.send_channel(&out.channel, out.data, out.target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use motion_shared::{
        math::Transform,
        net::{ReliableConn, ReliableListener},
        protocol::{InputCommand, PlayerState, Snapshot},
        render::NullRenderer,
    };
    use std::{
        collections::BTreeMap,
        sync::atomic::{AtomicUsize, Ordering},
    };

    const DT: f32 = 1.0 / 60.0;

    /// Fails every load for remote players and counts attempts.
    #[derive(Default)]
    struct RemoteFailLoader {
        attempts: AtomicUsize,
        inner: NullRenderer,
    }

    #[async_trait]
    impl AvatarLoader for RemoteFailLoader {
        async fn load(&self, key: EntityKey, is_local: bool) -> anyhow::Result<RenderHandle> {
            if is_local {
                return self.inner.load(key, is_local).await;
            }
            self.attempts.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("no model for {key}")
        }
    }

    fn player(id: &str, position: Vec3) -> PlayerState {
        PlayerState {
            id: PlayerId::from(id),
            name: id.to_string(),
            transform: Transform::from_position(position),
            velocity: Vec3::ZERO,
            input: InputCommand::default(),
        }
    }

    fn snapshot(frame_id: u64, players: &[PlayerState]) -> ServerMsg {
        ServerMsg::Snapshot(Snapshot {
            frame_id,
            timestamp: timestamp_ms(),
            players: players.iter().map(|p| (p.id.clone(), p.clone())).collect(),
            entities: BTreeMap::new(),
        })
    }

    async fn setup(
        loader: Arc<dyn AvatarLoader>,
    ) -> anyhow::Result<(GameClient, ReliableConn)> {
        let listener = ReliableListener::bind("127.0.0.1:0".parse()?).await?;
        let cfg = EngineConfig {
            server_addr: listener.local_addr()?.to_string(),
            player_name: "ada".into(),
            ..Default::default()
        };
        let mut client = GameClient::connect(cfg, Box::new(NullRenderer::default()), loader)?;
        client.join(Some(RoomId::from("r")), None);

        let mut server = listener.accept().await?;
        match server.recv::<ClientMsg>().await? {
            Some(ClientMsg::JoinRoom { player_name, .. }) => assert_eq!(player_name, "ada"),
            other => panic!("unexpected {other:?}"),
        }
        server
            .send(&ServerMsg::RoomJoined {
                player_id: PlayerId::from("me"),
                room_id: RoomId::from("r"),
                max_players: 2,
                current_players: 1,
            })
            .await?;
        Ok((client, server))
    }

    async fn run_frames_until(client: &mut GameClient, mut done: impl FnMut(&GameClient) -> bool) {
        for _ in 0..400 {
            client.frame(InputState::default(), DT);
            if done(client) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn local_avatar_enables_input() -> anyhow::Result<()> {
        let (mut client, mut server) = setup(Arc::new(NullRenderer::default())).await?;
        server
            .send(&snapshot(0, &[player("me", Vec3::new(0.0, 1.4, 0.0))]))
            .await?;

        run_frames_until(&mut client, |c| c.world().has_local_body()).await;
        let events = client.drain_events();
        assert_eq!(events[0], ClientEvent::Connected);
        assert!(matches!(events[1], ClientEvent::Joined { .. }));
        assert_eq!(client.room_id(), Some(&RoomId::from("r")));

        let forward = InputState {
            forward: true,
            ..Default::default()
        };
        client.frame(forward, DT);
        match server.recv::<ClientMsg>().await? {
            Some(ClientMsg::PlayerInput(cmd)) => {
                assert_eq!(cmd.sequence_number, 1);
                assert_eq!(cmd.movement, Vec3::new(0.0, 0.0, -1.0));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(client.world().local_position().unwrap().z < 0.0);
        Ok(())
    }

    #[tokio::test]
    async fn failed_avatar_load_retries_on_next_snapshot() -> anyhow::Result<()> {
        let loader = Arc::new(RemoteFailLoader::default());
        let (mut client, mut server) = setup(loader.clone()).await?;
        let players = [player("me", Vec3::ZERO), player("other", Vec3::ZERO)];

        server.send(&snapshot(0, &players)).await?;
        run_frames_until(&mut client, |_| loader.attempts.load(Ordering::SeqCst) == 1).await;
        // Let the failure be applied.
        run_frames_until(&mut client, |c| {
            c.world().registry().state(&EntityKey::Player(PlayerId::from("other")))
                == crate::registry::SlotState::Absent
        })
        .await;

        server.send(&snapshot(1, &players)).await?;
        run_frames_until(&mut client, |_| loader.attempts.load(Ordering::SeqCst) == 2).await;
        Ok(())
    }

    #[tokio::test]
    async fn pong_measures_rtt() -> anyhow::Result<()> {
        let (mut client, mut server) = setup(Arc::new(NullRenderer::default())).await?;
        client.ping();
        let ts = match server.recv::<ClientMsg>().await? {
            Some(ClientMsg::Ping { timestamp }) => timestamp,
            other => panic!("unexpected {other:?}"),
        };
        server.send(&ServerMsg::Pong { timestamp: ts }).await?;
        run_frames_until(&mut client, |c| c.rtt().is_some()).await;
        Ok(())
    }
}
