//! Full socket-based integration tests for client ↔ server communication.

use std::{sync::Arc, time::Duration};

use motion_client::{input::InputState, ClientEvent, GameClient};
use motion_shared::{
    config::EngineConfig,
    protocol::{PlayerId, RoomId},
    render::{EntityKey, NullRenderer},
};
use motion_tests::{init_tracing, TestServer, WAIT};
use serde_json::json;
use tokio::time::{sleep, Instant};

const DT: f32 = 1.0 / 60.0;

fn client(cfg: &EngineConfig, name: &str) -> anyhow::Result<GameClient> {
    let cfg = EngineConfig {
        player_name: name.to_string(),
        ..cfg.clone()
    };
    GameClient::connect(
        cfg,
        Box::new(NullRenderer::default()),
        Arc::new(NullRenderer::default()),
    )
}

/// Runs frames with `input` until `done` holds, collecting events.
async fn frames_until(
    client: &mut GameClient,
    input: InputState,
    events: &mut Vec<ClientEvent>,
    mut done: impl FnMut(&GameClient, &[ClientEvent]) -> bool,
) -> anyhow::Result<()> {
    let deadline = Instant::now() + WAIT;
    loop {
        client.frame(input, DT);
        events.extend(client.drain_events());
        if done(client, &events[..]) {
            return Ok(());
        }
        anyhow::ensure!(Instant::now() < deadline, "condition not reached in time");
        sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_joins_and_predicts_movement() -> anyhow::Result<()> {
    init_tracing();
    let server = TestServer::start(60).await?;

    let mut c = client(&server.cfg, "TestPlayer")?;
    c.join(Some(RoomId::from("arena")), None);

    let mut events = Vec::new();
    frames_until(&mut c, InputState::default(), &mut events, |c, _| {
        c.world().has_local_body()
    })
    .await?;
    assert!(matches!(events[0], ClientEvent::Connected));
    assert!(events.iter().any(|e| matches!(
        e,
        ClientEvent::Joined { room_id, current_players: 1, .. } if room_id.0 == "arena"
    )));
    assert_eq!(c.room_id(), Some(&RoomId::from("arena")));

    let start = c.world().local_position().expect("local body");
    let forward = InputState {
        forward: true,
        ..Default::default()
    };
    frames_until(&mut c, forward, &mut events, |c, _| {
        c.world()
            .local_position()
            .is_some_and(|p| p.z < start.z - 0.2)
    })
    .await?;

    // Later snapshots keep feeding reconciliation.
    frames_until(&mut c, InputState::default(), &mut events, |c, _| {
        c.world().reconciler().last_processed_frame() > Some(0)
    })
    .await?;

    c.disconnect();
    server.stop().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clients_see_each_other_and_exchange_channels() -> anyhow::Result<()> {
    init_tracing();
    let server = TestServer::start(60).await?;

    let mut a = client(&server.cfg, "alice")?;
    let mut b = client(&server.cfg, "bob")?;
    a.join(Some(RoomId::from("pair")), None);
    let mut a_events = Vec::new();
    frames_until(&mut a, InputState::default(), &mut a_events, |c, _| {
        c.player_id().is_some()
    })
    .await?;

    b.join(Some(RoomId::from("pair")), None);
    let mut b_events = Vec::new();
    frames_until(&mut b, InputState::default(), &mut b_events, |c, _| {
        c.player_id().is_some()
    })
    .await?;
    let bob: PlayerId = b.player_id().cloned().expect("joined");
    let alice: PlayerId = a.player_id().cloned().expect("joined");

    // Alice hears about Bob and starts interpolating him.
    let bob_key = EntityKey::Player(bob.clone());
    frames_until(&mut a, InputState::default(), &mut a_events, |c, ev| {
        c.world().transform_of(&bob_key).is_some()
            && ev
                .iter()
                .any(|e| matches!(e, ClientEvent::PlayerJoined { player_id, .. } if *player_id == bob))
    })
    .await?;

    a.send_channel("emote", json!({ "kind": "wave" }), None);
    frames_until(&mut b, InputState::default(), &mut b_events, |_, ev| {
        ev.iter().any(|e| {
            *e == ClientEvent::Channel {
                channel: "emote".into(),
                data: json!({ "kind": "wave" }),
                sender_id: Some(alice.clone()),
            }
        })
    })
    .await?;

    // Bob leaving removes him from Alice's world.
    b.leave();
    frames_until(&mut a, InputState::default(), &mut a_events, |c, ev| {
        c.world().transform_of(&bob_key).is_none()
            && ev
                .iter()
                .any(|e| matches!(e, ClientEvent::PlayerLeft { player_id } if *player_id == bob))
    })
    .await?;

    a.disconnect();
    b.disconnect();
    server.stop().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ping_reports_round_trip_time() -> anyhow::Result<()> {
    init_tracing();
    let server = TestServer::start(30).await?;

    let mut c = client(&server.cfg, "pinger")?;
    let mut events = Vec::new();
    frames_until(&mut c, InputState::default(), &mut events, |c, _| {
        c.is_connected()
    })
    .await?;

    c.ping();
    frames_until(&mut c, InputState::default(), &mut events, |c, _| {
        c.rtt().is_some()
    })
    .await?;
    assert!(c.rtt() < Some(WAIT));

    c.disconnect();
    server.stop().await
}
