//! Standalone headless client.
//!
//! Usage:
//!   cargo run -p motion_client -- [--config client.json] [--addr 127.0.0.1:40000]
//!                                 [--name Player] [--room lobby]
//!
//! The client connects, joins a room and runs the frame loop at the tick
//! rate. Movement keys are toggled from stdin.
//!
//! Console commands:
//!   w / a / s / d / jump   - Toggle a held key
//!   stop                   - Release every key
//!   say <channel> <text>   - Send a channel message to the room
//!   ping                   - Measure round-trip time
//!   join [room]            - Join a room (any free room without an id)
//!   leave                  - Leave the current room
//!   status                 - Show client status
//!   quit                   - Exit client

use std::{
    env,
    io::{BufRead, Write},
    path::PathBuf,
    sync::Arc,
};

use anyhow::Context;
use motion_client::{client::GameClient, input::InputState};
use motion_shared::{config::EngineConfig, protocol::RoomId, render::NullRenderer};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> anyhow::Result<EngineConfig> {
    let args: Vec<String> = env::args().collect();
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) => {
            let path = args.get(i + 1).context("--config needs a path")?;
            EngineConfig::load(&PathBuf::from(path))?
        }
        None => EngineConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--name" if i + 1 < args.len() => {
                cfg.player_name = args[i + 1].clone();
                i += 2;
            }
            "--room" if i + 1 < args.len() => {
                cfg.room_id = Some(args[i + 1].clone());
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().context("parse --tick-hz")?;
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

/// Forwards non-empty console lines until end of input or until the
/// receiver goes away.
fn pump_console(mut input: impl BufRead, mut prompt: impl Write, tx: mpsc::Sender<String>) {
    loop {
        let _ = write!(prompt, "] ");
        let _ = prompt.flush();
        let mut line = String::new();
        match input.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = line.trim().to_string();
        if !line.is_empty() && tx.blocking_send(line).is_err() {
            break;
        }
    }
}

/// Applies one console line. Returns false on `quit`.
fn exec_console(client: &mut GameClient, keys: &mut InputState, line: &str) -> bool {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some(cmd) = tokens.first() else {
        return true;
    };
    match *cmd {
        "w" => keys.forward = !keys.forward,
        "s" => keys.back = !keys.back,
        "a" => keys.left = !keys.left,
        "d" => keys.right = !keys.right,
        "jump" => keys.jump = !keys.jump,
        "stop" => *keys = InputState::default(),
        "say" if tokens.len() >= 3 => {
            client.send_channel(tokens[1], json!(tokens[2..].join(" ")), None);
        }
        "ping" => client.ping(),
        "join" => client.join(tokens.get(1).map(|r| RoomId::from(*r)), None),
        "leave" => client.leave(),
        "status" => {
            println!("Connected: {}", client.is_connected());
            println!("Player: {:?}", client.player_id());
            println!("Room: {:?}", client.room_id());
            println!("Entities: {}", client.world().registry().len());
            println!("Position: {:?}", client.world().local_position());
            println!("RTT: {:?}", client.rtt());
        }
        "quit" | "exit" => return false,
        other => println!("Unknown command: {other}"),
    }
    true
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(server = %cfg.server_addr, name = %cfg.player_name, "Starting client");

    let tick_interval = cfg.tick_interval();
    let room = cfg.room_id.as_deref().map(RoomId::from);
    let mut client = GameClient::connect(
        cfg,
        Box::new(NullRenderer::default()),
        Arc::new(NullRenderer::default()),
    )
    .context("connect")?;
    client.join(room, None);

    // Set up console input channel.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);

    // Spawn stdin reader thread.
    std::thread::spawn(move || {
        pump_console(std::io::stdin().lock(), std::io::stdout(), console_tx);
    });

    println!("Client started. Type 'status' for info, 'quit' to exit.");
    println!();

    let mut keys = InputState::default();
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;

        while let Ok(line) = console_rx.try_recv() {
            if !exec_console(&mut client, &mut keys, &line) {
                client.disconnect();
                return Ok(());
            }
        }

        client.frame(keys, tick_interval.as_secs_f32());
        for event in client.drain_events() {
            info!(?event, "Client event");
        }
    }
}
