//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p motion_server -- [--config server.json] [--addr 127.0.0.1:40000]
//!                                 [--tick-hz 60] [--max-players 2] [--demo-scripts]
//!
//! The server accepts client connections, places players into rooms, runs
//! each occupied room at the tick rate and broadcasts snapshots to its
//! members. Ctrl-C stops every room and exits.

use std::{env, path::PathBuf, sync::Arc};

use anyhow::Context;
use motion_server::server::GameServer;
use motion_shared::{
    config::EngineConfig,
    math::{Quat, Transform, Vec3},
    protocol::RoomId,
    script::ScriptHost,
};
use serde_json::json;
use tracing::info;

struct Args {
    cfg: EngineConfig,
    demo_scripts: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = env::args().collect();

    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) => {
            let path = args.get(i + 1).context("--config needs a path")?;
            EngineConfig::load(&PathBuf::from(path))?
        }
        None => EngineConfig::default(),
    };
    let mut demo_scripts = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().context("parse --tick-hz")?;
                i += 2;
            }
            "--max-players" if i + 1 < args.len() => {
                cfg.max_players = args[i + 1].parse().context("parse --max-players")?;
                i += 2;
            }
            "--demo-scripts" => {
                demo_scripts = true;
                i += 1;
            }
            _ => i += 1,
        }
    }
    Ok(Args { cfg, demo_scripts })
}

/// A rotating platform replicated to clients, plus a balance query.
fn install_demo_scripts(server: &mut GameServer) {
    server.set_script_installer(Arc::new(|room: &RoomId, host: &mut ScriptHost| {
        info!(%room, "Installing demo scripts");
        let mut angle = 0.0f32;
        host.on_frame(move |ctx, dt| {
            angle = (angle + std::f32::consts::PI * dt) % std::f32::consts::TAU;
            ctx.set_entity(
                "platform",
                Transform::new(Vec3::new(0.0, 0.5, 0.0), Quat::from_yaw(angle)),
            );
        });
        host.on_channel("balance", |ctx, _data, sender| {
            let (Some(store), Some(sender)) = (ctx.store(), sender) else {
                return;
            };
            let balance = store.get_balance(sender);
            ctx.send_channel("balance", json!({ "balance": balance }), Some(sender.clone()));
        });
    }));
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let Args { cfg, demo_scripts } = parse_args()?;
    info!(
        addr = %cfg.server_addr,
        tick_hz = cfg.tick_hz,
        max_players = cfg.max_players,
        "Starting server"
    );

    let mut server = GameServer::bind(cfg).await.context("create server")?;
    if demo_scripts {
        install_demo_scripts(&mut server);
    }
    let local = server.local_addr()?;
    info!(%local, "Server listening");

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}
