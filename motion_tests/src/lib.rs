//! Shared harness for the integration tests.
//!
//! [`TestServer`] runs a real server on an ephemeral port in the
//! background. [`RawClient`] speaks the wire protocol directly so tests can
//! observe exactly what the server sends.

use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use bytes::{BufMut, BytesMut};
use motion_server::server::{bind_ephemeral, GameServer};
use motion_shared::{
    config::EngineConfig,
    net::{FrameReader, FrameWriter, ReliableConn},
    protocol::{ClientMsg, PlayerId, RoomId, ServerMsg},
};
use tokio::{
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
    sync::oneshot,
    task::JoinHandle,
};

/// Upper bound for any single wait in a test.
pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// A server serving on its own task until stopped.
pub struct TestServer {
    pub cfg: EngineConfig,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    pub async fn start(tick_hz: u32) -> anyhow::Result<Self> {
        let (server, cfg) = bind_ephemeral(tick_hz).await?;
        Ok(Self::spawn(server, cfg))
    }

    /// Runs an already configured server.
    pub fn spawn(server: GameServer, cfg: EngineConfig) -> Self {
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async {
            let _ = stopped.await;
        }));
        Self {
            cfg,
            stop: Some(stop),
            task,
        }
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        self.cfg.server_addr.parse().context("parse server_addr")
    }

    pub async fn stop(mut self) -> anyhow::Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        (&mut self.task).await.context("server task")?
    }
}

/// A protocol-level client with no prediction or reconnect logic.
pub struct RawClient {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
}

impl RawClient {
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let conn = ReliableConn::connect(addr).await?;
        let (reader, writer) = conn.into_split();
        Ok(Self { reader, writer })
    }

    pub async fn send(&mut self, msg: &ClientMsg) -> anyhow::Result<()> {
        self.writer.send(msg).await
    }

    /// Sends `payload` in a well-formed frame without encoding it.
    pub async fn send_raw(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        let mut frame = BytesMut::with_capacity(4 + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.extend_from_slice(payload);
        self.writer.send_frame(&frame).await
    }

    /// Next message, failing on timeout or a closed connection.
    pub async fn recv(&mut self) -> anyhow::Result<ServerMsg> {
        tokio::time::timeout(WAIT, self.reader.recv::<ServerMsg>())
            .await
            .context("timed out waiting for server message")??
            .context("server closed the connection")
    }

    /// Reads until `pick` accepts a message, skipping the rest.
    pub async fn recv_until<T>(
        &mut self,
        mut pick: impl FnMut(ServerMsg) -> Option<T>,
    ) -> anyhow::Result<T> {
        loop {
            if let Some(found) = pick(self.recv().await?) {
                return Ok(found);
            }
        }
    }

    /// Next message that is not a snapshot.
    pub async fn recv_event(&mut self) -> anyhow::Result<ServerMsg> {
        self.recv_until(|msg| match msg {
            ServerMsg::Snapshot(_) => None,
            other => Some(other),
        })
        .await
    }

    /// Joins and returns the assigned player id with the room.
    pub async fn join(
        &mut self,
        room: Option<&str>,
        name: &str,
    ) -> anyhow::Result<(PlayerId, RoomId)> {
        self.send(&ClientMsg::JoinRoom {
            room_id: room.map(RoomId::from),
            player_name: name.to_string(),
            spawn_position: None,
        })
        .await?;
        match self.recv_event().await? {
            ServerMsg::RoomJoined {
                player_id, room_id, ..
            } => Ok((player_id, room_id)),
            other => anyhow::bail!("expected ROOM_JOINED, got {other:?}"),
        }
    }

    /// Asserts the server closes the connection within [`WAIT`].
    pub async fn expect_closed(&mut self) -> anyhow::Result<()> {
        loop {
            let next = tokio::time::timeout(WAIT, self.reader.next_frame())
                .await
                .context("timed out waiting for close")?;
            match next {
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return Ok(()),
            }
        }
    }
}
