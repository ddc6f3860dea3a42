//! Reconnecting server connection.
//!
//! [`NetworkManager`] owns a background task that keeps one TCP connection
//! to the server alive. When the connection drops, it waits using
//! [`Backoff`] and tries again. Once a `JOIN_ROOM` has been sent, it is
//! re-sent after every successful reconnect so the player lands back in
//! the same room. Anything sent while offline is dropped.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use motion_shared::{
    config::EngineConfig,
    math::Vec3,
    net::{decode_payload, FrameReader, ReliableConn},
    protocol::{ClientMsg, ServerMsg},
};
use tokio::{
    net::tcp::OwnedReadHalf,
    sync::mpsc,
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, info, warn};

/// Exponential reconnect delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self::new(cfg.reconnect_initial(), cfg.reconnect_max())
    }

    /// Returns the delay to wait now and doubles the next one, up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Connection lifecycle and inbound traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum NetEvent {
    Connected,
    Disconnected,
    Message(ServerMsg),
}

#[derive(Debug)]
enum Outgoing {
    Send(ClientMsg),
    /// Spawn position for the next automatic re-join.
    SpawnHint(Vec3),
}

/// State carried across reconnects.
#[derive(Debug, Default)]
struct Rejoin {
    join: Option<ClientMsg>,
}

impl Rejoin {
    fn observe(&mut self, msg: &ClientMsg) {
        match msg {
            ClientMsg::JoinRoom { .. } => self.join = Some(msg.clone()),
            ClientMsg::LeaveRoom => self.join = None,
            _ => {}
        }
    }

    fn set_spawn(&mut self, position: Vec3) {
        if let Some(ClientMsg::JoinRoom { spawn_position, .. }) = &mut self.join {
            *spawn_position = Some(position);
        }
    }
}

enum SessionEnd {
    /// The connection dropped; reconnect.
    Lost,
    /// The manager is gone; stop.
    Closed,
}

/// Handle to the background connection task.
#[derive(Debug)]
pub struct NetworkManager {
    tx: mpsc::UnboundedSender<Outgoing>,
    events: mpsc::UnboundedReceiver<NetEvent>,
    connected: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl NetworkManager {
    /// Starts connecting in the background. Must be called inside a tokio
    /// runtime.
    pub fn start(addr: SocketAddr, backoff: Backoff) -> Self {
        let (tx, out_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run(addr, backoff, out_rx, events_tx, connected.clone()));
        Self {
            tx,
            events,
            connected,
            task,
        }
    }

    pub fn send(&self, msg: ClientMsg) {
        let _ = self.tx.send(Outgoing::Send(msg));
    }

    /// Updates the spawn position used when re-joining after a reconnect.
    pub fn update_spawn(&self, position: Vec3) {
        let _ = self.tx.send(Outgoing::SpawnHint(position));
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn try_next_event(&mut self) -> Option<NetEvent> {
        self.events.try_recv().ok()
    }

    pub async fn next_event(&mut self) -> Option<NetEvent> {
        self.events.recv().await
    }

    /// Closes the connection and cancels any pending reconnect. Events
    /// not yet taken are discarded.
    pub fn disconnect(&mut self) {
        self.task.abort();
        self.connected.store(false, Ordering::Relaxed);
        self.events.close();
        while self.events.try_recv().is_ok() {}
    }
}

impl Drop for NetworkManager {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    addr: SocketAddr,
    mut backoff: Backoff,
    mut out_rx: mpsc::UnboundedReceiver<Outgoing>,
    events: mpsc::UnboundedSender<NetEvent>,
    connected: Arc<AtomicBool>,
) {
    let mut rejoin = Rejoin::default();
    loop {
        match ReliableConn::connect(addr).await {
            Ok(conn) => {
                info!(server = %addr, "Connected to server");
                backoff.reset();
                connected.store(true, Ordering::Relaxed);
                let _ = events.send(NetEvent::Connected);

                let end = session(conn, &mut out_rx, &events, &mut rejoin).await;

                connected.store(false, Ordering::Relaxed);
                let _ = events.send(NetEvent::Disconnected);
                if let SessionEnd::Closed = end {
                    return;
                }
            }
            Err(e) => debug!(server = %addr, error = %e, "Connect failed"),
        }

        let delay = backoff.next_delay();
        info!(delay_ms = delay.as_millis() as u64, "Reconnecting");
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                out = out_rx.recv() => match out {
                    Some(Outgoing::Send(msg)) => {
                        rejoin.observe(&msg);
                        debug!(?msg, "Dropping message while offline");
                    }
                    Some(Outgoing::SpawnHint(p)) => rejoin.set_spawn(p),
                    None => return,
                },
            }
        }
    }
}

async fn session(
    conn: ReliableConn,
    out_rx: &mut mpsc::UnboundedReceiver<Outgoing>,
    events: &mpsc::UnboundedSender<NetEvent>,
    rejoin: &mut Rejoin,
) -> SessionEnd {
    let (reader, mut writer) = conn.into_split();
    // The set aborts the reader when dropped, also when this task is aborted.
    let mut reader_task = JoinSet::new();
    reader_task.spawn(read_loop(reader, events.clone()));

    let end = 'session: {
        if let Some(join) = &rejoin.join {
            if let Err(e) = writer.send(join).await {
                warn!(error = %e, "Re-join failed");
                break 'session SessionEnd::Lost;
            }
        }
        loop {
            tokio::select! {
                _ = reader_task.join_next() => break 'session SessionEnd::Lost,
                out = out_rx.recv() => match out {
                    Some(Outgoing::Send(msg)) => {
                        rejoin.observe(&msg);
                        if let Err(e) = writer.send(&msg).await {
                            warn!(error = %e, "Send failed");
                            break 'session SessionEnd::Lost;
                        }
                    }
                    Some(Outgoing::SpawnHint(p)) => rejoin.set_spawn(p),
                    None => break 'session SessionEnd::Closed,
                },
            }
        }
    };

    reader_task.abort_all();
    let _ = writer.shutdown().await;
    end
}

async fn read_loop(mut reader: FrameReader<OwnedReadHalf>, events: mpsc::UnboundedSender<NetEvent>) {
    loop {
        let frame = match reader.next_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("Server closed the connection");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Connection read failed");
                return;
            }
        };
        match decode_payload::<ServerMsg>(&frame) {
            Ok(msg) => {
                if events.send(NetEvent::Message(msg)).is_err() {
                    return;
                }
            }
            Err(e) => warn!(error = %format!("{e:#}"), "Invalid server message"),
        }
    }
}
