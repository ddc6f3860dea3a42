//! Per-connection reader and writer tasks.
//!
//! The reader decodes client messages and forwards them to the hub. A
//! frame that fails to decode is answered with `INVALID_MESSAGE` and the
//! connection stays open. The writer drains the connection's [`Outbox`]
//! until every sender is gone.
//!
//! Outboxes are bounded. A peer that stops reading eventually fills its
//! outbox; the connection is then closed and the hub sees it disconnect.

use std::sync::Arc;

use bytes::Bytes;
use motion_shared::{
    net::{decode_payload, encode_frame, FrameReader, FrameWriter, ReliableConn},
    protocol::{ClientMsg, ConnectionId, ErrorCode, PlayerId, RoomId, ServerMsg},
};
use tokio::{
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
    sync::{
        mpsc::{self, error::TrySendError},
        Notify,
    },
};
use tracing::{debug, info, warn};

use crate::server::HubEvent;

/// Frames a connection may have queued before it counts as stalled.
pub const OUTBOX_CAPACITY: usize = 256;

/// Bounded queue of encoded frames for one connection's writer task.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Bytes>,
    stalled: Arc<Notify>,
}

impl Outbox {
    /// Creates an outbox and the receiver its writer drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let outbox = Self {
            tx,
            stalled: Arc::new(Notify::new()),
        };
        (outbox, rx)
    }

    /// Queues an encoded frame without waiting. Returns false when the frame
    /// was dropped. A full queue flags the connection as stalled.
    pub fn push(&self, frame: Bytes) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.stalled.notify_one();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Encodes and queues one message.
    pub fn send(&self, msg: &ServerMsg) -> bool {
        match encode_frame(msg) {
            Ok(frame) => self.push(frame),
            Err(e) => {
                warn!(error = %e, "Failed to encode message");
                false
            }
        }
    }

    /// A handle that neither keeps the writer alive nor counts as a sender.
    fn downgrade(&self) -> WeakOutbox {
        WeakOutbox {
            tx: self.tx.downgrade(),
            stalled: self.stalled.clone(),
        }
    }
}

/// Reader-side view of an outbox. Once the hub drops every [`Outbox`]
/// clone the writer finishes even while the reader is still running.
struct WeakOutbox {
    tx: mpsc::WeakSender<Bytes>,
    stalled: Arc<Notify>,
}

impl WeakOutbox {
    fn send(&self, msg: &ServerMsg) {
        if let Some(tx) = self.tx.upgrade() {
            Outbox {
                tx,
                stalled: self.stalled.clone(),
            }
            .send(msg);
        }
    }

    async fn stalled(&self) {
        self.stalled.notified().await
    }
}

/// Where a connection's player currently lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub room: RoomId,
    pub player: PlayerId,
}

/// Hub-side view of one connection.
#[derive(Debug)]
pub struct Session {
    pub conn: ConnectionId,
    pub outbox: Outbox,
    pub membership: Option<Membership>,
}

impl Session {
    pub fn new(conn: ConnectionId, outbox: Outbox) -> Self {
        Self {
            conn,
            outbox,
            membership: None,
        }
    }

    pub fn send(&self, msg: &ServerMsg) {
        if !self.outbox.send(msg) {
            debug!(conn = %self.conn, "Message dropped");
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ReadEnd {
    Closed,
    Stalled,
}

/// Starts the reader and writer tasks for an accepted connection and
/// returns its outbox.
pub fn spawn(conn: ReliableConn, id: ConnectionId, events: mpsc::UnboundedSender<HubEvent>) -> Outbox {
    let peer = conn.peer_addr();
    let (reader, writer) = conn.into_split();
    let (outbox, rx) = Outbox::channel(OUTBOX_CAPACITY);

    let write_task = tokio::spawn(write_loop(writer, rx, id));
    let replies = outbox.downgrade();
    tokio::spawn(async move {
        if read_loop(reader, replies, id, events).await == ReadEnd::Stalled {
            write_task.abort();
        }
    });

    info!(%peer, conn = %id, "Client connected");
    outbox
}

async fn read_loop(
    mut reader: FrameReader<OwnedReadHalf>,
    replies: WeakOutbox,
    id: ConnectionId,
    events: mpsc::UnboundedSender<HubEvent>,
) -> ReadEnd {
    let end = loop {
        let next = tokio::select! {
            next = reader.next_frame() => next,
            _ = replies.stalled() => {
                warn!(conn = %id, "Client not reading, closing connection");
                break ReadEnd::Stalled;
            }
        };
        let frame = match next {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(conn = %id, "Connection closed by peer");
                break ReadEnd::Closed;
            }
            Err(e) => {
                warn!(conn = %id, error = %e, "Connection read failed");
                break ReadEnd::Closed;
            }
        };

        match decode_payload::<ClientMsg>(&frame) {
            Ok(msg) => {
                if events.send(HubEvent::Inbound { conn: id, msg }).is_err() {
                    return ReadEnd::Closed;
                }
            }
            Err(e) => {
                warn!(conn = %id, error = %format!("{e:#}"), "Invalid message");
                replies.send(&ServerMsg::error(
                    ErrorCode::InvalidMessage,
                    "Invalid message format",
                ));
            }
        }
    };
    let _ = events.send(HubEvent::Disconnected { conn: id });
    end
}

async fn write_loop(
    mut writer: FrameWriter<OwnedWriteHalf>,
    mut rx: mpsc::Receiver<Bytes>,
    id: ConnectionId,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.send_frame(&frame).await {
            debug!(conn = %id, error = %e, "Connection write failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}
