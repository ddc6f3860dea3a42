//! Networking primitives.
//!
//! Goals:
//! - Provide a reliable, ordered message stream (TCP).
//! - Frame every message with a 4-byte big-endian length prefix.
//! - Keep serialization explicit (JSON payloads) and bounded in size.
//!
//! Decoding is split from framing so a connection can survive a payload it
//! fails to parse: the frame boundary is still known, only its contents are
//! rejected.

use std::net::SocketAddr;

use anyhow::Context;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
};

/// Largest payload accepted from a peer.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Serializes a message into a length-prefixed frame.
pub fn encode_frame<T: Serialize>(msg: &T) -> anyhow::Result<Bytes> {
    let payload = serde_json::to_vec(msg).context("serialize msg")?;
    anyhow::ensure!(
        payload.len() <= MAX_FRAME_LEN,
        "frame of {} bytes exceeds limit",
        payload.len()
    );
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    Ok(buf.freeze())
}

/// Parses a frame payload (without its length prefix).
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> anyhow::Result<T> {
    serde_json::from_slice(payload).context("deserialize msg")
}

/// Reads length-prefixed frames.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Returns the next payload, or `None` when the peer closed cleanly.
    pub async fn next_frame(&mut self) -> anyhow::Result<Option<Bytes>> {
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e).context("tcp read len"),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        anyhow::ensure!(len <= MAX_FRAME_LEN, "frame of {len} bytes exceeds limit");

        let mut payload = BytesMut::zeroed(len);
        self.inner
            .read_exact(&mut payload)
            .await
            .context("tcp read payload")?;
        Ok(Some(payload.freeze()))
    }

    /// Reads and decodes the next message.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> anyhow::Result<Option<T>> {
        match self.next_frame().await? {
            Some(payload) => decode_payload(&payload).map(Some),
            None => Ok(None),
        }
    }
}

/// Writes length-prefixed frames.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Writes an already encoded frame (see [`encode_frame`]).
    pub async fn send_frame(&mut self, frame: &[u8]) -> anyhow::Result<()> {
        self.inner.write_all(frame).await.context("tcp write")?;
        Ok(())
    }

    pub async fn send<T: Serialize>(&mut self, msg: &T) -> anyhow::Result<()> {
        let frame = encode_frame(msg)?;
        self.send_frame(&frame).await
    }

    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.inner.shutdown().await.context("tcp shutdown")?;
        Ok(())
    }
}

/// Reliable connection over TCP with length-prefixed frames.
#[derive(Debug)]
pub struct ReliableConn {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    peer: SocketAddr,
}

impl ReliableConn {
    pub fn new(stream: TcpStream) -> anyhow::Result<Self> {
        let peer = stream.peer_addr().context("peer addr")?;
        stream.set_nodelay(true).context("set nodelay")?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: FrameReader::new(read),
            writer: FrameWriter::new(write),
            peer,
        })
    }

    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await.context("tcp connect")?;
        Self::new(stream)
    }

    pub async fn send<T: Serialize>(&mut self, msg: &T) -> anyhow::Result<()> {
        self.writer.send(msg).await
    }

    pub async fn recv<T: DeserializeOwned>(&mut self) -> anyhow::Result<Option<T>> {
        self.reader.recv().await
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Splits into independently owned read and write halves.
    pub fn into_split(self) -> (FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>) {
        (self.reader, self.writer)
    }
}

/// TCP server listener.
pub struct ReliableListener {
    listener: TcpListener,
}

impl ReliableListener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> anyhow::Result<ReliableConn> {
        let (stream, _addr) = self.listener.accept().await.context("tcp accept")?;
        ReliableConn::new(stream)
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClientMsg, ServerMsg};

    #[tokio::test]
    async fn frames_survive_a_duplex_pipe() -> anyhow::Result<()> {
        let (a, b) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(a);
        let mut reader = FrameReader::new(b);

        writer.send(&ClientMsg::Ping { timestamp: 5 }).await?;
        writer.send(&ClientMsg::LeaveRoom).await?;
        drop(writer);

        assert_eq!(
            reader.recv::<ClientMsg>().await?,
            Some(ClientMsg::Ping { timestamp: 5 })
        );
        assert_eq!(reader.recv::<ClientMsg>().await?, Some(ClientMsg::LeaveRoom));
        assert_eq!(reader.recv::<ClientMsg>().await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_payload_keeps_frame_boundary() -> anyhow::Result<()> {
        let (a, b) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(a);
        let mut reader = FrameReader::new(b);

        let junk = b"{not json";
        let mut frame = BytesMut::new();
        frame.put_u32(junk.len() as u32);
        frame.extend_from_slice(junk);
        writer.send_frame(&frame).await?;
        writer.send(&ServerMsg::Pong { timestamp: 1 }).await?;

        let payload = reader.next_frame().await?.expect("frame");
        assert!(decode_payload::<ClientMsg>(&payload).is_err());
        assert_eq!(
            reader.recv::<ServerMsg>().await?,
            Some(ServerMsg::Pong { timestamp: 1 })
        );
        Ok(())
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (a, b) = tokio::io::duplex(64);
        let mut writer = FrameWriter::new(a);
        let mut reader = FrameReader::new(b);
        let len = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        writer.send_frame(&len).await.unwrap();
        assert!(reader.next_frame().await.is_err());
    }
}
