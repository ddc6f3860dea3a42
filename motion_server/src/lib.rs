//! `motion_server`
//!
//! Server-side systems:
//! - Room registry and per-room fixed-rate simulation
//! - Player membership, input application and channel routing
//! - Snapshot broadcast to room members
//!
//! Networking model:
//! - TCP with length-prefixed JSON frames, one connection per client
//! - A single hub task owns all room state

pub mod connection;
pub mod room;
pub mod rooms;
pub mod server;

pub use room::{JoinError, Room, RoomConfig, RoomStatus};
pub use rooms::RoomManager;
pub use server::{bind_ephemeral, GameServer};
