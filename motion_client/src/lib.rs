//! `motion_client`
//!
//! Client-side systems:
//! - Reconnecting server connection with automatic re-join
//! - Input sampling into sequenced commands
//! - Prediction and reconciliation of the local player
//! - Interpolation of remote players and script entities
//! - Rendering abstraction wiring through `RenderBridge`/`AvatarLoader`

pub mod client;
pub mod connection;
pub mod input;
pub mod interp;
pub mod prediction;
pub mod registry;
pub mod world;

pub use client::{ClientEvent, GameClient};
