//! `motion_shared`
//!
//! Shared libraries used by both client and server.
//!
//! Design goals:
//! - One movement model, compiled into both sides, so prediction matches
//!   the authoritative simulation.
//! - Clear separation of concerns (math, physics, protocol, net, scripting).
//! - Traits at the seams owned by external collaborators (rendering,
//!   persistence).
//! - No `unsafe`.

pub mod config;
pub mod math;
pub mod net;
pub mod physics;
pub mod protocol;
pub mod render;
pub mod script;
pub mod store;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::math::*;
    pub use crate::physics::{BodyHandle, BodyState, PhysicsConfig, PhysicsWorld};
    pub use crate::protocol::*;
}
