//! Rendering abstraction.
//!
//! This crate intentionally does not depend on a graphics backend.
//! The core only needs two things from a renderer: create a renderable for
//! an entity (possibly slowly, e.g. by loading an avatar model) and push
//! transforms onto existing renderables.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;

use crate::{math::Transform, protocol::PlayerId};

/// Opaque handle to an external renderable object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderHandle(pub u64);

/// Key of anything a snapshot can describe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKey {
    Player(PlayerId),
    /// Script-owned entity.
    Entity(String),
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Player(id) => write!(f, "player:{id}"),
            EntityKey::Entity(id) => write!(f, "entity:{id}"),
        }
    }
}

/// Synchronous side of the renderer, driven once per client frame.
pub trait RenderBridge: Send {
    fn apply_transform(&mut self, handle: RenderHandle, transform: &Transform);
    fn release(&mut self, handle: RenderHandle);
}

/// Asynchronous renderable creation (avatar/model loading).
#[async_trait]
pub trait AvatarLoader: Send + Sync {
    async fn load(&self, key: EntityKey, is_local: bool) -> anyhow::Result<RenderHandle>;
}

/// A no-op renderer useful for headless clients and tests.
#[derive(Debug, Default)]
pub struct NullRenderer {
    next_handle: AtomicU64,
}

impl RenderBridge for NullRenderer {
    fn apply_transform(&mut self, _handle: RenderHandle, _transform: &Transform) {}
    fn release(&mut self, _handle: RenderHandle) {}
}

#[async_trait]
impl AvatarLoader for NullRenderer {
    async fn load(&self, _key: EntityKey, _is_local: bool) -> anyhow::Result<RenderHandle> {
        Ok(RenderHandle(self.next_handle.fetch_add(1, Ordering::Relaxed)))
    }
}
