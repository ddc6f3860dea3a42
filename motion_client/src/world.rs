//! Client-side world state.
//!
//! [`ClientWorld`] is the part of the client that involves no I/O: the
//! local physics mirror, the entity registry, prediction and
//! interpolation, and client script hooks. The frame loop in
//! [`crate::client`] feeds it network messages and avatar-load results.

use std::collections::BTreeSet;

use motion_shared::{
    math::{Transform, Vec3},
    physics::{BodyHandle, PhysicsWorld},
    protocol::{InputCommand, PlayerId, PlayerState, Snapshot},
    render::{EntityKey, RenderBridge, RenderHandle},
    script::{ChannelSend, ScriptHost},
};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    interp::InterpolationTarget,
    prediction::{Correction, Reconciler},
    registry::{EntityKind, EntityRegistry, Slot, SlotState, Tracked},
};

/// An entity whose renderable must be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCreate {
    pub key: EntityKey,
    pub is_local: bool,
}

#[derive(Default)]
pub struct ClientWorld {
    physics: PhysicsWorld,
    registry: EntityRegistry,
    reconciler: Reconciler,
    local_player: Option<PlayerId>,
    local_body: Option<BodyHandle>,
    latest: Option<Snapshot>,
    scripts: ScriptHost,
}

impl ClientWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_player(&self) -> Option<&PlayerId> {
        self.local_player.as_ref()
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn latest_snapshot(&self) -> Option<&Snapshot> {
        self.latest.as_ref()
    }

    pub fn scripts_mut(&mut self) -> &mut ScriptHost {
        &mut self.scripts
    }

    pub fn physics_body_count(&self) -> usize {
        self.physics.body_count()
    }

    /// True once the local player has a body to predict with.
    pub fn has_local_body(&self) -> bool {
        self.local_body.is_some()
    }

    /// Predicted position of the local player.
    pub fn local_position(&self) -> Option<Vec3> {
        let body = self.local_body?;
        self.physics.read_state(body).map(|s| s.position)
    }

    /// Transform of a ready entity.
    pub fn transform_of(&self, key: &EntityKey) -> Option<&Transform> {
        self.registry.get(key).map(|t| &t.transform)
    }

    /// Records which player this client controls. A different id than
    /// before drops everything tracked for the previous session.
    pub fn set_local_player(&mut self, id: PlayerId, renderer: &mut dyn RenderBridge) {
        if self.local_player.as_ref() == Some(&id) {
            return;
        }
        self.reset(renderer);
        self.local_player = Some(id);
    }

    /// Forgets the session: every renderable is released and every body
    /// removed.
    pub fn reset(&mut self, renderer: &mut dyn RenderBridge) {
        for (_, tracked) in self.registry.drain_ready() {
            self.release(tracked, renderer);
        }
        self.local_player = None;
        self.local_body = None;
        self.latest = None;
        self.reconciler.reset();
    }

    /// Applies a snapshot to the registry. Remote targets are replaced,
    /// entities missing from the snapshot are dropped, and unseen entities
    /// are returned for creation. The snapshot is kept for reconciliation.
    pub fn apply_snapshot(
        &mut self,
        snapshot: Snapshot,
        renderer: &mut dyn RenderBridge,
    ) -> Vec<PendingCreate> {
        let mut to_create = Vec::new();
        let mut seen = BTreeSet::new();

        for (id, state) in &snapshot.players {
            let key = EntityKey::Player(id.clone());
            let is_local = self.local_player.as_ref() == Some(id);
            self.observe(&key, &state.transform, state.velocity, is_local, &mut to_create);
            seen.insert(key);
        }
        for (id, transform) in &snapshot.entities {
            let key = EntityKey::Entity(id.clone());
            self.observe(&key, transform, Vec3::ZERO, false, &mut to_create);
            seen.insert(key);
        }

        let gone: Vec<EntityKey> = self
            .registry
            .keys()
            .filter(|k| !seen.contains(*k))
            .cloned()
            .collect();
        for key in gone {
            self.remove_entity(&key, renderer);
        }

        self.latest = Some(snapshot);
        to_create
    }

    fn observe(
        &mut self,
        key: &EntityKey,
        transform: &Transform,
        velocity: Vec3,
        is_local: bool,
        to_create: &mut Vec<PendingCreate>,
    ) {
        match self.registry.state(key) {
            SlotState::Absent => {
                if self.registry.begin_creating(key) {
                    to_create.push(PendingCreate {
                        key: key.clone(),
                        is_local,
                    });
                }
            }
            SlotState::Creating => {}
            SlotState::Ready => {
                if let Some(tracked) = self.registry.get_mut(key) {
                    if let EntityKind::Remote { target } = &mut tracked.kind {
                        target.retarget(transform);
                        tracked.velocity = velocity;
                    }
                }
            }
        }
    }

    /// Drops an entity, releasing its renderable and body.
    pub fn remove_entity(&mut self, key: &EntityKey, renderer: &mut dyn RenderBridge) {
        if let Some(Slot::Ready(tracked)) = self.registry.remove(key) {
            self.release(tracked, renderer);
            debug!(%key, "Entity removed");
        }
    }

    fn release(&mut self, tracked: Tracked, renderer: &mut dyn RenderBridge) {
        if let EntityKind::Local { body } = tracked.kind {
            self.physics.remove_body(body);
            if self.local_body == Some(body) {
                self.local_body = None;
            }
        }
        renderer.release(tracked.handle);
    }

    /// Finishes an asynchronous avatar load. A failure releases the
    /// creating marker so the next snapshot retries; a handle for an
    /// entity that is gone is released right away.
    pub fn complete_creation(
        &mut self,
        key: EntityKey,
        result: anyhow::Result<RenderHandle>,
        renderer: &mut dyn RenderBridge,
    ) {
        let handle = match result {
            Ok(handle) => handle,
            Err(e) => {
                warn!(%key, error = %e, "Avatar creation failed");
                self.registry.abandon_creating(&key);
                return;
            }
        };

        let Some((transform, velocity)) = self.latest_state_of(&key) else {
            self.registry.abandon_creating(&key);
            renderer.release(handle);
            return;
        };

        let is_local = matches!(&key, EntityKey::Player(id) if self.local_player.as_ref() == Some(id));
        let kind = if is_local {
            let body = self.physics.create_body(transform.position);
            EntityKind::Local { body }
        } else {
            EntityKind::Remote {
                target: InterpolationTarget::new(&transform),
            }
        };
        let tracked = Tracked {
            handle,
            transform,
            velocity,
            kind,
        };

        match self.registry.finish_creating(&key, tracked) {
            Ok(()) => {
                if let Some(Tracked {
                    kind: EntityKind::Local { body },
                    ..
                }) = self.registry.get(&key)
                {
                    self.local_body = Some(*body);
                }
                debug!(%key, is_local, "Entity ready");
            }
            Err(orphan) => self.release(orphan, renderer),
        }
    }

    fn latest_state_of(&self, key: &EntityKey) -> Option<(Transform, Vec3)> {
        let snapshot = self.latest.as_ref()?;
        match key {
            EntityKey::Player(id) => snapshot
                .players
                .get(id)
                .map(|p| (p.transform, p.velocity)),
            EntityKey::Entity(id) => snapshot.entities.get(id).map(|t| (*t, Vec3::ZERO)),
        }
    }

    /// Steps the local mirror. `input` is the command sent this frame, if
    /// any; without one the body receives a zero intent.
    pub fn predict(&mut self, input: Option<&InputCommand>, dt: f32) {
        let Some(body) = self.local_body else {
            return;
        };
        match input {
            Some(cmd) => {
                self.physics.apply_movement_intent(body, cmd.movement);
                self.reconciler.record(cmd.clone());
            }
            None => {
                self.physics.apply_movement_intent(body, Vec3::ZERO);
            }
        }
        self.physics.step_fixed(dt);
        self.sync_local();
    }

    /// Reconciles against the latest snapshot, once per frame id.
    pub fn reconcile(&mut self) -> Option<Correction> {
        let body = self.local_body?;
        let id = self.local_player.as_ref()?;
        let snapshot = self.latest.as_ref()?;
        let server: &PlayerState = snapshot.players.get(id)?;
        let correction = self
            .reconciler
            .reconcile(snapshot.frame_id, &mut self.physics, body, server);
        self.sync_local();
        Some(correction)
    }

    fn sync_local(&mut self) {
        let (Some(body), Some(id)) = (self.local_body, self.local_player.clone()) else {
            return;
        };
        let Some(state) = self.physics.read_state(body) else {
            return;
        };
        if let Some(tracked) = self.registry.get_mut(&EntityKey::Player(id)) {
            tracked.transform.position = state.position;
            tracked.transform.rotation = state.rotation;
            tracked.velocity = state.velocity;
        }
    }

    /// Eases every remote entity toward its target.
    pub fn interpolate(&mut self, dt: f32) {
        for (_, tracked) in self.registry.ready_mut() {
            if let EntityKind::Remote { target } = &mut tracked.kind {
                target.advance(&mut tracked.transform, dt);
            }
        }
    }

    /// Runs client frame hooks and returns what they want sent.
    pub fn run_scripts(&mut self, dt: f32) -> Vec<ChannelSend> {
        self.scripts.run_frame(dt, None);
        self.scripts.take_outbox()
    }

    /// Delivers a server channel broadcast to client handlers.
    pub fn dispatch_channel(
        &mut self,
        channel: &str,
        data: &Value,
        sender: Option<&PlayerId>,
    ) -> Vec<ChannelSend> {
        self.scripts.dispatch(channel, data, sender, None);
        self.scripts.take_outbox()
    }

    /// Pushes every ready transform to the renderer.
    pub fn render(&self, renderer: &mut dyn RenderBridge) {
        for (_, tracked) in self.registry.ready() {
            renderer.apply_transform(tracked.handle, &tracked.transform);
        }
    }
}
