//! Client entity registry.
//!
//! Every entity a snapshot mentions moves through three states:
//! absent (no slot), `Creating` while its renderable loads, and `Ready`
//! once it has a render handle. Only an absent entity may start creating,
//! so a slow load overlapping later snapshots never creates twice.

use std::collections::HashMap;

use motion_shared::{
    math::{Transform, Vec3},
    physics::BodyHandle,
    render::{EntityKey, RenderHandle},
};

use crate::interp::InterpolationTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Absent,
    Creating,
    Ready,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntityKind {
    /// The local player, driven by prediction.
    Local { body: BodyHandle },
    /// Anything else, driven by interpolation.
    Remote { target: InterpolationTarget },
}

/// A fully created entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Tracked {
    pub handle: RenderHandle,
    pub transform: Transform,
    pub velocity: Vec3,
    pub kind: EntityKind,
}

impl Tracked {
    pub fn is_local(&self) -> bool {
        matches!(self.kind, EntityKind::Local { .. })
    }
}

#[derive(Debug)]
pub enum Slot {
    Creating,
    Ready(Tracked),
}

#[derive(Debug, Default)]
pub struct EntityRegistry {
    slots: HashMap<EntityKey, Slot>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, key: &EntityKey) -> SlotState {
        match self.slots.get(key) {
            None => SlotState::Absent,
            Some(Slot::Creating) => SlotState::Creating,
            Some(Slot::Ready(_)) => SlotState::Ready,
        }
    }

    /// Marks an absent entity as creating. Returns false otherwise.
    pub fn begin_creating(&mut self, key: &EntityKey) -> bool {
        if self.slots.contains_key(key) {
            return false;
        }
        self.slots.insert(key.clone(), Slot::Creating);
        true
    }

    /// Promotes a creating entity. Hands the entity back when its slot is
    /// no longer creating (removed meanwhile).
    pub fn finish_creating(&mut self, key: &EntityKey, tracked: Tracked) -> Result<(), Tracked> {
        match self.slots.get_mut(key) {
            Some(slot) if matches!(slot, Slot::Creating) => {
                *slot = Slot::Ready(tracked);
                Ok(())
            }
            _ => Err(tracked),
        }
    }

    /// Releases a creating marker after a failed load.
    pub fn abandon_creating(&mut self, key: &EntityKey) -> bool {
        if matches!(self.slots.get(key), Some(Slot::Creating)) {
            self.slots.remove(key);
            return true;
        }
        false
    }

    pub fn get(&self, key: &EntityKey) -> Option<&Tracked> {
        match self.slots.get(key) {
            Some(Slot::Ready(t)) => Some(t),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: &EntityKey) -> Option<&mut Tracked> {
        match self.slots.get_mut(key) {
            Some(Slot::Ready(t)) => Some(t),
            _ => None,
        }
    }

    pub fn remove(&mut self, key: &EntityKey) -> Option<Slot> {
        self.slots.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &EntityKey> {
        self.slots.keys()
    }

    pub fn ready(&self) -> impl Iterator<Item = (&EntityKey, &Tracked)> {
        self.slots.iter().filter_map(|(k, s)| match s {
            Slot::Ready(t) => Some((k, t)),
            Slot::Creating => None,
        })
    }

    pub fn ready_mut(&mut self) -> impl Iterator<Item = (&EntityKey, &mut Tracked)> {
        self.slots.iter_mut().filter_map(|(k, s)| match s {
            Slot::Ready(t) => Some((k, t)),
            Slot::Creating => None,
        })
    }

    /// Empties the registry, returning every ready entity.
    pub fn drain_ready(&mut self) -> Vec<(EntityKey, Tracked)> {
        self.slots
            .drain()
            .filter_map(|(k, s)| match s {
                Slot::Ready(t) => Some((k, t)),
                Slot::Creating => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use motion_shared::protocol::PlayerId;

    fn remote(handle: u64) -> Tracked {
        Tracked {
            handle: RenderHandle(handle),
            transform: Transform::default(),
            velocity: Vec3::ZERO,
            kind: EntityKind::Remote {
                target: InterpolationTarget::new(&Transform::default()),
            },
        }
    }

    #[test]
    fn creation_is_exclusive() {
        let mut reg = EntityRegistry::new();
        let key = EntityKey::Player(PlayerId::from("p"));
        assert_eq!(reg.state(&key), SlotState::Absent);
        assert!(reg.begin_creating(&key));
        assert!(!reg.begin_creating(&key));
        assert_eq!(reg.state(&key), SlotState::Creating);

        assert!(reg.finish_creating(&key, remote(1)).is_ok());
        assert_eq!(reg.state(&key), SlotState::Ready);
        assert!(!reg.begin_creating(&key));
        assert!(reg.finish_creating(&key, remote(2)).is_err());
        assert_eq!(reg.get(&key).unwrap().handle, RenderHandle(1));
    }

    #[test]
    fn completion_after_removal_is_handed_back() {
        let mut reg = EntityRegistry::new();
        let key = EntityKey::Entity("crate".into());
        reg.begin_creating(&key);
        reg.remove(&key);
        let back = reg.finish_creating(&key, remote(3)).unwrap_err();
        assert_eq!(back.handle, RenderHandle(3));
        assert!(reg.is_empty());
    }

    #[test]
    fn abandon_only_touches_creating() {
        let mut reg = EntityRegistry::new();
        let key = EntityKey::Entity("a".into());
        assert!(!reg.abandon_creating(&key));
        reg.begin_creating(&key);
        assert!(reg.abandon_creating(&key));
        assert_eq!(reg.state(&key), SlotState::Absent);

        reg.begin_creating(&key);
        reg.finish_creating(&key, remote(1)).unwrap();
        assert!(!reg.abandon_creating(&key));
        assert_eq!(reg.drain_ready().len(), 1);
        assert!(reg.is_empty());
    }
}
