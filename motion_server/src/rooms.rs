//! Room registry.

use std::{collections::BTreeMap, sync::Arc};

use motion_shared::{protocol::RoomId, script::ScriptHost, store::UserStore};
use tracing::info;

use crate::room::{Room, RoomConfig};

/// Installs script hooks into every newly created room.
pub type ScriptInstaller = Arc<dyn Fn(&RoomId, &mut ScriptHost) + Send + Sync>;

/// Owns every room of a server process.
pub struct RoomManager {
    rooms: BTreeMap<RoomId, Room>,
    cfg: RoomConfig,
    store: Arc<dyn UserStore>,
    installer: Option<ScriptInstaller>,
}

impl RoomManager {
    pub fn new(cfg: RoomConfig, store: Arc<dyn UserStore>) -> Self {
        Self {
            rooms: BTreeMap::new(),
            cfg,
            store,
            installer: None,
        }
    }

    /// Hooks installed into rooms created from now on.
    pub fn set_script_installer(&mut self, installer: ScriptInstaller) {
        self.installer = Some(installer);
    }

    pub fn store(&self) -> &Arc<dyn UserStore> {
        &self.store
    }

    pub fn get_or_create(&mut self, id: &RoomId) -> &mut Room {
        let cfg = self.cfg;
        let store = &self.store;
        let installer = &self.installer;
        self.rooms.entry(id.clone()).or_insert_with(|| {
            let mut room = Room::new(id.clone(), cfg, store.clone());
            if let Some(install) = installer {
                install(id, room.scripts_mut());
            }
            info!(room = %id, max_players = cfg.max_players, "Room created");
            room
        })
    }

    /// Returns a room with a free slot, creating a fresh one if none has.
    pub fn find_or_create_available(&mut self) -> RoomId {
        if let Some(id) = self
            .rooms
            .iter()
            .find(|(_, room)| room.has_free_slot())
            .map(|(id, _)| id.clone())
        {
            return id;
        }
        let id = RoomId::generate();
        self.get_or_create(&id);
        id
    }

    pub fn get(&self, id: &RoomId) -> Option<&Room> {
        self.rooms.get(id)
    }

    pub fn get_mut(&mut self, id: &RoomId) -> Option<&mut Room> {
        self.rooms.get_mut(id)
    }

    pub fn remove(&mut self, id: &RoomId) -> Option<Room> {
        let room = self.rooms.remove(id)?;
        info!(room = %id, "Room removed");
        Some(room)
    }

    /// Drops every room and returns their ids.
    pub fn shutdown(&mut self) -> Vec<RoomId> {
        let ids: Vec<RoomId> = self.rooms.keys().cloned().collect();
        self.rooms.clear();
        info!(rooms = ids.len(), "Rooms shut down");
        ids
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &RoomId> {
        self.rooms.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use motion_shared::{protocol::ConnectionId, store::MemoryUserStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::connection::Outbox;

    fn manager(max_players: u32) -> RoomManager {
        RoomManager::new(
            RoomConfig {
                max_players,
                tick_hz: 60,
            },
            Arc::new(MemoryUserStore::new()),
        )
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let mut rooms = manager(2);
        let id = RoomId::from("lobby");
        rooms.get_or_create(&id);
        rooms.get_or_create(&id);
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms.get(&id).unwrap().id(), &id);
    }

    #[test]
    fn available_room_is_reused_until_full() {
        let mut rooms = manager(1);
        let first = rooms.find_or_create_available();
        assert_eq!(rooms.find_or_create_available(), first);

        let (tx, _rx) = Outbox::channel(4);
        rooms
            .get_mut(&first)
            .unwrap()
            .add_player(ConnectionId::new_unique(), "a", None, tx)
            .unwrap();

        let second = rooms.find_or_create_available();
        assert_ne!(second, first);
        assert_eq!(rooms.len(), 2);
    }

    #[test]
    fn installer_runs_once_per_new_room() {
        let mut rooms = manager(2);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        rooms.set_script_installer(Arc::new(move |_: &RoomId, host: &mut ScriptHost| {
            seen.fetch_add(1, Ordering::SeqCst);
            host.on_frame(|_, _| {});
        }));

        let id = RoomId::from("a");
        rooms.get_or_create(&id);
        rooms.get_or_create(&id);
        rooms.get_or_create(&RoomId::from("b"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(rooms.get_mut(&id).unwrap().scripts_mut().hook_count(), 1);
    }

    #[test]
    fn remove_and_shutdown() {
        let mut rooms = manager(2);
        rooms.get_or_create(&RoomId::from("a"));
        rooms.get_or_create(&RoomId::from("b"));
        assert!(rooms.remove(&RoomId::from("a")).is_some());
        assert!(rooms.remove(&RoomId::from("a")).is_none());
        assert_eq!(rooms.shutdown(), vec![RoomId::from("b")]);
        assert!(rooms.is_empty());
    }
}
