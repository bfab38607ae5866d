//! Shared server state: one in-memory room per room id.

use collabcanvas_core::{MemoryRoom, SharedClock};
use dashmap::DashMap;
use std::sync::Arc;

struct RoomEntry {
    room: Arc<MemoryRoom>,
    clients: usize,
}

/// Rooms outlive their connections so a canvas survives everyone leaving.
pub struct AppState {
    clock: SharedClock,
    rooms: DashMap<String, RoomEntry>,
}

impl AppState {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            rooms: DashMap::new(),
        }
    }

    /// Get or create a room and count one more client in it.
    pub fn join_room(&self, room_id: &str) -> (Arc<MemoryRoom>, usize) {
        let mut entry = self.rooms.entry(room_id.to_string()).or_insert_with(|| RoomEntry {
            room: Arc::new(MemoryRoom::new(self.clock.clone())),
            clients: 0,
        });
        entry.clients += 1;
        (entry.room.clone(), entry.clients)
    }

    pub fn leave_room(&self, room_id: &str) {
        if let Some(mut entry) = self.rooms.get_mut(room_id) {
            entry.clients = entry.clients.saturating_sub(1);
        }
    }

    pub fn client_count(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map_or(0, |e| e.clients)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
