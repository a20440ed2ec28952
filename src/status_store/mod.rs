//! Room-status store
//!
//! One record per configured room, mutated only by the occupancy state
//! machine and read by the inspection surface. A single RwLock around the
//! map is the whole concurrency story; no lock is held across a network
//! publish.

use std::collections::HashMap;
use tokio::sync::RwLock;

/// Mutable per-room occupancy state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoomStatus {
    /// Unix seconds of the most recent occupied observation; 0 if never.
    /// Non-decreasing across all mutations.
    pub last_occupied_at: i64,
    /// Tracks only the most recent normalised motion/door event.
    pub motion_on: bool,
    /// Direction of the latest published verdict.
    pub occupied: bool,
}

impl RoomStatus {
    /// Record an occupied observation. `last_occupied_at` never moves
    /// backwards.
    pub fn mark_occupied(&mut self, now: i64) {
        self.last_occupied_at = self.last_occupied_at.max(now);
        self.occupied = true;
    }

    /// Clear the verdict direction; the timestamp is untouched.
    pub fn mark_unoccupied(&mut self) {
        self.occupied = false;
    }

    /// Track a motion/door edge. Motion starting is itself an occupied
    /// observation.
    pub fn set_motion(&mut self, on: bool, now: i64) {
        self.motion_on = on;
        if on {
            self.mark_occupied(now);
        }
    }
}

/// Shared map `room name -> RoomStatus`.
#[derive(Default)]
pub struct StatusStore {
    rooms: RwLock<HashMap<String, RoomStatus>>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current status for a room, defaulting to the zero record for rooms
    /// that have not produced an event yet.
    pub async fn snapshot(&self, room: &str) -> RoomStatus {
        self.rooms.read().await.get(room).copied().unwrap_or_default()
    }

    /// Store the result of a read-modify-write sequence.
    pub async fn put(&self, room: &str, status: RoomStatus) {
        self.rooms.write().await.insert(room.to_string(), status);
    }

    pub async fn mark_occupied(&self, room: &str, now: i64) {
        let mut rooms = self.rooms.write().await;
        rooms.entry(room.to_string()).or_default().mark_occupied(now);
    }

    pub async fn mark_unoccupied(&self, room: &str) {
        let mut rooms = self.rooms.write().await;
        rooms.entry(room.to_string()).or_default().mark_unoccupied();
    }

    pub async fn set_motion(&self, room: &str, on: bool, now: i64) {
        let mut rooms = self.rooms.write().await;
        rooms.entry(room.to_string()).or_default().set_motion(on, now);
    }

    /// Drop entries for rooms that left the model. Called on model rebuild
    /// so the store only ever describes currently configured rooms.
    pub async fn sync_rooms(&self, names: &[String]) {
        let mut rooms = self.rooms.write().await;
        rooms.retain(|name, _| names.iter().any(|n| n == name));
    }

    /// All known entries, for the inspection surface.
    pub async fn all(&self) -> Vec<(String, RoomStatus)> {
        self.rooms
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }
}
