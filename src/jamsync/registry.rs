use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};

use super::broadcaster;
use super::config::Config;
use super::room::{self, HEALTH_PRINCIPAL, Room, RoomError, RoomId, RoomState};

/// The registry behind the process-wide lock, the way handlers receive it.
pub type SharedRegistry = Arc<RwLock<RoomRegistry>>;

/// Process-wide owner of all rooms. Lookups clone the per-room `Arc` and
/// release the outer lock immediately, so commands on different rooms never
/// block each other.
#[derive(Debug)]
pub struct RoomRegistry {
    rooms: HashMap<RoomId, Arc<RwLock<Room>>>,
    config: Config,
}

impl RoomRegistry {
    pub fn new(config: Config) -> Self {
        Self {
            rooms: HashMap::new(),
            config,
        }
    }

    /// Room ids are minted by the HTTP facade; the registry only enforces
    /// non-emptiness and uniqueness. Creation wires up the room's event
    /// fan-out and end-of-track timer tasks.
    pub fn create(&mut self, room_id: &str, host_id: &str) -> Result<Arc<RwLock<Room>>, RoomError> {
        if room_id.trim().is_empty() || host_id.trim().is_empty() {
            return Err(RoomError::InvalidId);
        }
        if self.rooms.contains_key(room_id) {
            return Err(RoomError::RoomExists);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        let room = Arc::new(RwLock::new(Room::new(
            room_id,
            host_id,
            &self.config,
            events_tx,
            timer_tx,
        )));

        self.rooms.insert(room_id.to_owned(), Arc::clone(&room));

        actix_rt::spawn(broadcaster::run(Arc::clone(&room), events_rx));
        actix_rt::spawn(room::end_of_track_loop(Arc::clone(&room), timer_rx));

        debug!("[{room_id}] room created for host {host_id}");

        Ok(room)
    }

    pub fn get(&self, room_id: &str) -> Option<Arc<RwLock<Room>>> {
        self.rooms.get(room_id).cloned()
    }

    pub fn exists(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    /// Defensive copy for stats and health scanning; callers lock each room
    /// on their own without holding the registry.
    pub fn iter_snapshot(&self) -> Vec<(RoomId, Arc<RwLock<Room>>)> {
        self.rooms
            .iter()
            .map(|(id, room)| (id.clone(), Arc::clone(room)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// Tears a room down: only its host or the health subsystem may do it.
    /// `room_closed` goes out first, then the broadcaster closes the member
    /// connections and the timer task stops. Deleting an already-terminated
    /// room is a no-op.
    pub async fn delete(&mut self, room_id: &str, caller_id: &str) -> Result<(), RoomError> {
        let Some(room_arc) = self.rooms.get(room_id).cloned() else {
            return Err(RoomError::RoomNotFound);
        };

        {
            let mut room = room_arc.write().await;

            if room.state != RoomState::Terminated
                && !room.is_host(caller_id)
                && caller_id != HEALTH_PRINCIPAL
            {
                warn!("[{room_id}] delete refused for caller {caller_id}");
                return Err(RoomError::NotAuthorized);
            }

            debug!("[{room_id}] room deleted by {caller_id}");
            room.terminate();
        }

        self.rooms.remove(room_id);

        Ok(())
    }

    /// Graceful-shutdown sweep: every room broadcasts `room_closed`, closes
    /// its members and stops its timer.
    pub async fn shutdown_all(&mut self) {
        for (id, room) in self.rooms.drain() {
            debug!("[{id}] closing room on shutdown");
            room.write().await.terminate();
        }
    }
}
