use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub fn list_rooms(&self) -> Vec<Room> {
        self.store.rooms.find(|_| true)
    }

    pub fn get_room(&self, id: &Ulid) -> Result<Room, EngineError> {
        self.store.rooms.find_by_id(id).ok_or(EngineError::NotFound(*id))
    }

    /// Every reservation, inactive history included, in creation order.
    pub fn list_reservations(&self) -> Vec<Reservation> {
        self.store.reservations.find(|_| true)
    }

    pub fn get_reservation(&self, id: &Ulid) -> Result<Reservation, EngineError> {
        self.store
            .reservations
            .find_by_id(id)
            .ok_or(EngineError::NotFound(*id))
    }

    /// The active reservation running in `room_id` right now.
    ///
    /// Reads the store as-is; a reservation the sweeper has not reached yet
    /// still counts until its end instant.
    pub fn active_reservation(&self, room_id: &Ulid) -> Result<Reservation, EngineError> {
        if !self.store.rooms.contains(room_id) {
            return Err(EngineError::NotFound(*room_id));
        }
        let now = self.now_ms();
        self.store
            .active_for_room(room_id)
            .into_iter()
            .find(|r| r.is_running(now))
            .ok_or(EngineError::NotFound(*room_id))
    }
}
