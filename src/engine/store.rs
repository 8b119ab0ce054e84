use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

/// A record addressable by its generated id.
pub trait Document: Clone + Send + Sync + 'static {
    fn id(&self) -> Ulid;
}

impl Document for Room {
    fn id(&self) -> Ulid {
        self.id
    }
}

impl Document for Reservation {
    fn id(&self) -> Ulid {
        self.id
    }
}

/// One named collection of documents. Each call is atomic per document;
/// nothing here spans more than one record.
pub struct Collection<D> {
    docs: DashMap<Ulid, D>,
}

impl<D: Document> Default for Collection<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Document> Collection<D> {
    pub fn new() -> Self {
        Self {
            docs: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Matching documents in id order (ULIDs sort by creation time).
    pub fn find(&self, filter: impl Fn(&D) -> bool) -> Vec<D> {
        let mut found: Vec<D> = self
            .docs
            .iter()
            .filter(|e| filter(e.value()))
            .map(|e| e.value().clone())
            .collect();
        found.sort_by_key(|d| d.id());
        found
    }

    pub fn find_by_id(&self, id: &Ulid) -> Option<D> {
        self.docs.get(id).map(|e| e.value().clone())
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.docs.contains_key(id)
    }

    /// Insert or replace by id.
    pub fn insert(&self, doc: D) {
        self.docs.insert(doc.id(), doc);
    }

    pub fn update_by_id(&self, id: &Ulid, patch: impl FnOnce(&mut D)) -> Option<D> {
        let mut entry = self.docs.get_mut(id)?;
        patch(entry.value_mut());
        Some(entry.value().clone())
    }

    pub fn delete_by_id(&self, id: &Ulid) -> Option<D> {
        self.docs.remove(id).map(|(_, d)| d)
    }

    /// Patch every matching document; returns the patched documents.
    pub fn update_many(&self, filter: impl Fn(&D) -> bool, patch: impl Fn(&mut D)) -> Vec<D> {
        let mut updated = Vec::new();
        for mut entry in self.docs.iter_mut() {
            if filter(entry.value()) {
                patch(entry.value_mut());
                updated.push(entry.value().clone());
            }
        }
        updated.sort_by_key(|d| d.id());
        updated
    }
}

/// The `rooms` and `reservations` collections plus a room → reservation index.
#[derive(Default)]
pub struct Store {
    pub rooms: Collection<Room>,
    pub reservations: Collection<Reservation>,
    by_room: DashMap<Ulid, Vec<Ulid>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every reservation ever booked on a room, in id order.
    pub fn reservations_for_room(&self, room_id: &Ulid) -> Vec<Reservation> {
        let ids = self
            .by_room
            .get(room_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut out: Vec<Reservation> = ids
            .iter()
            .filter_map(|id| self.reservations.find_by_id(id))
            .collect();
        out.sort_by_key(|r| r.id);
        out
    }

    /// Active reservations of a room, nearest first; ties broken by id.
    pub fn active_for_room(&self, room_id: &Ulid) -> Vec<Reservation> {
        let mut out: Vec<Reservation> = self
            .reservations_for_room(room_id)
            .into_iter()
            .filter(|r| r.is_active())
            .collect();
        out.sort_by_key(|r| (r.span.start, r.id));
        out
    }

    pub fn reservation_count(&self, room_id: &Ulid) -> usize {
        self.by_room.get(room_id).map_or(0, |e| e.value().len())
    }

    /// Case-insensitive name clash with any room other than `except`.
    pub fn room_name_taken(&self, name: &str, except: Option<Ulid>) -> bool {
        let wanted = name.to_lowercase();
        !self
            .rooms
            .find(|r| Some(r.id) != except && r.name.to_lowercase() == wanted)
            .is_empty()
    }

    fn index(&self, room_id: Ulid, reservation_id: Ulid) {
        let mut ids = self.by_room.entry(room_id).or_default();
        if !ids.contains(&reservation_id) {
            ids.push(reservation_id);
        }
    }

    fn unindex(&self, room_id: &Ulid, reservation_id: &Ulid) {
        if let Some(mut ids) = self.by_room.get_mut(room_id) {
            ids.retain(|id| id != reservation_id);
        }
    }

    // ── Event application ────────────────────────────────────

    /// Apply a committed event. Used for live writes and WAL replay alike,
    /// so every arm must be idempotent with respect to its own record.
    pub fn apply_event(&self, event: &Event) {
        match event {
            Event::RoomCreated { room } | Event::RoomUpdated { room } => {
                self.rooms.insert(room.clone());
            }
            Event::RoomDeleted { id } => {
                self.rooms.delete_by_id(id);
            }
            Event::ReservationCreated { reservation } => {
                self.index(reservation.room_id, reservation.id);
                self.reservations.insert(reservation.clone());
            }
            Event::ReservationUpdated { reservation } => {
                if let Some(previous) = self.reservations.find_by_id(&reservation.id)
                    && previous.room_id != reservation.room_id
                {
                    self.unindex(&previous.room_id, &reservation.id);
                }
                self.index(reservation.room_id, reservation.id);
                self.reservations.insert(reservation.clone());
            }
            Event::ReservationDeleted { id, room_id } => {
                self.unindex(room_id, id);
                self.reservations.delete_by_id(id);
            }
            Event::ReservationsDeactivated { room_id, ids } => {
                self.reservations.update_many(
                    |r| r.room_id == *room_id && r.is_active() && ids.contains(&r.id),
                    |r| r.status = ReservationStatus::Inactive,
                );
            }
        }
    }

    /// One record per live document, rooms first. Replaying the result
    /// rebuilds this store exactly.
    pub fn compacted_events(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .rooms
            .find(|_| true)
            .into_iter()
            .map(|room| Event::RoomCreated { room })
            .collect();
        events.extend(
            self.reservations
                .find(|_| true)
                .into_iter()
                .map(|reservation| Event::ReservationCreated { reservation }),
        );
        events
    }
}
