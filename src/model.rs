use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type inside the engine.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
///
/// Ordering of `start` and `end` is not enforced here; reservation input is
/// checked by the validator before a span ever reaches the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Displayed state of a room. `Occupied` is only ever derived by the
/// reconciler; `Maintenance` is a manual override it never clears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Available,
    Occupied,
    Maintenance,
}

impl RoomStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomStatus::Available => "available",
            RoomStatus::Occupied => "occupied",
            RoomStatus::Maintenance => "maintenance",
        }
    }
}

/// `Inactive` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub name: String,
    pub capacity: u32,
    pub status: RoomStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub room_id: Ulid,
    pub user: String,
    pub span: Span,
    pub status: ReservationStatus,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Active
    }

    /// Strictly past the end: a reservation is still current at `now == end`
    /// for expiry purposes, although it no longer occupies the room.
    pub fn has_expired(&self, now: Ms) -> bool {
        now > self.span.end
    }

    pub fn is_running(&self, now: Ms) -> bool {
        self.span.contains_instant(now)
    }
}

/// One event per document write. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated { room: Room },
    RoomUpdated { room: Room },
    RoomDeleted { id: Ulid },
    ReservationCreated { reservation: Reservation },
    ReservationUpdated { reservation: Reservation },
    ReservationDeleted { id: Ulid, room_id: Ulid },
    /// Bulk `active → inactive` for the listed reservations of one room.
    ReservationsDeactivated { room_id: Ulid, ids: Vec<Ulid> },
}

impl Event {
    /// The room whose timeline this event touches.
    pub fn room_id(&self) -> Ulid {
        match self {
            Event::RoomCreated { room } | Event::RoomUpdated { room } => room.id,
            Event::RoomDeleted { id } => *id,
            Event::ReservationCreated { reservation } | Event::ReservationUpdated { reservation } => {
                reservation.room_id
            }
            Event::ReservationDeleted { room_id, .. }
            | Event::ReservationsDeactivated { room_id, .. } => *room_id,
        }
    }

    pub fn touches_rooms(&self) -> bool {
        matches!(
            self,
            Event::RoomCreated { .. } | Event::RoomUpdated { .. } | Event::RoomDeleted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        let d = Span::new(50, 400);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(a.overlaps(&d));
        assert!(d.overlaps(&a));
    }

    #[test]
    fn reservation_expiry_is_strict() {
        let r = Reservation {
            id: Ulid::new(),
            room_id: Ulid::new(),
            user: "ana".into(),
            span: Span::new(1_000, 2_000),
            status: ReservationStatus::Active,
        };
        assert!(r.is_running(1_000));
        assert!(!r.is_running(2_000));
        assert!(!r.has_expired(2_000));
        assert!(r.has_expired(2_001));
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&RoomStatus::Maintenance).unwrap(),
            "\"maintenance\""
        );
        let parsed: ReservationStatus = serde_json::from_str("\"inactive\"").unwrap();
        assert_eq!(parsed, ReservationStatus::Inactive);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::RoomCreated {
            room: Room {
                id: Ulid::new(),
                name: "Sala Norte".into(),
                capacity: 4,
                status: RoomStatus::Available,
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn event_room_id() {
        let room_id = Ulid::new();
        let event = Event::ReservationsDeactivated {
            room_id,
            ids: vec![Ulid::new()],
        };
        assert_eq!(event.room_id(), room_id);
        assert!(!event.touches_rooms());
        assert!(Event::RoomDeleted { id: room_id }.touches_rooms());
    }
}
