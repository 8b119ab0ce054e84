use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// Outcome of reconciling one room at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Status the room should display.
    pub status: RoomStatus,
    /// Active reservations whose end has passed and must become inactive.
    pub expired: Vec<Ulid>,
}

impl Reconciliation {
    /// Whether applying this outcome to `room` would write anything.
    pub fn is_noop(&self, room: &Room) -> bool {
        self.expired.is_empty() && self.status == room.status
    }
}

/// Derive a room's status from its active reservations at `now`.
///
/// Reservations are walked nearest-first (by start, then id). Ended ones are
/// collected for expiry and skipped; the first one that has not ended decides:
/// occupied while `start <= now < end`, available otherwise. A room in
/// maintenance keeps that status whatever its reservations say, but its
/// ended reservations still expire.
///
/// Pure and idempotent: feeding the result back in yields a no-op.
pub fn reconcile(room: &Room, active: &[Reservation], now: Ms) -> Reconciliation {
    let mut pending: Vec<&Reservation> = active
        .iter()
        .filter(|r| r.room_id == room.id && r.is_active())
        .collect();
    pending.sort_by_key(|r| (r.span.start, r.id));

    let expired: Vec<Ulid> = pending
        .iter()
        .filter(|r| r.has_expired(now))
        .map(|r| r.id)
        .collect();

    let derived = match pending.iter().find(|r| !r.has_expired(now)) {
        Some(nearest) if nearest.is_running(now) => RoomStatus::Occupied,
        _ => RoomStatus::Available,
    };

    let status = if room.status == RoomStatus::Maintenance {
        RoomStatus::Maintenance
    } else {
        derived
    };

    Reconciliation { status, expired }
}

/// Totals from one pass over every room.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub rooms: usize,
    pub expired: usize,
    pub transitions: usize,
    pub failures: usize,
}

impl Engine {
    /// Re-derive one room's status and persist whatever changed.
    pub async fn reconcile_room(&self, room_id: Ulid) -> Result<Reconciliation, EngineError> {
        let _guard = self.lock_existing_room(room_id).await?;
        self.reconcile_locked(room_id).await
    }

    /// Caller holds the room lock.
    pub(super) async fn reconcile_locked(&self, room_id: Ulid) -> Result<Reconciliation, EngineError> {
        let room = self
            .store
            .rooms
            .find_by_id(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let active = self.store.active_for_room(&room_id);
        let outcome = reconcile(&room, &active, self.clock.now_ms());

        if outcome.is_noop(&room) {
            return Ok(outcome);
        }

        if !outcome.expired.is_empty() {
            let event = Event::ReservationsDeactivated {
                room_id,
                ids: outcome.expired.clone(),
            };
            self.persist(&event).await?;
            metrics::counter!(crate::observability::RESERVATIONS_EXPIRED_TOTAL)
                .increment(outcome.expired.len() as u64);
            info!(room = %room_id, count = outcome.expired.len(), "expired reservations");
        }

        if outcome.status != room.status {
            let updated = Room {
                status: outcome.status,
                ..room.clone()
            };
            self.persist(&Event::RoomUpdated { room: updated }).await?;
            metrics::counter!(
                crate::observability::ROOM_TRANSITIONS_TOTAL,
                "to" => outcome.status.as_str()
            )
            .increment(1);
            info!(
                room = %room_id,
                from = room.status.as_str(),
                to = outcome.status.as_str(),
                "room status changed"
            );
        }

        Ok(outcome)
    }

    /// Reconcile every room. Rooms deleted mid-pass are skipped; a failed
    /// write is counted and the pass moves on to the next room.
    pub async fn sweep(&self) -> SweepReport {
        let started = std::time::Instant::now();
        let mut report = SweepReport::default();

        for room in self.store.rooms.find(|_| true) {
            let before = room.status;
            match self.reconcile_room(room.id).await {
                Ok(outcome) => {
                    report.rooms += 1;
                    report.expired += outcome.expired.len();
                    if outcome.status != before {
                        report.transitions += 1;
                    }
                }
                Err(EngineError::NotFound(_)) => debug!(room = %room.id, "sweep skip: room deleted"),
                Err(e) => {
                    report.failures += 1;
                    warn!(room = %room.id, "sweep failed: {e}");
                }
            }
        }

        metrics::histogram!(crate::observability::SWEEP_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const M: Ms = MINUTE_MS;

    fn room(status: RoomStatus) -> Room {
        Room {
            id: Ulid::new(),
            name: "Sala R".into(),
            capacity: 4,
            status,
        }
    }

    fn booking(room: &Room, start: Ms, end: Ms) -> Reservation {
        Reservation {
            id: Ulid::new(),
            room_id: room.id,
            user: "ines".into(),
            span: Span::new(start, end),
            status: ReservationStatus::Active,
        }
    }

    #[test]
    fn no_reservations_means_available() {
        let r = room(RoomStatus::Occupied);
        let out = reconcile(&r, &[], 0);
        assert_eq!(out.status, RoomStatus::Available);
        assert!(out.expired.is_empty());
    }

    #[test]
    fn future_reservation_does_not_occupy() {
        let r = room(RoomStatus::Available);
        let res = booking(&r, 60 * M, 90 * M);
        let out = reconcile(&r, &[res], 0);
        assert_eq!(out.status, RoomStatus::Available);
        assert!(out.is_noop(&r));
    }

    #[test]
    fn running_reservation_occupies() {
        let r = room(RoomStatus::Available);
        let res = booking(&r, 0, 30 * M);
        assert_eq!(reconcile(&r, &[res.clone()], 0).status, RoomStatus::Occupied);
        assert_eq!(reconcile(&r, &[res], 30 * M - 1).status, RoomStatus::Occupied);
    }

    #[test]
    fn end_instant_frees_room_but_does_not_expire() {
        let r = room(RoomStatus::Occupied);
        let res = booking(&r, 0, 30 * M);
        let out = reconcile(&r, &[res], 30 * M);
        assert_eq!(out.status, RoomStatus::Available);
        assert!(out.expired.is_empty());
    }

    #[test]
    fn expired_nearest_is_dropped_and_next_considered() {
        let r = room(RoomStatus::Occupied);
        let done = booking(&r, 0, 30 * M);
        let next = booking(&r, 40 * M, 70 * M);
        let out = reconcile(&r, &[next.clone(), done.clone()], 45 * M);
        assert_eq!(out.expired, vec![done.id]);
        assert_eq!(out.status, RoomStatus::Occupied);
    }

    #[test]
    fn maintenance_is_never_cleared() {
        let r = room(RoomStatus::Maintenance);
        let running = booking(&r, 0, 30 * M);
        assert_eq!(reconcile(&r, &[running.clone()], 10 * M).status, RoomStatus::Maintenance);
        let future = booking(&r, 60 * M, 90 * M);
        assert_eq!(reconcile(&r, &[future], 10 * M).status, RoomStatus::Maintenance);
        let out = reconcile(&r, &[running.clone()], 31 * M);
        assert_eq!(out.status, RoomStatus::Maintenance);
        assert_eq!(out.expired, vec![running.id]);
    }

    #[test]
    fn ignores_inactive_and_foreign_reservations() {
        let r = room(RoomStatus::Available);
        let mut cancelled = booking(&r, 0, 30 * M);
        cancelled.status = ReservationStatus::Inactive;
        let other = room(RoomStatus::Available);
        let foreign = booking(&other, 0, 30 * M);
        let out = reconcile(&r, &[cancelled, foreign], 10 * M);
        assert_eq!(out.status, RoomStatus::Available);
        assert!(out.expired.is_empty());
    }

    #[test]
    fn reconcile_is_idempotent() {
        let r = room(RoomStatus::Available);
        let done = booking(&r, 0, 15 * M);
        let running = booking(&r, 20 * M, 50 * M);
        let now = 25 * M;

        let first = reconcile(&r, &[done.clone(), running.clone()], now);
        assert!(!first.is_noop(&r));

        // apply the outcome the way the engine would, then run again
        let applied_room = Room { status: first.status, ..r.clone() };
        let remaining: Vec<Reservation> = [done, running]
            .into_iter()
            .filter(|x| !first.expired.contains(&x.id))
            .collect();
        let second = reconcile(&applied_room, &remaining, now);
        assert_eq!(second.status, first.status);
        assert!(second.is_noop(&applied_room));
    }
}
