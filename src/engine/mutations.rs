use tokio::sync::OwnedMutexGuard;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::validate::validate;
use super::{Engine, EngineError, ValidationError};

/// Replacement of a room's editable fields. With no `status`, a room in
/// maintenance stays there and any other room is left to reconciliation.
#[derive(Debug, Clone)]
pub struct RoomUpdate {
    pub name: String,
    pub capacity: u32,
    pub status: Option<RoomStatus>,
}

/// Partial reservation edit; `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct ReservationPatch {
    pub room_id: Option<Ulid>,
    pub user: Option<String>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub status: Option<ReservationStatus>,
}

impl ReservationPatch {
    pub fn cancel() -> Self {
        Self {
            status: Some(ReservationStatus::Inactive),
            ..Self::default()
        }
    }
}

fn clean_room_name(name: &str) -> Result<String, EngineError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ValidationError::EmptyName.into());
    }
    if name.len() > MAX_ROOM_NAME_LEN {
        return Err(EngineError::LimitExceeded("room name too long"));
    }
    Ok(name.to_string())
}

fn clean_user(user: &str) -> Result<String, EngineError> {
    let user = user.trim();
    if user.is_empty() {
        return Err(ValidationError::EmptyUser.into());
    }
    if user.len() > MAX_USER_LEN {
        return Err(EngineError::LimitExceeded("user too long"));
    }
    Ok(user.to_string())
}

fn check_room_fields(capacity: u32, status: RoomStatus) -> Result<(), EngineError> {
    if capacity == 0 {
        return Err(ValidationError::InvalidCapacity.into());
    }
    if status == RoomStatus::Occupied {
        return Err(ValidationError::ForcedOccupied.into());
    }
    Ok(())
}

fn record_rejection(err: &EngineError) {
    metrics::counter!(crate::observability::RESERVATIONS_REJECTED_TOTAL, "reason" => err.kind())
        .increment(1);
}

impl Engine {
    // ── Rooms ────────────────────────────────────────────────

    /// Create a room as `available` or `maintenance`.
    pub async fn create_room(
        &self,
        name: &str,
        capacity: u32,
        status: RoomStatus,
    ) -> Result<Room, EngineError> {
        let name = clean_room_name(name)?;
        check_room_fields(capacity, status)?;

        let _catalog = self.catalog.lock().await;
        if self.store.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if self.store.room_name_taken(&name, None) {
            return Err(EngineError::DuplicateName(name));
        }

        let room = Room {
            id: Ulid::new(),
            name,
            capacity,
            status,
        };
        self.persist(&Event::RoomCreated { room: room.clone() }).await?;
        info!(room = %room.id, name = %room.name, "room created");
        Ok(room)
    }

    /// Replace name, capacity and status. `maintenance` forces the override;
    /// `available` lifts it and the room is reconciled straight away.
    pub async fn update_room(&self, id: Ulid, update: RoomUpdate) -> Result<Room, EngineError> {
        let name = clean_room_name(&update.name)?;
        check_room_fields(update.capacity, update.status.unwrap_or(RoomStatus::Available))?;

        let _catalog = self.catalog.lock().await;
        let _guard = self.lock_existing_room(id).await?;
        let current = self
            .store
            .rooms
            .find_by_id(&id)
            .ok_or(EngineError::NotFound(id))?;
        if self.store.room_name_taken(&name, Some(id)) {
            return Err(EngineError::DuplicateName(name));
        }

        let requested = update.status.unwrap_or(match current.status {
            RoomStatus::Maintenance => RoomStatus::Maintenance,
            _ => RoomStatus::Available,
        });
        // `available` is a request to stop overriding; the displayed value
        // comes from reconciliation below.
        let status = match (requested, current.status) {
            (RoomStatus::Available, RoomStatus::Occupied) => RoomStatus::Occupied,
            (requested, _) => requested,
        };
        let room = Room {
            id,
            name,
            capacity: update.capacity,
            status,
        };
        if room != current {
            self.persist(&Event::RoomUpdated { room }).await?;
        }
        self.reconcile_locked(id).await?;

        self.store
            .rooms
            .find_by_id(&id)
            .ok_or(EngineError::NotFound(id))
    }

    /// Deactivate every active reservation of the room, then delete it.
    /// The reservations stay behind as inactive history.
    pub async fn delete_room(&self, id: Ulid) -> Result<Room, EngineError> {
        let _catalog = self.catalog.lock().await;
        let guard = self.lock_existing_room(id).await?;
        let room = self
            .store
            .rooms
            .find_by_id(&id)
            .ok_or(EngineError::NotFound(id))?;

        let deactivated = self.deactivate_locked(id).await?;
        self.persist(&Event::RoomDeleted { id }).await?;
        drop(guard);
        self.forget_room_lock(&id);

        info!(room = %id, deactivated, "room deleted");
        Ok(room)
    }

    // ── Reservations ─────────────────────────────────────────

    /// Validate and book a span on a room. Check and insert happen under the
    /// room lock, so two concurrent bookers cannot both pass validation.
    pub async fn create_reservation(
        &self,
        room_id: Ulid,
        user: &str,
        span: Span,
    ) -> Result<Reservation, EngineError> {
        let result = self.create_reservation_inner(room_id, user, span).await;
        match &result {
            Ok(_) => metrics::counter!(crate::observability::RESERVATIONS_CREATED_TOTAL).increment(1),
            Err(e) => record_rejection(e),
        }
        result
    }

    async fn create_reservation_inner(
        &self,
        room_id: Ulid,
        user: &str,
        span: Span,
    ) -> Result<Reservation, EngineError> {
        let user = clean_user(user)?;
        let _guard = self.lock_existing_room(room_id).await?;
        if self.store.reservation_count(&room_id) >= MAX_RESERVATIONS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many reservations on room"));
        }

        let active = self.store.active_for_room(&room_id);
        validate(&span, &active, self.now_ms())?;

        let reservation = Reservation {
            id: Ulid::new(),
            room_id,
            user,
            span,
            status: ReservationStatus::Active,
        };
        self.persist(&Event::ReservationCreated {
            reservation: reservation.clone(),
        })
        .await?;
        info!(
            reservation = %reservation.id,
            room = %room_id,
            start = span.start,
            end = span.end,
            "reservation created"
        );

        // a booking that starts now occupies the room immediately
        self.reconcile_locked(room_id).await?;
        Ok(reservation)
    }

    /// Read a reservation and lock its room plus `extra`. Retries if the
    /// reservation moved rooms between the read and the lock. Lock entries
    /// for rooms that no longer exist (history of a deleted room) are not kept.
    async fn lock_reservation(
        &self,
        id: Ulid,
        extra: Option<Ulid>,
    ) -> Result<(Reservation, Vec<OwnedMutexGuard<()>>), EngineError> {
        loop {
            let seen = self
                .store
                .reservations
                .find_by_id(&id)
                .ok_or(EngineError::NotFound(id))?;
            let mut rooms = vec![seen.room_id];
            rooms.extend(extra);
            let guards = self.lock_rooms(rooms.clone()).await;
            for room_id in &rooms {
                if !self.store.rooms.contains(room_id) {
                    self.forget_room_lock(room_id);
                }
            }
            let current = self
                .store
                .reservations
                .find_by_id(&id)
                .ok_or(EngineError::NotFound(id))?;
            if current.room_id == seen.room_id {
                return Ok((current, guards));
            }
        }
    }

    /// Edit an active reservation. New times (or a new room) are validated
    /// against the target room's other active reservations; `inactive` is
    /// terminal and refuses every edit.
    pub async fn update_reservation(
        &self,
        id: Ulid,
        patch: ReservationPatch,
    ) -> Result<Reservation, EngineError> {
        if let Some(target) = patch.room_id {
            if !self.store.rooms.contains(&target) {
                return Err(EngineError::NotFound(target));
            }
        }
        let (current, _guards) = self.lock_reservation(id, patch.room_id).await?;
        if !current.is_active() {
            if patch.status == Some(ReservationStatus::Active) {
                return Err(ValidationError::Reactivation.into());
            }
            return Err(EngineError::Inactive(id));
        }

        let user = match &patch.user {
            Some(u) => clean_user(u)?,
            None => current.user.clone(),
        };
        let span = Span::new(
            patch.start.unwrap_or(current.span.start),
            patch.end.unwrap_or(current.span.end),
        );
        let updated = Reservation {
            id,
            room_id: patch.room_id.unwrap_or(current.room_id),
            user,
            span,
            status: patch.status.unwrap_or(current.status),
        };

        let moved = updated.room_id != current.room_id;
        if moved && !self.store.rooms.contains(&updated.room_id) {
            // target deleted while we waited for its lock
            return Err(EngineError::NotFound(updated.room_id));
        }
        if updated.is_active() && (moved || updated.span != current.span) {
            let others: Vec<Reservation> = self
                .store
                .active_for_room(&updated.room_id)
                .into_iter()
                .filter(|r| r.id != id)
                .collect();
            if let Err(e) = validate(&span, &others, self.now_ms()) {
                record_rejection(&e);
                return Err(e);
            }
        }

        if updated == current {
            return Ok(current);
        }
        self.persist(&Event::ReservationUpdated {
            reservation: updated.clone(),
        })
        .await?;
        info!(reservation = %id, status = ?updated.status, "reservation updated");

        let mut touched = vec![current.room_id];
        if moved {
            touched.push(updated.room_id);
        }
        for room_id in touched {
            if self.store.rooms.contains(&room_id) {
                self.reconcile_locked(room_id).await?;
            }
        }
        Ok(updated)
    }

    /// `active → inactive`.
    pub async fn cancel_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.update_reservation(id, ReservationPatch::cancel()).await
    }

    /// Remove the document. A reservation that is active and running right
    /// now cannot be deleted; cancel it instead.
    pub async fn delete_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let (current, _guards) = self.lock_reservation(id, None).await?;
        if current.is_active() && current.is_running(self.now_ms()) {
            return Err(EngineError::InProgress(id));
        }

        self.persist(&Event::ReservationDeleted {
            id,
            room_id: current.room_id,
        })
        .await?;
        info!(reservation = %id, room = %current.room_id, "reservation deleted");

        if self.store.rooms.contains(&current.room_id) {
            self.reconcile_locked(current.room_id).await?;
        }
        Ok(current)
    }

    /// Bulk `active → inactive` for one room; returns how many changed.
    pub async fn deactivate_room_reservations(&self, room_id: Ulid) -> Result<usize, EngineError> {
        let _guard = self.lock_existing_room(room_id).await?;
        let count = self.deactivate_locked(room_id).await?;
        self.reconcile_locked(room_id).await?;
        info!(room = %room_id, count, "reservations deactivated");
        Ok(count)
    }

    /// Caller holds the room lock. Writes nothing when there is nothing active.
    pub(super) async fn deactivate_locked(&self, room_id: Ulid) -> Result<usize, EngineError> {
        let ids: Vec<Ulid> = self
            .store
            .active_for_room(&room_id)
            .into_iter()
            .map(|r| r.id)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let count = ids.len();
        self.persist(&Event::ReservationsDeactivated { room_id, ids })
            .await?;
        Ok(count)
    }
}
