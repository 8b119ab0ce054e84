use crate::limits::{MAX_RESERVATION_MS, MIN_RESERVATION_MS};
use crate::model::*;

use super::error::{EngineError, ValidationError};

/// Check a requested span against the booking rules and the room's current
/// active reservations. Pure; fails on the first broken rule, in this order:
///
/// 1. neither endpoint lies before `now`
/// 2. `start < end`
/// 3. duration within `[15 min, 120 min]`
/// 4. no overlap with any active reservation (half-open, touching allowed)
///
/// `existing` must be the room's active set, minus the reservation being
/// edited when re-validating an update.
pub fn validate(span: &Span, existing: &[Reservation], now: Ms) -> Result<(), EngineError> {
    if span.start < now {
        return Err(ValidationError::StartInPast.into());
    }
    if span.end < now {
        return Err(ValidationError::EndInPast.into());
    }
    if span.start >= span.end {
        return Err(ValidationError::EndNotAfterStart.into());
    }
    let duration = span.duration_ms();
    if duration < MIN_RESERVATION_MS {
        return Err(ValidationError::TooShort {
            minutes: duration / MINUTE_MS,
        }
        .into());
    }
    if duration > MAX_RESERVATION_MS {
        return Err(ValidationError::TooLong {
            minutes: duration / MINUTE_MS,
        }
        .into());
    }
    check_no_overlap(span, existing)
}

pub(crate) fn check_no_overlap(span: &Span, existing: &[Reservation]) -> Result<(), EngineError> {
    match existing
        .iter()
        .filter(|r| r.is_active())
        .find(|r| r.span.overlaps(span))
    {
        Some(clash) => Err(EngineError::Overlap(clash.id)),
        None => Ok(()),
    }
}
