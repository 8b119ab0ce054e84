use crate::model::{Ms, MINUTE_MS};

/// Shortest bookable reservation (inclusive).
pub const MIN_RESERVATION_MS: Ms = 15 * MINUTE_MS;

/// Longest bookable reservation (inclusive).
pub const MAX_RESERVATION_MS: Ms = 120 * MINUTE_MS;

pub const MAX_ROOM_NAME_LEN: usize = 256;
pub const MAX_USER_LEN: usize = 256;
pub const MAX_ROOMS: usize = 10_000;
pub const MAX_RESERVATIONS_PER_ROOM: usize = 100_000;
