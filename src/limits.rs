//! Hard bounds on input sizes and counts.

use crate::model::Ms;

pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 2_000;
pub const MAX_ATTENDEES: u32 = 10_000;

pub const MAX_ROOM_NAME_LEN: usize = 200;
pub const MAX_AMENITIES: usize = 32;
pub const MAX_AMENITY_LEN: usize = 64;
pub const MAX_ROOMS_PER_OFFICE: usize = 1_000;
pub const DEFAULT_ROOM_CAPACITY: u32 = 8;

/// 1970-01-01 .. 9999-12-31.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;
/// A single reservation may not span more than a year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_OFFICES: usize = 1_000;
pub const MAX_OFFICE_NAME_LEN: usize = 64;

/// Queued notifications per office before new ones are dropped.
pub const OUTBOX_CAPACITY: usize = 4_096;
/// Pending WAL commands before writers wait.
pub const WAL_CHANNEL_CAPACITY: usize = 4_096;
