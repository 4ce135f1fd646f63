// Availability Checker
// Answers whether a room is free for a date range. The check runs on an open store
// transaction so the read and the insert that follows share the same locks.

use crate::error::{BookingError, Result};
use crate::model::{BookingId, BookingItem, RoomId, RoomStatus};
use crate::store::StoreTx;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// Half-open stay interval `[check_in, check_out)`: the checkout day is not occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawDateRange")]
pub struct DateRange {
    check_in: NaiveDate,
    check_out: NaiveDate,
}

#[derive(Deserialize)]
struct RawDateRange {
    check_in: NaiveDate,
    check_out: NaiveDate,
}

impl TryFrom<RawDateRange> for DateRange {
    type Error = BookingError;

    fn try_from(raw: RawDateRange) -> Result<Self> {
        DateRange::new(raw.check_in, raw.check_out)
    }
}

impl DateRange {
    pub fn new(check_in: NaiveDate, check_out: NaiveDate) -> Result<Self> {
        if check_out <= check_in {
            return Err(BookingError::Validation(format!(
                "check_out ({}) must be after check_in ({})",
                check_out, check_in
            )));
        }
        Ok(DateRange {
            check_in,
            check_out,
        })
    }

    // For rows that were validated when they were written.
    pub(crate) fn from_stored(check_in: NaiveDate, check_out: NaiveDate) -> Self {
        DateRange {
            check_in,
            check_out,
        }
    }

    pub fn check_in(&self) -> NaiveDate {
        self.check_in
    }

    pub fn check_out(&self) -> NaiveDate {
        self.check_out
    }

    pub fn nights(&self) -> i64 {
        (self.check_out - self.check_in).num_days().max(1)
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        !(other.check_out <= self.check_in || other.check_in >= self.check_out)
    }
}

// First existing item that blocks `range`. Callers pass items of active bookings only.
pub fn find_conflict<'a>(
    existing: &'a [BookingItem],
    range: &DateRange,
) -> Option<&'a BookingItem> {
    existing.iter().find(|item| item.range().overlaps(range))
}

pub fn conflict_error(room_id: RoomId, range: &DateRange) -> BookingError {
    BookingError::RoomConflict {
        room_id,
        check_in: range.check_in(),
        check_out: range.check_out(),
    }
}

// Date-overlap check against active bookings; the room's own status is checked separately.
pub async fn is_room_free<T: StoreTx>(
    tx: &mut T,
    room_id: RoomId,
    range: &DateRange,
    excluding: Option<BookingId>,
) -> Result<bool> {
    let existing = tx.active_items_for_room(room_id, excluding).await?;
    match find_conflict(&existing, range) {
        Some(blocking) => {
            tracing::debug!(
                room_id = %room_id,
                blocking_booking = %blocking.booking_id,
                check_in = %range.check_in(),
                check_out = %range.check_out(),
                "Room is taken for the requested dates"
            );
            Ok(false)
        }
        None => Ok(true),
    }
}

pub fn ensure_room_status_available(room_id: RoomId, status: RoomStatus) -> Result<()> {
    if status != RoomStatus::Available {
        return Err(BookingError::RoomNotAvailable {
            room_id,
            status: status.to_string(),
        });
    }
    Ok(())
}

// Two lines of the same request must not claim the same room for overlapping nights.
pub fn ensure_no_overlap_within_request(requested: &[(RoomId, DateRange)]) -> Result<()> {
    for (index, (room_id, range)) in requested.iter().enumerate() {
        let clash = requested[index + 1..]
            .iter()
            .any(|(other_room, other_range)| other_room == room_id && other_range.overlaps(range));
        if clash {
            return Err(conflict_error(*room_id, range));
        }
    }
    Ok(())
}
