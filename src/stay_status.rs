// Stay-Status State Machine
// A booking moves pending -> reserved -> checked_in -> checked_out, or ends early in
// canceled / no_show. `StayStatus::apply` is the only place a transition is decided;
// every caller goes through it so an illegal move is rejected before anything is written.

use crate::error::{BookingError, Result};
use crate::model::{RoomId, RoomStatus};
use crate::store::StoreTx;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// Discriminants are the numeric codes stored in the bookings table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StayStatus {
    Reserved = 1,
    CheckedIn = 2,
    CheckedOut = 3,
    Canceled = 4,
    NoShow = 5,
    Pending = 6,
}

impl StayStatus {
    // Bookings in these states hold their rooms for the booked nights.
    pub const ACTIVE: [StayStatus; 3] = [
        StayStatus::Pending,
        StayStatus::Reserved,
        StayStatus::CheckedIn,
    ];

    pub const fn code(self) -> i16 {
        self as i16
    }

    pub fn from_code(code: i16) -> Result<Self> {
        match code {
            1 => Ok(StayStatus::Reserved),
            2 => Ok(StayStatus::CheckedIn),
            3 => Ok(StayStatus::CheckedOut),
            4 => Ok(StayStatus::Canceled),
            5 => Ok(StayStatus::NoShow),
            6 => Ok(StayStatus::Pending),
            other => Err(BookingError::Storage(format!(
                "unknown stay status code {}",
                other
            ))),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            StayStatus::Pending => "pending",
            StayStatus::Reserved => "reserved",
            StayStatus::CheckedIn => "checked_in",
            StayStatus::CheckedOut => "checked_out",
            StayStatus::Canceled => "canceled",
            StayStatus::NoShow => "no_show",
        }
    }

    pub const fn is_active(self) -> bool {
        matches!(
            self,
            StayStatus::Pending | StayStatus::Reserved | StayStatus::CheckedIn
        )
    }

    pub const fn is_finalized(self) -> bool {
        !self.is_active()
    }

    // The single transition table. Anything not listed is illegal.
    pub fn apply(self, action: &StayAction) -> Result<StayStatus> {
        use StayAction::*;
        use StayStatus::*;

        match (self, action) {
            (Pending, Approve) => Ok(Reserved),
            (Reserved, CheckIn) => Ok(CheckedIn),
            (CheckedIn, CheckOut) => Ok(CheckedOut),
            (Pending | Reserved | CheckedIn, Cancel { .. }) => Ok(Canceled),
            (Pending | Reserved, MarkNoShow) => Ok(NoShow),
            (Canceled, CheckIn) => Err(BookingError::InvalidTransition(
                "cannot check in a canceled booking".to_string(),
            )),
            (from, action) => Err(BookingError::InvalidTransition(format!(
                "cannot {} a {} booking",
                action.name(),
                from
            ))),
        }
    }
}

impl fmt::Display for StayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StayAction {
    Approve,
    CheckIn,
    CheckOut,
    Cancel { reason: String },
    MarkNoShow,
}

impl StayAction {
    pub fn name(&self) -> &'static str {
        match self {
            StayAction::Approve => "approve",
            StayAction::CheckIn => "check in",
            StayAction::CheckOut => "check out",
            StayAction::Cancel { .. } => "cancel",
            StayAction::MarkNoShow => "mark as no-show",
        }
    }

    // Cancel is open to the owning customer; everything else is front-desk work.
    pub fn requires_staff(&self) -> bool {
        !matches!(self, StayAction::Cancel { .. })
    }
}

pub const fn room_status_for(stay: StayStatus) -> RoomStatus {
    match stay {
        StayStatus::Pending => RoomStatus::Pending,
        StayStatus::Reserved => RoomStatus::Booked,
        StayStatus::CheckedIn => RoomStatus::Occupied,
        StayStatus::CheckedOut => RoomStatus::Checkout,
        StayStatus::Canceled | StayStatus::NoShow => RoomStatus::Available,
    }
}

// Room-status side effects of one transition: every room of the booking moves to
// the same status. Computed once, then applied inside the transition's transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomProjection {
    pub status: RoomStatus,
    pub room_ids: BTreeSet<RoomId>,
}

impl RoomProjection {
    pub fn for_stay(stay: StayStatus, room_ids: impl IntoIterator<Item = RoomId>) -> Self {
        RoomProjection {
            status: room_status_for(stay),
            room_ids: room_ids.into_iter().collect(),
        }
    }

    // Housekeeping step after checkout; stay status is untouched.
    pub fn cleaning(room_ids: impl IntoIterator<Item = RoomId>) -> Self {
        RoomProjection {
            status: RoomStatus::Cleaning,
            room_ids: room_ids.into_iter().collect(),
        }
    }

    pub async fn apply<T: StoreTx>(&self, tx: &mut T) -> Result<()> {
        for room_id in &self.room_ids {
            tx.set_room_status(*room_id, self.status).await?;
        }
        tracing::debug!(
            status = %self.status,
            rooms = self.room_ids.len(),
            "Applied room status projection"
        );
        Ok(())
    }
}
