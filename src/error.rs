// Error taxonomy for the booking core
// Every business-rule violation maps to exactly one variant; storage failures are
// translated into the nearest domain error before they leave the store layer.

use crate::model::{BookingId, BookingItemId, RoomId, ServiceId};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BookingError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Room {0} not found")]
    RoomNotFound(RoomId),

    #[error("Room {room_id} is not available (status: {status})")]
    RoomNotAvailable { room_id: RoomId, status: String },

    #[error("Room {room_id} is already booked for {check_in}..{check_out}")]
    RoomConflict {
        room_id: RoomId,
        check_in: chrono::NaiveDate,
        check_out: chrono::NaiveDate,
    },

    #[error("Booking {0} not found")]
    BookingNotFound(BookingId),

    #[error("Booking item {0} not found")]
    BookingItemNotFound(BookingItemId),

    #[error("Service {0} not found")]
    ServiceNotFound(ServiceId),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Payment status is locked: {0}")]
    PaymentLocked(String),

    #[error("Too late to cancel: cancellation closed at {deadline}")]
    TooLateToCancel { deadline: chrono::DateTime<chrono::Utc> },

    #[error("Booking {0} is already checked in")]
    AlreadyCheckedIn(BookingId),

    #[error("Booking {0} is already finalized")]
    AlreadyFinalized(BookingId),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BookingError {
    // Only lock/serialization failures are worth replaying; business rejections are final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BookingError::ConcurrencyConflict(_))
    }

    // Errors that indicate something outside the business rules went wrong.
    pub fn is_internal(&self) -> bool {
        matches!(self, BookingError::Storage(_) | BookingError::Internal(_))
    }

    pub fn missing_fields(fields: &[&str]) -> Self {
        BookingError::Validation(format!("missing required fields: {}", fields.join(", ")))
    }
}

pub type Result<T, E = BookingError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_concurrency_conflicts_are_retryable() {
        assert!(BookingError::ConcurrencyConflict("lock timeout".into()).is_retryable());
        assert!(!BookingError::RoomNotFound(RoomId(1)).is_retryable());
        assert!(!BookingError::Storage("connection reset".into()).is_retryable());
    }

    #[test]
    fn test_missing_fields_names_every_field() {
        let err = BookingError::missing_fields(&["customer_name", "total_price"]);
        assert_eq!(
            err.to_string(),
            "Validation error: missing required fields: customer_name, total_price"
        );
    }
}
