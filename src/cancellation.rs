// Cancellation / No-show Policy Engine
// Decides whether an actor may cancel a booking right now, and when a reserved
// booking may be written off as a no-show. All instants are derived from the earliest
// check-in date of the booking, the configured check-in time and the hotel's UTC offset.

use crate::config::EngineConfig;
use crate::error::{BookingError, Result};
use crate::model::{Actor, Booking, BookingItem};
use crate::payment_sync;
use crate::stay_status::{StayAction, StayStatus};
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

pub fn earliest_check_in(items: &[BookingItem]) -> Option<NaiveDate> {
    items.iter().map(|item| item.check_in).min()
}

// Check-in date at the configured check-in time, hotel local time, as a UTC instant.
pub fn check_in_instant(date: NaiveDate, config: &EngineConfig) -> DateTime<Utc> {
    let local = date.and_time(config.check_in_time);
    let offset = Duration::seconds(i64::from(config.hotel_offset().local_minus_utc()));
    Utc.from_utc_datetime(&(local - offset))
}

// Customers can cancel a reserved booking only before this instant.
pub fn cancellation_deadline(check_in: NaiveDate, config: &EngineConfig) -> DateTime<Utc> {
    check_in_instant(check_in, config) - Duration::hours(config.cancellation_cutoff_hours)
}

// A no-show can be recorded from this instant on.
pub fn no_show_deadline(check_in: NaiveDate, config: &EngineConfig) -> DateTime<Utc> {
    check_in_instant(check_in, config) + Duration::minutes(config.no_show_grace_minutes)
}

pub fn authorize_cancel(
    booking: &Booking,
    items: &[BookingItem],
    actor: &Actor,
    now: DateTime<Utc>,
    config: &EngineConfig,
) -> Result<()> {
    if !actor.is_staff() && !booking.is_owned_by(actor.user_id) {
        return Err(BookingError::Forbidden(format!(
            "booking {} belongs to another customer",
            booking.id
        )));
    }

    match booking.stay_status {
        StayStatus::CheckedOut | StayStatus::Canceled | StayStatus::NoShow => {
            Err(BookingError::AlreadyFinalized(booking.id))
        }
        _ if actor.is_staff() => Ok(()),
        StayStatus::CheckedIn => Err(BookingError::AlreadyCheckedIn(booking.id)),
        StayStatus::Pending => Ok(()),
        StayStatus::Reserved => match earliest_check_in(items) {
            Some(check_in) => {
                let deadline = cancellation_deadline(check_in, config);
                if now < deadline {
                    Ok(())
                } else {
                    Err(BookingError::TooLateToCancel { deadline })
                }
            }
            None => Ok(()),
        },
    }
}

pub fn apply_cancellation(
    booking: &mut Booking,
    actor: &Actor,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    booking.stay_status = booking.stay_status.apply(&StayAction::Cancel {
        reason: reason.to_string(),
    })?;
    payment_sync::force_failed(booking);

    let reason = reason.trim();
    booking.cancel_reason = (!reason.is_empty()).then(|| reason.to_string());
    booking.canceled_by = actor.user_id;
    booking.canceled_at = Some(now);
    Ok(())
}

pub fn authorize_no_show(
    booking: &Booking,
    items: &[BookingItem],
    now: DateTime<Utc>,
    config: &EngineConfig,
) -> Result<()> {
    // Surfaces the state machine's own rejection for checked-in or finalized bookings.
    booking.stay_status.apply(&StayAction::MarkNoShow)?;

    // Bookings without rooms have no check-in date to wait for.
    let Some(check_in) = earliest_check_in(items) else {
        return Ok(());
    };
    let deadline = no_show_deadline(check_in, config);
    if now < deadline {
        return Err(BookingError::InvalidTransition(format!(
            "no-show can only be recorded from {}",
            deadline
        )));
    }
    Ok(())
}

pub fn apply_no_show(booking: &mut Booking, now: DateTime<Utc>) -> Result<()> {
    booking.stay_status = booking.stay_status.apply(&StayAction::MarkNoShow)?;
    payment_sync::force_failed(booking);
    booking.canceled_at = Some(now);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        BookingId, BookingItemId, BookingMethod, Money, PaymentMethod, PaymentStatus, RoomId,
        UserId,
    };
    use test_case::test_case;

    fn at(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn booking(stay_status: StayStatus) -> Booking {
        Booking {
            id: BookingId(7),
            customer_name: "Pham Thi D".to_string(),
            customer_email: Some("d@example.com".to_string()),
            customer_phone: None,
            user_id: Some(UserId(42)),
            total_price: Money::new(1_600_000),
            discount_amount: Money::ZERO,
            payment_status: PaymentStatus::Pending,
            payment_method: Some(PaymentMethod::Cash),
            booking_method: BookingMethod::Online,
            stay_status,
            rooms_config: Vec::new(),
            created_at: at("2025-05-01T09:00:00Z"),
            is_refunded: false,
            damage_total: Money::ZERO,
            cancel_reason: None,
            canceled_by: None,
            canceled_at: None,
        }
    }

    fn items() -> Vec<BookingItem> {
        let item = |id: i64, check_in: &str, check_out: &str| BookingItem {
            id: BookingItemId(id),
            booking_id: BookingId(7),
            room_id: RoomId(100 + id),
            check_in: check_in.parse().unwrap(),
            check_out: check_out.parse().unwrap(),
            room_price: Money::new(800_000),
            num_adults: 2,
            num_children: 0,
            special_requests: None,
        };
        vec![
            item(2, "2025-06-03", "2025-06-05"),
            item(1, "2025-06-01", "2025-06-03"),
        ]
    }

    #[test]
    fn test_deadlines_use_earliest_item_and_hotel_offset() {
        let config = EngineConfig::default();
        let check_in = earliest_check_in(&items()).unwrap();
        assert_eq!(check_in, "2025-06-01".parse::<NaiveDate>().unwrap());

        assert_eq!(check_in_instant(check_in, &config), at("2025-06-01T12:00:00Z"));
        assert_eq!(cancellation_deadline(check_in, &config), at("2025-05-31T12:00:00Z"));
        assert_eq!(no_show_deadline(check_in, &config), at("2025-06-01T14:00:00Z"));

        let hanoi = EngineConfig {
            utc_offset_minutes: 7 * 60,
            ..EngineConfig::default()
        };
        assert_eq!(check_in_instant(check_in, &hanoi), at("2025-06-01T05:00:00Z"));
    }

    #[test_case("2025-05-31T11:59:59Z", true ; "just before cutoff")]
    #[test_case("2025-05-31T12:00:00Z", false ; "at cutoff")]
    #[test_case("2025-06-01T02:00:00Z", false ; "ten hours before check in")]
    fn test_customer_cutoff_for_reserved(now: &str, allowed: bool) {
        let result = authorize_cancel(
            &booking(StayStatus::Reserved),
            &items(),
            &Actor::customer(UserId(42)),
            at(now),
            &EngineConfig::default(),
        );
        if allowed {
            assert!(result.is_ok());
        } else {
            assert_eq!(
                result,
                Err(BookingError::TooLateToCancel {
                    deadline: at("2025-05-31T12:00:00Z")
                })
            );
        }
    }

    #[test]
    fn test_customer_guards() {
        let config = EngineConfig::default();
        let owner = Actor::customer(UserId(42));
        let late = at("2025-06-01T10:00:00Z");

        assert!(authorize_cancel(&booking(StayStatus::Pending), &items(), &owner, late, &config).is_ok());
        assert_eq!(
            authorize_cancel(&booking(StayStatus::CheckedIn), &items(), &owner, late, &config),
            Err(BookingError::AlreadyCheckedIn(BookingId(7)))
        );
        assert_eq!(
            authorize_cancel(&booking(StayStatus::NoShow), &items(), &owner, late, &config),
            Err(BookingError::AlreadyFinalized(BookingId(7)))
        );
        assert!(matches!(
            authorize_cancel(
                &booking(StayStatus::Pending),
                &items(),
                &Actor::customer(UserId(43)),
                late,
                &config
            ),
            Err(BookingError::Forbidden(_))
        ));
    }

    #[test_case(StayStatus::Pending, true ; "pending")]
    #[test_case(StayStatus::Reserved, true ; "reserved after cutoff")]
    #[test_case(StayStatus::CheckedIn, true ; "force cancel in house")]
    #[test_case(StayStatus::CheckedOut, false ; "checked out")]
    #[test_case(StayStatus::Canceled, false ; "already canceled")]
    fn test_staff_cancel_ignores_cutoff(stay: StayStatus, allowed: bool) {
        let result = authorize_cancel(
            &booking(stay),
            &items(),
            &Actor::staff(UserId(1)),
            at("2025-06-01T10:00:00Z"),
            &EngineConfig::default(),
        );
        assert_eq!(result.is_ok(), allowed);
    }

    #[test]
    fn test_cancellation_records_who_when_and_fails_payment() {
        let mut canceled = booking(StayStatus::Reserved);
        let now = at("2025-05-20T08:00:00Z");
        apply_cancellation(&mut canceled, &Actor::staff(UserId(1)), "  guest request ", now).unwrap();

        assert_eq!(canceled.stay_status, StayStatus::Canceled);
        assert_eq!(canceled.payment_status, PaymentStatus::Failed);
        assert_eq!(canceled.cancel_reason.as_deref(), Some("guest request"));
        assert_eq!(canceled.canceled_by, Some(UserId(1)));
        assert_eq!(canceled.canceled_at, Some(now));

        // The state machine rejects a second cancel.
        assert!(apply_cancellation(&mut canceled, &Actor::staff(UserId(1)), "", now).is_err());
    }

    #[test]
    fn test_no_show_waits_for_grace_period() {
        let config = EngineConfig::default();
        let reserved = booking(StayStatus::Reserved);

        assert!(matches!(
            authorize_no_show(&reserved, &items(), at("2025-06-01T13:59:00Z"), &config),
            Err(BookingError::InvalidTransition(_))
        ));
        assert!(authorize_no_show(&reserved, &items(), at("2025-06-01T14:00:00Z"), &config).is_ok());
        assert!(matches!(
            authorize_no_show(
                &booking(StayStatus::CheckedIn),
                &items(),
                at("2025-06-02T00:00:00Z"),
                &config
            ),
            Err(BookingError::InvalidTransition(_))
        ));
    }

    #[test]
    fn test_bookings_without_rooms_have_no_date_gate() {
        let config = EngineConfig::default();
        let early = at("2025-01-01T00:00:00Z");

        assert!(authorize_no_show(&booking(StayStatus::Reserved), &[], early, &config).is_ok());
        assert!(authorize_cancel(
            &booking(StayStatus::Reserved),
            &[],
            &Actor::customer(UserId(42)),
            early,
            &config
        )
        .is_ok());
    }
}
