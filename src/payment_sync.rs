// Payment-Status Synchronizer
// Payment status follows the stay: approving a cash booking marks it paid, and a
// cancellation or no-show forces it to failed. Outside those hooks the status can be
// written by an operator or the payment gateway only inside a narrow window.

use crate::error::{BookingError, Result};
use crate::model::{Booking, PaymentMethod, PaymentStatus};
use crate::stay_status::StayStatus;
use serde::{Deserialize, Serialize};

// Result reported by the payment gateway for an online payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentOutcome {
    Succeeded,
    Failed,
}

// Cash is settled at the desk, so approval is the moment the money is in hand.
pub fn on_approval(booking: &mut Booking) {
    if booking.payment_method == Some(PaymentMethod::Cash) {
        booking.payment_status = PaymentStatus::Paid;
    }
}

// Cancellation and no-show always end in failed, whatever the status was.
pub fn force_failed(booking: &mut Booking) {
    booking.payment_status = PaymentStatus::Failed;
}

// Operators may edit payment status only while the booking is reserved and not yet
// paid. The one exception is refunding a failed payment of a canceled or no-show booking.
pub fn operator_update(
    booking: &mut Booking,
    status: PaymentStatus,
    method: Option<PaymentMethod>,
) -> Result<PaymentStatus> {
    let previous = booking.payment_status;

    if status == PaymentStatus::Refunded {
        let refundable = previous == PaymentStatus::Failed
            && matches!(
                booking.stay_status,
                StayStatus::Canceled | StayStatus::NoShow
            );
        if !refundable {
            return Err(BookingError::PaymentLocked(format!(
                "only failed payments of canceled or no-show bookings can be refunded \
                 (payment {}, stay {})",
                previous, booking.stay_status
            )));
        }
        booking.payment_status = PaymentStatus::Refunded;
        booking.is_refunded = true;
        return Ok(previous);
    }

    if booking.stay_status != StayStatus::Reserved {
        return Err(BookingError::PaymentLocked(format!(
            "payment can only be edited while the booking is reserved (stay {})",
            booking.stay_status
        )));
    }
    if previous == PaymentStatus::Paid {
        return Err(BookingError::PaymentLocked(
            "payment is already settled".to_string(),
        ));
    }

    booking.payment_status = status;
    if let Some(method) = method {
        booking.payment_method = Some(method);
    }
    Ok(previous)
}

// Applies a gateway callback. It follows the same window as operator edits: the
// booking must be reserved and not yet paid. Anything else is late or a duplicate.
pub fn gateway_callback(booking: &mut Booking, outcome: PaymentOutcome) -> Result<PaymentStatus> {
    let previous = booking.payment_status;

    if booking.stay_status != StayStatus::Reserved {
        return Err(BookingError::PaymentLocked(format!(
            "gateway callback ignored for a {} booking",
            booking.stay_status
        )));
    }
    if matches!(previous, PaymentStatus::Paid | PaymentStatus::Refunded) {
        return Err(BookingError::PaymentLocked(format!(
            "payment is already {}",
            previous
        )));
    }

    match outcome {
        PaymentOutcome::Succeeded => {
            booking.payment_status = PaymentStatus::Paid;
            booking.payment_method = Some(PaymentMethod::Online);
        }
        PaymentOutcome::Failed => booking.payment_status = PaymentStatus::Failed,
    }
    Ok(previous)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BookingId, BookingMethod, Money};
    use chrono::Utc;
    use test_case::test_case;

    fn booking(stay_status: StayStatus, payment_status: PaymentStatus) -> Booking {
        Booking {
            id: BookingId(1),
            customer_name: "Le Van C".to_string(),
            customer_email: None,
            customer_phone: None,
            user_id: None,
            total_price: Money::new(1_000_000),
            discount_amount: Money::ZERO,
            payment_status,
            payment_method: Some(PaymentMethod::Cash),
            booking_method: BookingMethod::Offline,
            stay_status,
            rooms_config: Vec::new(),
            created_at: Utc::now(),
            is_refunded: false,
            damage_total: Money::ZERO,
            cancel_reason: None,
            canceled_by: None,
            canceled_at: None,
        }
    }

    #[test]
    fn test_cash_approval_marks_paid() {
        let mut cash = booking(StayStatus::Pending, PaymentStatus::Pending);
        on_approval(&mut cash);
        assert_eq!(cash.payment_status, PaymentStatus::Paid);

        let mut card = booking(StayStatus::Pending, PaymentStatus::Unpaid);
        card.payment_method = Some(PaymentMethod::Card);
        on_approval(&mut card);
        assert_eq!(card.payment_status, PaymentStatus::Unpaid);
    }

    #[test]
    fn test_operator_edits_reserved_unpaid_booking() {
        let mut reserved = booking(StayStatus::Reserved, PaymentStatus::Unpaid);
        let previous =
            operator_update(&mut reserved, PaymentStatus::Paid, Some(PaymentMethod::Card)).unwrap();

        assert_eq!(previous, PaymentStatus::Unpaid);
        assert_eq!(reserved.payment_status, PaymentStatus::Paid);
        assert_eq!(reserved.payment_method, Some(PaymentMethod::Card));
    }

    #[test_case(StayStatus::Reserved, PaymentStatus::Paid ; "already paid")]
    #[test_case(StayStatus::Pending, PaymentStatus::Unpaid ; "not yet approved")]
    #[test_case(StayStatus::CheckedIn, PaymentStatus::Unpaid ; "guest in house")]
    #[test_case(StayStatus::Canceled, PaymentStatus::Failed ; "canceled")]
    fn test_operator_edits_outside_window_are_locked(stay: StayStatus, payment: PaymentStatus) {
        let mut locked = booking(stay, payment);
        let result = operator_update(&mut locked, PaymentStatus::Pending, None);

        assert!(matches!(result, Err(BookingError::PaymentLocked(_))));
        assert_eq!(locked.payment_status, payment);
    }

    #[test]
    fn test_refund_only_after_failed_cancellation() {
        let mut canceled = booking(StayStatus::Canceled, PaymentStatus::Failed);
        operator_update(&mut canceled, PaymentStatus::Refunded, None).unwrap();
        assert_eq!(canceled.payment_status, PaymentStatus::Refunded);
        assert!(canceled.is_refunded);

        let mut active = booking(StayStatus::Reserved, PaymentStatus::Failed);
        assert!(operator_update(&mut active, PaymentStatus::Refunded, None).is_err());
        assert!(!active.is_refunded);
    }

    #[test]
    fn test_gateway_callback_window() {
        let mut reserved = booking(StayStatus::Reserved, PaymentStatus::Unpaid);
        gateway_callback(&mut reserved, PaymentOutcome::Succeeded).unwrap();
        assert_eq!(reserved.payment_status, PaymentStatus::Paid);
        assert_eq!(reserved.payment_method, Some(PaymentMethod::Online));

        // A second callback for the same payment is a duplicate.
        assert!(gateway_callback(&mut reserved, PaymentOutcome::Failed).is_err());
        assert_eq!(reserved.payment_status, PaymentStatus::Paid);
    }

    #[test_case(StayStatus::Pending ; "not yet approved")]
    #[test_case(StayStatus::CheckedIn ; "guest in house")]
    #[test_case(StayStatus::Canceled ; "canceled")]
    fn test_gateway_callback_outside_reserved_is_locked(stay: StayStatus) {
        let mut locked = booking(stay, PaymentStatus::Unpaid);
        for outcome in [PaymentOutcome::Succeeded, PaymentOutcome::Failed] {
            assert!(matches!(
                gateway_callback(&mut locked, outcome),
                Err(BookingError::PaymentLocked(_))
            ));
        }
        assert_eq!(locked.payment_status, PaymentStatus::Unpaid);
        assert_eq!(locked.payment_method, Some(PaymentMethod::Cash));
    }

    #[test]
    fn test_failed_gateway_payment_can_be_retried() {
        let mut reserved = booking(StayStatus::Reserved, PaymentStatus::Unpaid);
        gateway_callback(&mut reserved, PaymentOutcome::Failed).unwrap();
        assert_eq!(reserved.payment_status, PaymentStatus::Failed);

        gateway_callback(&mut reserved, PaymentOutcome::Succeeded).unwrap();
        assert_eq!(reserved.payment_status, PaymentStatus::Paid);
    }
}
