// Pricing Calculator
// Room price = nightly rate x nights + occupancy overage; booking total aggregates
// rooms, services and damage, minus the externally computed discount.

use crate::availability::DateRange;
use crate::error::{BookingError, Result};
use crate::model::{Booking, BookingItem, BookingService, Money, RoomType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemQuote {
    pub base: Money,
    pub adult_overage: Money,
    pub child_overage: Money,
    pub total: Money,
}

fn overflow(what: &str) -> BookingError {
    BookingError::Validation(format!("{} exceeds the supported amount", what))
}

// max(0, requested - allowed) x surcharge x nights
pub fn overage_fee(requested: u32, allowed: u32, surcharge: Money, nights: i64) -> Result<Money> {
    let extra = i64::from(requested.saturating_sub(allowed));
    surcharge
        .checked_mul(extra)
        .and_then(|fee| fee.checked_mul(nights))
        .ok_or_else(|| overflow("overage fee"))
}

pub fn quote_item(
    room_type: &RoomType,
    range: &DateRange,
    num_adults: u32,
    num_children: u32,
) -> Result<ItemQuote> {
    let nights = range.nights();
    let base = room_type
        .price_per_night
        .checked_mul(nights)
        .ok_or_else(|| overflow("room price"))?;
    let adult_overage = overage_fee(
        num_adults,
        room_type.max_adults,
        room_type.adult_surcharge,
        nights,
    )?;
    let child_overage = overage_fee(
        num_children,
        room_type.max_children,
        room_type.child_surcharge,
        nights,
    )?;
    let total = base
        .checked_add(adult_overage)
        .and_then(|sum| sum.checked_add(child_overage))
        .ok_or_else(|| overflow("room price"))?;

    Ok(ItemQuote {
        base,
        adult_overage,
        child_overage,
        total,
    })
}

pub fn service_total(unit_price: Money, quantity: u32) -> Result<Money> {
    unit_price
        .checked_mul(i64::from(quantity))
        .ok_or_else(|| overflow("service price"))
}

fn sum(amounts: impl IntoIterator<Item = Money>) -> Result<Money> {
    amounts
        .into_iter()
        .try_fold(Money::ZERO, |acc, amount| acc.checked_add(amount))
        .ok_or_else(|| overflow("booking total"))
}

// Booking total from its parts. A discount larger than the subtotal is capped so the
// total never goes below zero.
pub fn booking_total(
    room_prices: impl IntoIterator<Item = Money>,
    service_prices: impl IntoIterator<Item = Money>,
    damage_total: Money,
    discount: Money,
) -> Result<Money> {
    if damage_total.is_negative() || discount.is_negative() {
        return Err(BookingError::Validation(
            "damage and discount amounts must not be negative".to_string(),
        ));
    }
    let subtotal = sum(room_prices)?
        .checked_add(sum(service_prices)?)
        .and_then(|amount| amount.checked_add(damage_total))
        .ok_or_else(|| overflow("booking total"))?;
    let applied = discount.min(subtotal);
    subtotal
        .checked_sub(applied)
        .ok_or_else(|| overflow("booking total"))
}

// The recompute half of recompute-and-persist; callers write the result in the same transaction.
pub fn recompute_total(
    booking: &Booking,
    items: &[BookingItem],
    services: &[BookingService],
) -> Result<Money> {
    booking_total(
        items.iter().map(|item| item.room_price),
        services.iter().map(|service| service.total_service_price),
        booking.damage_total,
        booking.discount_amount,
    )
}
