// Booking core data model
// Entities persisted by the store plus the request payloads accepted by the engine.

use crate::availability::DateRange;
use crate::error::{BookingError, Result};
use crate::stay_status::StayStatus;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! id_type {
    ($($name:ident),+ $(,)?) => {
        $(
            #[derive(
                Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
            )]
            #[serde(transparent)]
            pub struct $name(pub i64);

            impl $name {
                pub const fn get(self) -> i64 {
                    self.0
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )+
    };
}

id_type!(
    BookingId,
    BookingItemId,
    BookingGuestId,
    BookingServiceId,
    RoomId,
    RoomTypeId,
    ServiceId,
    UserId,
);

// Enums persisted as text. The wire name doubles as the column value.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = BookingError;

            fn from_str(value: &str) -> Result<Self> {
                match value {
                    $($text => Ok($name::$variant),)+
                    other => Err(BookingError::Validation(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

text_enum!(
    // Payment state of a booking. `Pending` is cash-on-delivery awaiting collection.
    PaymentStatus {
        Unpaid => "unpaid",
        Pending => "pending",
        Paid => "paid",
        Failed => "failed",
        Refunded => "refunded",
    }
);

text_enum!(
    PaymentMethod {
        Cash => "cash",
        Card => "card",
        BankTransfer => "bank_transfer",
        Online => "online",
    }
);

text_enum!(
    BookingMethod {
        Online => "online",
        Offline => "offline",
    }
);

text_enum!(
    // Operational status of a physical room, projected from the stay status of
    // the booking that holds it. `Maintenance` is set by the catalog only.
    RoomStatus {
        Available => "available",
        Pending => "pending",
        Booked => "booked",
        Occupied => "occupied",
        Checkout => "checkout",
        Cleaning => "cleaning",
        Maintenance => "maintenance",
    }
);

text_enum!(
    GuestType {
        Adult => "adult",
        Child => "child",
    }
);

// Money in whole currency units. Integer arithmetic only, so totals never drift.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn new(amount: i64) -> Self {
        Money(amount)
    }

    pub const fn amount(self) -> i64 {
        self.0
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    pub fn checked_sub(self, other: Money) -> Option<Money> {
        self.0.checked_sub(other.0).map(Money)
    }

    pub fn checked_mul(self, factor: i64) -> Option<Money> {
        self.0.checked_mul(factor).map(Money)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Catalog records. The core reads them but never creates or deletes them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub room_number: String,
    pub room_type_id: RoomTypeId,
    pub status: RoomStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomType {
    pub id: RoomTypeId,
    pub name: String,
    pub price_per_night: Money,
    pub max_adults: u32,
    pub max_children: u32,
    pub adult_surcharge: Money,
    pub child_surcharge: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceOffering {
    pub id: ServiceId,
    pub name: String,
    pub unit_price: Money,
}

// Quantity request by room type. Stored as-is; rooms are never auto-assigned from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRequest {
    pub room_type_id: RoomTypeId,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub customer_name: String,
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,
    pub user_id: Option<UserId>,
    pub total_price: Money,
    pub discount_amount: Money,
    pub payment_status: PaymentStatus,
    pub payment_method: Option<PaymentMethod>,
    pub booking_method: BookingMethod,
    pub stay_status: StayStatus,
    pub rooms_config: Vec<RoomRequest>,
    pub created_at: DateTime<Utc>,
    pub is_refunded: bool,
    pub damage_total: Money,
    pub cancel_reason: Option<String>,
    pub canceled_by: Option<UserId>,
    pub canceled_at: Option<DateTime<Utc>>,
}

impl Booking {
    pub fn is_owned_by(&self, user_id: Option<UserId>) -> bool {
        matches!((self.user_id, user_id), (Some(owner), Some(actor)) if owner == actor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingItem {
    pub id: BookingItemId,
    pub booking_id: BookingId,
    pub room_id: RoomId,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub room_price: Money,
    pub num_adults: u32,
    pub num_children: u32,
    pub special_requests: Option<String>,
}

impl BookingItem {
    // Stored items always satisfy check_out > check_in.
    pub fn range(&self) -> DateRange {
        DateRange::from_stored(self.check_in, self.check_out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingGuest {
    pub id: BookingGuestId,
    pub booking_item_id: BookingItemId,
    pub guest_name: String,
    pub guest_type: GuestType,
    pub age: Option<u32>,
    pub is_primary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingService {
    pub id: BookingServiceId,
    pub booking_id: BookingId,
    pub booking_item_id: Option<BookingItemId>,
    pub service_id: ServiceId,
    pub quantity: u32,
    pub total_service_price: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDetails {
    pub item: BookingItem,
    pub guests: Vec<BookingGuest>,
}

// Full read model returned by `get_by_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingDetails {
    pub booking: Booking,
    pub items: Vec<ItemDetails>,
    pub services: Vec<BookingService>,
}

impl BookingDetails {
    pub fn room_ids(&self) -> Vec<RoomId> {
        let mut ids: Vec<RoomId> = self.items.iter().map(|detail| detail.item.room_id).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    Staff,
    Admin,
}

// Who is asking. Authentication happens upstream; the core only checks roles and ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: Option<UserId>,
    pub role: Role,
}

impl Actor {
    pub fn customer(user_id: UserId) -> Self {
        Actor {
            user_id: Some(user_id),
            role: Role::Customer,
        }
    }

    pub fn staff(user_id: UserId) -> Self {
        Actor {
            user_id: Some(user_id),
            role: Role::Staff,
        }
    }

    pub fn admin(user_id: UserId) -> Self {
        Actor {
            user_id: Some(user_id),
            role: Role::Admin,
        }
    }

    // The engine itself, e.g. when the payment gateway calls back.
    pub fn system() -> Self {
        Actor {
            user_id: None,
            role: Role::Admin,
        }
    }

    pub fn is_staff(&self) -> bool {
        matches!(self.role, Role::Staff | Role::Admin)
    }
}

// Request payloads
// Required fields are optional here so validation can name every missing one at once.

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBooking {
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,
    pub user_id: Option<UserId>,
    pub total_price: Option<Money>,
    pub payment_status: Option<PaymentStatus>,
    pub payment_method: Option<PaymentMethod>,
    pub booking_method: Option<BookingMethod>,
    pub stay_status: Option<StayStatus>,
    pub discount_code: Option<String>,
    #[serde(default)]
    pub items: Vec<NewBookingItem>,
    #[serde(default)]
    pub rooms_config: Vec<RoomRequest>,
    // Services that apply to the whole booking rather than a single room.
    #[serde(default)]
    pub services: Vec<NewServiceLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBookingItem {
    pub room_id: RoomId,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub num_adults: u32,
    #[serde(default)]
    pub num_children: u32,
    pub special_requests: Option<String>,
    #[serde(default)]
    pub guests: Vec<NewGuest>,
    #[serde(default)]
    pub services: Vec<NewServiceLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewGuest {
    pub guest_name: String,
    pub guest_type: GuestType,
    pub age: Option<u32>,
    #[serde(default)]
    pub is_primary: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewServiceLine {
    pub service_id: ServiceId,
    pub quantity: u32,
}
