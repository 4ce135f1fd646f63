// Hotel booking core: reservation lifecycle engine

// Domain model and policies
pub mod availability;
pub mod cancellation;
pub mod error;
pub mod model;
pub mod payment_sync;
pub mod pricing;
pub mod stay_status;

// Coordination and infrastructure
pub mod clock;
pub mod config;
pub mod discount;
pub mod engine;
pub mod logging;
pub mod notifier;
pub mod retry;
pub mod store;

// Re-export key types for convenience
pub use availability::DateRange;
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{ConfigError, DatabaseConfig, EngineConfig};
pub use discount::{DiscountEngine, DiscountKind, DiscountRule, FixedDiscounts, NoDiscount};
pub use engine::BookingEngine;
pub use error::{BookingError, Result};
pub use model::{
    Actor, Booking, BookingDetails, BookingId, BookingItemId, BookingMethod, GuestType, Money,
    NewBooking, NewBookingItem, NewGuest, NewServiceLine, PaymentMethod, PaymentStatus, Role,
    Room, RoomId, RoomStatus, ServiceId, UserId,
};
pub use notifier::{BookingEvent, ChannelNotifier, NoopNotifier, Notifier, NotifyError, WebhookNotifier};
pub use payment_sync::PaymentOutcome;
pub use retry::RetryConfig;
pub use stay_status::{StayAction, StayStatus};
pub use store::{BookingStore, MemoryStore, PostgresStore, StoreTx};
