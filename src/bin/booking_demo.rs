// Walks one booking through its lifecycle against the in-memory store.
// Set DATABASE_URL to run the same flow against PostgreSQL instead.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use hotel_booking_core::logging::init_tracing;
use hotel_booking_core::model::{RoomType, RoomTypeId, ServiceOffering};
use hotel_booking_core::{
    Actor, BookingEngine, BookingMethod, BookingStore, DatabaseConfig, EngineConfig, FixedClock,
    GuestType, MemoryStore, Money, NewBooking, NewBookingItem, NewGuest, PaymentMethod,
    PaymentStatus, PostgresStore, Room, RoomId, RoomStatus, ServiceId, StayAction, StayStatus,
    UserId,
};
use std::sync::Arc;
use tracing::info;

fn parse_date(value: &str) -> Result<NaiveDate> {
    value
        .parse()
        .with_context(|| format!("invalid date literal {}", value))
}

fn parse_instant(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("invalid instant literal {}", value))?
        .with_timezone(&Utc))
}

async fn seed_catalog(store: &MemoryStore) {
    store
        .add_room_type(RoomType {
            id: RoomTypeId(1),
            name: "Deluxe Double".to_string(),
            price_per_night: Money::new(800_000),
            max_adults: 2,
            max_children: 1,
            adult_surcharge: Money::new(200_000),
            child_surcharge: Money::new(100_000),
        })
        .await;
    for (id, number) in [(101, "101"), (102, "102")] {
        store
            .add_room(Room {
                id: RoomId(id),
                room_number: number.to_string(),
                room_type_id: RoomTypeId(1),
                status: RoomStatus::Available,
            })
            .await;
    }
    store
        .add_service(ServiceOffering {
            id: ServiceId(5),
            name: "Airport pickup".to_string(),
            unit_price: Money::new(50_000),
        })
        .await;
}

async fn run_lifecycle<S: BookingStore>(engine: &BookingEngine<S>, clock: &FixedClock) -> Result<()> {
    let front_desk = Actor::staff(UserId(1));
    let details = engine
        .create_booking(NewBooking {
            customer_name: Some("Nguyen Van A".to_string()),
            customer_email: Some("a@example.com".to_string()),
            user_id: Some(UserId(42)),
            total_price: Some(Money::new(1_600_000)),
            payment_status: Some(PaymentStatus::Pending),
            payment_method: Some(PaymentMethod::Cash),
            booking_method: Some(BookingMethod::Online),
            stay_status: Some(StayStatus::Pending),
            items: vec![NewBookingItem {
                room_id: RoomId(101),
                check_in: parse_date("2025-06-01")?,
                check_out: parse_date("2025-06-03")?,
                num_adults: 2,
                num_children: 0,
                special_requests: Some("High floor".to_string()),
                guests: vec![NewGuest {
                    guest_name: "Nguyen Van A".to_string(),
                    guest_type: GuestType::Adult,
                    age: None,
                    is_primary: true,
                }],
                services: Vec::new(),
            }],
            ..NewBooking::default()
        })
        .await?;
    let booking_id = details.booking.id;
    let item_id = details.items[0].item.id;
    info!(booking_id = %booking_id, total = %details.booking.total_price, "Created");

    let approved = engine
        .transition(booking_id, StayAction::Approve, front_desk)
        .await?;
    info!(payment_status = %approved.payment_status, "Approved");

    clock.set(parse_instant("2025-06-01T12:30:00Z")?);
    engine
        .transition(booking_id, StayAction::CheckIn, front_desk)
        .await?;

    let with_service = engine.add_service(item_id, ServiceId(5), 2).await?;
    info!(total = %with_service.booking.total_price, "Airport pickup added");

    clock.advance(Duration::days(2));
    engine
        .transition(booking_id, StayAction::CheckOut, front_desk)
        .await?;
    let cleaned = engine.confirm_checkout(booking_id, front_desk).await?;
    info!(rooms = ?cleaned, "Rooms sent to housekeeping");

    let finished = engine.get_by_id(booking_id).await?;
    println!("{}", serde_json::to_string_pretty(&finished)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("hotel_booking_core=info,booking_demo=info");

    let config = EngineConfig::from_env().context("loading engine configuration")?;
    config.validate().context("validating engine configuration")?;
    let clock = Arc::new(FixedClock::new(parse_instant("2025-05-20T09:00:00Z")?));

    if std::env::var("DATABASE_URL").is_ok() {
        let database = DatabaseConfig::from_env().context("loading database configuration")?;
        let store = PostgresStore::connect(&database, &config)
            .await
            .context("connecting to PostgreSQL")?;
        store.migrate().await.context("running migrations")?;
        info!("Running against PostgreSQL; the catalog must already hold rooms 101/102 and service 5");
        let engine = BookingEngine::new(store, config).with_clock(clock.clone());
        return run_lifecycle(&engine, &clock).await;
    }

    let store = MemoryStore::new(config.lock_timeout());
    seed_catalog(&store).await;
    let engine = BookingEngine::new(store, config).with_clock(clock.clone());
    run_lifecycle(&engine, &clock).await?;

    let stats = engine.store().stats();
    info!(commits = stats.commits, rollbacks = stats.rollbacks, "In-memory store summary");
    Ok(())
}
