// Runs the engine against a real PostgreSQL database.
// cargo test --test postgres_store -- --ignored   (requires DATABASE_URL)

use chrono::NaiveDate;
use hotel_booking_core::{
    Actor, BookingEngine, BookingError, BookingMethod, DatabaseConfig, EngineConfig, Money,
    NewBooking, NewBookingItem, PaymentStatus, PostgresStore, RoomId, ServiceId, StayAction,
    StayStatus, UserId,
};
use rand::Rng;

struct Catalog {
    room: RoomId,
    service: ServiceId,
}

async fn connect() -> anyhow::Result<PostgresStore> {
    let config = EngineConfig::default();
    let store = PostgresStore::connect(&DatabaseConfig::from_env()?, &config).await?;
    store.migrate().await?;
    Ok(store)
}

// Fresh catalog rows per test so runs never collide on room numbers.
async fn seed(store: &PostgresStore) -> anyhow::Result<Catalog> {
    let suffix: u32 = rand::thread_rng().gen();
    let room_type: i64 = sqlx::query_scalar(
        "INSERT INTO room_types (name, price_per_night, max_adults, max_children, adult_surcharge, child_surcharge)
         VALUES ('Deluxe Double', 800000, 2, 1, 200000, 100000) RETURNING id",
    )
    .fetch_one(store.pool())
    .await?;
    let room: i64 = sqlx::query_scalar(
        "INSERT INTO rooms (room_number, room_type_id) VALUES ($1, $2) RETURNING id",
    )
    .bind(format!("T-{}", suffix))
    .bind(room_type)
    .fetch_one(store.pool())
    .await?;
    let service: i64 = sqlx::query_scalar(
        "INSERT INTO services (name, unit_price) VALUES ('Airport pickup', 50000) RETURNING id",
    )
    .fetch_one(store.pool())
    .await?;

    Ok(Catalog {
        room: RoomId(room),
        service: ServiceId(service),
    })
}

fn booking(room: RoomId, check_in: &str, check_out: &str) -> NewBooking {
    NewBooking {
        customer_name: Some("Vo Thi G".to_string()),
        user_id: Some(UserId(42)),
        total_price: Some(Money::new(1_600_000)),
        payment_status: Some(PaymentStatus::Unpaid),
        booking_method: Some(BookingMethod::Offline),
        stay_status: Some(StayStatus::Reserved),
        items: vec![NewBookingItem {
            room_id: room,
            check_in: check_in.parse::<NaiveDate>().unwrap(),
            check_out: check_out.parse::<NaiveDate>().unwrap(),
            num_adults: 2,
            num_children: 0,
            special_requests: None,
            guests: Vec::new(),
            services: Vec::new(),
        }],
        ..NewBooking::default()
    }
}

#[tokio::test]
#[ignore]
async fn test_postgres_lifecycle_round_trip() -> anyhow::Result<()> {
    let store = connect().await?;
    let catalog = seed(&store).await?;
    let engine = BookingEngine::new(store, EngineConfig::default());
    let staff = Actor::staff(UserId(1));

    let created = engine
        .create_booking(booking(catalog.room, "2030-06-01", "2030-06-03"))
        .await?;
    assert_eq!(created.booking.total_price, Money::new(1_600_000));

    let err = engine
        .create_booking(booking(catalog.room, "2030-06-02", "2030-06-04"))
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::RoomConflict { .. }));

    let id = created.booking.id;
    engine.transition(id, StayAction::CheckIn, staff).await?;
    let with_service = engine
        .add_service(created.items[0].item.id, catalog.service, 2)
        .await?;
    assert_eq!(with_service.booking.total_price, Money::new(1_700_000));

    let fetched = engine.get_by_id(id).await?;
    assert_eq!(fetched.booking.stay_status, StayStatus::CheckedIn);
    assert_eq!(fetched.services.len(), 1);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_postgres_unknown_room_rolls_back() -> anyhow::Result<()> {
    let store = connect().await?;
    let catalog = seed(&store).await?;
    let engine = BookingEngine::new(store, EngineConfig::default());

    let mut payload = booking(catalog.room, "2030-07-01", "2030-07-03");
    payload.items.push(NewBookingItem {
        room_id: RoomId(i64::MAX),
        ..payload.items[0].clone()
    });
    let err = engine.create_booking(payload).await.unwrap_err();
    assert_eq!(err, BookingError::RoomNotFound(RoomId(i64::MAX)));

    let items: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM booking_items WHERE room_id = $1")
        .bind(catalog.room.get())
        .fetch_one(engine.store().pool())
        .await?;
    assert_eq!(items, 0);
    Ok(())
}
