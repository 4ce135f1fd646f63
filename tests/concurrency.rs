use chrono::NaiveDate;
use futures::future::join_all;
use hotel_booking_core::model::{RoomType, RoomTypeId};
use hotel_booking_core::{
    Actor, BookingEngine, BookingError, BookingMethod, EngineConfig, MemoryStore, Money,
    NewBooking, NewBookingItem, PaymentStatus, RetryConfig, Room, RoomId, RoomStatus,
    StayAction, StayStatus, UserId,
};
use std::sync::Arc;
use std::time::Duration;

async fn engine_with_rooms(lock_timeout: Duration, retry: RetryConfig) -> Arc<BookingEngine<MemoryStore>> {
    let store = MemoryStore::new(lock_timeout);
    store
        .add_room_type(RoomType {
            id: RoomTypeId(1),
            name: "Standard Twin".to_string(),
            price_per_night: Money::new(600_000),
            max_adults: 2,
            max_children: 0,
            adult_surcharge: Money::new(150_000),
            child_surcharge: Money::ZERO,
        })
        .await;
    for id in [201, 202] {
        store
            .add_room(Room {
                id: RoomId(id),
                room_number: id.to_string(),
                room_type_id: RoomTypeId(1),
                status: RoomStatus::Available,
            })
            .await;
    }

    let config = EngineConfig {
        retry,
        ..EngineConfig::default()
    };
    Arc::new(BookingEngine::new(store, config))
}

fn booking_for(user: i64, room: i64, check_in: &str, check_out: &str) -> NewBooking {
    NewBooking {
        customer_name: Some(format!("Guest {}", user)),
        user_id: Some(UserId(user)),
        total_price: Some(Money::new(1_200_000)),
        payment_status: Some(PaymentStatus::Unpaid),
        booking_method: Some(BookingMethod::Online),
        stay_status: Some(StayStatus::Pending),
        items: vec![NewBookingItem {
            room_id: RoomId(room),
            check_in: check_in.parse::<NaiveDate>().unwrap(),
            check_out: check_out.parse::<NaiveDate>().unwrap(),
            num_adults: 1,
            num_children: 0,
            special_requests: None,
            guests: Vec::new(),
            services: Vec::new(),
        }],
        ..NewBooking::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_for_one_room_yield_exactly_one_booking() {
    let engine = engine_with_rooms(Duration::from_secs(5), RetryConfig::default()).await;

    let attempts = (0..8).map(|user| {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .create_booking(booking_for(user, 201, "2025-09-01", "2025-09-03"))
                .await
        })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let winners = results.iter().filter(|result| result.is_ok()).count();
    assert_eq!(winners, 1);
    for result in results.iter().filter(|result| result.is_err()) {
        assert!(matches!(
            result,
            Err(BookingError::RoomConflict { room_id: RoomId(201), .. })
        ));
    }
    assert_eq!(engine.store().row_counts().await.bookings, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transitions_on_one_booking_serialize() {
    let engine = engine_with_rooms(Duration::from_secs(5), RetryConfig::default()).await;
    let created = engine
        .create_booking(booking_for(1, 202, "2025-09-01", "2025-09-03"))
        .await
        .unwrap();
    let id = created.booking.id;
    let staff = Actor::staff(UserId(99));

    let approvals = (0..4).map(|_| {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.transition(id, StayAction::Approve, staff).await })
    });
    let results: Vec<_> = join_all(approvals)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|result| result.as_ref().err())
        .all(|err| matches!(err, BookingError::InvalidTransition(_))));
}

#[tokio::test]
async fn test_lock_timeout_surfaces_as_retryable_conflict() {
    let engine = engine_with_rooms(Duration::from_millis(20), RetryConfig::disabled()).await;

    // An open transaction holds the store lock for as long as it lives.
    let held = hotel_booking_core::BookingStore::begin(engine.store())
        .await
        .unwrap();
    let err = engine
        .create_booking(booking_for(1, 201, "2025-09-01", "2025-09-03"))
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::ConcurrencyConflict(_)));
    assert!(err.is_retryable());
    drop(held);

    assert!(engine
        .create_booking(booking_for(1, 201, "2025-09-01", "2025-09-03"))
        .await
        .is_ok());
    assert_eq!(engine.store().stats().lock_timeouts, 1);
}
