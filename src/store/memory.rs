// In-memory booking store
// One async mutex guards every table. A transaction holds the guard for its whole
// lifetime and works on a private copy of the tables, which replaces the shared state
// only on commit. That makes transactions fully serialized, which is stricter than the
// per-room locks of the Postgres store but gives the same outcomes for concurrent writers.

use super::{BookingStore, StoreTx};
use crate::error::{BookingError, Result};
use crate::model::{
    Booking, BookingGuest, BookingGuestId, BookingId, BookingItem, BookingItemId, BookingService,
    BookingServiceId, Room, RoomId, RoomStatus, RoomType, RoomTypeId, ServiceId, ServiceOffering,
    UserId,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Default)]
struct Tables {
    rooms: BTreeMap<RoomId, Room>,
    room_types: BTreeMap<RoomTypeId, RoomType>,
    services: BTreeMap<ServiceId, ServiceOffering>,
    bookings: BTreeMap<BookingId, Booking>,
    items: BTreeMap<BookingItemId, BookingItem>,
    guests: BTreeMap<BookingGuestId, BookingGuest>,
    booking_services: BTreeMap<BookingServiceId, BookingService>,
    // Shared sequence for every table; ids start at 1.
    last_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }
}

#[derive(Debug, Default)]
pub struct MemoryStoreStats {
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub lock_timeouts: AtomicUsize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStoreStatsReport {
    pub commits: usize,
    pub rollbacks: usize,
    pub lock_timeouts: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RowCounts {
    pub bookings: usize,
    pub items: usize,
    pub guests: usize,
    pub services: usize,
}

#[derive(Clone)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    lock_timeout: Duration,
    stats: Arc<MemoryStoreStats>,
    fail_next_commit: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            lock_timeout,
            stats: Arc::new(MemoryStoreStats::default()),
            fail_next_commit: Arc::new(AtomicBool::new(false)),
        }
    }

    // Catalog seeding. The booking core never writes these tables itself.

    pub async fn add_room_type(&self, room_type: RoomType) {
        let mut tables = self.tables.lock().await;
        tables.room_types.insert(room_type.id, room_type);
    }

    pub async fn add_room(&self, room: Room) {
        let mut tables = self.tables.lock().await;
        tables.rooms.insert(room.id, room);
    }

    pub async fn add_service(&self, service: ServiceOffering) {
        let mut tables = self.tables.lock().await;
        tables.services.insert(service.id, service);
    }

    pub async fn room(&self, id: RoomId) -> Option<Room> {
        self.tables.lock().await.rooms.get(&id).cloned()
    }

    pub async fn row_counts(&self) -> RowCounts {
        let tables = self.tables.lock().await;
        RowCounts {
            bookings: tables.bookings.len(),
            items: tables.items.len(),
            guests: tables.guests.len(),
            services: tables.booking_services.len(),
        }
    }

    // Makes the next commit fail with a storage error, as a dropped connection would.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub fn stats(&self) -> MemoryStoreStatsReport {
        MemoryStoreStatsReport {
            commits: self.stats.commits.load(Ordering::Relaxed),
            rollbacks: self.stats.rollbacks.load(Ordering::Relaxed),
            lock_timeouts: self.stats.lock_timeouts.load(Ordering::Relaxed),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl BookingStore for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx> {
        let guard = tokio::time::timeout(self.lock_timeout, Arc::clone(&self.tables).lock_owned())
            .await
            .map_err(|_| {
                self.stats.lock_timeouts.fetch_add(1, Ordering::Relaxed);
                BookingError::ConcurrencyConflict(format!(
                    "timed out after {}ms waiting for the store lock",
                    self.lock_timeout.as_millis()
                ))
            })?;
        let work = (*guard).clone();

        Ok(MemoryTx {
            guard,
            work,
            stats: Arc::clone(&self.stats),
            fail_commit: self.fail_next_commit.swap(false, Ordering::SeqCst),
        })
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<Tables>,
    work: Tables,
    stats: Arc<MemoryStoreStats>,
    fail_commit: bool,
}

fn is_active_booking(tables: &Tables, booking_id: BookingId) -> bool {
    tables
        .bookings
        .get(&booking_id)
        .map(|booking| booking.stay_status.is_active())
        .unwrap_or(false)
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn lock_rooms(&mut self, room_ids: &[RoomId]) -> Result<Vec<Room>> {
        let mut ids = room_ids.to_vec();
        ids.sort();
        ids.dedup();
        Ok(ids
            .iter()
            .filter_map(|id| self.work.rooms.get(id).cloned())
            .collect())
    }

    async fn list_rooms(&mut self) -> Result<Vec<Room>> {
        Ok(self.work.rooms.values().cloned().collect())
    }

    async fn room_type(&mut self, id: RoomTypeId) -> Result<Option<RoomType>> {
        Ok(self.work.room_types.get(&id).cloned())
    }

    async fn set_room_status(&mut self, room_id: RoomId, status: RoomStatus) -> Result<()> {
        let room = self
            .work
            .rooms
            .get_mut(&room_id)
            .ok_or(BookingError::RoomNotFound(room_id))?;
        room.status = status;
        Ok(())
    }

    async fn service(&mut self, id: ServiceId) -> Result<Option<ServiceOffering>> {
        Ok(self.work.services.get(&id).cloned())
    }

    async fn active_items_for_room(
        &mut self,
        room_id: RoomId,
        excluding: Option<BookingId>,
    ) -> Result<Vec<BookingItem>> {
        let tables = &self.work;
        Ok(tables
            .items
            .values()
            .filter(|item| item.room_id == room_id)
            .filter(|item| Some(item.booking_id) != excluding)
            .filter(|item| is_active_booking(tables, item.booking_id))
            .cloned()
            .collect())
    }

    async fn lock_booking(&mut self, id: BookingId) -> Result<Option<Booking>> {
        // The store-wide guard already excludes every other writer.
        Ok(self.work.bookings.get(&id).cloned())
    }

    async fn booking(&mut self, id: BookingId) -> Result<Option<Booking>> {
        Ok(self.work.bookings.get(&id).cloned())
    }

    async fn bookings_for_user(&mut self, user_id: UserId) -> Result<Vec<Booking>> {
        let mut bookings: Vec<Booking> = self
            .work
            .bookings
            .values()
            .filter(|booking| booking.user_id == Some(user_id))
            .cloned()
            .collect();
        bookings.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(bookings)
    }

    async fn item(&mut self, id: BookingItemId) -> Result<Option<BookingItem>> {
        Ok(self.work.items.get(&id).cloned())
    }

    async fn items_for_booking(&mut self, booking_id: BookingId) -> Result<Vec<BookingItem>> {
        Ok(self
            .work
            .items
            .values()
            .filter(|item| item.booking_id == booking_id)
            .cloned()
            .collect())
    }

    async fn guests_for_items(
        &mut self,
        item_ids: &[BookingItemId],
    ) -> Result<Vec<BookingGuest>> {
        Ok(self
            .work
            .guests
            .values()
            .filter(|guest| item_ids.contains(&guest.booking_item_id))
            .cloned()
            .collect())
    }

    async fn services_for_booking(
        &mut self,
        booking_id: BookingId,
    ) -> Result<Vec<BookingService>> {
        Ok(self
            .work
            .booking_services
            .values()
            .filter(|service| service.booking_id == booking_id)
            .cloned()
            .collect())
    }

    async fn insert_booking(&mut self, mut booking: Booking) -> Result<Booking> {
        booking.id = BookingId(self.work.next_id());
        self.work.bookings.insert(booking.id, booking.clone());
        Ok(booking)
    }

    async fn insert_item(&mut self, mut item: BookingItem) -> Result<BookingItem> {
        if !self.work.bookings.contains_key(&item.booking_id) {
            return Err(BookingError::BookingNotFound(item.booking_id));
        }
        if !self.work.rooms.contains_key(&item.room_id) {
            return Err(BookingError::RoomNotFound(item.room_id));
        }
        item.id = BookingItemId(self.work.next_id());
        self.work.items.insert(item.id, item.clone());
        Ok(item)
    }

    async fn insert_guest(&mut self, mut guest: BookingGuest) -> Result<BookingGuest> {
        if !self.work.items.contains_key(&guest.booking_item_id) {
            return Err(BookingError::BookingItemNotFound(guest.booking_item_id));
        }
        guest.id = BookingGuestId(self.work.next_id());
        self.work.guests.insert(guest.id, guest.clone());
        Ok(guest)
    }

    async fn insert_service(&mut self, mut service: BookingService) -> Result<BookingService> {
        if !self.work.bookings.contains_key(&service.booking_id) {
            return Err(BookingError::BookingNotFound(service.booking_id));
        }
        if !self.work.services.contains_key(&service.service_id) {
            return Err(BookingError::ServiceNotFound(service.service_id));
        }
        service.id = BookingServiceId(self.work.next_id());
        self.work
            .booking_services
            .insert(service.id, service.clone());
        Ok(service)
    }

    async fn update_booking(&mut self, booking: &Booking) -> Result<()> {
        if booking.total_price.is_negative() {
            return Err(BookingError::Validation(
                "total_price must not be negative".to_string(),
            ));
        }
        match self.work.bookings.get_mut(&booking.id) {
            Some(row) => {
                *row = booking.clone();
                Ok(())
            }
            None => Err(BookingError::BookingNotFound(booking.id)),
        }
    }

    async fn commit(self) -> Result<()> {
        let MemoryTx {
            mut guard,
            work,
            stats,
            fail_commit,
        } = self;
        if fail_commit {
            stats.rollbacks.fetch_add(1, Ordering::Relaxed);
            return Err(BookingError::Storage(
                "connection lost during commit".to_string(),
            ));
        }
        *guard = work;
        stats.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.stats.rollbacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BookingMethod, Money, PaymentStatus};
    use crate::stay_status::StayStatus;
    use chrono::{NaiveDate, Utc};

    fn booking(stay_status: StayStatus) -> Booking {
        Booking {
            id: BookingId(0),
            customer_name: "Tran Thi B".to_string(),
            customer_email: None,
            customer_phone: None,
            user_id: Some(UserId(9)),
            total_price: Money::ZERO,
            discount_amount: Money::ZERO,
            payment_status: PaymentStatus::Unpaid,
            payment_method: None,
            booking_method: BookingMethod::Online,
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

    fn item(booking_id: BookingId) -> BookingItem {
        BookingItem {
            id: BookingItemId(0),
            booking_id,
            room_id: RoomId(101),
            check_in: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            check_out: NaiveDate::from_ymd_opt(2025, 6, 3).unwrap(),
            room_price: Money::new(1_000_000),
            num_adults: 2,
            num_children: 0,
            special_requests: None,
        }
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new(Duration::from_millis(50));
        store
            .add_room(Room {
                id: RoomId(101),
                room_number: "101".to_string(),
                room_type_id: RoomTypeId(1),
                status: RoomStatus::Available,
            })
            .await;
        store
    }

    #[tokio::test]
    async fn test_writes_are_invisible_until_commit() {
        let store = seeded().await;

        let mut tx = store.begin().await.unwrap();
        let created = tx.insert_booking(booking(StayStatus::Pending)).await.unwrap();
        assert_eq!(created.id, BookingId(1));
        tx.rollback().await.unwrap();
        assert_eq!(store.row_counts().await.bookings, 0);

        let mut tx = store.begin().await.unwrap();
        tx.insert_booking(booking(StayStatus::Pending)).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.row_counts().await.bookings, 1);
        assert_eq!(
            store.stats(),
            MemoryStoreStatsReport {
                commits: 1,
                rollbacks: 1,
                lock_timeouts: 0
            }
        );
    }

    #[tokio::test]
    async fn test_second_writer_times_out_while_first_holds_the_lock() {
        let store = seeded().await;
        let _held = store.begin().await.unwrap();

        let result = store.begin().await;
        assert!(matches!(result, Err(BookingError::ConcurrencyConflict(_))));
        assert_eq!(store.stats().lock_timeouts, 1);
    }

    #[tokio::test]
    async fn test_active_items_skip_finalized_and_excluded_bookings() {
        let store = seeded().await;
        let mut tx = store.begin().await.unwrap();

        let live = tx.insert_booking(booking(StayStatus::Reserved)).await.unwrap();
        let gone = tx.insert_booking(booking(StayStatus::Canceled)).await.unwrap();
        tx.insert_item(item(live.id)).await.unwrap();
        tx.insert_item(item(gone.id)).await.unwrap();

        let active = tx.active_items_for_room(RoomId(101), None).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].booking_id, live.id);

        let excluded = tx
            .active_items_for_room(RoomId(101), Some(live.id))
            .await
            .unwrap();
        assert!(excluded.is_empty());
    }

    #[tokio::test]
    async fn test_injected_commit_failure_discards_writes() {
        let store = seeded().await;
        store.fail_next_commit();

        let mut tx = store.begin().await.unwrap();
        tx.insert_booking(booking(StayStatus::Pending)).await.unwrap();
        assert!(matches!(tx.commit().await, Err(BookingError::Storage(_))));
        assert_eq!(store.row_counts().await.bookings, 0);
    }
}
