// Persistence seam
// The engine only talks to storage through an open transaction. Everything one
// booking operation reads or writes happens on a single `StoreTx`, which is either
// committed as a whole or rolled back as a whole.

use crate::error::Result;
use crate::model::{
    Booking, BookingDetails, BookingGuest, BookingId, BookingItem, BookingItemId, BookingService,
    ItemDetails, Room, RoomId, RoomStatus, RoomType, RoomTypeId, ServiceId, ServiceOffering,
    UserId,
};
use async_trait::async_trait;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

#[async_trait]
pub trait BookingStore: Send + Sync + 'static {
    type Tx: StoreTx;

    // Opens a transaction. Waiting for locks is bounded by the store's lock timeout;
    // running out of it yields `BookingError::ConcurrencyConflict`.
    async fn begin(&self) -> Result<Self::Tx>;
}

// One unit of work. Dropping a transaction without committing discards its writes.
#[async_trait]
pub trait StoreTx: Send {
    // Rooms are locked in ascending id order so two writers never wait on each other
    // in opposite orders. Unknown ids are absent from the result.
    async fn lock_rooms(&mut self, room_ids: &[RoomId]) -> Result<Vec<Room>>;
    async fn list_rooms(&mut self) -> Result<Vec<Room>>;
    async fn room_type(&mut self, id: RoomTypeId) -> Result<Option<RoomType>>;
    async fn set_room_status(&mut self, room_id: RoomId, status: RoomStatus) -> Result<()>;
    async fn service(&mut self, id: ServiceId) -> Result<Option<ServiceOffering>>;

    // Items on `room_id` whose booking is pending, reserved or checked in.
    async fn active_items_for_room(
        &mut self,
        room_id: RoomId,
        excluding: Option<BookingId>,
    ) -> Result<Vec<BookingItem>>;

    // Reads the booking and holds its row lock until commit/rollback.
    async fn lock_booking(&mut self, id: BookingId) -> Result<Option<Booking>>;
    async fn booking(&mut self, id: BookingId) -> Result<Option<Booking>>;
    async fn bookings_for_user(&mut self, user_id: UserId) -> Result<Vec<Booking>>;
    async fn item(&mut self, id: BookingItemId) -> Result<Option<BookingItem>>;
    async fn items_for_booking(&mut self, booking_id: BookingId) -> Result<Vec<BookingItem>>;
    async fn guests_for_items(&mut self, item_ids: &[BookingItemId])
        -> Result<Vec<BookingGuest>>;
    async fn services_for_booking(&mut self, booking_id: BookingId)
        -> Result<Vec<BookingService>>;

    // Inserts ignore the incoming id and return the row with the id the store assigned.
    async fn insert_booking(&mut self, booking: Booking) -> Result<Booking>;
    async fn insert_item(&mut self, item: BookingItem) -> Result<BookingItem>;
    async fn insert_guest(&mut self, guest: BookingGuest) -> Result<BookingGuest>;
    async fn insert_service(&mut self, service: BookingService) -> Result<BookingService>;
    async fn update_booking(&mut self, booking: &Booking) -> Result<()>;

    async fn commit(self) -> Result<()>;
    async fn rollback(self) -> Result<()>;
}

// Assembles the full read model of `booking` from the open transaction.
pub async fn load_details<T: StoreTx>(tx: &mut T, booking: Booking) -> Result<BookingDetails> {
    let items = tx.items_for_booking(booking.id).await?;
    let item_ids: Vec<BookingItemId> = items.iter().map(|item| item.id).collect();
    let mut guests = tx.guests_for_items(&item_ids).await?;
    let services = tx.services_for_booking(booking.id).await?;

    let items = items
        .into_iter()
        .map(|item| {
            let (own, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut guests)
                .into_iter()
                .partition(|guest| guest.booking_item_id == item.id);
            guests = rest;
            ItemDetails { item, guests: own }
        })
        .collect();

    Ok(BookingDetails {
        booking,
        items,
        services,
    })
}
