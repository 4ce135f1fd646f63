// PostgreSQL booking store
// Rooms and bookings are locked with SELECT ... FOR UPDATE inside the transaction, so two
// writers touching the same room serialize on its row while unrelated rooms proceed in
// parallel. Lock and statement timeouts are set per transaction; hitting either surfaces
// as a retryable concurrency conflict.

use super::{BookingStore, StoreTx};
use crate::config::{DatabaseConfig, EngineConfig};
use crate::error::{BookingError, Result};
use crate::model::{
    Booking, BookingGuest, BookingGuestId, BookingId, BookingItem, BookingItemId, BookingService,
    BookingServiceId, Money, PaymentMethod, Room, RoomId, RoomRequest, RoomStatus, RoomType, RoomTypeId,
    ServiceId, ServiceOffering, UserId,
};
use crate::stay_status::StayStatus;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

// SQLSTATE codes the store translates into domain errors
const LOCK_NOT_AVAILABLE: &str = "55P03";
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const QUERY_CANCELED: &str = "57014";
const FOREIGN_KEY_VIOLATION: &str = "23503";
const UNIQUE_VIOLATION: &str = "23505";
const CHECK_VIOLATION: &str = "23514";

macro_rules! booking_columns {
    () => {
        "id, customer_name, customer_email, customer_phone, user_id, total_price, \
         discount_amount, payment_status, payment_method, booking_method, stay_status, \
         rooms_config, created_at, is_refunded, damage_total, cancel_reason, canceled_by, \
         canceled_at"
    };
}

macro_rules! item_columns {
    () => {
        "id, booking_id, room_id, check_in, check_out, room_price, num_adults, num_children, \
         special_requests"
    };
}

pub(crate) fn map_sqlx(err: sqlx::Error) -> BookingError {
    if let sqlx::Error::Database(db) = &err {
        let message = db.message().to_string();
        return match db.code().as_deref() {
            Some(LOCK_NOT_AVAILABLE | SERIALIZATION_FAILURE | DEADLOCK_DETECTED | QUERY_CANCELED) => {
                BookingError::ConcurrencyConflict(message)
            }
            Some(FOREIGN_KEY_VIOLATION) => {
                BookingError::Validation(format!("referenced record does not exist: {}", message))
            }
            Some(UNIQUE_VIOLATION) => {
                BookingError::Validation(format!("duplicate record: {}", message))
            }
            Some(CHECK_VIOLATION) => {
                BookingError::Validation(format!("value out of range: {}", message))
            }
            _ => BookingError::Storage(err.to_string()),
        };
    }
    match err {
        sqlx::Error::PoolTimedOut => BookingError::ConcurrencyConflict(
            "timed out waiting for a database connection".to_string(),
        ),
        other => BookingError::Storage(other.to_string()),
    }
}

fn violates_foreign_key(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some(FOREIGN_KEY_VIOLATION)
                && db.constraint() == Some(constraint)
        }
        _ => false,
    }
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column).map_err(map_sqlx)
}

fn get_count(row: &PgRow, column: &str) -> Result<u32> {
    let value: i32 = get(row, column)?;
    u32::try_from(value).map_err(|_| {
        BookingError::Storage(format!("column {} holds negative value {}", column, value))
    })
}

fn get_text<T: FromStr<Err = BookingError>>(row: &PgRow, column: &str) -> Result<T> {
    let raw: String = get(row, column)?;
    raw.parse()
        .map_err(|err: BookingError| BookingError::Storage(err.to_string()))
}

fn count_param(value: u32, field: &str) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| BookingError::Validation(format!("{} is too large: {}", field, value)))
}

fn ids<T: Copy>(values: &[T], raw: impl Fn(T) -> i64) -> Vec<i64> {
    values.iter().map(|value| raw(*value)).collect()
}

fn room_from_row(row: &PgRow) -> Result<Room> {
    Ok(Room {
        id: RoomId(get(row, "id")?),
        room_number: get(row, "room_number")?,
        room_type_id: RoomTypeId(get(row, "room_type_id")?),
        status: get_text(row, "status")?,
    })
}

fn booking_from_row(row: &PgRow) -> Result<Booking> {
    let payment_method: Option<String> = get(row, "payment_method")?;
    let Json(rooms_config): Json<Vec<RoomRequest>> = get(row, "rooms_config")?;

    Ok(Booking {
        id: BookingId(get(row, "id")?),
        customer_name: get(row, "customer_name")?,
        customer_email: get(row, "customer_email")?,
        customer_phone: get(row, "customer_phone")?,
        user_id: get::<Option<i64>>(row, "user_id")?.map(UserId),
        total_price: Money::new(get(row, "total_price")?),
        discount_amount: Money::new(get(row, "discount_amount")?),
        payment_status: get_text(row, "payment_status")?,
        payment_method: payment_method
            .as_deref()
            .map(str::parse::<PaymentMethod>)
            .transpose()
            .map_err(|err: BookingError| BookingError::Storage(err.to_string()))?,
        booking_method: get_text(row, "booking_method")?,
        stay_status: StayStatus::from_code(get(row, "stay_status")?)?,
        rooms_config,
        created_at: get(row, "created_at")?,
        is_refunded: get(row, "is_refunded")?,
        damage_total: Money::new(get(row, "damage_total")?),
        cancel_reason: get(row, "cancel_reason")?,
        canceled_by: get::<Option<i64>>(row, "canceled_by")?.map(UserId),
        canceled_at: get(row, "canceled_at")?,
    })
}

fn item_from_row(row: &PgRow) -> Result<BookingItem> {
    Ok(BookingItem {
        id: BookingItemId(get(row, "id")?),
        booking_id: BookingId(get(row, "booking_id")?),
        room_id: RoomId(get(row, "room_id")?),
        check_in: get(row, "check_in")?,
        check_out: get(row, "check_out")?,
        room_price: Money::new(get(row, "room_price")?),
        num_adults: get_count(row, "num_adults")?,
        num_children: get_count(row, "num_children")?,
        special_requests: get(row, "special_requests")?,
    })
}

fn guest_from_row(row: &PgRow) -> Result<BookingGuest> {
    let age: Option<i32> = get(row, "age")?;
    Ok(BookingGuest {
        id: BookingGuestId(get(row, "id")?),
        booking_item_id: BookingItemId(get(row, "booking_item_id")?),
        guest_name: get(row, "guest_name")?,
        guest_type: get_text(row, "guest_type")?,
        age: age.and_then(|value| u32::try_from(value).ok()),
        is_primary: get(row, "is_primary")?,
    })
}

fn service_from_row(row: &PgRow) -> Result<BookingService> {
    Ok(BookingService {
        id: BookingServiceId(get(row, "id")?),
        booking_id: BookingId(get(row, "booking_id")?),
        booking_item_id: get::<Option<i64>>(row, "booking_item_id")?.map(BookingItemId),
        service_id: ServiceId(get(row, "service_id")?),
        quantity: get_count(row, "quantity")?,
        total_service_price: Money::new(get(row, "total_service_price")?),
    })
}

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    lock_timeout_ms: u64,
    statement_timeout_ms: u64,
}

impl PostgresStore {
    pub fn new(pool: PgPool, engine: &EngineConfig) -> Self {
        Self {
            pool,
            lock_timeout_ms: engine.lock_timeout_ms,
            statement_timeout_ms: engine.statement_timeout_ms,
        }
    }

    pub async fn connect(database: &DatabaseConfig, engine: &EngineConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(database.max_connections)
            .min_connections(database.min_connections)
            .acquire_timeout(Duration::from_secs(database.connect_timeout_secs))
            .connect(&database.url)
            .await
            .map_err(map_sqlx)?;

        info!(
            max_connections = database.max_connections,
            lock_timeout_ms = engine.lock_timeout_ms,
            "Connected booking store to PostgreSQL"
        );
        Ok(Self::new(pool, engine))
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| BookingError::Storage(format!("migration failed: {}", err)))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl BookingStore for PostgresStore {
    type Tx = PostgresTx;

    async fn begin(&self) -> Result<PostgresTx> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        sqlx::query(
            "SELECT set_config('lock_timeout', $1, true), set_config('statement_timeout', $2, true)",
        )
        .bind(format!("{}ms", self.lock_timeout_ms))
        .bind(format!("{}ms", self.statement_timeout_ms))
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        Ok(PostgresTx { tx })
    }
}

pub struct PostgresTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PostgresTx {
    async fn lock_rooms(&mut self, room_ids: &[RoomId]) -> Result<Vec<Room>> {
        let rows = sqlx::query(
            "SELECT id, room_number, room_type_id, status FROM rooms \
             WHERE id = ANY($1) ORDER BY id FOR UPDATE",
        )
        .bind(ids(room_ids, RoomId::get))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(room_from_row).collect()
    }

    async fn list_rooms(&mut self) -> Result<Vec<Room>> {
        let rows = sqlx::query("SELECT id, room_number, room_type_id, status FROM rooms ORDER BY id")
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(room_from_row).collect()
    }

    async fn room_type(&mut self, id: RoomTypeId) -> Result<Option<RoomType>> {
        let row = sqlx::query(
            "SELECT id, name, price_per_night, max_adults, max_children, adult_surcharge, \
             child_surcharge FROM room_types WHERE id = $1",
        )
        .bind(id.get())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;

        row.map(|row| -> Result<RoomType> {
            Ok(RoomType {
                id: RoomTypeId(get(&row, "id")?),
                name: get(&row, "name")?,
                price_per_night: Money::new(get(&row, "price_per_night")?),
                max_adults: get_count(&row, "max_adults")?,
                max_children: get_count(&row, "max_children")?,
                adult_surcharge: Money::new(get(&row, "adult_surcharge")?),
                child_surcharge: Money::new(get(&row, "child_surcharge")?),
            })
        })
        .transpose()
    }

    async fn set_room_status(&mut self, room_id: RoomId, status: RoomStatus) -> Result<()> {
        let result = sqlx::query("UPDATE rooms SET status = $2 WHERE id = $1")
            .bind(room_id.get())
            .bind(status.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(BookingError::RoomNotFound(room_id));
        }
        Ok(())
    }

    async fn service(&mut self, id: ServiceId) -> Result<Option<ServiceOffering>> {
        let row = sqlx::query("SELECT id, name, unit_price FROM services WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;

        row.map(|row| -> Result<ServiceOffering> {
            Ok(ServiceOffering {
                id: ServiceId(get(&row, "id")?),
                name: get(&row, "name")?,
                unit_price: Money::new(get(&row, "unit_price")?),
            })
        })
        .transpose()
    }

    async fn active_items_for_room(
        &mut self,
        room_id: RoomId,
        excluding: Option<BookingId>,
    ) -> Result<Vec<BookingItem>> {
        let active: Vec<i16> = StayStatus::ACTIVE.iter().map(|status| status.code()).collect();
        let rows = sqlx::query(
            "SELECT i.id, i.booking_id, i.room_id, i.check_in, i.check_out, i.room_price, \
             i.num_adults, i.num_children, i.special_requests \
             FROM booking_items i JOIN bookings b ON b.id = i.booking_id \
             WHERE i.room_id = $1 AND b.stay_status = ANY($2) \
             AND ($3::BIGINT IS NULL OR b.id <> $3)",
        )
        .bind(room_id.get())
        .bind(active)
        .bind(excluding.map(BookingId::get))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(item_from_row).collect()
    }

    async fn lock_booking(&mut self, id: BookingId) -> Result<Option<Booking>> {
        let row = sqlx::query(concat!(
            "SELECT ",
            booking_columns!(),
            " FROM bookings WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.get())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        row.as_ref().map(booking_from_row).transpose()
    }

    async fn booking(&mut self, id: BookingId) -> Result<Option<Booking>> {
        let row = sqlx::query(concat!(
            "SELECT ",
            booking_columns!(),
            " FROM bookings WHERE id = $1"
        ))
        .bind(id.get())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        row.as_ref().map(booking_from_row).transpose()
    }

    async fn bookings_for_user(&mut self, user_id: UserId) -> Result<Vec<Booking>> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            booking_columns!(),
            " FROM bookings WHERE user_id = $1 ORDER BY created_at DESC, id DESC"
        ))
        .bind(user_id.get())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(booking_from_row).collect()
    }

    async fn item(&mut self, id: BookingItemId) -> Result<Option<BookingItem>> {
        let row = sqlx::query(concat!(
            "SELECT ",
            item_columns!(),
            " FROM booking_items WHERE id = $1"
        ))
        .bind(id.get())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        row.as_ref().map(item_from_row).transpose()
    }

    async fn items_for_booking(&mut self, booking_id: BookingId) -> Result<Vec<BookingItem>> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            item_columns!(),
            " FROM booking_items WHERE booking_id = $1 ORDER BY id"
        ))
        .bind(booking_id.get())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(item_from_row).collect()
    }

    async fn guests_for_items(
        &mut self,
        item_ids: &[BookingItemId],
    ) -> Result<Vec<BookingGuest>> {
        let rows = sqlx::query(
            "SELECT id, booking_item_id, guest_name, guest_type, age, is_primary \
             FROM booking_guests WHERE booking_item_id = ANY($1) ORDER BY id",
        )
        .bind(ids(item_ids, BookingItemId::get))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(guest_from_row).collect()
    }

    async fn services_for_booking(
        &mut self,
        booking_id: BookingId,
    ) -> Result<Vec<BookingService>> {
        let rows = sqlx::query(
            "SELECT id, booking_id, booking_item_id, service_id, quantity, total_service_price \
             FROM booking_services WHERE booking_id = $1 ORDER BY id",
        )
        .bind(booking_id.get())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(service_from_row).collect()
    }

    async fn insert_booking(&mut self, mut booking: Booking) -> Result<Booking> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO bookings (customer_name, customer_email, customer_phone, user_id, \
             total_price, discount_amount, payment_status, payment_method, booking_method, \
             stay_status, rooms_config, created_at, is_refunded, damage_total, cancel_reason, \
             canceled_by, canceled_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17) \
             RETURNING id",
        )
        .bind(&booking.customer_name)
        .bind(&booking.customer_email)
        .bind(&booking.customer_phone)
        .bind(booking.user_id.map(UserId::get))
        .bind(booking.total_price.amount())
        .bind(booking.discount_amount.amount())
        .bind(booking.payment_status.as_str())
        .bind(booking.payment_method.map(|method| method.as_str()))
        .bind(booking.booking_method.as_str())
        .bind(booking.stay_status.code())
        .bind(Json(&booking.rooms_config))
        .bind(booking.created_at)
        .bind(booking.is_refunded)
        .bind(booking.damage_total.amount())
        .bind(&booking.cancel_reason)
        .bind(booking.canceled_by.map(UserId::get))
        .bind(booking.canceled_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;

        booking.id = BookingId(id);
        Ok(booking)
    }

    async fn insert_item(&mut self, mut item: BookingItem) -> Result<BookingItem> {
        let room_id = item.room_id;
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO booking_items (booking_id, room_id, check_in, check_out, room_price, \
             num_adults, num_children, special_requests) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING id",
        )
        .bind(item.booking_id.get())
        .bind(room_id.get())
        .bind(item.check_in)
        .bind(item.check_out)
        .bind(item.room_price.amount())
        .bind(count_param(item.num_adults, "num_adults")?)
        .bind(count_param(item.num_children, "num_children")?)
        .bind(&item.special_requests)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|err| {
            if violates_foreign_key(&err, "booking_items_room_id_fkey") {
                BookingError::RoomNotFound(room_id)
            } else {
                map_sqlx(err)
            }
        })?;

        item.id = BookingItemId(id);
        Ok(item)
    }

    async fn insert_guest(&mut self, mut guest: BookingGuest) -> Result<BookingGuest> {
        let age = guest
            .age
            .map(|age| count_param(age, "age"))
            .transpose()?;
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO booking_guests (booking_item_id, guest_name, guest_type, age, is_primary) \
             VALUES ($1, $2, $3, $4, $5) RETURNING id",
        )
        .bind(guest.booking_item_id.get())
        .bind(&guest.guest_name)
        .bind(guest.guest_type.as_str())
        .bind(age)
        .bind(guest.is_primary)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;

        guest.id = BookingGuestId(id);
        Ok(guest)
    }

    async fn insert_service(&mut self, mut service: BookingService) -> Result<BookingService> {
        let service_id = service.service_id;
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO booking_services (booking_id, booking_item_id, service_id, quantity, \
             total_service_price) VALUES ($1, $2, $3, $4, $5) RETURNING id",
        )
        .bind(service.booking_id.get())
        .bind(service.booking_item_id.map(BookingItemId::get))
        .bind(service_id.get())
        .bind(count_param(service.quantity, "quantity")?)
        .bind(service.total_service_price.amount())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|err| {
            if violates_foreign_key(&err, "booking_services_service_id_fkey") {
                BookingError::ServiceNotFound(service_id)
            } else {
                map_sqlx(err)
            }
        })?;

        service.id = BookingServiceId(id);
        Ok(service)
    }

    async fn update_booking(&mut self, booking: &Booking) -> Result<()> {
        let result = sqlx::query(
            "UPDATE bookings SET customer_name = $2, customer_email = $3, customer_phone = $4, \
             total_price = $5, discount_amount = $6, payment_status = $7, payment_method = $8, \
             stay_status = $9, is_refunded = $10, damage_total = $11, cancel_reason = $12, \
             canceled_by = $13, canceled_at = $14 WHERE id = $1",
        )
        .bind(booking.id.get())
        .bind(&booking.customer_name)
        .bind(&booking.customer_email)
        .bind(&booking.customer_phone)
        .bind(booking.total_price.amount())
        .bind(booking.discount_amount.amount())
        .bind(booking.payment_status.as_str())
        .bind(booking.payment_method.map(|method| method.as_str()))
        .bind(booking.stay_status.code())
        .bind(booking.is_refunded)
        .bind(booking.damage_total.amount())
        .bind(&booking.cancel_reason)
        .bind(booking.canceled_by.map(UserId::get))
        .bind(booking.canceled_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(BookingError::BookingNotFound(booking.id));
        }
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await.map_err(map_sqlx)
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await.map_err(map_sqlx)
    }
}
