// Booking Transaction Coordinator
// Every operation opens one store transaction, runs the policy checks, writes the
// booking, its children and the room-status projection, recomputes the total, and
// commits. Any error rolls the whole transaction back. Conflicts on locks are retried
// with backoff; events go out only after a successful commit.

use crate::availability::{self, DateRange};
use crate::cancellation;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::discount::{DiscountEngine, NoDiscount};
use crate::error::{BookingError, Result};
use crate::model::{
    Actor, Booking, BookingDetails, BookingGuest, BookingGuestId, BookingId, BookingItem,
    BookingItemId, BookingService, BookingServiceId, Money, NewBooking, NewGuest, NewServiceLine,
    PaymentMethod, PaymentStatus, Room, RoomId, RoomStatus, RoomType, RoomTypeId, ServiceId,
    UserId,
};
use crate::notifier::{BookingEvent, NoopNotifier, Notifier, WebhookNotifier};
use crate::payment_sync::{self, PaymentOutcome};
use crate::pricing;
use crate::retry::retry_on_conflict;
use crate::stay_status::{RoomProjection, StayAction, StayStatus};
use crate::store::{load_details, BookingStore, StoreTx};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

// A create request that passed every check that needs no storage access.
#[derive(Debug, Clone)]
struct CreatePlan {
    booking: Booking,
    quoted_total: Money,
    discount_code: Option<String>,
    items: Vec<PlannedItem>,
    services: Vec<NewServiceLine>,
}

#[derive(Debug, Clone)]
struct PlannedItem {
    room_id: RoomId,
    range: DateRange,
    num_adults: u32,
    num_children: u32,
    special_requests: Option<String>,
    guests: Vec<NewGuest>,
    services: Vec<NewServiceLine>,
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn ensure_quantity(line: &NewServiceLine) -> Result<()> {
    if line.quantity == 0 {
        return Err(BookingError::Validation(format!(
            "quantity for service {} must be at least 1",
            line.service_id
        )));
    }
    Ok(())
}

// At most one primary guest per room; with none flagged the first guest becomes primary.
fn normalize_guests(room_id: RoomId, mut guests: Vec<NewGuest>) -> Result<Vec<NewGuest>> {
    if guests.iter().any(|guest| guest.guest_name.trim().is_empty()) {
        return Err(BookingError::Validation(format!(
            "every guest of room {} needs a name",
            room_id
        )));
    }
    match guests.iter().filter(|guest| guest.is_primary).count() {
        0 => {
            if let Some(first) = guests.first_mut() {
                first.is_primary = true;
            }
        }
        1 => {}
        _ => {
            return Err(BookingError::Validation(format!(
                "room {} has more than one primary guest",
                room_id
            )))
        }
    }
    Ok(guests)
}

fn plan_booking(payload: NewBooking, now: DateTime<Utc>) -> Result<CreatePlan> {
    let customer_name = non_blank(&payload.customer_name);

    let mut missing = Vec::new();
    if customer_name.is_none() {
        missing.push("customer_name");
    }
    if payload.total_price.is_none() {
        missing.push("total_price");
    }
    if payload.payment_status.is_none() {
        missing.push("payment_status");
    }
    if payload.booking_method.is_none() {
        missing.push("booking_method");
    }
    if payload.stay_status.is_none() {
        missing.push("stay_status");
    }
    if payload.items.is_empty() && payload.rooms_config.is_empty() {
        missing.push("items or rooms_config");
    }

    let (
        Some(customer_name),
        Some(quoted_total),
        Some(payment_status),
        Some(booking_method),
        Some(stay_status),
    ) = (
        customer_name,
        payload.total_price,
        payload.payment_status,
        payload.booking_method,
        payload.stay_status,
    )
    else {
        return Err(BookingError::missing_fields(&missing));
    };
    if !missing.is_empty() {
        return Err(BookingError::missing_fields(&missing));
    }

    if quoted_total.is_negative() {
        return Err(BookingError::Validation(
            "total_price must not be negative".to_string(),
        ));
    }
    if !matches!(stay_status, StayStatus::Pending | StayStatus::Reserved) {
        return Err(BookingError::Validation(format!(
            "a new booking must start pending or reserved, not {}",
            stay_status
        )));
    }
    if matches!(
        payment_status,
        PaymentStatus::Failed | PaymentStatus::Refunded
    ) {
        return Err(BookingError::Validation(format!(
            "a new booking cannot start with payment {}",
            payment_status
        )));
    }
    if let Some(request) = payload.rooms_config.iter().find(|r| r.quantity == 0) {
        return Err(BookingError::Validation(format!(
            "rooms_config quantity for room type {} must be at least 1",
            request.room_type_id
        )));
    }
    for line in &payload.services {
        ensure_quantity(line)?;
    }

    let mut items = Vec::with_capacity(payload.items.len());
    for item in payload.items {
        let range = DateRange::new(item.check_in, item.check_out)?;
        if item.num_adults == 0 {
            return Err(BookingError::Validation(format!(
                "room {} needs at least one adult",
                item.room_id
            )));
        }
        for line in &item.services {
            ensure_quantity(line)?;
        }
        items.push(PlannedItem {
            room_id: item.room_id,
            range,
            num_adults: item.num_adults,
            num_children: item.num_children,
            special_requests: non_blank(&item.special_requests),
            guests: normalize_guests(item.room_id, item.guests)?,
            services: item.services,
        });
    }
    let requested: Vec<(RoomId, DateRange)> =
        items.iter().map(|item| (item.room_id, item.range)).collect();
    availability::ensure_no_overlap_within_request(&requested)?;

    let mut booking = Booking {
        id: BookingId::default(),
        customer_name,
        customer_email: non_blank(&payload.customer_email),
        customer_phone: non_blank(&payload.customer_phone),
        user_id: payload.user_id,
        total_price: Money::ZERO,
        discount_amount: Money::ZERO,
        payment_status,
        payment_method: payload.payment_method,
        booking_method,
        stay_status,
        rooms_config: payload.rooms_config,
        created_at: now,
        is_refunded: false,
        damage_total: Money::ZERO,
        cancel_reason: None,
        canceled_by: None,
        canceled_at: None,
    };
    // Entering a booking directly as reserved counts as approving it.
    if stay_status == StayStatus::Reserved {
        payment_sync::on_approval(&mut booking);
    }

    Ok(CreatePlan {
        booking,
        quoted_total,
        discount_code: non_blank(&payload.discount_code),
        items,
        services: payload.services,
    })
}

// Recompute-and-persist: the stored total always reflects the stored rows.
async fn persist_total<T: StoreTx>(tx: &mut T, booking: &mut Booking) -> Result<()> {
    let items = tx.items_for_booking(booking.id).await?;
    let services = tx.services_for_booking(booking.id).await?;
    booking.total_price = pricing::recompute_total(booking, &items, &services)?;
    tx.update_booking(booking).await
}

async fn lock_existing<T: StoreTx>(tx: &mut T, id: BookingId) -> Result<Booking> {
    tx.lock_booking(id)
        .await?
        .ok_or(BookingError::BookingNotFound(id))
}

async fn price_service_line<T: StoreTx>(tx: &mut T, line: &NewServiceLine) -> Result<Money> {
    let offering = tx
        .service(line.service_id)
        .await?
        .ok_or(BookingError::ServiceNotFound(line.service_id))?;
    pricing::service_total(offering.unit_price, line.quantity)
}

async fn insert_service_line<T: StoreTx>(
    tx: &mut T,
    booking_id: BookingId,
    booking_item_id: Option<BookingItemId>,
    line: &NewServiceLine,
) -> Result<BookingService> {
    let total_service_price = price_service_line(tx, line).await?;
    tx.insert_service(BookingService {
        id: BookingServiceId::default(),
        booking_id,
        booking_item_id,
        service_id: line.service_id,
        quantity: line.quantity,
        total_service_price,
    })
    .await
}

fn change_events(before: &Booking, after: &Booking, at: DateTime<Utc>) -> Vec<BookingEvent> {
    let mut events = Vec::new();
    if before.stay_status != after.stay_status {
        events.push(BookingEvent::StatusChanged {
            booking_id: after.id,
            from: before.stay_status,
            to: after.stay_status,
            at,
        });
    }
    if before.payment_status != after.payment_status {
        events.push(BookingEvent::PaymentChanged {
            booking_id: after.id,
            from: before.payment_status,
            to: after.payment_status,
        });
    }
    events
}

// Storage details are logged here and replaced by a generic error for the caller.
fn surface(err: BookingError, operation: &'static str, booking_id: Option<BookingId>) -> BookingError {
    let booking_id = booking_id.map(BookingId::get);
    if err.is_internal() {
        error!(operation, ?booking_id, error = %err, "Booking operation failed, rolled back");
        BookingError::Internal(format!("{} failed", operation))
    } else {
        debug!(operation, ?booking_id, error = %err, "Booking operation rejected");
        err
    }
}

async fn finish<T: StoreTx, V>(
    tx: T,
    result: Result<V>,
    operation: &'static str,
    booking_id: Option<BookingId>,
) -> Result<V> {
    match result {
        Ok(value) => match tx.commit().await {
            Ok(()) => Ok(value),
            Err(err) => Err(surface(err, operation, booking_id)),
        },
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(operation, error = %rollback_err, "Rollback failed");
            }
            Err(surface(err, operation, booking_id))
        }
    }
}

pub struct BookingEngine<S: BookingStore> {
    store: S,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    discounts: Arc<dyn DiscountEngine>,
}

impl<S: BookingStore> BookingEngine<S> {
    // Engine on the system clock. Events go to the configured webhook, if any.
    pub fn new(store: S, config: EngineConfig) -> Self {
        let notifier: Arc<dyn Notifier> = match &config.notification_webhook_url {
            Some(url) => match WebhookNotifier::new(url.clone(), WEBHOOK_TIMEOUT) {
                Ok(webhook) => Arc::new(webhook),
                Err(err) => {
                    warn!(error = %err, "Webhook notifier unavailable, notifications disabled");
                    Arc::new(NoopNotifier)
                }
            },
            None => Arc::new(NoopNotifier),
        };

        Self {
            store,
            config,
            clock: Arc::new(SystemClock),
            notifier,
            discounts: Arc::new(NoDiscount),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_discount_engine(mut self, discounts: Arc<dyn DiscountEngine>) -> Self {
        self.discounts = discounts;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn publish(&self, events: Vec<BookingEvent>) {
        for event in events {
            let notifier = Arc::clone(&self.notifier);
            tokio::spawn(async move {
                if let Err(err) = notifier.notify(&event).await {
                    warn!(
                        booking_id = %event.booking_id(),
                        event = event.name(),
                        error = %err,
                        "Notification delivery failed"
                    );
                }
            });
        }
    }

    // Booking creation

    #[tracing::instrument(skip(self, payload), fields(customer = ?payload.customer_name))]
    pub async fn create_booking(&self, payload: NewBooking) -> Result<BookingDetails> {
        let plan = plan_booking(payload, self.clock.now())?;
        let plan = &plan;
        let details = retry_on_conflict(&self.config.retry, "create_booking", || {
            self.try_create(plan)
        })
        .await?;

        if details.booking.total_price != plan.quoted_total {
            debug!(
                booking_id = %details.booking.id,
                quoted = %plan.quoted_total,
                computed = %details.booking.total_price,
                "Quoted total differs from computed total"
            );
        }
        info!(
            booking_id = %details.booking.id,
            rooms = details.items.len(),
            total = %details.booking.total_price,
            stay_status = %details.booking.stay_status,
            "Booking created"
        );

        self.publish(vec![BookingEvent::Created {
            booking_id: details.booking.id,
            customer_name: details.booking.customer_name.clone(),
            customer_email: details.booking.customer_email.clone(),
            stay_status: details.booking.stay_status,
            total_price: details.booking.total_price,
            room_ids: details.room_ids(),
        }]);
        Ok(details)
    }

    async fn try_create(&self, plan: &CreatePlan) -> Result<BookingDetails> {
        let mut tx = self.store.begin().await?;
        let result = self.create_in(&mut tx, plan).await;
        finish(tx, result, "create_booking", None).await
    }

    async fn create_in(&self, tx: &mut S::Tx, plan: &CreatePlan) -> Result<BookingDetails> {
        let room_ids: Vec<RoomId> = plan.items.iter().map(|item| item.room_id).collect();
        let rooms: HashMap<RoomId, Room> = tx
            .lock_rooms(&room_ids)
            .await?
            .into_iter()
            .map(|room| (room.id, room))
            .collect();

        let mut room_types: HashMap<RoomTypeId, RoomType> = HashMap::new();
        let mut prices = Vec::with_capacity(plan.items.len());
        for item in &plan.items {
            let room = rooms
                .get(&item.room_id)
                .ok_or(BookingError::RoomNotFound(item.room_id))?;
            // Overlap is reported before the coarse room status so a double booking
            // always surfaces as a conflict.
            if !availability::is_room_free(tx, room.id, &item.range, None).await? {
                return Err(availability::conflict_error(room.id, &item.range));
            }
            availability::ensure_room_status_available(room.id, room.status)?;

            if !room_types.contains_key(&room.room_type_id) {
                let room_type = tx.room_type(room.room_type_id).await?.ok_or_else(|| {
                    BookingError::Internal(format!(
                        "room {} references missing room type {}",
                        room.id, room.room_type_id
                    ))
                })?;
                room_types.insert(room.room_type_id, room_type);
            }
            let room_type = room_types.get(&room.room_type_id).ok_or_else(|| {
                BookingError::Internal(format!("room type {} not loaded", room.room_type_id))
            })?;
            let quote =
                pricing::quote_item(room_type, &item.range, item.num_adults, item.num_children)?;
            prices.push(quote.total);
        }

        let mut service_prices = Vec::new();
        for line in plan
            .items
            .iter()
            .flat_map(|item| &item.services)
            .chain(&plan.services)
        {
            service_prices.push(price_service_line(tx, line).await?);
        }
        let subtotal = pricing::booking_total(
            prices.iter().copied(),
            service_prices,
            Money::ZERO,
            Money::ZERO,
        )?;

        // Discounts are judged on catalog prices, never on the client's quote.
        let mut new_booking = plan.booking.clone();
        if let Some(code) = &plan.discount_code {
            let discount = self.discounts.validate(code, subtotal).await?;
            new_booking.discount_amount = discount.min(subtotal).max(Money::ZERO);
        }

        let mut booking = tx.insert_booking(new_booking).await?;

        for (item, room_price) in plan.items.iter().zip(prices) {
            let stored = tx
                .insert_item(BookingItem {
                    id: BookingItemId::default(),
                    booking_id: booking.id,
                    room_id: item.room_id,
                    check_in: item.range.check_in(),
                    check_out: item.range.check_out(),
                    room_price,
                    num_adults: item.num_adults,
                    num_children: item.num_children,
                    special_requests: item.special_requests.clone(),
                })
                .await?;

            for guest in &item.guests {
                tx.insert_guest(BookingGuest {
                    id: BookingGuestId::default(),
                    booking_item_id: stored.id,
                    guest_name: guest.guest_name.trim().to_string(),
                    guest_type: guest.guest_type,
                    age: guest.age,
                    is_primary: guest.is_primary,
                })
                .await?;
            }
            for line in &item.services {
                insert_service_line(tx, booking.id, Some(stored.id), line).await?;
            }
        }
        for line in &plan.services {
            insert_service_line(tx, booking.id, None, line).await?;
        }

        persist_total(tx, &mut booking).await?;
        RoomProjection::for_stay(booking.stay_status, room_ids)
            .apply(tx)
            .await?;

        load_details(tx, booking).await
    }

    // Reads

    #[tracing::instrument(skip(self))]
    pub async fn get_by_id(&self, id: BookingId) -> Result<BookingDetails> {
        let mut tx = self.store.begin().await?;
        let result = match tx.booking(id).await {
            Ok(Some(booking)) => load_details(&mut tx, booking).await,
            Ok(None) => Err(BookingError::BookingNotFound(id)),
            Err(err) => Err(err),
        };
        finish(tx, result, "get_by_id", Some(id)).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Booking>> {
        let mut tx = self.store.begin().await?;
        let result = tx.bookings_for_user(user_id).await;
        finish(tx, result, "list_for_user", None).await
    }

    // Rooms that are administratively available and have no active booking
    // overlapping `[check_in, check_out)`.
    #[tracing::instrument(skip(self))]
    pub async fn available_rooms(
        &self,
        check_in: NaiveDate,
        check_out: NaiveDate,
    ) -> Result<Vec<Room>> {
        let range = DateRange::new(check_in, check_out)?;
        let mut tx = self.store.begin().await?;
        let result = Self::free_rooms_in(&mut tx, &range).await;
        finish(tx, result, "available_rooms", None).await
    }

    async fn free_rooms_in(tx: &mut S::Tx, range: &DateRange) -> Result<Vec<Room>> {
        let mut free = Vec::new();
        for room in tx.list_rooms().await? {
            if room.status == RoomStatus::Available
                && availability::is_room_free(tx, room.id, range, None).await?
            {
                free.push(room);
            }
        }
        Ok(free)
    }

    // Stay transitions

    // Applies a stay action. Cancel goes through the cancellation policy; the
    // other actions are front-desk operations and need a staff actor.
    #[tracing::instrument(skip(self), fields(action = action.name()))]
    pub async fn transition(
        &self,
        id: BookingId,
        action: StayAction,
        actor: Actor,
    ) -> Result<Booking> {
        if action.requires_staff() && !actor.is_staff() {
            return Err(BookingError::Forbidden(format!(
                "only staff can {} a booking",
                action.name()
            )));
        }
        match action {
            StayAction::Cancel { reason } => self.cancel_booking(id, actor, &reason).await,
            StayAction::MarkNoShow => self.mark_no_show(id).await,
            action => {
                let action = &action;
                let (booking, events) =
                    retry_on_conflict(&self.config.retry, "transition", || {
                        self.try_transition(id, action)
                    })
                    .await?;
                info!(booking_id = %id, stay_status = %booking.stay_status, "Stay status changed");
                self.publish(events);
                Ok(booking)
            }
        }
    }

    async fn try_transition(
        &self,
        id: BookingId,
        action: &StayAction,
    ) -> Result<(Booking, Vec<BookingEvent>)> {
        let mut tx = self.store.begin().await?;
        let result = self.transition_in(&mut tx, id, action).await;
        finish(tx, result, "transition", Some(id)).await
    }

    async fn transition_in(
        &self,
        tx: &mut S::Tx,
        id: BookingId,
        action: &StayAction,
    ) -> Result<(Booking, Vec<BookingEvent>)> {
        let before = lock_existing(tx, id).await?;
        let mut booking = before.clone();
        booking.stay_status = before.stay_status.apply(action)?;
        if *action == StayAction::Approve {
            payment_sync::on_approval(&mut booking);
        }

        self.write_transition(tx, &mut booking).await?;
        let events = change_events(&before, &booking, self.clock.now());
        Ok((booking, events))
    }

    // Persists a booking whose stay status just changed and moves its rooms along.
    async fn write_transition(&self, tx: &mut S::Tx, booking: &mut Booking) -> Result<()> {
        persist_total(tx, booking).await?;
        let items = tx.items_for_booking(booking.id).await?;
        RoomProjection::for_stay(booking.stay_status, items.iter().map(|item| item.room_id))
            .apply(tx)
            .await
    }

    #[tracing::instrument(skip(self, reason))]
    pub async fn cancel_booking(
        &self,
        id: BookingId,
        actor: Actor,
        reason: &str,
    ) -> Result<Booking> {
        let (booking, events) = retry_on_conflict(&self.config.retry, "cancel_booking", || {
            self.try_cancel(id, actor, reason)
        })
        .await?;
        info!(booking_id = %id, by = ?actor.user_id.map(UserId::get), "Booking canceled");
        self.publish(events);
        Ok(booking)
    }

    async fn try_cancel(
        &self,
        id: BookingId,
        actor: Actor,
        reason: &str,
    ) -> Result<(Booking, Vec<BookingEvent>)> {
        let mut tx = self.store.begin().await?;
        let result = self.cancel_in(&mut tx, id, actor, reason).await;
        finish(tx, result, "cancel_booking", Some(id)).await
    }

    async fn cancel_in(
        &self,
        tx: &mut S::Tx,
        id: BookingId,
        actor: Actor,
        reason: &str,
    ) -> Result<(Booking, Vec<BookingEvent>)> {
        let before = lock_existing(tx, id).await?;
        let items = tx.items_for_booking(id).await?;
        let now = self.clock.now();
        cancellation::authorize_cancel(&before, &items, &actor, now, &self.config)?;

        let mut booking = before.clone();
        cancellation::apply_cancellation(&mut booking, &actor, reason, now)?;
        self.write_transition(tx, &mut booking).await?;
        Ok((booking.clone(), change_events(&before, &booking, now)))
    }

    #[tracing::instrument(skip(self))]
    pub async fn mark_no_show(&self, id: BookingId) -> Result<Booking> {
        let (booking, events) = retry_on_conflict(&self.config.retry, "mark_no_show", || {
            self.try_no_show(id)
        })
        .await?;
        info!(booking_id = %id, "Booking marked as no-show");
        self.publish(events);
        Ok(booking)
    }

    async fn try_no_show(&self, id: BookingId) -> Result<(Booking, Vec<BookingEvent>)> {
        let mut tx = self.store.begin().await?;
        let result = self.no_show_in(&mut tx, id).await;
        finish(tx, result, "mark_no_show", Some(id)).await
    }

    async fn no_show_in(
        &self,
        tx: &mut S::Tx,
        id: BookingId,
    ) -> Result<(Booking, Vec<BookingEvent>)> {
        let before = lock_existing(tx, id).await?;
        let items = tx.items_for_booking(id).await?;
        let now = self.clock.now();
        cancellation::authorize_no_show(&before, &items, now, &self.config)?;

        let mut booking = before.clone();
        cancellation::apply_no_show(&mut booking, now)?;
        self.write_transition(tx, &mut booking).await?;
        Ok((booking.clone(), change_events(&before, &booking, now)))
    }

    // Housekeeping hand-off after checkout: rooms still in `checkout` move to `cleaning`.
    #[tracing::instrument(skip(self))]
    pub async fn confirm_checkout(&self, id: BookingId, actor: Actor) -> Result<Vec<RoomId>> {
        if !actor.is_staff() {
            return Err(BookingError::Forbidden(
                "only staff can confirm a checkout".to_string(),
            ));
        }
        let moved = retry_on_conflict(&self.config.retry, "confirm_checkout", || {
            self.try_confirm_checkout(id)
        })
        .await?;
        info!(booking_id = %id, rooms = moved.len(), "Rooms handed to housekeeping");
        Ok(moved)
    }

    async fn try_confirm_checkout(&self, id: BookingId) -> Result<Vec<RoomId>> {
        let mut tx = self.store.begin().await?;
        let result = Self::confirm_checkout_in(&mut tx, id).await;
        finish(tx, result, "confirm_checkout", Some(id)).await
    }

    async fn confirm_checkout_in(tx: &mut S::Tx, id: BookingId) -> Result<Vec<RoomId>> {
        let booking = lock_existing(tx, id).await?;
        if booking.stay_status != StayStatus::CheckedOut {
            return Err(BookingError::InvalidTransition(format!(
                "cannot confirm checkout of a {} booking",
                booking.stay_status
            )));
        }
        let room_ids: Vec<RoomId> = tx
            .items_for_booking(id)
            .await?
            .iter()
            .map(|item| item.room_id)
            .collect();
        let waiting: Vec<RoomId> = tx
            .lock_rooms(&room_ids)
            .await?
            .into_iter()
            .filter(|room| room.status == RoomStatus::Checkout)
            .map(|room| room.id)
            .collect();

        RoomProjection::cleaning(waiting.iter().copied())
            .apply(tx)
            .await?;
        Ok(waiting)
    }

    // Services and charges

    // Adds a service to one room of an active booking and updates the total.
    #[tracing::instrument(skip(self))]
    pub async fn add_service(
        &self,
        booking_item_id: BookingItemId,
        service_id: ServiceId,
        quantity: u32,
    ) -> Result<BookingDetails> {
        let line = NewServiceLine {
            service_id,
            quantity,
        };
        ensure_quantity(&line)?;

        let line = &line;
        let (details, event) = retry_on_conflict(&self.config.retry, "add_service", || {
            self.try_add_service(booking_item_id, line)
        })
        .await?;
        info!(
            booking_id = %details.booking.id,
            service_id = %service_id,
            total = %details.booking.total_price,
            "Service added"
        );
        self.publish(vec![event]);
        Ok(details)
    }

    async fn try_add_service(
        &self,
        booking_item_id: BookingItemId,
        line: &NewServiceLine,
    ) -> Result<(BookingDetails, BookingEvent)> {
        let mut tx = self.store.begin().await?;
        let result = Self::add_service_in(&mut tx, booking_item_id, line).await;
        let booking_id = result.as_ref().ok().map(|(details, _)| details.booking.id);
        finish(tx, result, "add_service", booking_id).await
    }

    async fn add_service_in(
        tx: &mut S::Tx,
        booking_item_id: BookingItemId,
        line: &NewServiceLine,
    ) -> Result<(BookingDetails, BookingEvent)> {
        let item = tx
            .item(booking_item_id)
            .await?
            .ok_or(BookingError::BookingItemNotFound(booking_item_id))?;
        let mut booking = lock_existing(tx, item.booking_id).await?;
        if booking.stay_status.is_finalized() {
            return Err(BookingError::AlreadyFinalized(booking.id));
        }

        let service = insert_service_line(tx, booking.id, Some(item.id), line).await?;
        persist_total(tx, &mut booking).await?;

        let event = BookingEvent::ServiceAdded {
            booking_id: booking.id,
            service_id: service.service_id,
            quantity: service.quantity,
            total_price: booking.total_price,
        };
        Ok((load_details(tx, booking).await?, event))
    }

    // Records the assessed damage charge of a stay. The amount replaces any earlier one.
    #[tracing::instrument(skip(self))]
    pub async fn record_damage(&self, id: BookingId, amount: Money, actor: Actor) -> Result<Booking> {
        if !actor.is_staff() {
            return Err(BookingError::Forbidden(
                "only staff can record damage".to_string(),
            ));
        }
        if amount.is_negative() {
            return Err(BookingError::Validation(
                "damage amount must not be negative".to_string(),
            ));
        }
        let booking = retry_on_conflict(&self.config.retry, "record_damage", || {
            self.try_record_damage(id, amount)
        })
        .await?;
        info!(booking_id = %id, damage = %amount, total = %booking.total_price, "Damage recorded");
        Ok(booking)
    }

    async fn try_record_damage(&self, id: BookingId, amount: Money) -> Result<Booking> {
        let mut tx = self.store.begin().await?;
        let result = Self::record_damage_in(&mut tx, id, amount).await;
        finish(tx, result, "record_damage", Some(id)).await
    }

    async fn record_damage_in(tx: &mut S::Tx, id: BookingId, amount: Money) -> Result<Booking> {
        let mut booking = lock_existing(tx, id).await?;
        if !matches!(
            booking.stay_status,
            StayStatus::CheckedIn | StayStatus::CheckedOut
        ) {
            return Err(BookingError::InvalidTransition(format!(
                "damage can only be recorded during or after a stay, not for a {} booking",
                booking.stay_status
            )));
        }
        booking.damage_total = amount;
        persist_total(tx, &mut booking).await?;
        Ok(booking)
    }

    // Payment

    #[tracing::instrument(skip(self))]
    pub async fn set_payment_status(
        &self,
        id: BookingId,
        status: PaymentStatus,
        method: Option<PaymentMethod>,
        actor: Actor,
    ) -> Result<Booking> {
        if !actor.is_staff() {
            return Err(BookingError::Forbidden(
                "only staff can edit payment status".to_string(),
            ));
        }
        self.update_payment("set_payment_status", id, |booking| {
            payment_sync::operator_update(booking, status, method)
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn apply_payment_callback(
        &self,
        id: BookingId,
        outcome: PaymentOutcome,
    ) -> Result<Booking> {
        self.update_payment("apply_payment_callback", id, |booking| {
            payment_sync::gateway_callback(booking, outcome)
        })
        .await
    }

    async fn update_payment<F>(
        &self,
        operation: &'static str,
        id: BookingId,
        update: F,
    ) -> Result<Booking>
    where
        F: Fn(&mut Booking) -> Result<PaymentStatus> + Send + Sync,
    {
        let update = &update;
        let (booking, events) = retry_on_conflict(&self.config.retry, operation, || {
            self.try_update_payment(operation, id, update)
        })
        .await?;
        info!(booking_id = %id, payment_status = %booking.payment_status, "Payment status updated");
        self.publish(events);
        Ok(booking)
    }

    async fn try_update_payment<F>(
        &self,
        operation: &'static str,
        id: BookingId,
        update: &F,
    ) -> Result<(Booking, Vec<BookingEvent>)>
    where
        F: Fn(&mut Booking) -> Result<PaymentStatus> + Send + Sync,
    {
        let mut tx = self.store.begin().await?;
        let result = self.update_payment_in(&mut tx, id, update).await;
        finish(tx, result, operation, Some(id)).await
    }

    async fn update_payment_in<F>(
        &self,
        tx: &mut S::Tx,
        id: BookingId,
        update: &F,
    ) -> Result<(Booking, Vec<BookingEvent>)>
    where
        F: Fn(&mut Booking) -> Result<PaymentStatus> + Send + Sync,
    {
        let before = lock_existing(tx, id).await?;
        let mut booking = before.clone();
        update(&mut booking)?;
        persist_total(tx, &mut booking).await?;
        let events = change_events(&before, &booking, self.clock.now());
        Ok((booking, events))
    }
}
