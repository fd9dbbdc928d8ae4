use std::collections::HashMap;

use chrono::NaiveDate;
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::BOOKING_REJECTIONS_TOTAL;

use super::conflict::{check_batch_disjoint, now_ms, propose};
use super::{apply_to_listing, Engine, EngineError, SharedListingState};

/// Count a rejected booking write by reason and pass the error through.
fn rejected(err: EngineError) -> EngineError {
    metrics::counter!(BOOKING_REJECTIONS_TOTAL, "reason" => err.reason_code()).increment(1);
    debug!("booking rejected: {err}");
    err
}

fn booking_view(ls: &ListingState, id: Ulid) -> Result<BookingInfo, EngineError> {
    ls.booking(id)
        .map(|b| ls.booking_info(b))
        .ok_or(EngineError::BookingNotFound(id))
}

/// Write-lock two distinct listings in id order. Returns `(a, b)` guards in
/// argument order.
async fn lock_pair(
    a: SharedListingState,
    b: SharedListingState,
    a_id: Ulid,
    b_id: Ulid,
) -> (OwnedRwLockWriteGuard<ListingState>, OwnedRwLockWriteGuard<ListingState>) {
    if a_id < b_id {
        let ga = a.write_owned().await;
        let gb = b.write_owned().await;
        (ga, gb)
    } else {
        let gb = b.write_owned().await;
        let ga = a.write_owned().await;
        (ga, gb)
    }
}

impl Engine {
    /// Dry run: what a booking of `[start, end)` would cost right now, or why
    /// it would be rejected. Nothing is written.
    pub async fn propose_booking(
        &self,
        listing_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
        excluding: Option<Ulid>,
    ) -> Result<Quote, EngineError> {
        let ls = self
            .get_listing_state(&listing_id)
            .ok_or(EngineError::ListingNotFound(listing_id))?;
        let guard = ls.read().await;
        propose(&guard, start, end, excluding)
    }

    pub async fn create_booking(
        &self,
        listing_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BookingInfo, EngineError> {
        self.create_booking_with_id(Ulid::new(), listing_id, start, end)
            .await
    }

    /// Validate, price and persist a new pending booking. The listing stays
    /// write-locked from the conflict check until the event is applied.
    pub async fn create_booking_with_id(
        &self,
        id: Ulid,
        listing_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BookingInfo, EngineError> {
        let _shared = self.gate.read().await;
        let mut guard = self.lock_listing(listing_id).await.map_err(rejected)?;
        self.reserve_entity(id, listing_id)?;
        let result = self
            .insert_booking_locked(&mut guard, id, listing_id, start, end)
            .await;
        if result.is_err() {
            self.release_entities([&id]);
        }
        result
    }

    async fn insert_booking_locked(
        &self,
        guard: &mut ListingState,
        id: Ulid,
        listing_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BookingInfo, EngineError> {
        if guard.bookings.len() >= MAX_BOOKINGS_PER_LISTING {
            return Err(rejected(EngineError::LimitExceeded(
                "too many bookings on listing",
            )));
        }

        let quote = propose(guard, start, end, None).map_err(rejected)?;
        let event = Event::BookingCreated {
            id,
            listing_id,
            stay: quote.stay,
            total_price: quote.total_price,
            at: now_ms(),
        };
        self.persist_and_apply(guard, &event).await?;
        debug!(
            "booking {id} on {listing_id}: {} nights, {}",
            quote.nights, quote.total_price
        );
        booking_view(guard, id)
    }

    /// Book several stays at once, possibly across listings. All-or-nothing:
    /// every entry is checked against stored bookings and against the other
    /// entries, and the batch is logged as one unit before anything is
    /// applied.
    pub async fn create_bookings(
        &self,
        bookings: Vec<NewBooking>,
    ) -> Result<Vec<BookingInfo>, EngineError> {
        if bookings.is_empty() {
            return Ok(Vec::new());
        }
        if bookings.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }

        let _shared = self.gate.read().await;

        let mut listing_ids: Vec<Ulid> = bookings.iter().map(|b| b.listing_id).collect();
        listing_ids.sort();
        listing_ids.dedup();

        // Sorted acquisition order; two batches touching the same listings
        // cannot deadlock.
        let mut guards: HashMap<Ulid, OwnedRwLockWriteGuard<ListingState>> = HashMap::new();
        for lid in &listing_ids {
            let guard = self.lock_listing(*lid).await.map_err(rejected)?;
            guards.insert(*lid, guard);
        }

        // Claim every id up front; a repeated id inside the batch fails here too.
        for (n, b) in bookings.iter().enumerate() {
            if let Err(e) = self.reserve_entity(b.id, b.listing_id) {
                self.release_entities(bookings[..n].iter().map(|b| &b.id));
                return Err(e);
            }
        }

        let result = self.insert_bookings_locked(&mut guards, &bookings).await;
        if result.is_err() {
            self.release_entities(bookings.iter().map(|b| &b.id));
        }
        debug!(
            "batch of {} bookings across {} listings: {}",
            bookings.len(),
            listing_ids.len(),
            if result.is_ok() { "committed" } else { "rejected" }
        );
        result
    }

    async fn insert_bookings_locked(
        &self,
        guards: &mut HashMap<Ulid, OwnedRwLockWriteGuard<ListingState>>,
        bookings: &[NewBooking],
    ) -> Result<Vec<BookingInfo>, EngineError> {
        // Phase 1: validate against stored bookings, then within the batch.
        let mut quotes = Vec::with_capacity(bookings.len());
        let mut by_listing: HashMap<Ulid, Vec<(Ulid, Stay)>> = HashMap::new();
        for b in bookings {
            let guard = &guards[&b.listing_id];
            let quote = propose(guard, b.start_date, b.end_date, None).map_err(rejected)?;
            by_listing
                .entry(b.listing_id)
                .or_default()
                .push((b.id, quote.stay));
            quotes.push(quote);
        }
        for (lid, stays) in &by_listing {
            if guards[lid].bookings.len() + stays.len() > MAX_BOOKINGS_PER_LISTING {
                return Err(rejected(EngineError::LimitExceeded(
                    "too many bookings on listing",
                )));
            }
            check_batch_disjoint(stays).map_err(rejected)?;
        }

        // Phase 2: one WAL unit, then apply.
        let at = now_ms();
        let events: Vec<Event> = bookings
            .iter()
            .zip(quotes)
            .map(|(b, quote)| Event::BookingCreated {
                id: b.id,
                listing_id: b.listing_id,
                stay: quote.stay,
                total_price: quote.total_price,
                at,
            })
            .collect();
        self.wal_append_all(events.clone()).await?;

        let mut created = Vec::with_capacity(events.len());
        for event in &events {
            let Some(guard) = guards.get_mut(&event.listing_id()) else {
                return Err(EngineError::ListingNotFound(event.listing_id()));
            };
            apply_to_listing(guard, event, &self.entity_to_listing);
        }
        for b in bookings {
            created.push(booking_view(&guards[&b.listing_id], b.id)?);
        }
        Ok(created)
    }

    /// Change a booking's listing and/or dates. The result is re-validated as
    /// if it were new (excluding the booking itself) and re-priced at the
    /// target listing's current rate. Status is never touched here.
    pub async fn update_booking(
        &self,
        id: Ulid,
        patch: BookingPatch,
    ) -> Result<BookingInfo, EngineError> {
        let _shared = self.gate.read().await;

        loop {
            let current = self
                .get_listing_for_entity(&id)
                .ok_or(EngineError::BookingNotFound(id))?;
            let target = patch.listing_id.unwrap_or(current);
            let src = self
                .get_listing_state(&current)
                .ok_or(EngineError::BookingNotFound(id))?;

            if target == current {
                let mut guard = src.write_owned().await;
                if guard.deleted || self.get_listing_for_entity(&id) != Some(current) {
                    continue;
                }
                let record = guard
                    .booking(id)
                    .cloned()
                    .ok_or(EngineError::BookingNotFound(id))?;
                let start = patch.start_date.unwrap_or(record.stay.start);
                let end = patch.end_date.unwrap_or(record.stay.end);
                let quote = propose(&guard, start, end, Some(id)).map_err(rejected)?;

                let event = Event::BookingUpdated {
                    id,
                    listing_id: current,
                    previous_listing_id: current,
                    stay: quote.stay,
                    total_price: quote.total_price,
                };
                self.persist_and_apply(&mut guard, &event).await?;
                return booking_view(&guard, id);
            }

            let dst = self
                .get_listing_state(&target)
                .ok_or_else(|| rejected(EngineError::ListingNotFound(target)))?;
            let (mut from, mut to) = lock_pair(src, dst, current, target).await;
            if from.deleted || self.get_listing_for_entity(&id) != Some(current) {
                continue;
            }
            if to.deleted {
                return Err(rejected(EngineError::ListingNotFound(target)));
            }
            if to.bookings.len() >= MAX_BOOKINGS_PER_LISTING {
                return Err(rejected(EngineError::LimitExceeded(
                    "too many bookings on listing",
                )));
            }

            let record = from
                .booking(id)
                .cloned()
                .ok_or(EngineError::BookingNotFound(id))?;
            let start = patch.start_date.unwrap_or(record.stay.start);
            let end = patch.end_date.unwrap_or(record.stay.end);
            let quote = propose(&to, start, end, None).map_err(rejected)?;

            let event = Event::BookingUpdated {
                id,
                listing_id: target,
                previous_listing_id: current,
                stay: quote.stay,
                total_price: quote.total_price,
            };
            self.persist_and_move(&mut from, &mut to, &event).await?;
            debug!("booking {id} moved from {current} to {target}");
            return booking_view(&to, id);
        }
    }

    /// Move a booking along its lifecycle: pending → confirmed, and either
    /// active state → canceled. Canceling frees the stay immediately.
    pub async fn set_status(
        &self,
        id: Ulid,
        status: BookingStatus,
    ) -> Result<BookingInfo, EngineError> {
        let _shared = self.gate.read().await;
        let (listing_id, mut guard) = self
            .resolve_entity_write(id, EngineError::BookingNotFound)
            .await?;
        let from = guard
            .booking(id)
            .map(|b| b.status)
            .ok_or(EngineError::BookingNotFound(id))?;
        if !from.can_transition_to(status) {
            return Err(rejected(EngineError::InvalidTransition { from, to: status }));
        }

        let event = Event::BookingStatusChanged {
            id,
            listing_id,
            status,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!("booking {id}: {from} -> {status}");
        booking_view(&guard, id)
    }

    pub async fn confirm_booking(&self, id: Ulid) -> Result<BookingInfo, EngineError> {
        self.set_status(id, BookingStatus::Confirmed).await
    }

    pub async fn cancel_booking(&self, id: Ulid) -> Result<BookingInfo, EngineError> {
        self.set_status(id, BookingStatus::Canceled).await
    }

    pub async fn delete_booking(&self, id: Ulid) -> Result<(), EngineError> {
        let _shared = self.gate.read().await;
        let (listing_id, mut guard) = self
            .resolve_entity_write(id, EngineError::BookingNotFound)
            .await?;
        if guard.booking(id).is_none() {
            return Err(EngineError::BookingNotFound(id));
        }
        let event = Event::BookingDeleted { id, listing_id };
        self.persist_and_apply(&mut guard, &event).await
    }
}
