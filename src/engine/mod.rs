mod bookings;
mod conflict;
mod error;
mod listings;
mod pricing;
mod queries;
mod reviews;

pub use conflict::propose;
pub use error::EngineError;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::{error, info};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedListingState = Arc<RwLock<ListingState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    /// Events of one request; durable together or not at all.
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL. Appends queued while a flush is in
/// progress are written together and share a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { events, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };

        let mut batch = vec![(events, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { events, response }) => batch.push((events, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, mut batch: Vec<PendingAppend>) {
    let event_count: usize = batch.iter().map(|(events, _)| events.len()).sum();
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(event_count as f64);
    let flush_start = std::time::Instant::now();

    let mark = wal.mark();
    let result = batch
        .iter()
        .flat_map(|(events, _)| events)
        .try_for_each(|event| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    // Every caller of a failed batch is told it failed, so none of its
    // frames may survive on disk.
    if let Err(e) = &result
        && let Err(undo) = wal.rollback(mark)
    {
        error!("WAL rollback after failed commit ({e}) failed: {undo}");
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

pub struct Engine {
    state: DashMap<Ulid, SharedListingState>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: booking/review id → owning listing id.
    entity_to_listing: DashMap<Ulid, Ulid>,
    /// Mutations hold this shared; compaction holds it exclusively so the
    /// snapshot it writes cannot miss an in-flight event.
    gate: RwLock<()>,
}

/// Apply a single-listing event (caller holds the listing's lock).
fn apply_to_listing(ls: &mut ListingState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ListingUpdated {
            name,
            description,
            location,
            price_per_night,
            at,
            ..
        } => {
            ls.name = name.clone();
            ls.description = description.clone();
            ls.location = location.clone();
            ls.price_per_night = *price_per_night;
            ls.updated_at = *at;
        }
        Event::BookingCreated {
            id,
            listing_id,
            stay,
            total_price,
            at,
        } => {
            ls.insert_booking(BookingRecord {
                id: *id,
                stay: *stay,
                total_price: *total_price,
                status: BookingStatus::Pending,
                created_at: *at,
            });
            entity_map.insert(*id, *listing_id);
        }
        Event::BookingUpdated {
            id,
            stay,
            total_price,
            ..
        } => {
            // Re-insert to keep the start-date ordering.
            if let Some(mut record) = ls.remove_booking(*id) {
                record.stay = *stay;
                record.total_price = *total_price;
                ls.insert_booking(record);
            }
        }
        Event::BookingStatusChanged { id, status, .. } => {
            if let Some(record) = ls.booking_mut(*id) {
                record.status = *status;
            }
        }
        Event::BookingDeleted { id, .. } => {
            ls.remove_booking(*id);
            entity_map.remove(id);
        }
        Event::ReviewAdded {
            id,
            listing_id,
            rating,
            comment,
            at,
        } => {
            ls.reviews.push(Review {
                id: *id,
                rating: *rating,
                comment: comment.clone(),
                created_at: *at,
            });
            entity_map.insert(*id, *listing_id);
        }
        Event::ReviewDeleted { id, .. } => {
            ls.remove_review(*id);
            entity_map.remove(id);
        }
        // Listing creation/deletion is handled at the map level.
        Event::ListingCreated { .. } | Event::ListingDeleted { .. } => {}
    }
}

/// Apply a `BookingUpdated` that moves a booking between listings (caller
/// holds both locks).
fn apply_move(
    from: &mut ListingState,
    to: &mut ListingState,
    event: &Event,
    entity_map: &DashMap<Ulid, Ulid>,
) {
    let Event::BookingUpdated {
        id,
        listing_id,
        stay,
        total_price,
        ..
    } = event
    else {
        return;
    };
    if let Some(mut record) = from.remove_booking(*id) {
        record.stay = *stay;
        record.total_price = *total_price;
        to.insert_booking(record);
        entity_map.insert(*id, *listing_id);
    }
}

/// Drop the reverse-index entries of everything a listing owns.
fn unmap_owned(ls: &ListingState, entity_map: &DashMap<Ulid, Ulid>) {
    for b in &ls.bookings {
        entity_map.remove(&b.id);
    }
    for r in &ls.reviews {
        entity_map.remove(&r.id);
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            entity_to_listing: DashMap::new(),
            gate: RwLock::new(()),
        };

        // Rebuild plain state first; nothing is shared until replay is done.
        let mut listings: HashMap<Ulid, ListingState> = HashMap::new();
        for event in &events {
            match event {
                Event::ListingCreated {
                    id,
                    name,
                    description,
                    location,
                    price_per_night,
                    at,
                } => {
                    let ls = ListingState::new(
                        *id,
                        name.clone(),
                        description.clone(),
                        location.clone(),
                        *price_per_night,
                        *at,
                    );
                    listings.insert(*id, ls);
                }
                Event::ListingDeleted { id } => {
                    if let Some(ls) = listings.remove(id) {
                        unmap_owned(&ls, &engine.entity_to_listing);
                    }
                }
                Event::BookingUpdated {
                    listing_id,
                    previous_listing_id,
                    ..
                } if listing_id != previous_listing_id => {
                    let Some(mut from) = listings.remove(previous_listing_id) else {
                        continue;
                    };
                    if let Some(to) = listings.get_mut(listing_id) {
                        apply_move(&mut from, to, event, &engine.entity_to_listing);
                    }
                    listings.insert(*previous_listing_id, from);
                }
                other => {
                    if let Some(ls) = listings.get_mut(&other.listing_id()) {
                        apply_to_listing(ls, other, &engine.entity_to_listing);
                    }
                }
            }
        }

        for (id, ls) in listings {
            engine.state.insert(id, Arc::new(RwLock::new(ls)));
        }
        if !events.is_empty() {
            info!(
                "replayed {} events: {} listings, {} bookings/reviews",
                events.len(),
                engine.state.len(),
                engine.entity_to_listing.len()
            );
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append_all(vec![event.clone()]).await
    }

    /// Write several events as one unit: all become durable or none do.
    pub(super) async fn wal_append_all(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Persistence("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Persistence("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Persistence(e.to_string()))
    }

    pub fn get_listing_state(&self, id: &Ulid) -> Option<SharedListingState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_listing_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_listing.get(entity_id).map(|e| *e.value())
    }

    pub fn listing_count(&self) -> usize {
        self.state.len()
    }

    /// Claim `id` for a new booking or review of `listing_id`. Ids are unique
    /// across listings, bookings and reviews; the claim is atomic, so two
    /// writers racing on one id cannot both pass.
    pub(super) fn reserve_entity(&self, id: Ulid, listing_id: Ulid) -> Result<(), EngineError> {
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        match self.entity_to_listing.entry(id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(listing_id);
                Ok(())
            }
        }
    }

    /// Undo `reserve_entity` for writes that did not go through. Call while
    /// still holding the listing's write lock.
    pub(super) fn release_entities<'a>(&self, ids: impl IntoIterator<Item = &'a Ulid>) {
        for id in ids {
            self.entity_to_listing.remove(id);
        }
    }

    /// WAL-append then apply. State is untouched when the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        ls: &mut ListingState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_listing(ls, event, &self.entity_to_listing);
        Ok(())
    }

    pub(super) async fn persist_and_move(
        &self,
        from: &mut ListingState,
        to: &mut ListingState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_move(from, to, event, &self.entity_to_listing);
        Ok(())
    }

    /// Write-lock the listing a live listing id refers to.
    pub(super) async fn lock_listing(
        &self,
        listing_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ListingState>, EngineError> {
        let ls = self
            .get_listing_state(&listing_id)
            .ok_or(EngineError::ListingNotFound(listing_id))?;
        let guard = ls.write_owned().await;
        if guard.deleted {
            return Err(EngineError::ListingNotFound(listing_id));
        }
        Ok(guard)
    }

    /// Lookup entity → listing, acquire the listing's write lock, and confirm
    /// the entity did not move or vanish while we waited.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: Ulid,
        not_found: fn(Ulid) -> EngineError,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<ListingState>), EngineError> {
        loop {
            let listing_id = self
                .get_listing_for_entity(&entity_id)
                .ok_or_else(|| not_found(entity_id))?;
            let ls = self
                .get_listing_state(&listing_id)
                .ok_or_else(|| not_found(entity_id))?;
            let guard = ls.write_owned().await;
            if !guard.deleted && self.get_listing_for_entity(&entity_id) == Some(listing_id) {
                return Ok((listing_id, guard));
            }
        }
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.gate.write().await;

        let listings: Vec<SharedListingState> =
            self.state.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();
        for ls in listings {
            let guard = ls.read().await;
            if guard.deleted {
                continue;
            }
            snapshot_listing(&guard, &mut events);
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Persistence("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Persistence("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Persistence(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Minimal event sequence that recreates one listing.
fn snapshot_listing(ls: &ListingState, events: &mut Vec<Event>) {
    events.push(Event::ListingCreated {
        id: ls.id,
        name: ls.name.clone(),
        description: ls.description.clone(),
        location: ls.location.clone(),
        price_per_night: ls.price_per_night,
        at: ls.created_at,
    });
    if ls.updated_at != ls.created_at {
        events.push(Event::ListingUpdated {
            id: ls.id,
            name: ls.name.clone(),
            description: ls.description.clone(),
            location: ls.location.clone(),
            price_per_night: ls.price_per_night,
            at: ls.updated_at,
        });
    }
    for b in &ls.bookings {
        events.push(Event::BookingCreated {
            id: b.id,
            listing_id: ls.id,
            stay: b.stay,
            total_price: b.total_price,
            at: b.created_at,
        });
        if b.status != BookingStatus::Pending {
            events.push(Event::BookingStatusChanged {
                id: b.id,
                listing_id: ls.id,
                status: b.status,
            });
        }
    }
    for r in &ls.reviews {
        events.push(Event::ReviewAdded {
            id: r.id,
            listing_id: ls.id,
            rating: r.rating,
            comment: r.comment.clone(),
            at: r.created_at,
        });
    }
}
