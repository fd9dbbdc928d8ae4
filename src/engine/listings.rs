use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::now_ms;
use super::pricing::validate_price;
use super::{unmap_owned, Engine, EngineError, SharedListingState};

/// Required text: non-blank and at most `max` characters.
pub(super) fn validate_text(field: &'static str, value: &str, max: usize) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::InvalidField {
            field,
            reason: "must not be blank",
        });
    }
    if value.chars().count() > max {
        return Err(EngineError::InvalidField {
            field,
            reason: "too long",
        });
    }
    Ok(())
}

impl Engine {
    pub async fn create_listing(&self, id: Ulid, listing: NewListing) -> Result<ListingInfo, EngineError> {
        validate_text("name", &listing.name, MAX_NAME_LEN)?;
        validate_text("description", &listing.description, MAX_DESCRIPTION_LEN)?;
        validate_text("location", &listing.location, MAX_LOCATION_LEN)?;
        validate_price(listing.price_per_night)?;

        let _shared = self.gate.read().await;
        if self.state.len() >= MAX_LISTINGS {
            return Err(EngineError::LimitExceeded("too many listings"));
        }

        let at = now_ms();
        let event = Event::ListingCreated {
            id,
            name: listing.name.clone(),
            description: listing.description.clone(),
            location: listing.location.clone(),
            price_per_night: listing.price_per_night,
            at,
        };
        let ls = ListingState::new(
            id,
            listing.name,
            listing.description,
            listing.location,
            listing.price_per_night,
            at,
        );
        let info = ls.info();

        // Publish the listing write-locked so the id is claimed atomically
        // and nobody sees it before the event is durable.
        let shared: SharedListingState = Arc::new(RwLock::new(ls));
        let mut guard = shared.clone().write_owned().await;
        match self.state.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(shared);
            }
        }
        if self.entity_to_listing.contains_key(&id) {
            guard.deleted = true;
            self.state.remove(&id);
            return Err(EngineError::AlreadyExists(id));
        }
        if let Err(e) = self.wal_append(&event).await {
            guard.deleted = true;
            self.state.remove(&id);
            return Err(e);
        }

        info!("listing {id} created at {}/night", info.price_per_night);
        Ok(info)
    }

    /// Merge `patch` over the listing and bump `updated_at`. Existing
    /// bookings keep the price they were written with.
    pub async fn update_listing(&self, id: Ulid, patch: ListingPatch) -> Result<ListingInfo, EngineError> {
        if let Some(name) = &patch.name {
            validate_text("name", name, MAX_NAME_LEN)?;
        }
        if let Some(description) = &patch.description {
            validate_text("description", description, MAX_DESCRIPTION_LEN)?;
        }
        if let Some(location) = &patch.location {
            validate_text("location", location, MAX_LOCATION_LEN)?;
        }
        if let Some(price) = patch.price_per_night {
            validate_price(price)?;
        }

        let _shared = self.gate.read().await;
        let mut guard = self.lock_listing(id).await?;

        let event = Event::ListingUpdated {
            id,
            name: patch.name.unwrap_or_else(|| guard.name.clone()),
            description: patch.description.unwrap_or_else(|| guard.description.clone()),
            location: patch.location.unwrap_or_else(|| guard.location.clone()),
            price_per_night: patch.price_per_night.unwrap_or(guard.price_per_night),
            at: now_ms().max(guard.updated_at),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!("listing {id} updated");
        Ok(guard.info())
    }

    /// Delete a listing together with its bookings and reviews.
    pub async fn delete_listing(&self, id: Ulid) -> Result<(), EngineError> {
        let _shared = self.gate.read().await;
        let mut guard = self.lock_listing(id).await?;

        let event = Event::ListingDeleted { id };
        self.wal_append(&event).await?;

        guard.deleted = true;
        unmap_owned(&guard, &self.entity_to_listing);
        self.state.remove(&id);
        info!(
            "listing {id} deleted with {} bookings and {} reviews",
            guard.bookings.len(),
            guard.reviews.len()
        );
        Ok(())
    }

    pub async fn get_listing(&self, id: Ulid) -> Result<ListingInfo, EngineError> {
        let ls = self
            .get_listing_state(&id)
            .ok_or(EngineError::ListingNotFound(id))?;
        let guard = ls.read().await;
        if guard.deleted {
            return Err(EngineError::ListingNotFound(id));
        }
        Ok(guard.info())
    }

    /// Current nightly price.
    pub async fn price(&self, id: Ulid) -> Result<Money, EngineError> {
        self.get_listing(id).await.map(|l| l.price_per_night)
    }

    /// All listings, newest first.
    pub async fn list_listings(&self) -> Vec<ListingInfo> {
        let listings: Vec<SharedListingState> =
            self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(listings.len());
        for ls in listings {
            let guard = ls.read().await;
            if !guard.deleted {
                out.push(guard.info());
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        out
    }

    /// Listing with its booking count and bookings (by start date).
    pub async fn listing_detail(&self, id: Ulid) -> Result<ListingDetail, EngineError> {
        let ls = self
            .get_listing_state(&id)
            .ok_or(EngineError::ListingNotFound(id))?;
        let guard = ls.read().await;
        if guard.deleted {
            return Err(EngineError::ListingNotFound(id));
        }
        Ok(ListingDetail {
            listing: guard.info(),
            bookings: guard.bookings.iter().map(|b| guard.booking_info(b)).collect(),
        })
    }
}
