use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, SharedListingState};

impl Engine {
    pub async fn get_booking(&self, id: Ulid) -> Result<BookingInfo, EngineError> {
        let listing_id = self
            .get_listing_for_entity(&id)
            .ok_or(EngineError::BookingNotFound(id))?;
        let ls = self
            .get_listing_state(&listing_id)
            .ok_or(EngineError::BookingNotFound(id))?;
        let guard = ls.read().await;
        guard
            .booking(id)
            .map(|b| guard.booking_info(b))
            .ok_or(EngineError::BookingNotFound(id))
    }

    /// Every booking on every listing, newest first.
    pub async fn list_bookings(&self) -> Vec<BookingInfo> {
        let listings: Vec<SharedListingState> =
            self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for ls in listings {
            let guard = ls.read().await;
            if guard.deleted {
                continue;
            }
            out.extend(guard.bookings.iter().map(|b| guard.booking_info(b)));
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        out
    }

    /// Bookings of one listing ordered by start date. An empty `statuses`
    /// slice means any status.
    pub async fn bookings_for_listing(
        &self,
        listing_id: Ulid,
        statuses: &[BookingStatus],
    ) -> Result<Vec<BookingInfo>, EngineError> {
        let ls = self
            .get_listing_state(&listing_id)
            .ok_or(EngineError::ListingNotFound(listing_id))?;
        let guard = ls.read().await;
        if guard.deleted {
            return Err(EngineError::ListingNotFound(listing_id));
        }
        Ok(guard
            .bookings
            .iter()
            .filter(|b| statuses.is_empty() || statuses.contains(&b.status))
            .map(|b| guard.booking_info(b))
            .collect())
    }

    /// Reviews of one listing, newest first.
    pub async fn get_reviews(&self, listing_id: Ulid) -> Result<Vec<ReviewInfo>, EngineError> {
        let ls = self
            .get_listing_state(&listing_id)
            .ok_or(EngineError::ListingNotFound(listing_id))?;
        let guard = ls.read().await;
        if guard.deleted {
            return Err(EngineError::ListingNotFound(listing_id));
        }
        let mut out: Vec<ReviewInfo> = guard.reviews.iter().map(|r| guard.review_info(r)).collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(out)
    }

    pub async fn get_review(&self, id: Ulid) -> Result<ReviewInfo, EngineError> {
        let listing_id = self
            .get_listing_for_entity(&id)
            .ok_or(EngineError::ReviewNotFound(id))?;
        let ls = self
            .get_listing_state(&listing_id)
            .ok_or(EngineError::ReviewNotFound(id))?;
        let guard = ls.read().await;
        guard
            .reviews
            .iter()
            .find(|r| r.id == id)
            .map(|r| guard.review_info(r))
            .ok_or(EngineError::ReviewNotFound(id))
    }
}
