use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::now_ms;
use super::listings::validate_text;
use super::{Engine, EngineError};

impl Engine {
    pub async fn add_review(
        &self,
        id: Ulid,
        listing_id: Ulid,
        rating: i64,
        comment: String,
    ) -> Result<ReviewInfo, EngineError> {
        if !(MIN_RATING..=MAX_RATING).contains(&rating) {
            return Err(EngineError::InvalidRating(rating));
        }
        validate_text("comment", &comment, MAX_COMMENT_LEN)?;

        let _shared = self.gate.read().await;
        let mut guard = self.lock_listing(listing_id).await?;
        if guard.reviews.len() >= MAX_REVIEWS_PER_LISTING {
            return Err(EngineError::LimitExceeded("too many reviews on listing"));
        }
        self.reserve_entity(id, listing_id)?;

        let event = Event::ReviewAdded {
            id,
            listing_id,
            rating: rating as u8,
            comment,
            at: now_ms(),
        };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            self.release_entities([&id]);
            return Err(e);
        }
        debug!("review {id} ({rating}/5) on {listing_id}");

        guard
            .reviews
            .iter()
            .find(|r| r.id == id)
            .map(|r| guard.review_info(r))
            .ok_or(EngineError::ReviewNotFound(id))
    }

    pub async fn delete_review(&self, id: Ulid) -> Result<(), EngineError> {
        let _shared = self.gate.read().await;
        let (listing_id, mut guard) = self
            .resolve_entity_write(id, EngineError::ReviewNotFound)
            .await?;
        if !guard.reviews.iter().any(|r| r.id == id) {
            return Err(EngineError::ReviewNotFound(id));
        }
        let event = Event::ReviewDeleted { id, listing_id };
        self.persist_and_apply(&mut guard, &event).await
    }
}
