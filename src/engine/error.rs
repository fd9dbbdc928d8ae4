use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{BookingStatus, Money};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("listing not found: {0}")]
    ListingNotFound(Ulid),
    #[error("booking not found: {0}")]
    BookingNotFound(Ulid),
    #[error("review not found: {0}")]
    ReviewNotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("end_date {end} must be after start_date {start}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },
    #[error("[{stay_start}, {stay_end}) overlaps active booking {conflicting}")]
    DateConflict {
        conflicting: Ulid,
        stay_start: NaiveDate,
        stay_end: NaiveDate,
    },
    #[error("cannot move booking from {from} to {to}")]
    InvalidTransition { from: BookingStatus, to: BookingStatus },
    #[error("rating must be between 1 and 5, got {0}")]
    InvalidRating(i64),
    #[error("price_per_night must be greater than zero with at most two decimals, got {0}")]
    InvalidPrice(Money),
    #[error("{field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl EngineError {
    /// Stable machine-readable reason code surfaced to clients.
    pub fn reason_code(&self) -> &'static str {
        match self {
            EngineError::ListingNotFound(_) => "ListingNotFound",
            EngineError::BookingNotFound(_) => "BookingNotFound",
            EngineError::ReviewNotFound(_) => "ReviewNotFound",
            EngineError::AlreadyExists(_) => "AlreadyExists",
            EngineError::InvalidRange { .. } => "InvalidRange",
            EngineError::DateConflict { .. } => "DateConflict",
            EngineError::InvalidTransition { .. } => "InvalidTransition",
            EngineError::InvalidRating(_) => "InvalidRating",
            EngineError::InvalidPrice(_) => "InvalidPrice",
            EngineError::InvalidField { .. } => "InvalidField",
            EngineError::LimitExceeded(_) => "LimitExceeded",
            EngineError::Persistence(_) => "PersistenceError",
        }
    }

    /// The input field(s) that triggered the rejection, if any.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            EngineError::ListingNotFound(_) => Some("listing_id"),
            EngineError::InvalidRange { .. } => Some("end_date"),
            EngineError::DateConflict { .. } => Some("start_date,end_date"),
            EngineError::InvalidTransition { .. } => Some("status"),
            EngineError::InvalidRating(_) => Some("rating"),
            EngineError::InvalidPrice(_) => Some("price_per_night"),
            EngineError::InvalidField { field, .. } => Some(*field),
            _ => None,
        }
    }
}
