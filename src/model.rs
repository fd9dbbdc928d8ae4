use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ulid::Ulid;

use crate::limits::MONEY_SCALE;

/// Unix milliseconds. Used for `created_at` / `updated_at` stamps.
pub type Ms = i64;

/// Half-open stay `[start, end)` in calendar days. `end` is the checkout day
/// and is not a booked night, so back-to-back stays do not overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stay {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Stay {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start < end, "Stay start must be before end");
        Self { start, end }
    }

    /// Number of booked nights (whole days between check-in and checkout).
    pub fn nights(&self) -> i64 {
        self.end.signed_duration_since(self.start).num_days()
    }

    pub fn overlaps(&self, other: &Stay) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Fixed-point money amount. Persisted as integer cents, displayed with
/// exactly two fraction digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Money(Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    pub fn from_cents(cents: i64) -> Self {
        Self(Decimal::new(cents, MONEY_SCALE))
    }

    /// Amount in minor units, or `None` when it carries more than two
    /// fraction digits or does not fit an i64.
    pub fn cents(&self) -> Option<i64> {
        if self.0.scale() > MONEY_SCALE {
            return None;
        }
        let mut scaled = self.0;
        scaled.rescale(MONEY_SCALE);
        i64::try_from(scaled.mantissa()).ok()
    }

    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    pub fn checked_mul(&self, factor: i64) -> Option<Money> {
        self.0.checked_mul(Decimal::from(factor)).map(Money)
    }
}

impl FromStr for Money {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Decimal::from_str(s.trim()).map(Money)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut shown = self.0;
        shown.rescale(MONEY_SCALE);
        write!(f, "{shown}")
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let cents = self
            .cents()
            .ok_or_else(|| serde::ser::Error::custom(format!("unrepresentable amount: {}", self.0)))?;
        serializer.serialize_i64(cents)
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        i64::deserialize(deserializer).map(Money::from_cents)
    }
}

/// Booking lifecycle. `Canceled` is terminal and frees the stay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Canceled,
}

impl BookingStatus {
    pub const ACTIVE: [BookingStatus; 2] = [BookingStatus::Pending, BookingStatus::Confirmed];

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Canceled => "canceled",
        }
    }

    /// Pending and confirmed bookings block their stay.
    pub fn is_active(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        matches!(
            (self, next),
            (BookingStatus::Pending, BookingStatus::Confirmed)
                | (BookingStatus::Pending, BookingStatus::Canceled)
                | (BookingStatus::Confirmed, BookingStatus::Canceled)
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "canceled" | "cancelled" => Ok(BookingStatus::Canceled),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

/// A booking as stored inside its listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRecord {
    pub id: Ulid,
    pub stay: Stay,
    pub total_price: Money,
    pub status: BookingStatus,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Review {
    pub id: Ulid,
    pub rating: u8,
    pub comment: String,
    pub created_at: Ms,
}

/// A listing with everything it owns. Bookings and reviews live and die
/// with their listing.
#[derive(Debug, Clone)]
pub struct ListingState {
    pub id: Ulid,
    pub name: String,
    pub description: String,
    pub location: String,
    pub price_per_night: Money,
    pub created_at: Ms,
    pub updated_at: Ms,
    /// Set under the write lock right before the listing leaves the state map.
    pub deleted: bool,
    /// All bookings regardless of status, sorted by `stay.start`.
    pub bookings: Vec<BookingRecord>,
    pub reviews: Vec<Review>,
}

impl ListingState {
    pub fn new(
        id: Ulid,
        name: String,
        description: String,
        location: String,
        price_per_night: Money,
        created_at: Ms,
    ) -> Self {
        Self {
            id,
            name,
            description,
            location,
            price_per_night,
            created_at,
            updated_at: created_at,
            deleted: false,
            bookings: Vec::new(),
            reviews: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by stay start.
    pub fn insert_booking(&mut self, booking: BookingRecord) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.stay.start, |b| b.stay.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<BookingRecord> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&BookingRecord> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut BookingRecord> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings of any status whose stay overlaps `query`.
    /// Binary search skips bookings starting on or after `query.end`.
    pub fn overlapping(&self, query: &Stay) -> impl Iterator<Item = &BookingRecord> {
        let right_bound = self.bookings.partition_point(|b| b.stay.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.stay.end > query.start)
    }

    pub fn remove_review(&mut self, id: Ulid) -> Option<Review> {
        let pos = self.reviews.iter().position(|r| r.id == id)?;
        Some(self.reviews.remove(pos))
    }

    pub fn info(&self) -> ListingInfo {
        ListingInfo {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            location: self.location.clone(),
            price_per_night: self.price_per_night,
            created_at: self.created_at,
            updated_at: self.updated_at,
            bookings_count: self.bookings.len(),
        }
    }

    pub fn booking_info(&self, record: &BookingRecord) -> BookingInfo {
        BookingInfo {
            id: record.id,
            listing_id: self.id,
            stay: record.stay,
            total_price: record.total_price,
            status: record.status,
            created_at: record.created_at,
        }
    }

    pub fn review_info(&self, review: &Review) -> ReviewInfo {
        ReviewInfo {
            id: review.id,
            listing_id: self.id,
            rating: review.rating,
            comment: review.comment.clone(),
            created_at: review.created_at,
        }
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ListingCreated {
        id: Ulid,
        name: String,
        description: String,
        location: String,
        price_per_night: Money,
        at: Ms,
    },
    ListingUpdated {
        id: Ulid,
        name: String,
        description: String,
        location: String,
        price_per_night: Money,
        at: Ms,
    },
    ListingDeleted {
        id: Ulid,
    },
    BookingCreated {
        id: Ulid,
        listing_id: Ulid,
        stay: Stay,
        total_price: Money,
        at: Ms,
    },
    /// `previous_listing_id` differs from `listing_id` when the booking moves.
    BookingUpdated {
        id: Ulid,
        listing_id: Ulid,
        previous_listing_id: Ulid,
        stay: Stay,
        total_price: Money,
    },
    BookingStatusChanged {
        id: Ulid,
        listing_id: Ulid,
        status: BookingStatus,
    },
    BookingDeleted {
        id: Ulid,
        listing_id: Ulid,
    },
    ReviewAdded {
        id: Ulid,
        listing_id: Ulid,
        rating: u8,
        comment: String,
        at: Ms,
    },
    ReviewDeleted {
        id: Ulid,
        listing_id: Ulid,
    },
}

impl Event {
    /// The listing whose state this event changes.
    pub fn listing_id(&self) -> Ulid {
        match self {
            Event::ListingCreated { id, .. }
            | Event::ListingUpdated { id, .. }
            | Event::ListingDeleted { id } => *id,
            Event::BookingCreated { listing_id, .. }
            | Event::BookingUpdated { listing_id, .. }
            | Event::BookingStatusChanged { listing_id, .. }
            | Event::BookingDeleted { listing_id, .. }
            | Event::ReviewAdded { listing_id, .. }
            | Event::ReviewDeleted { listing_id, .. } => *listing_id,
        }
    }
}

// ── Write inputs ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewListing {
    pub name: String,
    pub description: String,
    pub location: String,
    pub price_per_night: Money,
}

/// Fields left `None` keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub price_per_night: Option<Money>,
}

/// One entry of a multi-booking request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewBooking {
    pub id: Ulid,
    pub listing_id: Ulid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

/// Fields left `None` keep their current value. There is no price field:
/// `total_price` is always derived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookingPatch {
    pub listing_id: Option<Ulid>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingInfo {
    pub id: Ulid,
    pub name: String,
    pub description: String,
    pub location: String,
    pub price_per_night: Money,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub bookings_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingDetail {
    pub listing: ListingInfo,
    pub bookings: Vec<BookingInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub id: Ulid,
    pub listing_id: Ulid,
    pub stay: Stay,
    pub total_price: Money,
    pub status: BookingStatus,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewInfo {
    pub id: Ulid,
    pub listing_id: Ulid,
    pub rating: u8,
    pub comment: String,
    pub created_at: Ms,
}

/// Result of a successful booking proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quote {
    pub listing_id: Ulid,
    pub stay: Stay,
    pub nights: i64,
    pub price_per_night: Money,
    pub total_price: Money,
}
