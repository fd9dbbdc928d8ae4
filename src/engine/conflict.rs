use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::pricing::total_price;
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Structural check: the stay must cover at least one night.
pub(crate) fn validate_range(start: NaiveDate, end: NaiveDate) -> Result<Stay, EngineError> {
    if end <= start {
        return Err(EngineError::InvalidRange { start, end });
    }
    let stay = Stay::new(start, end);
    if stay.nights() > MAX_STAY_NIGHTS {
        return Err(EngineError::LimitExceeded("stay too long"));
    }
    Ok(stay)
}

/// First active booking overlapping `stay`, skipping `excluding` (the booking
/// being updated). Canceled bookings never conflict.
pub(crate) fn find_conflict<'a>(
    ls: &'a ListingState,
    stay: &Stay,
    excluding: Option<Ulid>,
) -> Option<&'a BookingRecord> {
    ls.overlapping(stay)
        .find(|b| b.status.is_active() && Some(b.id) != excluding)
}

pub(crate) fn check_no_conflict(
    ls: &ListingState,
    stay: &Stay,
    excluding: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(ls, stay, excluding) {
        Some(existing) => Err(EngineError::DateConflict {
            conflicting: existing.id,
            stay_start: stay.start,
            stay_end: stay.end,
        }),
        None => Ok(()),
    }
}

/// Validate a proposed stay against a listing and price it. Pure: the caller
/// holds the listing lock and decides whether to persist.
pub fn propose(
    ls: &ListingState,
    start: NaiveDate,
    end: NaiveDate,
    excluding: Option<Ulid>,
) -> Result<Quote, EngineError> {
    if ls.deleted {
        return Err(EngineError::ListingNotFound(ls.id));
    }
    let stay = validate_range(start, end)?;
    check_no_conflict(ls, &stay, excluding)?;
    let total = total_price(ls.price_per_night, &stay)?;
    Ok(Quote {
        listing_id: ls.id,
        stay,
        nights: stay.nights(),
        price_per_night: ls.price_per_night,
        total_price: total,
    })
}

/// Stays requested together for one listing must not overlap each other.
pub(crate) fn check_batch_disjoint(batch: &[(Ulid, Stay)]) -> Result<(), EngineError> {
    let mut sorted: Vec<&(Ulid, Stay)> = batch.iter().collect();
    sorted.sort_by_key(|(_, stay)| stay.start);

    // Furthest checkout seen so far and the booking that owns it.
    let mut reach: Option<(Ulid, NaiveDate)> = None;
    for (id, stay) in sorted {
        if let Some((owner, end)) = reach
            && stay.start < end
        {
            return Err(EngineError::DateConflict {
                conflicting: owner,
                stay_start: stay.start,
                stay_end: stay.end,
            });
        }
        if reach.is_none_or(|(_, end)| stay.end > end) {
            reach = Some((*id, stay.end));
        }
    }
    Ok(())
}
