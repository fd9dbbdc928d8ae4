use crate::limits::MAX_MONEY_CENTS;
use crate::model::{Money, Stay};

use super::EngineError;

/// Nightly price must be positive and fit DECIMAL(10, 2).
pub(crate) fn validate_price(price: Money) -> Result<(), EngineError> {
    if !price.is_positive() {
        return Err(EngineError::InvalidPrice(price));
    }
    match price.cents() {
        Some(cents) if cents <= MAX_MONEY_CENTS => Ok(()),
        _ => Err(EngineError::InvalidPrice(price)),
    }
}

/// `nights × rate`, exact in decimal.
pub(crate) fn total_price(rate: Money, stay: &Stay) -> Result<Money, EngineError> {
    let total = rate
        .checked_mul(stay.nights())
        .ok_or(EngineError::LimitExceeded("total price overflow"))?;
    match total.cents() {
        Some(cents) if cents <= MAX_MONEY_CENTS => Ok(total),
        _ => Err(EngineError::LimitExceeded("total price exceeds 99999999.99")),
    }
}
