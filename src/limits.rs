//! Hard caps enforced by the engine and the SQL front end.

pub const MAX_LISTINGS: usize = 100_000;
pub const MAX_BOOKINGS_PER_LISTING: usize = 10_000;
pub const MAX_REVIEWS_PER_LISTING: usize = 10_000;

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_LOCATION_LEN: usize = 255;
pub const MAX_DESCRIPTION_LEN: usize = 16_384;
pub const MAX_COMMENT_LEN: usize = 8_192;

/// Longest stay a single booking may cover.
pub const MAX_STAY_NIGHTS: i64 = 730;

/// Rows accepted by one multi-row `INSERT INTO bookings`.
pub const MAX_BATCH_SIZE: usize = 1_000;

/// Money columns are DECIMAL(10, 2): at most 99,999,999.99.
pub const MONEY_SCALE: u32 = 2;
pub const MAX_MONEY_CENTS: i64 = 9_999_999_999;

pub const MIN_RATING: i64 = 1;
pub const MAX_RATING: i64 = 5;

pub const MAX_IN_CLAUSE_VALUES: usize = 16;
