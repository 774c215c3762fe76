//! Upper bounds on everything a caller controls.

pub const MAX_ESTATES: usize = 100_000;
pub const MAX_RESERVATIONS_PER_ESTATE: usize = 50_000;
pub const MAX_LOCKS_PER_ESTATE: usize = 10_000;
pub const MAX_NOTE_LEN: usize = 2_000;

/// Longest bookable or lockable range (about ten years).
pub const MAX_RANGE_DAYS: i64 = 3_660;
/// Widest calendar query window (about five years).
pub const MAX_QUERY_WINDOW_DAYS: i64 = 1_830;

pub const MAX_GUESTS: u32 = 100;
pub const MAX_UNITS: u32 = 10_000;
pub const MAX_RATE: i64 = 1_000_000_000;

/// Earliest and latest supported calendar years.
pub const MIN_YEAR: i32 = 2000;
pub const MAX_YEAR: i32 = 2200;

/// Jobs a single in-process timer queue will keep armed.
pub const MAX_ARMED_JOBS: usize = 1_000_000;
