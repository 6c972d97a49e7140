use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// Longest single reservation or availability window (31 days).
pub const MAX_SPAN_DURATION_MS: Ms = 31 * 24 * 3_600_000;

/// Widest window accepted by range queries (366 days).
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_RESOURCES: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_WINDOWS_PER_TRAINER: usize = 10_000;
pub const MAX_RESERVATIONS_PER_RESOURCE: usize = 100_000;
pub const MAX_ACTIVITY_CAPACITY: u32 = 10_000;
