use crate::model::{DAY_MS, MINUTE_MS, Ms};

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single request may not span more than 31 days.
pub const MAX_SPAN_DURATION_MS: Ms = 31 * DAY_MS;
/// `find_overlapping` / `list_requests` windows are capped at a year.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * DAY_MS;

pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 4_000;
pub const MAX_REASON_LEN: usize = 1_000;
pub const MAX_NAME_LEN: usize = 200;

pub const MAX_RESOURCES: usize = 10_000;
pub const MAX_ACCOUNTS: usize = 1_000_000;
pub const MAX_GROUPS: usize = 100_000;
pub const MAX_REQUESTS_PER_RESOURCE: usize = 100_000;
pub const MAX_IN_CLAUSE_STATUSES: usize = 8;

pub const MIN_SLOT_MS: Ms = 5 * MINUTE_MS;
pub const MAX_SLOT_MS: Ms = DAY_MS;
