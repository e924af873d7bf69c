//! Hard caps on input sizes and state growth. These are guardrails against
//! unbounded memory and WAL growth, not business rules.

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_PHONE_LEN: usize = 32;
pub const MAX_NOTES_LEN: usize = 2_000;
pub const MAX_REASON_LEN: usize = 500;

pub const MAX_BUSINESSES: usize = 10_000;
pub const MAX_SERVICES_PER_BUSINESS: usize = 500;
pub const MAX_APPOINTMENTS_PER_CALENDAR: usize = 100_000;
pub const MAX_EXCEPTIONS_PER_CALENDAR: usize = 5_000;
pub const MAX_QUEUE_ENTRIES: usize = 1_000_000;

/// Upper bound on `process_pending` batch size per invocation.
pub const MAX_BATCH_LIMIT: usize = 1_000;

/// A service may not run longer than a full day.
pub const MAX_SERVICE_DURATION_MINUTES: u32 = 24 * 60;
