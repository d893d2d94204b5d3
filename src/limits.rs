use crate::model::Ms;

// ── Time bounds ──────────────────────────────────────────────────

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// Longest single blocked interval (one year).
pub const MAX_BLOCK_DURATION_MS: Ms = 366 * 24 * 3_600_000;
/// Fixed offsets span UTC-12:00 .. UTC+14:00.
pub const MIN_UTC_OFFSET_MIN: i32 = -12 * 60;
pub const MAX_UTC_OFFSET_MIN: i32 = 14 * 60;

// ── Durations (minutes) ──────────────────────────────────────────

pub const MIN_RULE_MINUTES: u32 = 15;
pub const MAX_RULE_MINUTES: u32 = 480;
pub const MIN_APPOINTMENT_MINUTES: u32 = 1;
pub const MAX_APPOINTMENT_MINUTES: u32 = 480;
pub const DEFAULT_SLOT_MINUTES: u32 = 30;
pub const DEFAULT_WAITLIST_MINUTES: u32 = 30;
pub const MAX_BUFFER_MINUTES: u32 = 240;
pub const MAX_DAILY_MEETINGS: u32 = 96;

// ── Strings ──────────────────────────────────────────────────────

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;
pub const MAX_TENANT_NAME_LEN: usize = 64;

// ── Cardinalities ────────────────────────────────────────────────

pub const MAX_TEACHERS_PER_TENANT: usize = 100_000;
pub const MAX_STUDENTS_PER_TENANT: usize = 1_000_000;
pub const MAX_SUBJECTS_PER_TENANT: usize = 10_000;
pub const MAX_SUBJECTS_PER_PROFILE: usize = 64;
pub const MAX_RULES_PER_TEACHER: usize = 1_000;
pub const MAX_BLOCKS_PER_TEACHER: usize = 10_000;
pub const MAX_APPOINTMENTS_PER_TEACHER: usize = 100_000;
pub const MAX_WAITLIST_PER_TEACHER: usize = 10_000;
pub const MAX_TENANTS: usize = 1024;

// ── Promotion ────────────────────────────────────────────────────

pub const DEFAULT_MAX_PROMOTION_ATTEMPTS: u32 = 5;
pub const MAX_PROMOTION_ATTEMPTS: u32 = 20;
