use chrono::NaiveDate;

use crate::calendar::{self, MINUTE_MS};
use crate::limits::DEFAULT_SLOT_MINUTES;
use crate::model::*;

use super::availability::free_windows;
use super::store::TeacherState;

/// Coerce a caller-supplied duration: non-finite or non-positive values and
/// anything that floors below one minute fall back to the default.
pub fn normalize_duration(minutes: f64) -> u32 {
    if !minutes.is_finite() || minutes <= 0.0 {
        return DEFAULT_SLOT_MINUTES;
    }
    let floored = minutes.floor();
    if floored < 1.0 {
        return DEFAULT_SLOT_MINUTES;
    }
    // saturating float-to-int cast
    floored as u32
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 { a } else { gcd(b, a % b) }
}

/// Scan step in minutes: `gcd(duration, buffer)`, at least one.
pub fn scan_step(duration_min: u32, buffer_min: u32) -> u32 {
    gcd(duration_min, buffer_min).max(1)
}

/// Bookable start instants on a local date, ascending and deduplicated.
///
/// A start qualifies when its raw range lies clear of every blocked interval
/// and its range grown by the buffer on both sides misses every occupying
/// appointment. That is the same test the booking guard runs.
pub fn generate(ts: &TeacherState, date: NaiveDate, duration_min: u32) -> Vec<Ms> {
    let offset = ts.profile.utc_offset_min;
    let duration = Ms::from(duration_min) * MINUTE_MS;
    let buffer = ts.profile.buffer_ms();
    let step = Ms::from(scan_step(duration_min, ts.profile.buffer_min)) * MINUTE_MS;
    let free = free_windows(ts, date);

    let mut slots = Vec::new();
    for rule in ts.active_rules_on(calendar::weekday_of(date)) {
        let window = calendar::window_on(date, offset, rule.start, rule.end);
        let mut start = window.start;
        while start + duration <= window.end {
            let candidate = Span::new(start, start + duration);
            let unblocked = free.iter().any(|w| w.contains_span(&candidate));
            if unblocked
                && ts
                    .occupying_overlapping(&candidate.expanded(buffer))
                    .next()
                    .is_none()
            {
                slots.push(start);
            }
            start += step;
        }
    }
    slots.sort_unstable();
    slots.dedup();
    slots
}
