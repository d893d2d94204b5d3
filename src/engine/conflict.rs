use ulid::Ulid;

use crate::calendar;
use crate::limits::*;
use crate::model::*;

use super::store::TeacherState;
use super::{EngineError, RejectReason};

pub(crate) fn validate_instant(t: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    validate_instant(span.start)?;
    validate_instant(span.end)?;
    if span.start >= span.end {
        return Err(EngineError::InvalidTime("start must be before end".into()));
    }
    if span.duration_ms() > MAX_BLOCK_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// The teacher must teach the subject; a student with an empty enrolment
/// list may take any subject.
pub(crate) fn check_subject(ts: &TeacherState, sp: &StudentProfile, subject_id: Ulid) -> Result<(), RejectReason> {
    let taught = ts.profile.subjects.contains(&subject_id);
    let enrolled = sp.subjects.is_empty() || sp.subjects.contains(&subject_id);
    if !taught || !enrolled {
        return Err(RejectReason::SubjectMismatch);
    }
    Ok(())
}

/// Run the booking guard for `span` against the teacher's rows.
///
/// The proposal grows by the buffer on both sides and must miss every
/// occupying appointment; then the local day must still have room under
/// `max_daily_meetings`.
pub(crate) fn check_booking(ts: &TeacherState, span: &Span) -> Result<(), RejectReason> {
    let grown = span.expanded(ts.profile.buffer_ms());
    if ts.occupying_overlapping(&grown).next().is_some() {
        return Err(RejectReason::SlotTaken);
    }

    let offset = ts.profile.utc_offset_min;
    let date = calendar::local_date(span.start, offset).ok_or(RejectReason::SlotUnavailable)?;
    let day = calendar::local_day_span(date, offset);
    let booked = ts
        .appointments_starting_in(&day)
        .iter()
        .filter(|a| a.is_occupying())
        .count();
    if booked >= ts.profile.max_daily_meetings as usize {
        return Err(RejectReason::MaxDailyReached);
    }
    Ok(())
}
