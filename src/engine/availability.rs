use chrono::{Days, NaiveDate};
use ulid::Ulid;

use crate::calendar::{self, TimeOfDay};
use crate::limits::{MAX_RULE_MINUTES, MIN_RULE_MINUTES};
use crate::model::*;

use super::overlap::{self, Overlap};
use super::store::TeacherState;

// ── Interval arithmetic ──────────────────────────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted by start and disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

/// Bookable time on one local date: the union of active rule windows for its
/// weekday minus every blocked interval. Appointments are not subtracted.
pub fn free_windows(ts: &TeacherState, date: NaiveDate) -> Vec<Span> {
    let offset = ts.profile.utc_offset_min;
    let mut windows: Vec<Span> = ts
        .active_rules_on(calendar::weekday_of(date))
        .map(|r| calendar::window_on(date, offset, r.start, r.end))
        .collect();
    if windows.is_empty() {
        return windows;
    }
    windows.sort_by_key(|s| s.start);
    let windows = merge_overlapping(&windows);

    let day = calendar::local_day_span(date, offset);
    let mut blocked: Vec<Span> = ts.blocks_overlapping(&day).map(|b| b.span).collect();
    if blocked.is_empty() {
        return windows;
    }
    blocked.sort_by_key(|s| s.start);
    subtract_intervals(&windows, &merge_overlapping(&blocked))
}

/// Is `span` inside one active window and clear of every blocked interval?
pub fn slot_is_available(ts: &TeacherState, span: &Span) -> bool {
    let Some(date) = calendar::local_date(span.start, ts.profile.utc_offset_min) else {
        return false;
    };
    free_windows(ts, date).iter().any(|w| w.contains_span(span))
}

// ── Availability conflict detector ───────────────────────────────

/// A proposed weekly window in the teacher's local time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleProposal {
    /// 0 = Sunday .. 6 = Saturday.
    pub weekday: u8,
    /// `HH:mm`
    pub start: String,
    /// `HH:mm`
    pub end: String,
}

impl RuleProposal {
    pub fn new(weekday: u8, start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            weekday,
            start: start.into(),
            end: end.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    InvalidTime,
    ExactMatch,
    Contains,
    Contained,
    Overlap,
}

impl ConflictKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictKind::InvalidTime => "invalid_time",
            ConflictKind::ExactMatch => "exact_match",
            ConflictKind::Contains => "contains",
            ConflictKind::Contained => "contained",
            ConflictKind::Overlap => "overlap",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleConflict {
    pub kind: ConflictKind,
    /// The existing rule involved; `None` for `InvalidTime`.
    pub rule_id: Option<Ulid>,
    /// Shared minutes with the existing rule.
    pub shared: Option<(TimeOfDay, TimeOfDay)>,
    pub message: String,
}

/// Non-blocking notice about a blocked interval or booking inside the window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleWarning {
    pub entity_id: Ulid,
    pub span: Span,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuggestionKind {
    Merge,
    Split,
    Extend,
    ChooseOtherTime,
}

impl SuggestionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SuggestionKind::Merge => "merge",
            SuggestionKind::Split => "split",
            SuggestionKind::Extend => "extend",
            SuggestionKind::ChooseOtherTime => "choose_other_time",
        }
    }

    /// 1 is the strongest.
    pub fn rank(self) -> u8 {
        match self {
            SuggestionKind::Merge => 1,
            SuggestionKind::Extend => 2,
            SuggestionKind::Split => 3,
            SuggestionKind::ChooseOtherTime => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suggestion {
    pub kind: SuggestionKind,
    pub priority: u8,
    pub message: String,
    /// For `Merge`: the resulting window. For `ChooseOtherTime`: free gaps
    /// on the weekday long enough for the proposal.
    pub windows: Vec<(TimeOfDay, TimeOfDay)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleValidation {
    pub conflicts: Vec<RuleConflict>,
    /// Rules in partial overlap; the merge candidates.
    pub overlapping: Vec<Ulid>,
    pub block_warnings: Vec<RuleWarning>,
    pub appointment_warnings: Vec<RuleWarning>,
    pub suggestions: Vec<Suggestion>,
    /// Parsed window, present when time validation passed.
    pub window: Option<(TimeOfDay, TimeOfDay)>,
}

impl RuleValidation {
    /// No blocking conflicts.
    pub fn is_ok(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Every blocking conflict is a partial overlap.
    pub fn can_merge(&self) -> bool {
        !self.conflicts.is_empty() && self.conflicts.iter().all(|c| c.kind == ConflictKind::Overlap)
    }

    fn invalid(message: String) -> Self {
        Self {
            conflicts: vec![RuleConflict {
                kind: ConflictKind::InvalidTime,
                rule_id: None,
                shared: None,
                message,
            }],
            ..Self::default()
        }
    }
}

/// Parse and bound-check the proposal's window.
pub fn parse_window(proposal: &RuleProposal) -> Result<(TimeOfDay, TimeOfDay), String> {
    let start: TimeOfDay = proposal.start.parse().map_err(|e| format!("{e}"))?;
    let end: TimeOfDay = proposal.end.parse().map_err(|e| format!("{e}"))?;
    if start >= end {
        return Err(format!("start {start} must be before end {end}"));
    }
    let minutes = u32::from(end.minutes() - start.minutes());
    if !(MIN_RULE_MINUTES..=MAX_RULE_MINUTES).contains(&minutes) {
        return Err(format!(
            "window of {minutes} minutes is outside {MIN_RULE_MINUTES}..={MAX_RULE_MINUTES}"
        ));
    }
    Ok((start, end))
}

fn minute_span(start: TimeOfDay, end: TimeOfDay) -> Span {
    Span::new(Ms::from(start.minutes()), Ms::from(end.minutes()))
}

fn tod(minutes: Ms) -> TimeOfDay {
    // minute spans are built from TimeOfDay values, so this stays in range
    TimeOfDay::from_minutes(minutes.clamp(0, 1440) as u16).unwrap_or(TimeOfDay::MIDNIGHT)
}

/// Validate a proposed weekly rule against the teacher's active rules,
/// future blocked intervals and future bookings. `ignore` skips the rule
/// being replaced by an update.
pub fn validate_rule(
    ts: &TeacherState,
    proposal: &RuleProposal,
    ignore: Option<Ulid>,
    now: Ms,
) -> RuleValidation {
    let (start, end) = match parse_window(proposal) {
        Ok(w) => w,
        Err(msg) => return RuleValidation::invalid(msg),
    };
    let proposed = minute_span(start, end);
    let mut v = RuleValidation {
        window: Some((start, end)),
        ..RuleValidation::default()
    };

    let mut contains_existing = false;
    let mut inside_existing = false;
    for rule in ts.active_rules_on(proposal.weekday) {
        if Some(rule.id) == ignore {
            continue;
        }
        let existing = rule.minute_span();
        let label = format!("{}-{}", rule.start, rule.end);
        let relation = overlap::classify(&proposed, &existing);
        let (kind, message) = match relation {
            Overlap::None => continue,
            Overlap::Exact => (
                ConflictKind::ExactMatch,
                format!("an identical window {label} already exists"),
            ),
            Overlap::Contains => {
                contains_existing = true;
                (
                    ConflictKind::Contains,
                    format!("proposed window covers the existing window {label}"),
                )
            }
            Overlap::Contained => {
                inside_existing = true;
                (
                    ConflictKind::Contained,
                    format!("proposed window lies inside the existing window {label}"),
                )
            }
            Overlap::Partial(_) => {
                v.overlapping.push(rule.id);
                (
                    ConflictKind::Overlap,
                    format!("proposed window partially overlaps {label}"),
                )
            }
        };
        if relation == Overlap::Exact {
            inside_existing = true;
        }
        v.conflicts.push(RuleConflict {
            kind,
            rule_id: Some(rule.id),
            shared: overlap::intersection(&proposed, &existing).map(|s| (tod(s.start), tod(s.end))),
            message,
        });
    }

    collect_block_warnings(ts, proposal.weekday, start, end, now, &mut v.block_warnings);
    collect_appointment_warnings(ts, proposal.weekday, &proposed, now, &mut v.appointment_warnings);

    if !v.overlapping.is_empty() {
        let merged = merged_window(ts, &v.overlapping, start, end);
        v.suggestions.push(Suggestion {
            kind: SuggestionKind::Merge,
            priority: SuggestionKind::Merge.rank(),
            message: format!("merge into a single window {}-{}", merged.0, merged.1),
            windows: vec![merged],
        });
    }
    if inside_existing {
        v.suggestions.push(Suggestion {
            kind: SuggestionKind::Extend,
            priority: SuggestionKind::Extend.rank(),
            message: "extend the existing window instead of adding a new one".into(),
            windows: Vec::new(),
        });
    }
    if contains_existing {
        v.suggestions.push(Suggestion {
            kind: SuggestionKind::Split,
            priority: SuggestionKind::Split.rank(),
            message: "split the proposal around the existing window".into(),
            windows: Vec::new(),
        });
    }
    if !v.conflicts.is_empty() {
        let gaps = free_gaps(ts, proposal.weekday, ignore, proposed.duration_ms());
        v.suggestions.push(Suggestion {
            kind: SuggestionKind::ChooseOtherTime,
            priority: SuggestionKind::ChooseOtherTime.rank(),
            message: "choose a time that does not overlap existing availability".into(),
            windows: gaps,
        });
    }
    v.suggestions.sort_by_key(|s| s.priority);
    v
}

/// Union of the proposal with the given rules: `[min(starts), max(ends))`.
pub fn merged_window(
    ts: &TeacherState,
    rule_ids: &[Ulid],
    start: TimeOfDay,
    end: TimeOfDay,
) -> (TimeOfDay, TimeOfDay) {
    rule_ids
        .iter()
        .filter_map(|id| ts.rule(*id))
        .fold((start, end), |(s, e), r| (s.min(r.start), e.max(r.end)))
}

/// Uncovered stretches of the weekday at least `min_len` minutes long.
fn free_gaps(ts: &TeacherState, weekday: u8, ignore: Option<Ulid>, min_len: Ms) -> Vec<(TimeOfDay, TimeOfDay)> {
    let mut taken: Vec<Span> = ts
        .active_rules_on(weekday)
        .filter(|r| Some(r.id) != ignore)
        .map(|r| r.minute_span())
        .collect();
    taken.sort_by_key(|s| s.start);
    let whole_day = [Span::new(0, 1440)];
    subtract_intervals(&whole_day, &merge_overlapping(&taken))
        .into_iter()
        .filter(|gap| gap.duration_ms() >= min_len)
        .map(|gap| (tod(gap.start), tod(gap.end)))
        .collect()
}

/// Local dates touched by `span`, capped at one year.
fn local_dates(span: &Span, offset: i32) -> impl Iterator<Item = NaiveDate> {
    let first = calendar::local_date(span.start, offset);
    let last = calendar::local_date(span.end - 1, offset);
    let mut cur = first;
    std::iter::from_fn(move || {
        let (c, l) = (cur?, last?);
        if c > l {
            return None;
        }
        cur = c.checked_add_days(Days::new(1));
        Some(c)
    })
    .take(367)
}

fn collect_block_warnings(
    ts: &TeacherState,
    weekday: u8,
    start: TimeOfDay,
    end: TimeOfDay,
    now: Ms,
    out: &mut Vec<RuleWarning>,
) {
    let offset = ts.profile.utc_offset_min;
    for block in ts.blocks.iter().filter(|b| b.span.end > now) {
        let hit = local_dates(&block.span, offset)
            .filter(|d| calendar::weekday_of(*d) == weekday)
            .map(|d| calendar::window_on(d, offset, start, end))
            .find(|w| w.overlaps(&block.span));
        if let Some(window) = hit {
            let reason = block.reason.as_deref().unwrap_or("blocked");
            out.push(RuleWarning {
                entity_id: block.id,
                span: block.span,
                message: format!("{reason} overlaps this window starting at {}", window.start),
            });
        }
    }
}

fn collect_appointment_warnings(
    ts: &TeacherState,
    weekday: u8,
    proposed: &Span,
    now: Ms,
    out: &mut Vec<RuleWarning>,
) {
    let offset = ts.profile.utc_offset_min;
    for appt in ts.appointments.iter().filter(|a| a.is_occupying() && a.span().end > now) {
        let Some(date) = calendar::local_date(appt.start, offset) else { continue };
        if calendar::weekday_of(date) != weekday {
            continue;
        }
        let window = Span::new(
            calendar::local_midnight(date, offset) + proposed.start * calendar::MINUTE_MS,
            calendar::local_midnight(date, offset) + proposed.end * calendar::MINUTE_MS,
        );
        if window.overlaps(&appt.span()) {
            out.push(RuleWarning {
                entity_id: appt.id,
                span: appt.span(),
                message: format!("existing {} booking on {date} falls inside this window", appt.status),
            });
        }
    }
}

/// Active rules a new blocked interval cuts into, one warning per rule.
pub fn rules_hit_by_block(ts: &TeacherState, span: &Span) -> Vec<RuleWarning> {
    let offset = ts.profile.utc_offset_min;
    let mut warnings = Vec::new();
    for rule in ts.rules.iter().filter(|r| r.active) {
        let hit = local_dates(span, offset)
            .filter(|d| calendar::weekday_of(*d) == rule.weekday)
            .find(|d| calendar::window_on(*d, offset, rule.start, rule.end).overlaps(span));
        if let Some(date) = hit {
            warnings.push(RuleWarning {
                entity_id: rule.id,
                span: calendar::window_on(date, offset, rule.start, rule.end),
                message: format!("blocks availability {}-{} on {date}", rule.start, rule.end),
            });
        }
    }
    warnings
}
