use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::calendar::{TimeOfDay, MINUTE_MS};

/// Unix milliseconds, the only instant type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Grow the span by `by` on both sides.
    pub fn expanded(&self, by: Ms) -> Span {
        Span::new(self.start - by, self.end + by)
    }
}

// ── Principals ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Student,
    Teacher,
    Admin,
}

/// Identity resolved by the embedding layer. The engine never authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub user_id: Ulid,
    pub role: Role,
}

impl Principal {
    pub fn student(user_id: Ulid) -> Self {
        Self { user_id, role: Role::Student }
    }

    pub fn teacher(user_id: Ulid) -> Self {
        Self { user_id, role: Role::Teacher }
    }

    pub fn admin(user_id: Ulid) -> Self {
        Self { user_id, role: Role::Admin }
    }
}

// ── Tiers and statuses ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceTier {
    Level1,
    Level2,
    Premium,
}

impl ServiceTier {
    pub const ALL: [ServiceTier; 3] = [ServiceTier::Level1, ServiceTier::Level2, ServiceTier::Premium];

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceTier::Level1 => "level1",
            ServiceTier::Level2 => "level2",
            ServiceTier::Premium => "premium",
        }
    }

    /// Score stamped on waitlist entries. Stored for reporting; promotion is FIFO.
    pub fn priority_score(self) -> u32 {
        match self {
            ServiceTier::Level1 => 1,
            ServiceTier::Level2 => 2,
            ServiceTier::Premium => 3,
        }
    }
}

impl FromStr for ServiceTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "level1" => Ok(ServiceTier::Level1),
            "level2" => Ok(ServiceTier::Level2),
            "premium" => Ok(ServiceTier::Premium),
            other => Err(format!("unknown service tier: {other}")),
        }
    }
}

impl fmt::Display for ServiceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
    Completed,
    NoShow,
    Expired,
}

impl AppointmentStatus {
    /// Pending and approved appointments hold their slot.
    pub fn is_occupying(self) -> bool {
        matches!(self, AppointmentStatus::Pending | AppointmentStatus::Approved)
    }

    /// Terminal statuses that hand the slot back before the meeting happens.
    /// Reaching one of these triggers a waitlist promotion.
    pub fn frees_slot(self) -> bool {
        matches!(
            self,
            AppointmentStatus::Cancelled | AppointmentStatus::Rejected | AppointmentStatus::Expired
        )
    }

    pub fn can_transition_to(self, next: AppointmentStatus) -> bool {
        use AppointmentStatus::*;
        matches!(
            (self, next),
            (Pending, Approved | Rejected | Cancelled | Expired)
                | (Approved, Cancelled | Completed | NoShow)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Approved => "approved",
            AppointmentStatus::Rejected => "rejected",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::NoShow => "no_show",
            AppointmentStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitlistStatus {
    Waiting,
}

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeacherProfile {
    pub id: Ulid,
    pub name: Option<String>,
    /// Mandatory gap before and after every booking.
    pub buffer_min: u32,
    pub max_daily_meetings: u32,
    /// Fixed offset of the teacher's timezone from UTC.
    pub utc_offset_min: i32,
    pub subjects: Vec<Ulid>,
}

impl TeacherProfile {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            name: None,
            buffer_min: 0,
            max_daily_meetings: 8,
            utc_offset_min: 0,
            subjects: Vec::new(),
        }
    }

    pub fn buffer_ms(&self) -> Ms {
        Ms::from(self.buffer_min) * MINUTE_MS
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentProfile {
    pub id: Ulid,
    pub name: Option<String>,
    pub tier: ServiceTier,
    pub monthly_used: u32,
    pub last_reset: Ms,
    /// Enrolled subjects. Empty means no restriction.
    pub subjects: Vec<Ulid>,
}

impl StudentProfile {
    pub fn new(id: Ulid, tier: ServiceTier, now: Ms) -> Self {
        Self {
            id,
            name: None,
            tier,
            monthly_used: 0,
            last_reset: now,
            subjects: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePolicy {
    pub tier: ServiceTier,
    pub monthly_auto_approve: u32,
    /// Hard monthly cap; `None` is unlimited.
    pub monthly_cap: Option<u32>,
    pub priority: bool,
    pub expire_hours: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyRule {
    pub id: Ulid,
    pub teacher_id: Ulid,
    /// 0 = Sunday .. 6 = Saturday.
    pub weekday: u8,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    pub active: bool,
}

impl WeeklyRule {
    /// The rule window in minutes since midnight.
    pub fn minute_span(&self) -> Span {
        Span::new(Ms::from(self.start.minutes()), Ms::from(self.end.minutes()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedInterval {
    pub id: Ulid,
    pub teacher_id: Ulid,
    pub span: Span,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub student_id: Ulid,
    pub teacher_id: Ulid,
    pub subject_id: Ulid,
    pub start: Ms,
    pub duration_min: u32,
    pub status: AppointmentStatus,
    pub approval_required: bool,
    pub approved_at: Option<Ms>,
    pub idempotency_key: String,
    pub created_at: Ms,
}

impl Appointment {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.start + Ms::from(self.duration_min) * MINUTE_MS)
    }

    pub fn is_occupying(&self) -> bool {
        self.status.is_occupying()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: Ulid,
    pub teacher_id: Ulid,
    pub student_id: Ulid,
    pub slot: Ms,
    /// Local date of the slot, `YYYY-MM-DD`.
    pub date: String,
    pub duration_min: u32,
    pub priority: u32,
    pub status: WaitlistStatus,
    pub created_at: Ms,
}

/// Absolute usage counter state written with a booking or promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageUpdate {
    pub student_id: Ulid,
    pub monthly_used: u32,
    pub last_reset: Ms,
}

/// Flat event types. This is the WAL record format.
/// Each event is one committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SubjectCreated(Subject),
    TeacherUpserted(TeacherProfile),
    StudentUpserted(StudentProfile),
    PolicySet(ServicePolicy),
    RuleAdded(WeeklyRule),
    /// Merge or update: drop `removed`, insert `rule`.
    RulesReplaced {
        teacher_id: Ulid,
        removed: Vec<Ulid>,
        rule: WeeklyRule,
    },
    RuleActiveSet {
        id: Ulid,
        teacher_id: Ulid,
        active: bool,
    },
    RuleRemoved {
        id: Ulid,
        teacher_id: Ulid,
    },
    BlockAdded(BlockedInterval),
    BlockRemoved {
        id: Ulid,
        teacher_id: Ulid,
    },
    /// Insert, or overwrite in place when `appointment.id` already exists.
    /// `removed` holds the student's own waitlist entries for the slot.
    AppointmentBooked {
        appointment: Appointment,
        usage: Option<UsageUpdate>,
        removed: Vec<Ulid>,
    },
    AppointmentStatusChanged {
        id: Ulid,
        teacher_id: Ulid,
        status: AppointmentStatus,
        at: Ms,
    },
    WaitlistJoined(WaitlistEntry),
    WaitlistRemoved {
        teacher_id: Ulid,
        ids: Vec<Ulid>,
    },
    WaitlistPromoted {
        appointment: Appointment,
        removed: Vec<Ulid>,
        usage: UsageUpdate,
    },
    /// Conditional: applies only while the stored `last_reset` equals `expected_last_reset`.
    QuotaReset {
        student_id: Ulid,
        expected_last_reset: Ms,
        last_reset: Ms,
    },
}

// ── Operation result types ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingOutcome {
    pub appointment_id: Ulid,
    pub status: AppointmentStatus,
    pub approval_required: bool,
}

/// Result of a promotion attempt. `promoted` is 0 or 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promotion {
    pub promoted: u8,
    pub appointment_id: Option<Ulid>,
    pub student_id: Option<Ulid>,
    pub status: Option<AppointmentStatus>,
}

impl Promotion {
    pub fn none() -> Self {
        Self {
            promoted: 0,
            appointment_id: None,
            student_id: None,
            status: None,
        }
    }

    pub fn promoted(appointment: &Appointment) -> Self {
        Self {
            promoted: 1,
            appointment_id: Some(appointment.id),
            student_id: Some(appointment.student_id),
            status: Some(appointment.status),
        }
    }
}

/// Outcome of a lifecycle transition. `promotion` is set when the
/// transition freed the slot and a waitlist promotion ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub appointment_id: Ulid,
    pub status: AppointmentStatus,
    pub promotion: Option<Promotion>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaStatus {
    pub tier: ServiceTier,
    pub used: u32,
    pub cap: Option<u32>,
    pub auto_approve_remaining: Option<u32>,
}
