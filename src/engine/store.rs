use ulid::Ulid;

use crate::calendar::MINUTE_MS;
use crate::limits::MAX_APPOINTMENT_MINUTES;
use crate::model::*;

/// Longest possible appointment; bounds backwards scans over `appointments`.
const MAX_APPOINTMENT_MS: Ms = MAX_APPOINTMENT_MINUTES as Ms * MINUTE_MS;

/// Every row owned by one teacher. Guarded by a single `RwLock`; holding the
/// write guard is the per-teacher transaction.
#[derive(Debug, Clone)]
pub struct TeacherState {
    pub profile: TeacherProfile,
    /// Sorted by (weekday, start).
    pub rules: Vec<WeeklyRule>,
    /// Sorted by span.start.
    pub blocks: Vec<BlockedInterval>,
    /// Sorted by start. At most one row per start instant, whatever its status:
    /// this is the `(teacher, start)` uniqueness index.
    pub appointments: Vec<Appointment>,
    /// FIFO by created_at; equal instants keep commit order.
    pub waitlist: Vec<WaitlistEntry>,
}

impl TeacherState {
    pub fn new(profile: TeacherProfile) -> Self {
        Self {
            profile,
            rules: Vec::new(),
            blocks: Vec::new(),
            appointments: Vec::new(),
            waitlist: Vec::new(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.profile.id
    }

    // ── Weekly rules ─────────────────────────────────────────

    pub fn insert_rule(&mut self, rule: WeeklyRule) {
        let key = (rule.weekday, rule.start);
        let pos = self.rules.partition_point(|r| (r.weekday, r.start) < key);
        self.rules.insert(pos, rule);
    }

    pub fn remove_rule(&mut self, id: Ulid) -> Option<WeeklyRule> {
        let pos = self.rules.iter().position(|r| r.id == id)?;
        Some(self.rules.remove(pos))
    }

    pub fn rule(&self, id: Ulid) -> Option<&WeeklyRule> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn rule_mut(&mut self, id: Ulid) -> Option<&mut WeeklyRule> {
        self.rules.iter_mut().find(|r| r.id == id)
    }

    /// Active rules for one weekday, in start order.
    pub fn active_rules_on(&self, weekday: u8) -> impl Iterator<Item = &WeeklyRule> {
        self.rules
            .iter()
            .filter(move |r| r.active && r.weekday == weekday)
    }

    // ── Blocked intervals ────────────────────────────────────

    pub fn insert_block(&mut self, block: BlockedInterval) {
        let pos = self.blocks.partition_point(|b| b.span.start < block.span.start);
        self.blocks.insert(pos, block);
    }

    pub fn remove_block(&mut self, id: Ulid) -> Option<BlockedInterval> {
        let pos = self.blocks.iter().position(|b| b.id == id)?;
        Some(self.blocks.remove(pos))
    }

    /// Blocks whose span overlaps the query window.
    pub fn blocks_overlapping(&self, query: &Span) -> impl Iterator<Item = &BlockedInterval> {
        let right_bound = self.blocks.partition_point(|b| b.span.start < query.end);
        self.blocks[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    // ── Appointments ─────────────────────────────────────────

    /// Insert, or overwrite the row holding the same start. Returns the replaced row.
    pub fn upsert_appointment(&mut self, appt: Appointment) -> Option<Appointment> {
        match self.appointments.binary_search_by_key(&appt.start, |a| a.start) {
            Ok(pos) => Some(std::mem::replace(&mut self.appointments[pos], appt)),
            Err(pos) => {
                self.appointments.insert(pos, appt);
                None
            }
        }
    }

    pub fn appointment(&self, id: Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    pub fn appointment_mut(&mut self, id: Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == id)
    }

    /// The row at `(teacher, start)`, occupying or not.
    pub fn appointment_at(&self, start: Ms) -> Option<&Appointment> {
        self.appointments
            .binary_search_by_key(&start, |a| a.start)
            .ok()
            .map(|pos| &self.appointments[pos])
    }

    /// Rows starting inside the window, in start order.
    pub fn appointments_starting_in(&self, window: &Span) -> &[Appointment] {
        let lo = self.appointments.partition_point(|a| a.start < window.start);
        let hi = self.appointments.partition_point(|a| a.start < window.end);
        &self.appointments[lo..hi]
    }

    /// Occupying appointments whose raw range overlaps the query window.
    pub fn occupying_overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        let lo = self
            .appointments
            .partition_point(|a| a.start <= query.start - MAX_APPOINTMENT_MS);
        let hi = self.appointments.partition_point(|a| a.start < query.end);
        self.appointments[lo..hi]
            .iter()
            .filter(move |a| a.is_occupying() && a.span().end > query.start)
    }

    // ── Waitlist ─────────────────────────────────────────────

    pub fn insert_waitlist(&mut self, entry: WaitlistEntry) {
        let pos = self.waitlist.partition_point(|e| e.created_at <= entry.created_at);
        self.waitlist.insert(pos, entry);
    }

    pub fn remove_waitlist(&mut self, ids: &[Ulid]) {
        self.waitlist.retain(|e| !ids.contains(&e.id));
    }

    pub fn waitlist_entry(&self, id: Ulid) -> Option<&WaitlistEntry> {
        self.waitlist.iter().find(|e| e.id == id)
    }

    /// Waiting entries for one slot, oldest first.
    pub fn waiting_for(&self, slot: Ms) -> impl Iterator<Item = &WaitlistEntry> {
        self.waitlist.iter().filter(move |e| e.slot == slot)
    }
}
