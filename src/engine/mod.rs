mod access;
mod availability;
mod conflict;
mod error;
mod mutations;
mod overlap;
mod policy;
mod promotion;
mod queries;
mod slots;
mod store;
#[cfg(test)]
mod tests;

pub use availability::{
    ConflictKind, RuleConflict, RuleProposal, RuleValidation, RuleWarning, Suggestion, SuggestionKind,
    free_windows, merge_overlapping, subtract_intervals,
};
pub use error::{EngineError, RejectReason};
pub use mutations::{AddedBlock, AddedRule, BookingRequest, OnConflict, StudentUpsert};
pub use overlap::{Overlap, classify, intersection};
pub use policy::{Decision, decide, default_policy};
pub use slots::normalize_duration;
pub use store::TeacherState;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::warn;
use ulid::Ulid;

use crate::limits::DEFAULT_MAX_PROMOTION_ATTEMPTS;
use crate::model::*;
use crate::notify::{Notification, NotificationKind, NotifyHub};
use crate::wal::Wal;

pub type SharedTeacherState = Arc<RwLock<TeacherState>>;
pub type SharedStudentState = Arc<Mutex<StudentProfile>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }
                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<Pending>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        if tx.send(r).is_err() {
            warn!("WAL append response dropped: caller went away");
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

// ── Engine ───────────────────────────────────────────────

/// Lookup tables spanning every teacher of the tenant.
#[derive(Default)]
pub(super) struct Indexes {
    /// Entity (rule/block/appointment/waitlist entry) id → teacher id.
    pub(super) entity_to_teacher: DashMap<Ulid, Ulid>,
    /// Idempotency key → appointment id. Unique across the tenant.
    pub(super) idempotency: DashMap<String, Ulid>,
}

pub struct Engine {
    pub(super) teachers: DashMap<Ulid, SharedTeacherState>,
    pub(super) students: DashMap<Ulid, SharedStudentState>,
    pub(super) subjects: DashMap<Ulid, Subject>,
    pub(super) subject_names: DashMap<String, Ulid>,
    pub(super) policies: DashMap<ServiceTier, ServicePolicy>,
    pub(super) index: Indexes,
    /// Waitlist entries claimed by an in-flight promotion.
    pub(super) claims: DashSet<Ulid>,
    /// Idempotency keys of bookings in flight.
    pub(super) pending_keys: DashSet<String>,
    /// Serializes creation of teachers, students and subjects.
    pub(super) admin: Mutex<()>,
    /// Writers hold it shared for a whole operation; compaction takes it
    /// exclusively so the snapshot sees no half-applied event.
    pub(super) commit_gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) max_promotion_attempts: u32,
}

/// Teacher id an event belongs to, for events applied under a teacher lock.
fn event_teacher_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::RuleAdded(rule) => Some(rule.teacher_id),
        Event::BlockAdded(block) => Some(block.teacher_id),
        Event::WaitlistJoined(entry) => Some(entry.teacher_id),
        Event::AppointmentBooked { appointment, .. } | Event::WaitlistPromoted { appointment, .. } => {
            Some(appointment.teacher_id)
        }
        Event::RulesReplaced { teacher_id, .. }
        | Event::RuleActiveSet { teacher_id, .. }
        | Event::RuleRemoved { teacher_id, .. }
        | Event::BlockRemoved { teacher_id, .. }
        | Event::AppointmentStatusChanged { teacher_id, .. }
        | Event::WaitlistRemoved { teacher_id, .. } => Some(*teacher_id),
        Event::TeacherUpserted(profile) => Some(profile.id),
        Event::SubjectCreated(_) | Event::PolicySet(_) | Event::StudentUpserted(_) | Event::QuotaReset { .. } => None,
    }
}

fn put_appointment(ts: &mut TeacherState, appointment: &Appointment, index: &Indexes) {
    if let Some(old) = ts.upsert_appointment(appointment.clone())
        && old.idempotency_key != appointment.idempotency_key
    {
        index.idempotency.remove(&old.idempotency_key);
    }
    index
        .idempotency
        .insert(appointment.idempotency_key.clone(), appointment.id);
    index.entity_to_teacher.insert(appointment.id, appointment.teacher_id);
}

fn drop_waitlist(ts: &mut TeacherState, ids: &[Ulid], index: &Indexes) {
    ts.remove_waitlist(ids);
    for id in ids {
        index.entity_to_teacher.remove(id);
    }
}

/// Apply an event directly to a TeacherState (caller holds the lock).
fn apply_to_teacher(ts: &mut TeacherState, event: &Event, index: &Indexes) {
    match event {
        Event::TeacherUpserted(profile) => ts.profile = profile.clone(),
        Event::RuleAdded(rule) => {
            ts.insert_rule(rule.clone());
            index.entity_to_teacher.insert(rule.id, rule.teacher_id);
        }
        Event::RulesReplaced { removed, rule, .. } => {
            for id in removed {
                ts.remove_rule(*id);
                index.entity_to_teacher.remove(id);
            }
            ts.insert_rule(rule.clone());
            index.entity_to_teacher.insert(rule.id, rule.teacher_id);
        }
        Event::RuleActiveSet { id, active, .. } => {
            if let Some(rule) = ts.rule_mut(*id) {
                rule.active = *active;
            }
        }
        Event::RuleRemoved { id, .. } => {
            ts.remove_rule(*id);
            index.entity_to_teacher.remove(id);
        }
        Event::BlockAdded(block) => {
            ts.insert_block(block.clone());
            index.entity_to_teacher.insert(block.id, block.teacher_id);
        }
        Event::BlockRemoved { id, .. } => {
            ts.remove_block(*id);
            index.entity_to_teacher.remove(id);
        }
        Event::AppointmentBooked { appointment, removed, .. } => {
            drop_waitlist(ts, removed, index);
            put_appointment(ts, appointment, index);
        }
        Event::AppointmentStatusChanged { id, status, at, .. } => {
            if let Some(appt) = ts.appointment_mut(*id) {
                appt.status = *status;
                if *status == AppointmentStatus::Approved {
                    appt.approved_at = Some(*at);
                }
            }
        }
        Event::WaitlistJoined(entry) => {
            ts.insert_waitlist(entry.clone());
            index.entity_to_teacher.insert(entry.id, entry.teacher_id);
        }
        Event::WaitlistRemoved { ids, .. } => drop_waitlist(ts, ids, index),
        Event::WaitlistPromoted { appointment, removed, .. } => {
            drop_waitlist(ts, removed, index);
            put_appointment(ts, appointment, index);
        }
        Event::SubjectCreated(_) | Event::PolicySet(_) | Event::StudentUpserted(_) | Event::QuotaReset { .. } => {}
    }
}

/// Apply the student-side part of an event (caller holds the student lock).
fn apply_to_student(sp: &mut StudentProfile, event: &Event) {
    match event {
        Event::StudentUpserted(profile) => *sp = profile.clone(),
        Event::QuotaReset {
            expected_last_reset,
            last_reset,
            ..
        } => {
            if sp.last_reset == *expected_last_reset {
                sp.monthly_used = 0;
                sp.last_reset = *last_reset;
            }
        }
        Event::AppointmentBooked { usage: Some(usage), .. } | Event::WaitlistPromoted { usage, .. } => {
            if usage.student_id == sp.id {
                sp.monthly_used = usage.monthly_used;
                sp.last_reset = usage.last_reset;
            }
        }
        _ => {}
    }
}

fn event_student_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::StudentUpserted(profile) => Some(profile.id),
        Event::QuotaReset { student_id, .. } => Some(*student_id),
        Event::AppointmentBooked { usage: Some(usage), .. } | Event::WaitlistPromoted { usage, .. } => {
            Some(usage.student_id)
        }
        _ => None,
    }
}

/// Notification published once `event` is committed and applied.
fn notification_for(ts: &TeacherState, event: &Event) -> Option<Notification> {
    match event {
        Event::AppointmentBooked { appointment, .. } => {
            Some(Notification::new(NotificationKind::Booked, appointment))
        }
        Event::WaitlistPromoted { appointment, .. } => {
            Some(Notification::new(NotificationKind::WaitlistPromoted, appointment))
        }
        Event::AppointmentStatusChanged { id, status, .. } => ts
            .appointment(*id)
            .map(|a| Notification::new(NotificationKind::for_transition(*status), a)),
        _ => None,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if replay.discarded_tail {
            warn!(path = %wal_path.display(), "discarded damaged WAL tail");
        }
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            teachers: DashMap::new(),
            students: DashMap::new(),
            subjects: DashMap::new(),
            subject_names: DashMap::new(),
            policies: DashMap::new(),
            index: Indexes::default(),
            claims: DashSet::new(),
            pending_keys: DashSet::new(),
            admin: Mutex::new(()),
            commit_gate: RwLock::new(()),
            wal_tx,
            notify,
            max_promotion_attempts: DEFAULT_MAX_PROMOTION_ATTEMPTS,
        };

        // Replay into plain maps first; nothing else can see them yet.
        let mut teachers: HashMap<Ulid, TeacherState> = HashMap::new();
        let mut students: HashMap<Ulid, StudentProfile> = HashMap::new();
        for event in &replay.events {
            match event {
                Event::SubjectCreated(subject) => engine.insert_subject(subject.clone()),
                Event::PolicySet(policy) => {
                    engine.policies.insert(policy.tier, policy.clone());
                }
                Event::TeacherUpserted(profile) => {
                    teachers
                        .entry(profile.id)
                        .and_modify(|ts| ts.profile = profile.clone())
                        .or_insert_with(|| TeacherState::new(profile.clone()));
                }
                Event::StudentUpserted(profile) => {
                    students.insert(profile.id, profile.clone());
                }
                other => {
                    if let Some(tid) = event_teacher_id(other)
                        && let Some(ts) = teachers.get_mut(&tid)
                    {
                        apply_to_teacher(ts, other, &engine.index);
                    }
                    if let Some(sid) = event_student_id(other)
                        && let Some(sp) = students.get_mut(&sid)
                    {
                        apply_to_student(sp, other);
                    }
                }
            }
        }
        for (id, ts) in teachers {
            engine.teachers.insert(id, Arc::new(RwLock::new(ts)));
        }
        for (id, sp) in students {
            engine.students.insert(id, Arc::new(Mutex::new(sp)));
        }

        Ok(engine)
    }

    /// Override the promotion retry bound (clamped to at least one).
    pub fn with_max_promotion_attempts(mut self, attempts: u32) -> Self {
        self.max_promotion_attempts = attempts.max(1);
        self
    }

    fn insert_subject(&self, subject: Subject) {
        self.subject_names.insert(subject.name.clone(), subject.id);
        self.subjects.insert(subject.id, subject);
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    pub(super) fn teacher_state(&self, id: &Ulid) -> Result<SharedTeacherState, EngineError> {
        self.teachers
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(*id))
    }

    pub(super) fn student_state(&self, id: &Ulid) -> Result<SharedStudentState, EngineError> {
        self.students
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(*id))
    }

    pub(super) fn teacher_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.index.entity_to_teacher.get(entity_id).map(|e| *e.value())
    }

    pub(super) fn subject_by_name(&self, name: &str) -> Option<Subject> {
        let id = *self.subject_names.get(name.trim())?.value();
        self.subjects.get(&id).map(|s| s.value().clone())
    }

    pub(super) fn policy_for(&self, tier: ServiceTier) -> ServicePolicy {
        self.policies
            .get(&tier)
            .map(|p| p.value().clone())
            .unwrap_or_else(|| default_policy(tier))
    }

    /// WAL-append + apply + notify in one call. The caller holds the teacher
    /// write lock, and the student lock when the event carries usage.
    pub(super) async fn persist_and_apply(
        &self,
        ts: &mut TeacherState,
        student: Option<&mut StudentProfile>,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_teacher(ts, event, &self.index);
        if let Some(sp) = student {
            apply_to_student(sp, event);
        }
        if let Some(n) = notification_for(ts, event) {
            self.notify.send(n);
        }
        Ok(())
    }

    /// WAL-append + apply for events that touch only a student row.
    pub(super) async fn persist_student(&self, sp: &mut StudentProfile, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_student(sp, event);
        Ok(())
    }

    /// Lookup entity → teacher, get the teacher, acquire its write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<TeacherState>), EngineError> {
        let teacher_id = self
            .teacher_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let shared = self.teacher_state(&teacher_id)?;
        let guard = shared.write_owned().await;
        Ok((teacher_id, guard))
    }
}
