use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, oneshot};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::calendar::{self, MINUTE_MS};
use crate::limits::*;
use crate::model::*;

use super::availability::{self, RuleProposal, RuleValidation, RuleWarning};
use super::conflict::{self, validate_instant, validate_span};
use super::promotion::ClaimGuard;
use super::store::TeacherState;
use super::{Engine, EngineError, RejectReason, SharedStudentState, SharedTeacherState, WalCommand, access, policy};

/// A student's request for one meeting.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub student_id: Ulid,
    pub teacher_id: Ulid,
    /// Subject name, resolved at booking time.
    pub subject: String,
    pub slot: Ms,
    pub duration_min: u32,
    pub idempotency_key: String,
}

/// What `add_availability_rule` does with partial overlaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnConflict {
    Reject,
    /// Replace the proposal and every partially overlapping rule with their union.
    Merge,
}

#[derive(Debug, Clone)]
pub struct AddedRule {
    pub rule: WeeklyRule,
    /// Rules deleted by a merge.
    pub replaced: Vec<Ulid>,
    pub validation: RuleValidation,
}

#[derive(Debug, Clone)]
pub struct AddedBlock {
    pub block: BlockedInterval,
    pub warnings: Vec<RuleWarning>,
}

#[derive(Debug, Clone)]
pub struct StudentUpsert {
    pub id: Ulid,
    pub name: Option<String>,
    pub tier: ServiceTier,
    pub subjects: Vec<Ulid>,
}

fn check_name(name: &str, what: &str) -> Result<String, EngineError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EngineError::Validation(format!("{what} must not be empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(name.to_string())
}

fn check_weekday(weekday: u8) -> Result<(), EngineError> {
    if weekday > 6 {
        return Err(EngineError::Validation(format!("weekday {weekday} is outside 0..=6")));
    }
    Ok(())
}

fn invalid_window(validation: &RuleValidation) -> EngineError {
    let message = validation
        .conflicts
        .first()
        .map(|c| c.message.clone())
        .unwrap_or_else(|| "invalid window".into());
    EngineError::InvalidTime(message)
}

fn new_rule(teacher_id: Ulid, weekday: u8, start: calendar::TimeOfDay, end: calendar::TimeOfDay) -> WeeklyRule {
    WeeklyRule {
        id: Ulid::new(),
        teacher_id,
        weekday,
        start,
        end,
        active: true,
    }
}

impl Engine {
    // ── Reference data ───────────────────────────────────────

    pub async fn create_subject(&self, name: &str) -> Result<Subject, EngineError> {
        let name = check_name(name, "subject name")?;
        let _gate = self.commit_gate.read().await;
        let _admin = self.admin.lock().await;
        if self.subject_names.contains_key(&name) {
            return Err(EngineError::AlreadyExists(format!("subject {name}")));
        }
        if self.subjects.len() >= MAX_SUBJECTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many subjects"));
        }
        let subject = Subject { id: Ulid::new(), name };
        self.wal_append(&Event::SubjectCreated(subject.clone())).await?;
        self.insert_subject(subject.clone());
        Ok(subject)
    }

    /// Deduplicate subject ids, keeping first-seen order; every id must exist.
    fn known_subjects(&self, ids: &[Ulid]) -> Result<Vec<Ulid>, EngineError> {
        let mut out: Vec<Ulid> = Vec::with_capacity(ids.len());
        for id in ids {
            if !self.subjects.contains_key(id) {
                return Err(EngineError::NotFound(*id));
            }
            if !out.contains(id) {
                out.push(*id);
            }
        }
        if out.len() > MAX_SUBJECTS_PER_PROFILE {
            return Err(EngineError::LimitExceeded("too many subjects on profile"));
        }
        Ok(out)
    }

    /// Create or replace a teacher profile. Existing rows are untouched.
    pub async fn upsert_teacher(&self, mut profile: TeacherProfile) -> Result<TeacherProfile, EngineError> {
        if profile.buffer_min > MAX_BUFFER_MINUTES {
            return Err(EngineError::LimitExceeded("buffer too long"));
        }
        if !(1..=MAX_DAILY_MEETINGS).contains(&profile.max_daily_meetings) {
            return Err(EngineError::Validation(format!(
                "max_daily_meetings must be 1..={MAX_DAILY_MEETINGS}"
            )));
        }
        if !(MIN_UTC_OFFSET_MIN..=MAX_UTC_OFFSET_MIN).contains(&profile.utc_offset_min) {
            return Err(EngineError::InvalidTime(format!(
                "utc offset {} minutes is out of range",
                profile.utc_offset_min
            )));
        }
        profile.name = profile.name.as_deref().map(|n| check_name(n, "teacher name")).transpose()?;
        profile.subjects = self.known_subjects(&profile.subjects)?;

        let _gate = self.commit_gate.read().await;
        let _admin = self.admin.lock().await;
        let event = Event::TeacherUpserted(profile.clone());
        if let Ok(shared) = self.teacher_state(&profile.id) {
            let mut ts = shared.write().await;
            self.persist_and_apply(&mut ts, None, &event).await?;
        } else {
            if self.teachers.len() >= MAX_TEACHERS_PER_TENANT {
                return Err(EngineError::LimitExceeded("too many teachers"));
            }
            self.wal_append(&event).await?;
            let state: SharedTeacherState = Arc::new(RwLock::new(TeacherState::new(profile.clone())));
            self.teachers.insert(profile.id, state);
        }
        debug!(teacher_id = %profile.id, "teacher upserted");
        Ok(profile)
    }

    /// Create or replace a student profile. Quota usage carries over.
    pub async fn upsert_student(&self, req: StudentUpsert) -> Result<StudentProfile, EngineError> {
        let name = req.name.as_deref().map(|n| check_name(n, "student name")).transpose()?;
        let subjects = self.known_subjects(&req.subjects)?;

        let _gate = self.commit_gate.read().await;
        let _admin = self.admin.lock().await;
        if let Ok(shared) = self.student_state(&req.id) {
            let mut sp = shared.lock().await;
            let profile = StudentProfile {
                id: req.id,
                name,
                tier: req.tier,
                monthly_used: sp.monthly_used,
                last_reset: sp.last_reset,
                subjects,
            };
            self.persist_student(&mut sp, &Event::StudentUpserted(profile.clone()))
                .await?;
            return Ok(profile);
        }

        if self.students.len() >= MAX_STUDENTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many students"));
        }
        let mut profile = StudentProfile::new(req.id, req.tier, calendar::now_ms());
        profile.name = name;
        profile.subjects = subjects;
        self.wal_append(&Event::StudentUpserted(profile.clone())).await?;
        let state: SharedStudentState = Arc::new(Mutex::new(profile.clone()));
        self.students.insert(profile.id, state);
        Ok(profile)
    }

    /// Store the policy record for a tier, replacing the built-in default.
    pub async fn set_policy(&self, policy: ServicePolicy) -> Result<(), EngineError> {
        if policy.expire_hours == 0 {
            return Err(EngineError::Validation("expire_hours must be positive".into()));
        }
        let _gate = self.commit_gate.read().await;
        self.wal_append(&Event::PolicySet(policy.clone())).await?;
        self.policies.insert(policy.tier, policy);
        Ok(())
    }

    // ── Weekly availability ──────────────────────────────────

    /// Validate and store a weekly rule.
    ///
    /// With `OnConflict::Merge`, a proposal whose only conflicts are partial
    /// overlaps replaces those rules with one rule spanning their union, in a
    /// single WAL record. Every other conflict fails with `RuleConflict`.
    pub async fn add_availability_rule(
        &self,
        teacher_id: Ulid,
        proposal: RuleProposal,
        on_conflict: OnConflict,
    ) -> Result<AddedRule, EngineError> {
        check_weekday(proposal.weekday)?;
        let _gate = self.commit_gate.read().await;
        let shared = self.teacher_state(&teacher_id)?;
        let mut ts = shared.write().await;
        if ts.rules.len() >= MAX_RULES_PER_TEACHER {
            return Err(EngineError::LimitExceeded("too many rules on teacher"));
        }

        let validation = availability::validate_rule(&ts, &proposal, None, calendar::now_ms());
        let Some((start, end)) = validation.window else {
            return Err(invalid_window(&validation));
        };

        if validation.is_ok() {
            let rule = new_rule(teacher_id, proposal.weekday, start, end);
            self.persist_and_apply(&mut ts, None, &Event::RuleAdded(rule.clone()))
                .await?;
            return Ok(AddedRule {
                rule,
                replaced: Vec::new(),
                validation,
            });
        }

        if on_conflict == OnConflict::Merge && validation.can_merge() {
            let (start, end) = availability::merged_window(&ts, &validation.overlapping, start, end);
            let minutes = u32::from(end.minutes() - start.minutes());
            if minutes > MAX_RULE_MINUTES {
                return Err(EngineError::Validation(format!(
                    "merged window {start}-{end} is {minutes} minutes, over {MAX_RULE_MINUTES}"
                )));
            }
            let rule = new_rule(teacher_id, proposal.weekday, start, end);
            let replaced = validation.overlapping.clone();
            let event = Event::RulesReplaced {
                teacher_id,
                removed: replaced.clone(),
                rule: rule.clone(),
            };
            self.persist_and_apply(&mut ts, None, &event).await?;
            info!(%teacher_id, rule_id = %rule.id, merged = replaced.len(), "availability rules merged");
            return Ok(AddedRule {
                rule,
                replaced,
                validation,
            });
        }

        Err(EngineError::RuleConflict(Box::new(validation)))
    }

    /// Replace a rule's window and weekday, keeping its id and active flag.
    /// An inactive rule may be moved onto a conflicting window.
    pub async fn update_availability_rule(
        &self,
        rule_id: Ulid,
        proposal: RuleProposal,
    ) -> Result<WeeklyRule, EngineError> {
        check_weekday(proposal.weekday)?;
        let _gate = self.commit_gate.read().await;
        let (teacher_id, mut ts) = self.resolve_entity_write(&rule_id).await?;
        let existing = ts.rule(rule_id).cloned().ok_or(EngineError::NotFound(rule_id))?;

        let validation = availability::validate_rule(&ts, &proposal, Some(rule_id), calendar::now_ms());
        let Some((start, end)) = validation.window else {
            return Err(invalid_window(&validation));
        };
        if existing.active && !validation.is_ok() {
            return Err(EngineError::RuleConflict(Box::new(validation)));
        }

        let rule = WeeklyRule {
            id: rule_id,
            teacher_id,
            weekday: proposal.weekday,
            start,
            end,
            active: existing.active,
        };
        let event = Event::RulesReplaced {
            teacher_id,
            removed: vec![rule_id],
            rule: rule.clone(),
        };
        self.persist_and_apply(&mut ts, None, &event).await?;
        Ok(rule)
    }

    pub async fn remove_availability_rule(&self, rule_id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let (teacher_id, mut ts) = self.resolve_entity_write(&rule_id).await?;
        if ts.rule(rule_id).is_none() {
            return Err(EngineError::NotFound(rule_id));
        }
        let event = Event::RuleRemoved { id: rule_id, teacher_id };
        self.persist_and_apply(&mut ts, None, &event).await
    }

    /// Toggle a rule. Re-activation is validated like a new rule.
    pub async fn set_rule_active(&self, rule_id: Ulid, active: bool) -> Result<WeeklyRule, EngineError> {
        let _gate = self.commit_gate.read().await;
        let (teacher_id, mut ts) = self.resolve_entity_write(&rule_id).await?;
        let mut rule = ts.rule(rule_id).cloned().ok_or(EngineError::NotFound(rule_id))?;
        if rule.active == active {
            return Ok(rule);
        }
        if active {
            let proposal = RuleProposal::new(rule.weekday, rule.start.to_string(), rule.end.to_string());
            let validation = availability::validate_rule(&ts, &proposal, Some(rule_id), calendar::now_ms());
            if !validation.is_ok() {
                return Err(EngineError::RuleConflict(Box::new(validation)));
            }
        }
        let event = Event::RuleActiveSet {
            id: rule_id,
            teacher_id,
            active,
        };
        self.persist_and_apply(&mut ts, None, &event).await?;
        rule.active = active;
        Ok(rule)
    }

    // ── Blocked intervals ────────────────────────────────────

    /// Block an absolute interval. Overlaps with weekly rules come back as
    /// warnings; they never reject the block.
    pub async fn add_blocked_interval(
        &self,
        teacher_id: Ulid,
        span: Span,
        reason: Option<String>,
    ) -> Result<AddedBlock, EngineError> {
        validate_span(&span)?;
        let reason = reason.map(|r| r.trim().to_string()).filter(|r| !r.is_empty());
        if reason.as_ref().is_some_and(|r| r.len() > MAX_REASON_LEN) {
            return Err(EngineError::LimitExceeded("reason too long"));
        }

        let _gate = self.commit_gate.read().await;
        let shared = self.teacher_state(&teacher_id)?;
        let mut ts = shared.write().await;
        if ts.blocks.len() >= MAX_BLOCKS_PER_TEACHER {
            return Err(EngineError::LimitExceeded("too many blocked intervals on teacher"));
        }
        let warnings = availability::rules_hit_by_block(&ts, &span);
        let block = BlockedInterval {
            id: Ulid::new(),
            teacher_id,
            span,
            reason,
        };
        self.persist_and_apply(&mut ts, None, &Event::BlockAdded(block.clone()))
            .await?;
        Ok(AddedBlock { block, warnings })
    }

    pub async fn remove_blocked_interval(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let (teacher_id, mut ts) = self.resolve_entity_write(&id).await?;
        if !ts.blocks.iter().any(|b| b.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::BlockRemoved { id, teacher_id };
        self.persist_and_apply(&mut ts, None, &event).await
    }

    // ── Booking ──────────────────────────────────────────────

    /// Book a meeting, or return the earlier outcome for a repeated
    /// idempotency key.
    pub async fn create_appointment(&self, req: BookingRequest) -> Result<BookingOutcome, EngineError> {
        let _gate = self.commit_gate.read().await;
        let result = self.book(&req, calendar::now_ms()).await;
        let outcome = match &result {
            Ok(o) => o.status.as_str(),
            Err(e) => e.code(),
        };
        metrics::counter!(crate::observability::BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn outcome_for_key(&self, key: &str) -> Option<BookingOutcome> {
        let id = *self.index.idempotency.get(key)?.value();
        let shared = self.teacher_state(&self.teacher_for_entity(&id)?).ok()?;
        let ts = shared.read().await;
        let appt = ts.appointment(id)?;
        Some(BookingOutcome {
            appointment_id: appt.id,
            status: appt.status,
            approval_required: appt.approval_required,
        })
    }

    async fn book(&self, req: &BookingRequest, now: Ms) -> Result<BookingOutcome, EngineError> {
        if !(MIN_APPOINTMENT_MINUTES..=MAX_APPOINTMENT_MINUTES).contains(&req.duration_min) {
            return Err(EngineError::Validation(format!(
                "duration must be {MIN_APPOINTMENT_MINUTES}..={MAX_APPOINTMENT_MINUTES} minutes"
            )));
        }
        let key = req.idempotency_key.as_str();
        if key.trim().is_empty() {
            return Err(EngineError::Validation("idempotency key must not be empty".into()));
        }
        if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(EngineError::LimitExceeded("idempotency key too long"));
        }
        validate_instant(req.slot)?;
        if req.slot < now {
            return Err(EngineError::Validation("slot is in the past".into()));
        }
        let start = calendar::floor_to_minute(req.slot);

        if let Some(outcome) = self.outcome_for_key(key).await {
            return Ok(outcome);
        }
        let Some(_in_flight) = ClaimGuard::try_claim(&self.pending_keys, key.to_string()) else {
            return Err(EngineError::AlreadyExists(format!("booking {key} is in flight")));
        };
        // the winner of a concurrent duplicate may have committed meanwhile
        if let Some(outcome) = self.outcome_for_key(key).await {
            return Ok(outcome);
        }

        let teacher = self.teacher_state(&req.teacher_id)?;
        let student = self.student_state(&req.student_id)?;
        let mut ts = teacher.write().await;
        let mut sp = student.lock().await;

        let subject = self
            .subject_by_name(&req.subject)
            .ok_or(RejectReason::SubjectMismatch)?;
        conflict::check_subject(&ts, &sp, subject.id)?;

        let span = Span::new(start, start + Ms::from(req.duration_min) * MINUTE_MS);
        if !availability::slot_is_available(&ts, &span) {
            return Err(RejectReason::SlotUnavailable.into());
        }
        conflict::check_booking(&ts, &span)?;

        let reused = match ts.appointment_at(start) {
            Some(a) if a.is_occupying() => return Err(RejectReason::SlotTaken.into()),
            Some(a) => Some(a.id),
            None => None,
        };
        if reused.is_none() && ts.appointments.len() >= MAX_APPOINTMENTS_PER_TEACHER {
            return Err(EngineError::LimitExceeded("too many appointments on teacher"));
        }

        self.roll_month(&mut sp, now).await?;
        let decision = policy::decide(&self.policy_for(sp.tier), sp.monthly_used);
        if decision.quota_exceeded {
            return Err(RejectReason::QuotaExceeded.into());
        }

        let approved = decision.status == AppointmentStatus::Approved;
        let appointment = Appointment {
            id: reused.unwrap_or_else(Ulid::new),
            student_id: sp.id,
            teacher_id: ts.id(),
            subject_id: subject.id,
            start,
            duration_min: req.duration_min,
            status: decision.status,
            approval_required: decision.approval_required,
            approved_at: approved.then_some(now),
            idempotency_key: key.to_string(),
            created_at: now,
        };
        let usage = UsageUpdate {
            student_id: sp.id,
            monthly_used: sp.monthly_used.saturating_add(1),
            last_reset: sp.last_reset,
        };
        let removed: Vec<Ulid> = ts
            .waiting_for(start)
            .filter(|e| e.student_id == sp.id)
            .map(|e| e.id)
            .collect();
        let event = Event::AppointmentBooked {
            appointment: appointment.clone(),
            usage: Some(usage),
            removed,
        };
        self.persist_and_apply(&mut ts, Some(&mut *sp), &event).await?;

        info!(
            appointment_id = %appointment.id,
            teacher_id = %appointment.teacher_id,
            student_id = %appointment.student_id,
            start,
            status = %appointment.status,
            reused = reused.is_some(),
            "appointment booked"
        );
        Ok(BookingOutcome {
            appointment_id: appointment.id,
            status: appointment.status,
            approval_required: appointment.approval_required,
        })
    }

    // ── Lifecycle ────────────────────────────────────────────

    pub async fn approve_appointment(&self, principal: &Principal, id: Ulid) -> Result<TransitionOutcome, EngineError> {
        self.transition(principal, id, AppointmentStatus::Approved).await
    }

    /// Reject a pending booking; the freed slot goes to the waitlist.
    pub async fn reject_appointment(&self, principal: &Principal, id: Ulid) -> Result<TransitionOutcome, EngineError> {
        self.transition(principal, id, AppointmentStatus::Rejected).await
    }

    /// Cancel a booking; the freed slot goes to the waitlist.
    pub async fn cancel_appointment(&self, principal: &Principal, id: Ulid) -> Result<TransitionOutcome, EngineError> {
        self.transition(principal, id, AppointmentStatus::Cancelled).await
    }

    pub async fn complete_appointment(&self, principal: &Principal, id: Ulid) -> Result<TransitionOutcome, EngineError> {
        self.transition(principal, id, AppointmentStatus::Completed).await
    }

    pub async fn mark_no_show(&self, principal: &Principal, id: Ulid) -> Result<TransitionOutcome, EngineError> {
        self.transition(principal, id, AppointmentStatus::NoShow).await
    }

    async fn transition(
        &self,
        principal: &Principal,
        id: Ulid,
        to: AppointmentStatus,
    ) -> Result<TransitionOutcome, EngineError> {
        let _gate = self.commit_gate.read().await;
        self.transition_locked(Some(principal), id, to, calendar::now_ms()).await
    }

    /// Move an appointment to `to`, then promote from the waitlist if the
    /// slot was freed. `principal` is `None` only for the expiry sweep.
    /// The caller holds the commit gate.
    async fn transition_locked(
        &self,
        principal: Option<&Principal>,
        id: Ulid,
        to: AppointmentStatus,
        now: Ms,
    ) -> Result<TransitionOutcome, EngineError> {
        let (teacher_id, mut ts) = self.resolve_entity_write(&id).await?;
        let appt = ts.appointment(id).cloned().ok_or(EngineError::NotFound(id))?;
        if let Some(p) = principal {
            access::authorize_transition(p, &appt, to)?;
        }
        if !appt.status.can_transition_to(to) {
            return Err(EngineError::InvalidTransition { from: appt.status, to });
        }
        let event = Event::AppointmentStatusChanged {
            id,
            teacher_id,
            status: to,
            at: now,
        };
        self.persist_and_apply(&mut ts, None, &event).await?;
        drop(ts);
        info!(appointment_id = %id, %teacher_id, from = %appt.status, to = %to, "appointment transitioned");

        let mut promotion = None;
        if to.frees_slot() {
            let subject = self.subjects.get(&appt.subject_id).map(|s| s.name.clone());
            if let Some(subject) = subject {
                match self
                    .promote_locked(teacher_id, appt.start, &subject, Some(appt.student_id), now)
                    .await
                {
                    Ok(p) => promotion = Some(p),
                    Err(e) => warn!(appointment_id = %id, error = %e, "waitlist promotion failed"),
                }
            }
        }
        Ok(TransitionOutcome {
            appointment_id: id,
            status: to,
            promotion,
        })
    }

    /// Expire pending bookings older than their tier's `expire_hours`.
    /// Each expiry is its own transaction and promotes from the waitlist.
    pub async fn expire_stale_appointments(&self, now: Ms) -> Result<usize, EngineError> {
        let teachers: Vec<SharedTeacherState> = self.teachers.iter().map(|e| e.value().clone()).collect();
        let mut candidates: Vec<(Ulid, Ulid, Ms)> = Vec::new();
        for shared in teachers {
            let ts = shared.read().await;
            candidates.extend(
                ts.appointments
                    .iter()
                    .filter(|a| a.status == AppointmentStatus::Pending)
                    .map(|a| (a.id, a.student_id, a.created_at)),
            );
        }

        let mut expired = 0usize;
        for (id, student_id, created_at) in candidates {
            let tier = match self.student_state(&student_id) {
                Ok(student) => {
                    let sp = student.lock().await;
                    sp.tier
                }
                Err(_) => ServiceTier::Level1,
            };
            let ttl = Ms::from(self.policy_for(tier).expire_hours) * 3_600_000;
            if created_at + ttl > now {
                continue;
            }
            let _gate = self.commit_gate.read().await;
            match self.transition_locked(None, id, AppointmentStatus::Expired, now).await {
                Ok(_) => expired += 1,
                Err(EngineError::InvalidTransition { .. } | EngineError::NotFound(_)) => {
                    debug!(appointment_id = %id, "expiry candidate moved on");
                }
                Err(e) => return Err(e),
            }
        }

        if expired > 0 {
            metrics::counter!(crate::observability::APPOINTMENTS_EXPIRED_TOTAL).increment(expired as u64);
            info!(expired, "expired stale pending appointments");
        }
        self.prune_past_waitlist(now).await?;
        Ok(expired)
    }

    /// Drop waitlist entries whose slot has already started; nothing can
    /// promote them any more.
    async fn prune_past_waitlist(&self, now: Ms) -> Result<usize, EngineError> {
        let _gate = self.commit_gate.read().await;
        let teachers: Vec<SharedTeacherState> = self.teachers.iter().map(|e| e.value().clone()).collect();
        let mut pruned = 0usize;
        for shared in teachers {
            let mut ts = shared.write().await;
            let stale: Vec<Ulid> = ts.waitlist.iter().filter(|e| e.slot < now).map(|e| e.id).collect();
            if stale.is_empty() {
                continue;
            }
            pruned += stale.len();
            let teacher_id = ts.id();
            self.drop_entries(&mut ts, teacher_id, stale).await?;
        }
        if pruned > 0 {
            metrics::counter!(crate::observability::WAITLIST_PRUNED_TOTAL).increment(pruned as u64);
            info!(pruned, "dropped waitlist entries for past slots");
        }
        Ok(pruned)
    }

    // ── Waitlist ─────────────────────────────────────────────

    /// Queue a student for a slot. The entry waits until the slot is freed.
    pub async fn join_waitlist(
        &self,
        student_id: Ulid,
        teacher_id: Ulid,
        slot: Ms,
        duration_min: Option<u32>,
    ) -> Result<WaitlistEntry, EngineError> {
        let duration_min = duration_min.unwrap_or(DEFAULT_WAITLIST_MINUTES);
        if !(MIN_APPOINTMENT_MINUTES..=MAX_APPOINTMENT_MINUTES).contains(&duration_min) {
            return Err(EngineError::Validation(format!(
                "duration must be {MIN_APPOINTMENT_MINUTES}..={MAX_APPOINTMENT_MINUTES} minutes"
            )));
        }
        validate_instant(slot)?;
        let now = calendar::now_ms();
        if slot < now {
            return Err(EngineError::Validation("slot is in the past".into()));
        }
        let slot = calendar::floor_to_minute(slot);

        let _gate = self.commit_gate.read().await;
        let shared = self.teacher_state(&teacher_id)?;
        let tier = self.student_state(&student_id)?.lock().await.tier;
        let mut ts = shared.write().await;
        if ts.waitlist.len() >= MAX_WAITLIST_PER_TEACHER {
            return Err(EngineError::LimitExceeded("waitlist full"));
        }
        if ts.waiting_for(slot).any(|e| e.student_id == student_id) {
            return Err(EngineError::AlreadyExists(format!("student {student_id} already waiting")));
        }
        if ts
            .appointment_at(slot)
            .is_some_and(|a| a.is_occupying() && a.student_id == student_id)
        {
            return Err(EngineError::AlreadyExists(format!("student {student_id} already holds the slot")));
        }
        let date = calendar::local_date(slot, ts.profile.utc_offset_min)
            .ok_or_else(|| EngineError::InvalidTime("slot has no local date".into()))?;

        let entry = WaitlistEntry {
            id: Ulid::new(),
            teacher_id,
            student_id,
            slot,
            date: date.format("%Y-%m-%d").to_string(),
            duration_min,
            priority: tier.priority_score(),
            status: WaitlistStatus::Waiting,
            created_at: now,
        };
        self.persist_and_apply(&mut ts, None, &Event::WaitlistJoined(entry.clone()))
            .await?;
        debug!(entry_id = %entry.id, %teacher_id, %student_id, slot, "joined waitlist");
        Ok(entry)
    }

    pub async fn leave_waitlist(&self, principal: &Principal, entry_id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let (teacher_id, mut ts) = self.resolve_entity_write(&entry_id).await?;
        let entry = ts
            .waitlist_entry(entry_id)
            .cloned()
            .ok_or(EngineError::NotFound(entry_id))?;
        access::authorize_leave(principal, &entry)?;
        let event = Event::WaitlistRemoved {
            teacher_id,
            ids: vec![entry_id],
        };
        self.persist_and_apply(&mut ts, None, &event).await
    }

    // ── Maintenance ──────────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::new();

        events.extend(self.subjects.iter().map(|s| Event::SubjectCreated(s.value().clone())));
        events.extend(self.policies.iter().map(|p| Event::PolicySet(p.value().clone())));

        let students: Vec<SharedStudentState> = self.students.iter().map(|e| e.value().clone()).collect();
        for shared in students {
            events.push(Event::StudentUpserted(shared.lock().await.clone()));
        }

        let teachers: Vec<SharedTeacherState> = self.teachers.iter().map(|e| e.value().clone()).collect();
        for shared in teachers {
            let ts = shared.read().await;
            events.push(Event::TeacherUpserted(ts.profile.clone()));
            events.extend(ts.rules.iter().cloned().map(Event::RuleAdded));
            events.extend(ts.blocks.iter().cloned().map(Event::BlockAdded));
            events.extend(ts.appointments.iter().map(|a| Event::AppointmentBooked {
                appointment: a.clone(),
                usage: None,
                removed: Vec::new(),
            }));
            events.extend(ts.waitlist.iter().cloned().map(Event::WaitlistJoined));
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
