use std::hash::Hash;

use dashmap::DashSet;
use tracing::{debug, info};
use ulid::Ulid;

use crate::calendar::{self, MINUTE_MS};
use crate::model::*;

use super::store::TeacherState;
use super::{Engine, EngineError, SharedTeacherState, conflict, policy};

/// A transient reservation in a concurrent set, released on drop.
///
/// Claiming a waitlist row this way gives "select for update, skip locked":
/// a second claimant sees the row as taken and moves on.
pub(super) struct ClaimGuard<'a, K: Eq + Hash> {
    set: &'a DashSet<K>,
    key: Option<K>,
}

impl<'a, K: Eq + Hash + Clone> ClaimGuard<'a, K> {
    pub(super) fn try_claim(set: &'a DashSet<K>, key: K) -> Option<Self> {
        set.insert(key.clone()).then(|| Self { set, key: Some(key) })
    }

    pub(super) fn key(&self) -> Option<&K> {
        self.key.as_ref()
    }
}

impl<K: Eq + Hash> Drop for ClaimGuard<'_, K> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.set.remove(&key);
        }
    }
}

enum Attempt {
    Promoted(Promotion),
    /// Nothing (left) to promote, or the slot cannot take anyone.
    Stop(&'static str),
    /// The claimed entry was consumed; try the next-oldest.
    Retry,
    /// The claimed entry cannot take this lesson; leave it queued.
    Skip(Ulid),
}

/// Inputs shared by every round of one promotion call.
#[derive(Clone, Copy)]
struct Pass<'a> {
    slot: Ms,
    subject_name: &'a str,
    released_by: Option<Ulid>,
    skipped: &'a [Ulid],
    now: Ms,
}

impl Engine {
    /// Move the oldest eligible waiting student into a freed slot.
    ///
    /// Runs at most `max_promotion_attempts` claim/revalidate rounds. A slot
    /// in the past, an occupied slot, a guard rejection or an empty waitlist
    /// all yield `promoted: 0`. An unknown subject is an error.
    pub async fn promote_for_slot(
        &self,
        teacher_id: Ulid,
        slot: Ms,
        subject_name: &str,
    ) -> Result<Promotion, EngineError> {
        let _gate = self.commit_gate.read().await;
        self.promote_locked(teacher_id, slot, subject_name, None, calendar::now_ms())
            .await
    }

    /// Promotion body; the caller already holds the commit gate.
    /// Entries of `released_by`, the student who just freed the slot, are passed over.
    pub(super) async fn promote_locked(
        &self,
        teacher_id: Ulid,
        slot: Ms,
        subject_name: &str,
        released_by: Option<Ulid>,
        now: Ms,
    ) -> Result<Promotion, EngineError> {
        let slot = calendar::floor_to_minute(slot);
        let shared = self.teacher_state(&teacher_id)?;

        let mut attempts = 0u32;
        let mut stop = "exhausted";
        let mut result = Promotion::none();
        let mut skipped: Vec<Ulid> = Vec::new();
        while attempts < self.max_promotion_attempts {
            attempts += 1;
            let pass = Pass {
                slot,
                subject_name,
                released_by,
                skipped: &skipped,
                now,
            };
            let attempt = self.promotion_attempt(&shared, pass).await?;
            match attempt {
                Attempt::Promoted(p) => {
                    result = p;
                    stop = "promoted";
                    break;
                }
                Attempt::Stop(why) => {
                    stop = why;
                    break;
                }
                Attempt::Retry => {}
                Attempt::Skip(entry_id) => skipped.push(entry_id),
            }
        }

        metrics::histogram!(crate::observability::PROMOTION_ATTEMPTS).record(f64::from(attempts));
        metrics::counter!(crate::observability::PROMOTIONS_TOTAL, "outcome" => stop).increment(1);
        if result.promoted == 0 {
            debug!(%teacher_id, slot, outcome = stop, attempts, "no promotion");
        }
        Ok(result)
    }

    /// Claim the oldest unclaimed waiting entry for the slot that this pass
    /// has not already passed over.
    async fn claim_oldest<'a>(&'a self, shared: &SharedTeacherState, pass: &Pass<'_>) -> Option<ClaimGuard<'a, Ulid>> {
        let ts = shared.read().await;
        let claim = ts
            .waiting_for(pass.slot)
            .filter(|e| Some(e.student_id) != pass.released_by && !pass.skipped.contains(&e.id))
            .find_map(|entry| ClaimGuard::try_claim(&self.claims, entry.id));
        claim
    }

    async fn promotion_attempt(&self, shared: &SharedTeacherState, pass: Pass<'_>) -> Result<Attempt, EngineError> {
        let Pass { slot, subject_name, now, .. } = pass;
        let Some(claim) = self.claim_oldest(shared, &pass).await else {
            return Ok(Attempt::Stop("empty"));
        };
        let Some(entry_id) = claim.key().copied() else {
            return Ok(Attempt::Retry);
        };

        let mut ts = shared.write().await;
        let Some(entry) = ts.waitlist_entry(entry_id).cloned() else {
            debug!(%entry_id, "claimed waitlist entry vanished");
            return Ok(Attempt::Retry);
        };
        if slot < now {
            let stale: Vec<Ulid> = ts.waiting_for(slot).map(|e| e.id).collect();
            self.drop_entries(&mut ts, entry.teacher_id, stale).await?;
            return Ok(Attempt::Stop("past"));
        }
        if ts.appointment_at(slot).is_some_and(|a| a.is_occupying()) {
            return Ok(Attempt::Stop("occupied"));
        }

        let subject = self
            .subject_by_name(subject_name)
            .ok_or_else(|| EngineError::UnknownSubject(subject_name.to_string()))?;
        if !ts.profile.subjects.contains(&subject.id) {
            return Ok(Attempt::Stop("subject_mismatch"));
        }

        let Ok(student) = self.student_state(&entry.student_id) else {
            self.drop_entries(&mut ts, entry.teacher_id, vec![entry.id]).await?;
            return Ok(Attempt::Retry);
        };
        let mut sp = student.lock().await;
        if conflict::check_subject(&ts, &sp, subject.id).is_err() {
            debug!(%entry_id, student_id = %sp.id, subject = %subject.name, "student not enrolled, passing over");
            return Ok(Attempt::Skip(entry_id));
        }
        self.roll_month(&mut sp, now).await?;
        let decision = policy::decide(&self.policy_for(sp.tier), sp.monthly_used);
        if decision.quota_exceeded {
            debug!(student_id = %entry.student_id, "quota exhausted, dropping waitlist entry");
            self.drop_entries(&mut ts, entry.teacher_id, vec![entry.id]).await?;
            return Ok(Attempt::Retry);
        }

        let span = Span::new(slot, slot + Ms::from(entry.duration_min) * MINUTE_MS);
        if let Err(reason) = conflict::check_booking(&ts, &span) {
            debug!(%entry_id, reason = reason.code(), "promotion blocked by guard");
            return Ok(Attempt::Stop("blocked"));
        }

        let key = format!("promo:{}:{slot}:{now}", ts.id());
        if self.index.idempotency.contains_key(&key) {
            return Ok(Attempt::Stop("lost_race"));
        }
        let id = ts.appointment_at(slot).map_or_else(Ulid::new, |a| a.id);
        let approved = decision.status == AppointmentStatus::Approved;
        let appointment = Appointment {
            id,
            student_id: entry.student_id,
            teacher_id: ts.id(),
            subject_id: subject.id,
            start: slot,
            duration_min: entry.duration_min,
            status: decision.status,
            approval_required: decision.approval_required,
            approved_at: approved.then_some(now),
            idempotency_key: key,
            created_at: now,
        };
        let removed: Vec<Ulid> = ts
            .waiting_for(slot)
            .filter(|e| e.student_id == entry.student_id)
            .map(|e| e.id)
            .collect();
        let usage = UsageUpdate {
            student_id: sp.id,
            monthly_used: sp.monthly_used.saturating_add(1),
            last_reset: sp.last_reset,
        };
        let event = Event::WaitlistPromoted {
            appointment: appointment.clone(),
            removed,
            usage,
        };
        self.persist_and_apply(&mut ts, Some(&mut *sp), &event).await?;
        drop(claim);

        info!(
            appointment_id = %appointment.id,
            teacher_id = %appointment.teacher_id,
            student_id = %appointment.student_id,
            slot,
            status = %appointment.status,
            "promoted from waitlist"
        );
        Ok(Attempt::Promoted(Promotion::promoted(&appointment)))
    }

    pub(super) async fn drop_entries(
        &self,
        ts: &mut TeacherState,
        teacher_id: Ulid,
        ids: Vec<Ulid>,
    ) -> Result<(), EngineError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.persist_and_apply(ts, None, &Event::WaitlistRemoved { teacher_id, ids })
            .await
    }

    /// Lazy monthly reset as a compare-and-set on `last_reset`.
    pub(super) async fn roll_month(&self, sp: &mut StudentProfile, now: Ms) -> Result<(), EngineError> {
        if !policy::needs_reset(sp.last_reset, now) {
            return Ok(());
        }
        let event = Event::QuotaReset {
            student_id: sp.id,
            expected_last_reset: sp.last_reset,
            last_reset: now,
        };
        self.persist_student(sp, &event).await
    }
}
