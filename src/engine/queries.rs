use std::time::Instant;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::calendar;
use crate::model::*;

use super::availability::{self, RuleProposal, RuleValidation};
use super::{Engine, EngineError, policy, slots};

impl Engine {
    /// Bookable start instants for `date` in the teacher's offset, ascending.
    ///
    /// `duration_minutes` is normalized first: non-finite, non-positive or
    /// sub-minute values fall back to the default length.
    pub async fn generate_slots(
        &self,
        teacher_id: Ulid,
        date: NaiveDate,
        duration_minutes: f64,
    ) -> Result<Vec<Ms>, EngineError> {
        let duration = slots::normalize_duration(duration_minutes);
        let shared = self.teacher_state(&teacher_id)?;
        let started = Instant::now();
        let ts = shared.read().await;
        let out = slots::generate(&ts, date, duration);
        metrics::histogram!(crate::observability::SLOT_GENERATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        Ok(out)
    }

    /// Dry-run of `add_availability_rule`: conflicts, warnings and suggestions,
    /// nothing stored.
    pub async fn validate_availability_rule(
        &self,
        teacher_id: Ulid,
        proposal: &RuleProposal,
    ) -> Result<RuleValidation, EngineError> {
        if proposal.weekday > 6 {
            return Err(EngineError::Validation(format!(
                "weekday {} is outside 0..=6",
                proposal.weekday
            )));
        }
        let shared = self.teacher_state(&teacher_id)?;
        let ts = shared.read().await;
        Ok(availability::validate_rule(&ts, proposal, None, calendar::now_ms()))
    }

    pub async fn get_teacher(&self, id: Ulid) -> Result<TeacherProfile, EngineError> {
        let shared = self.teacher_state(&id)?;
        let ts = shared.read().await;
        Ok(ts.profile.clone())
    }

    pub async fn get_student(&self, id: Ulid) -> Result<StudentProfile, EngineError> {
        let shared = self.student_state(&id)?;
        let sp = shared.lock().await;
        Ok(sp.clone())
    }

    pub async fn get_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        let teacher_id = self.teacher_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let shared = self.teacher_state(&teacher_id)?;
        let ts = shared.read().await;
        ts.appointment(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// All rules of the teacher, active or not, by weekday then start.
    pub async fn list_rules(&self, teacher_id: Ulid) -> Result<Vec<WeeklyRule>, EngineError> {
        let shared = self.teacher_state(&teacher_id)?;
        let ts = shared.read().await;
        Ok(ts.rules.clone())
    }

    pub async fn list_blocked_intervals(&self, teacher_id: Ulid) -> Result<Vec<BlockedInterval>, EngineError> {
        let shared = self.teacher_state(&teacher_id)?;
        let ts = shared.read().await;
        Ok(ts.blocks.clone())
    }

    pub fn list_subjects(&self) -> Vec<Subject> {
        let mut out: Vec<Subject> = self.subjects.iter().map(|s| s.value().clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Every appointment row starting on the teacher's local `date`, any status.
    pub async fn appointments_on(&self, teacher_id: Ulid, date: NaiveDate) -> Result<Vec<Appointment>, EngineError> {
        let shared = self.teacher_state(&teacher_id)?;
        let ts = shared.read().await;
        let day = calendar::local_day_span(date, ts.profile.utc_offset_min);
        Ok(ts.appointments_starting_in(&day).to_vec())
    }

    /// Waiting entries for one slot in promotion order.
    pub async fn waitlist_for_slot(&self, teacher_id: Ulid, slot: Ms) -> Result<Vec<WaitlistEntry>, EngineError> {
        let slot = calendar::floor_to_minute(slot);
        let shared = self.teacher_state(&teacher_id)?;
        let ts = shared.read().await;
        Ok(ts.waiting_for(slot).cloned().collect())
    }

    /// Current usage against the tier's policy. Rolls the month first, so a
    /// stale counter reads as zero.
    pub async fn quota_status(&self, student_id: Ulid) -> Result<QuotaStatus, EngineError> {
        let _gate = self.commit_gate.read().await;
        let shared = self.student_state(&student_id)?;
        let mut sp = shared.lock().await;
        self.roll_month(&mut sp, calendar::now_ms()).await?;
        let policy = self.policy_for(sp.tier);
        Ok(QuotaStatus {
            tier: sp.tier,
            used: sp.monthly_used,
            cap: policy::effective_cap(&policy),
            auto_approve_remaining: policy::auto_approve_remaining(&policy, sp.monthly_used),
        })
    }
}
