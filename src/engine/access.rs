use crate::model::{Appointment, AppointmentStatus, Principal, Role, WaitlistEntry};

use super::EngineError;

fn is_admin(p: &Principal) -> bool {
    p.role == Role::Admin
}

fn is_owning_teacher(p: &Principal, appt: &Appointment) -> bool {
    p.role == Role::Teacher && p.user_id == appt.teacher_id
}

fn is_owning_student(p: &Principal, appt: &Appointment) -> bool {
    p.role == Role::Student && p.user_id == appt.student_id
}

/// May `principal` move `appt` to `to`?
///
/// Expiry is internal to the sweeper and never granted to a caller.
pub(super) fn authorize_transition(
    principal: &Principal,
    appt: &Appointment,
    to: AppointmentStatus,
) -> Result<(), EngineError> {
    let allowed = match to {
        AppointmentStatus::Approved
        | AppointmentStatus::Rejected
        | AppointmentStatus::Completed
        | AppointmentStatus::NoShow => is_admin(principal) || is_owning_teacher(principal, appt),
        AppointmentStatus::Cancelled => {
            is_admin(principal)
                || is_owning_teacher(principal, appt)
                || is_owning_student(principal, appt)
        }
        AppointmentStatus::Pending | AppointmentStatus::Expired => false,
    };
    if allowed { Ok(()) } else { Err(EngineError::Forbidden) }
}

pub(super) fn authorize_leave(principal: &Principal, entry: &WaitlistEntry) -> Result<(), EngineError> {
    let owner = principal.role == Role::Student && principal.user_id == entry.student_id;
    if owner || is_admin(principal) { Ok(()) } else { Err(EngineError::Forbidden) }
}
