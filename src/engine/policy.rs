use crate::calendar;
use crate::model::*;

/// Built-in policy for a tier with no stored record.
pub fn default_policy(tier: ServiceTier) -> ServicePolicy {
    match tier {
        ServiceTier::Level1 => ServicePolicy {
            tier,
            monthly_auto_approve: 2,
            monthly_cap: Some(10),
            priority: false,
            expire_hours: 24,
        },
        ServiceTier::Level2 => ServicePolicy {
            tier,
            monthly_auto_approve: 0,
            monthly_cap: Some(10),
            priority: false,
            expire_hours: 48,
        },
        ServiceTier::Premium => ServicePolicy {
            tier,
            monthly_auto_approve: u32::MAX,
            monthly_cap: None,
            priority: true,
            expire_hours: 24,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub approval_required: bool,
    pub status: AppointmentStatus,
    pub quota_exceeded: bool,
}

/// Approval and quota decision for a student who has already used `used`
/// meetings this month.
///
/// Premium is unlimited and auto-approved whatever its stored record says.
/// Level 2 always waits for the teacher.
pub fn decide(policy: &ServicePolicy, used: u32) -> Decision {
    let quota_exceeded = match policy.tier {
        ServiceTier::Premium => false,
        _ => policy.monthly_cap.is_some_and(|cap| used >= cap),
    };
    let auto_approved = match policy.tier {
        ServiceTier::Premium => true,
        ServiceTier::Level1 => used < policy.monthly_auto_approve,
        ServiceTier::Level2 => false,
    };
    Decision {
        approval_required: !auto_approved,
        status: if auto_approved {
            AppointmentStatus::Approved
        } else {
            AppointmentStatus::Pending
        },
        quota_exceeded,
    }
}

/// The counter belongs to an earlier UTC month and must restart.
pub fn needs_reset(last_reset: Ms, now: Ms) -> bool {
    last_reset < calendar::month_start(now)
}

/// Auto-approvals left this month; `None` means unlimited.
pub fn auto_approve_remaining(policy: &ServicePolicy, used: u32) -> Option<u32> {
    match policy.tier {
        ServiceTier::Premium => None,
        ServiceTier::Level1 => Some(policy.monthly_auto_approve.saturating_sub(used)),
        ServiceTier::Level2 => Some(0),
    }
}

/// Hard cap in force for the tier; `None` means unlimited.
pub fn effective_cap(policy: &ServicePolicy) -> Option<u32> {
    match policy.tier {
        ServiceTier::Premium => None,
        _ => policy.monthly_cap,
    }
}
