use super::*;
use crate::calendar::{self, MINUTE_MS, local_midnight};
use crate::limits::*;
use chrono::NaiveDate;

const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = MINUTE_MS;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("lessonslot_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 6, 3).unwrap()
}

/// Instant of `h:m` on the test Monday, UTC.
fn at(h: i64, m: i64) -> Ms {
    local_midnight(monday(), 0) + (h * 60 + m) * M
}

fn hm(slots: &[Ms]) -> Vec<String> {
    let midnight = local_midnight(monday(), 0);
    slots
        .iter()
        .map(|s| {
            let m = (s - midnight) / M;
            format!("{:02}:{:02}", m / 60, m % 60)
        })
        .collect()
}

struct Fixture {
    engine: Arc<Engine>,
    teacher: Ulid,
    rule: Ulid,
}

/// One teacher teaching "piano", available Mondays 09:00-12:00.
async fn fixture(name: &str, buffer_min: u32, max_daily: u32) -> Fixture {
    fixture_at(test_wal_path(name), buffer_min, max_daily).await
}

async fn fixture_at(path: PathBuf, buffer_min: u32, max_daily: u32) -> Fixture {
    let engine = Arc::new(Engine::new(path, Arc::new(NotifyHub::new())).unwrap());
    let subject = engine.create_subject("piano").await.unwrap();
    let teacher = Ulid::new();
    let mut profile = TeacherProfile::new(teacher);
    profile.buffer_min = buffer_min;
    profile.max_daily_meetings = max_daily;
    profile.subjects = vec![subject.id];
    engine.upsert_teacher(profile).await.unwrap();
    let added = engine
        .add_availability_rule(teacher, RuleProposal::new(1, "09:00", "12:00"), OnConflict::Reject)
        .await
        .unwrap();
    Fixture {
        engine,
        teacher,
        rule: added.rule.id,
    }
}

async fn student(engine: &Engine, tier: ServiceTier) -> Ulid {
    let id = Ulid::new();
    engine
        .upsert_student(StudentUpsert {
            id,
            name: None,
            tier,
            subjects: Vec::new(),
        })
        .await
        .unwrap();
    id
}

fn request(f: &Fixture, student_id: Ulid, slot: Ms, minutes: u32) -> BookingRequest {
    BookingRequest {
        student_id,
        teacher_id: f.teacher,
        subject: "piano".into(),
        slot,
        duration_min: minutes,
        idempotency_key: Ulid::new().to_string(),
    }
}

async fn book(f: &Fixture, student_id: Ulid, slot: Ms) -> Result<BookingOutcome, EngineError> {
    f.engine.create_appointment(request(f, student_id, slot, 30)).await
}

fn rejected(result: Result<BookingOutcome, EngineError>) -> RejectReason {
    match result {
        Err(EngineError::Rejected(reason)) => reason,
        other => panic!("expected a rejection, got {other:?}"),
    }
}

// ── Slot generation ──────────────────────────────────────

#[tokio::test]
async fn slots_skip_buffered_neighbours_of_a_booking() {
    let f = fixture("slots_buffer.wal", 15, 8).await;
    let s = student(&f.engine, ServiceTier::Premium).await;
    book(&f, s, at(10, 0)).await.unwrap();

    let slots = f.engine.generate_slots(f.teacher, monday(), 30.0).await.unwrap();
    assert_eq!(hm(&slots), vec!["09:00", "09:15", "10:45", "11:00", "11:15", "11:30"]);

    // every generated slot is bookable
    for slot in slots {
        let other = student(&f.engine, ServiceTier::Premium).await;
        let probe = f.engine.generate_slots(f.teacher, monday(), 30.0).await.unwrap();
        if probe.contains(&slot) {
            book(&f, other, slot).await.unwrap();
        }
    }
}

#[tokio::test]
async fn slots_fall_back_to_default_duration() {
    let f = fixture("slots_default.wal", 0, 8).await;
    let default = f.engine.generate_slots(f.teacher, monday(), f64::NAN).await.unwrap();
    let explicit = f.engine.generate_slots(f.teacher, monday(), 30.0).await.unwrap();
    assert_eq!(default, explicit);
    assert_eq!(default.len(), 6);

    let tuesday = NaiveDate::from_ymd_opt(2030, 6, 4).unwrap();
    assert!(f.engine.generate_slots(f.teacher, tuesday, 30.0).await.unwrap().is_empty());

    let unknown = f.engine.generate_slots(Ulid::new(), monday(), 30.0).await;
    assert!(matches!(unknown, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn slots_follow_teacher_offset() {
    let f = fixture("slots_offset.wal", 0, 8).await;
    let mut profile = f.engine.get_teacher(f.teacher).await.unwrap();
    profile.utc_offset_min = 120;
    f.engine.upsert_teacher(profile).await.unwrap();

    let slots = f.engine.generate_slots(f.teacher, monday(), 60.0).await.unwrap();
    // 09:00 at UTC+2 is 07:00 UTC
    assert_eq!(slots.first().copied(), Some(at(7, 0)));
    assert_eq!(slots.len(), 3);
}

// ── Booking guard ────────────────────────────────────────

#[tokio::test]
async fn level1_auto_approves_twice_then_pends() {
    let f = fixture("level1_policy.wal", 0, 8).await;
    let s = student(&f.engine, ServiceTier::Level1).await;

    let first = book(&f, s, at(9, 0)).await.unwrap();
    let second = book(&f, s, at(9, 30)).await.unwrap();
    let third = book(&f, s, at(10, 0)).await.unwrap();
    assert_eq!(first.status, AppointmentStatus::Approved);
    assert!(!first.approval_required);
    assert_eq!(second.status, AppointmentStatus::Approved);
    assert_eq!(third.status, AppointmentStatus::Pending);
    assert!(third.approval_required);

    let appt = f.engine.get_appointment(first.appointment_id).await.unwrap();
    assert!(appt.approved_at.is_some());

    let quota = f.engine.quota_status(s).await.unwrap();
    assert_eq!(quota.used, 3);
    assert_eq!(quota.cap, Some(10));
    assert_eq!(quota.auto_approve_remaining, Some(0));
}

#[tokio::test]
async fn level2_always_waits_for_the_teacher() {
    let f = fixture("level2_policy.wal", 0, 8).await;
    let s = student(&f.engine, ServiceTier::Level2).await;
    let outcome = book(&f, s, at(9, 0)).await.unwrap();
    assert_eq!(outcome.status, AppointmentStatus::Pending);
    assert!(outcome.approval_required);
}

#[tokio::test]
async fn hard_cap_blocks_further_bookings() {
    let f = fixture("hard_cap.wal", 0, 8).await;
    f.engine
        .set_policy(ServicePolicy {
            monthly_cap: Some(2),
            ..default_policy(ServiceTier::Level1)
        })
        .await
        .unwrap();
    let s = student(&f.engine, ServiceTier::Level1).await;
    book(&f, s, at(9, 0)).await.unwrap();
    book(&f, s, at(9, 30)).await.unwrap();
    assert_eq!(rejected(book(&f, s, at(10, 0)).await), RejectReason::QuotaExceeded);
    assert_eq!(f.engine.get_student(s).await.unwrap().monthly_used, 2);
}

#[tokio::test]
async fn premium_ignores_the_cap() {
    let f = fixture("premium_cap.wal", 0, 8).await;
    f.engine
        .set_policy(ServicePolicy {
            monthly_cap: Some(1),
            ..default_policy(ServiceTier::Premium)
        })
        .await
        .unwrap();
    let s = student(&f.engine, ServiceTier::Premium).await;
    for h in [9, 10, 11] {
        assert_eq!(book(&f, s, at(h, 0)).await.unwrap().status, AppointmentStatus::Approved);
    }
}

#[tokio::test]
async fn daily_cap_rejects_the_third_booking() {
    let f = fixture("daily_cap.wal", 0, 2).await;
    let s = student(&f.engine, ServiceTier::Premium).await;
    book(&f, s, at(9, 0)).await.unwrap();
    book(&f, s, at(10, 0)).await.unwrap();
    assert_eq!(rejected(book(&f, s, at(11, 0)).await), RejectReason::MaxDailyReached);
}

#[tokio::test]
async fn overlapping_and_buffered_requests_are_slot_taken() {
    let f = fixture("slot_taken.wal", 15, 8).await;
    let a = student(&f.engine, ServiceTier::Premium).await;
    let b = student(&f.engine, ServiceTier::Premium).await;
    book(&f, a, at(10, 0)).await.unwrap();

    assert_eq!(rejected(book(&f, b, at(10, 0)).await), RejectReason::SlotTaken);
    assert_eq!(rejected(book(&f, b, at(10, 40)).await), RejectReason::SlotTaken);
    assert_eq!(rejected(book(&f, b, at(9, 30)).await), RejectReason::SlotTaken);
    book(&f, b, at(10, 45)).await.unwrap();
}

#[tokio::test]
async fn subject_must_match_teacher_and_enrolment() {
    let f = fixture("subject_mismatch.wal", 0, 8).await;
    let s = student(&f.engine, ServiceTier::Premium).await;

    let mut unknown = request(&f, s, at(9, 0), 30);
    unknown.subject = "tuba".into();
    assert_eq!(rejected(f.engine.create_appointment(unknown).await), RejectReason::SubjectMismatch);

    let violin = f.engine.create_subject("violin").await.unwrap();
    let mut untaught = request(&f, s, at(9, 0), 30);
    untaught.subject = "violin".into();
    assert_eq!(rejected(f.engine.create_appointment(untaught).await), RejectReason::SubjectMismatch);

    let enrolled_elsewhere = Ulid::new();
    f.engine
        .upsert_student(StudentUpsert {
            id: enrolled_elsewhere,
            name: Some("Sam".into()),
            tier: ServiceTier::Premium,
            subjects: vec![violin.id],
        })
        .await
        .unwrap();
    assert_eq!(
        rejected(book(&f, enrolled_elsewhere, at(9, 0)).await),
        RejectReason::SubjectMismatch
    );

    // surrounding whitespace in the name is ignored
    let mut padded = request(&f, s, at(9, 0), 30);
    padded.subject = "  piano ".into();
    f.engine.create_appointment(padded).await.unwrap();
}

#[tokio::test]
async fn slot_outside_availability_is_unavailable() {
    let f = fixture("slot_unavailable.wal", 0, 8).await;
    let s = student(&f.engine, ServiceTier::Premium).await;
    assert_eq!(rejected(book(&f, s, at(8, 0)).await), RejectReason::SlotUnavailable);
    assert_eq!(rejected(book(&f, s, at(11, 45)).await), RejectReason::SlotUnavailable);

    let added = f
        .engine
        .add_blocked_interval(f.teacher, Span::new(at(10, 0), at(11, 0)), Some(" dentist ".into()))
        .await
        .unwrap();
    assert_eq!(added.block.reason.as_deref(), Some("dentist"));
    assert_eq!(added.warnings.len(), 1);
    assert_eq!(added.warnings[0].entity_id, f.rule);
    assert_eq!(rejected(book(&f, s, at(10, 0)).await), RejectReason::SlotUnavailable);

    let slots = f.engine.generate_slots(f.teacher, monday(), 30.0).await.unwrap();
    assert_eq!(hm(&slots), vec!["09:00", "09:30", "11:00", "11:30"]);

    f.engine.remove_blocked_interval(added.block.id).await.unwrap();
    book(&f, s, at(10, 0)).await.unwrap();
    assert!(f.engine.list_blocked_intervals(f.teacher).await.unwrap().is_empty());
}

#[tokio::test]
async fn booking_input_validation() {
    let f = fixture("booking_validation.wal", 0, 8).await;
    let s = student(&f.engine, ServiceTier::Premium).await;

    let mut zero = request(&f, s, at(9, 0), 30);
    zero.duration_min = 0;
    assert!(matches!(f.engine.create_appointment(zero).await, Err(EngineError::Validation(_))));

    let mut long = request(&f, s, at(9, 0), 30);
    long.duration_min = 481;
    assert!(matches!(f.engine.create_appointment(long).await, Err(EngineError::Validation(_))));

    let mut blank = request(&f, s, at(9, 0), 30);
    blank.idempotency_key = "   ".into();
    assert!(matches!(f.engine.create_appointment(blank).await, Err(EngineError::Validation(_))));

    let mut huge = request(&f, s, at(9, 0), 30);
    huge.idempotency_key = "k".repeat(MAX_IDEMPOTENCY_KEY_LEN + 1);
    assert!(matches!(f.engine.create_appointment(huge).await, Err(EngineError::LimitExceeded(_))));

    let past = request(&f, s, calendar::now_ms() - H, 30);
    assert!(matches!(f.engine.create_appointment(past).await, Err(EngineError::Validation(_))));

    let unknown_student = request(&f, Ulid::new(), at(9, 0), 30);
    assert!(matches!(
        f.engine.create_appointment(unknown_student).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn start_is_floored_to_the_minute() {
    let f = fixture("floor_start.wal", 0, 8).await;
    let s = student(&f.engine, ServiceTier::Premium).await;
    let outcome = book(&f, s, at(9, 0) + 42_123).await.unwrap();
    let appt = f.engine.get_appointment(outcome.appointment_id).await.unwrap();
    assert_eq!(appt.start, at(9, 0));
}

#[tokio::test]
async fn repeated_idempotency_key_returns_first_outcome() {
    let f = fixture("idempotency.wal", 0, 8).await;
    let s = student(&f.engine, ServiceTier::Level1).await;
    let req = request(&f, s, at(9, 0), 30);

    let first = f.engine.create_appointment(req.clone()).await.unwrap();
    let again = f.engine.create_appointment(req).await.unwrap();
    assert_eq!(first, again);
    assert_eq!(f.engine.get_student(s).await.unwrap().monthly_used, 1);
    assert_eq!(
        f.engine.appointments_on(f.teacher, monday()).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn released_row_is_reused_in_place() {
    let f = fixture("reuse_in_place.wal", 0, 8).await;
    let a = student(&f.engine, ServiceTier::Premium).await;
    let b = student(&f.engine, ServiceTier::Premium).await;

    let first_req = request(&f, a, at(9, 0), 30);
    let first = f.engine.create_appointment(first_req.clone()).await.unwrap();
    f.engine
        .cancel_appointment(&Principal::student(a), first.appointment_id)
        .await
        .unwrap();

    let second = book(&f, b, at(9, 0)).await.unwrap();
    assert_eq!(second.appointment_id, first.appointment_id);
    let appt = f.engine.get_appointment(second.appointment_id).await.unwrap();
    assert_eq!(appt.student_id, b);
    assert_eq!(appt.status, AppointmentStatus::Approved);
    assert_eq!(f.engine.appointments_on(f.teacher, monday()).await.unwrap().len(), 1);

    // the replaced key no longer resolves, so a retry is a fresh request
    assert_eq!(
        rejected(f.engine.create_appointment(first_req).await),
        RejectReason::SlotTaken
    );
}

// ── Lifecycle & access ───────────────────────────────────

#[tokio::test]
async fn lifecycle_respects_roles_and_transition_table() {
    let f = fixture("lifecycle.wal", 0, 8).await;
    let s = student(&f.engine, ServiceTier::Level2).await;
    let id = book(&f, s, at(9, 0)).await.unwrap().appointment_id;

    let as_student = Principal::student(s);
    let as_teacher = Principal::teacher(f.teacher);
    let stranger = Principal::teacher(Ulid::new());

    assert!(matches!(
        f.engine.approve_appointment(&as_student, id).await,
        Err(EngineError::Forbidden)
    ));
    assert!(matches!(
        f.engine.approve_appointment(&stranger, id).await,
        Err(EngineError::Forbidden)
    ));
    assert!(matches!(
        f.engine.complete_appointment(&as_teacher, id).await,
        Err(EngineError::InvalidTransition {
            from: AppointmentStatus::Pending,
            to: AppointmentStatus::Completed
        })
    ));

    let approved = f.engine.approve_appointment(&as_teacher, id).await.unwrap();
    assert_eq!(approved.status, AppointmentStatus::Approved);
    assert!(approved.promotion.is_none());
    assert!(f.engine.get_appointment(id).await.unwrap().approved_at.is_some());

    assert!(matches!(
        f.engine.approve_appointment(&as_teacher, id).await,
        Err(EngineError::InvalidTransition { .. })
    ));

    let done = f
        .engine
        .complete_appointment(&Principal::admin(Ulid::new()), id)
        .await
        .unwrap();
    assert_eq!(done.status, AppointmentStatus::Completed);
    assert!(matches!(
        f.engine.cancel_appointment(&as_student, id).await,
        Err(EngineError::InvalidTransition { .. })
    ));

    assert!(matches!(
        f.engine.cancel_appointment(&as_student, Ulid::new()).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn other_student_cannot_cancel() {
    let f = fixture("cancel_access.wal", 0, 8).await;
    let owner = student(&f.engine, ServiceTier::Premium).await;
    let other = student(&f.engine, ServiceTier::Premium).await;
    let id = book(&f, owner, at(9, 0)).await.unwrap().appointment_id;

    assert!(matches!(
        f.engine.cancel_appointment(&Principal::student(other), id).await,
        Err(EngineError::Forbidden)
    ));
    let mark = f
        .engine
        .mark_no_show(&Principal::teacher(f.teacher), id)
        .await
        .unwrap();
    assert_eq!(mark.status, AppointmentStatus::NoShow);
}

#[tokio::test]
async fn lifecycle_publishes_notifications() {
    let f = fixture("notifications.wal", 0, 8).await;
    let mut rx = f.engine.notify.subscribe(f.teacher);
    let s = student(&f.engine, ServiceTier::Level2).await;
    let id = book(&f, s, at(9, 0)).await.unwrap().appointment_id;
    f.engine
        .reject_appointment(&Principal::teacher(f.teacher), id)
        .await
        .unwrap();

    let booked = rx.recv().await.unwrap();
    assert_eq!(booked.kind, NotificationKind::Booked);
    assert_eq!(booked.appointment_id, id);
    let rejected = rx.recv().await.unwrap();
    assert_eq!(rejected.kind, NotificationKind::Rejected);
    assert_eq!(rejected.status, AppointmentStatus::Rejected);
}

// ── Waitlist promotion ───────────────────────────────────

#[tokio::test]
async fn cancellation_promotes_oldest_waiter() {
    let f = fixture("promote_fifo.wal", 0, 8).await;
    let holder = student(&f.engine, ServiceTier::Premium).await;
    let first = student(&f.engine, ServiceTier::Level1).await;
    let second = student(&f.engine, ServiceTier::Premium).await;
    let id = book(&f, holder, at(9, 0)).await.unwrap().appointment_id;

    let entry = f.engine.join_waitlist(first, f.teacher, at(9, 0), None).await.unwrap();
    assert_eq!(entry.date, "2030-06-03");
    assert_eq!(entry.duration_min, DEFAULT_WAITLIST_MINUTES);
    assert_eq!(entry.priority, 1);
    f.engine.join_waitlist(second, f.teacher, at(9, 0), None).await.unwrap();

    let mut all = f.engine.notify.subscribe_all();
    let outcome = f
        .engine
        .cancel_appointment(&Principal::student(holder), id)
        .await
        .unwrap();
    let promotion = outcome.promotion.unwrap();
    assert_eq!(promotion.promoted, 1);
    assert_eq!(promotion.student_id, Some(first));
    assert_eq!(promotion.status, Some(AppointmentStatus::Approved));
    assert_eq!(promotion.appointment_id, Some(id));

    let appt = f.engine.get_appointment(id).await.unwrap();
    assert_eq!(appt.student_id, first);
    assert!(appt.idempotency_key.starts_with("promo:"));
    assert_eq!(f.engine.get_student(first).await.unwrap().monthly_used, 1);

    let left = f.engine.waitlist_for_slot(f.teacher, at(9, 0)).await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].student_id, second);

    assert_eq!(all.recv().await.unwrap().kind, NotificationKind::Cancelled);
    assert_eq!(all.recv().await.unwrap().kind, NotificationKind::WaitlistPromoted);
}

#[tokio::test]
async fn promotion_skips_waiter_with_exhausted_quota() {
    let f = fixture("promote_quota.wal", 0, 8).await;
    let holder = student(&f.engine, ServiceTier::Premium).await;
    let exhausted = student(&f.engine, ServiceTier::Level1).await;
    let next = student(&f.engine, ServiceTier::Level2).await;
    let id = book(&f, holder, at(10, 0)).await.unwrap().appointment_id;

    f.engine.join_waitlist(exhausted, f.teacher, at(10, 0), None).await.unwrap();
    f.engine.join_waitlist(next, f.teacher, at(10, 0), None).await.unwrap();
    {
        let shared = f.engine.student_state(&exhausted).unwrap();
        shared.lock().await.monthly_used = 10;
    }

    let outcome = f
        .engine
        .cancel_appointment(&Principal::teacher(f.teacher), id)
        .await
        .unwrap();
    let promotion = outcome.promotion.unwrap();
    assert_eq!(promotion.promoted, 1);
    assert_eq!(promotion.student_id, Some(next));
    assert_eq!(promotion.status, Some(AppointmentStatus::Pending));

    assert!(f.engine.waitlist_for_slot(f.teacher, at(10, 0)).await.unwrap().is_empty());
    assert_eq!(f.engine.get_student(exhausted).await.unwrap().monthly_used, 10);
}

#[tokio::test]
async fn promotion_reports_zero_when_nothing_fits() {
    let f = fixture("promote_zero.wal", 0, 8).await;
    let holder = student(&f.engine, ServiceTier::Premium).await;

    // empty waitlist
    let p = f.engine.promote_for_slot(f.teacher, at(9, 0), "piano").await.unwrap();
    assert_eq!(p, Promotion::none());

    // occupied slot
    book(&f, holder, at(9, 0)).await.unwrap();
    let waiter = student(&f.engine, ServiceTier::Premium).await;
    f.engine.join_waitlist(waiter, f.teacher, at(9, 0), None).await.unwrap();
    let p = f.engine.promote_for_slot(f.teacher, at(9, 0), "piano").await.unwrap();
    assert_eq!(p.promoted, 0);
    assert_eq!(f.engine.waitlist_for_slot(f.teacher, at(9, 0)).await.unwrap().len(), 1);

    // unknown subject is a hard error once a waiter is eligible
    let free_slot = at(11, 0);
    f.engine.join_waitlist(waiter, f.teacher, free_slot, None).await.unwrap();
    assert!(matches!(
        f.engine.promote_for_slot(f.teacher, free_slot, "tuba").await,
        Err(EngineError::UnknownSubject(_))
    ));
}

#[tokio::test]
async fn promotion_stops_at_daily_cap() {
    let f = fixture("promote_daily_cap.wal", 0, 1).await;
    let holder = student(&f.engine, ServiceTier::Premium).await;
    let waiter = student(&f.engine, ServiceTier::Premium).await;
    book(&f, holder, at(9, 0)).await.unwrap();
    f.engine.join_waitlist(waiter, f.teacher, at(11, 0), None).await.unwrap();

    let p = f.engine.promote_for_slot(f.teacher, at(11, 0), "piano").await.unwrap();
    assert_eq!(p.promoted, 0);
    assert_eq!(f.engine.waitlist_for_slot(f.teacher, at(11, 0)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn direct_booking_clears_own_waitlist_entry() {
    let f = fixture("promote_self.wal", 0, 8).await;
    let s = student(&f.engine, ServiceTier::Level1).await;
    let other = student(&f.engine, ServiceTier::Level1).await;
    f.engine.join_waitlist(s, f.teacher, at(9, 0), None).await.unwrap();
    f.engine.join_waitlist(other, f.teacher, at(9, 0), None).await.unwrap();

    let id = book(&f, s, at(9, 0)).await.unwrap().appointment_id;
    let left = f.engine.waitlist_for_slot(f.teacher, at(9, 0)).await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].student_id, other);

    let outcome = f
        .engine
        .cancel_appointment(&Principal::student(s), id)
        .await
        .unwrap();
    let promotion = outcome.promotion.unwrap();
    assert_eq!(promotion.promoted, 1);
    assert_eq!(promotion.student_id, Some(other));
    assert_eq!(f.engine.get_student(s).await.unwrap().monthly_used, 1);
    assert!(f.engine.waitlist_for_slot(f.teacher, at(9, 0)).await.unwrap().is_empty());
}

#[tokio::test]
async fn cancelling_student_is_never_promoted_back() {
    let f = fixture("promote_canceller.wal", 0, 8).await;
    let holder = student(&f.engine, ServiceTier::Premium).await;
    let waiter = student(&f.engine, ServiceTier::Premium).await;
    let id = book(&f, holder, at(11, 0)).await.unwrap().appointment_id;
    f.engine.join_waitlist(waiter, f.teacher, at(11, 0), None).await.unwrap();

    // a stale entry of the holder's own, queued ahead of the waiter
    let stray = WaitlistEntry {
        id: Ulid::new(),
        teacher_id: f.teacher,
        student_id: holder,
        slot: at(11, 0),
        date: "2030-06-03".into(),
        duration_min: 30,
        priority: 3,
        status: WaitlistStatus::Waiting,
        created_at: 0,
    };
    f.engine
        .teacher_state(&f.teacher)
        .unwrap()
        .write()
        .await
        .insert_waitlist(stray.clone());

    let outcome = f
        .engine
        .cancel_appointment(&Principal::student(holder), id)
        .await
        .unwrap();
    assert_eq!(outcome.promotion.unwrap().student_id, Some(waiter));
    assert_eq!(f.engine.get_student(holder).await.unwrap().monthly_used, 1);
    let left = f.engine.waitlist_for_slot(f.teacher, at(11, 0)).await.unwrap();
    assert_eq!(left.iter().map(|e| e.id).collect::<Vec<_>>(), vec![stray.id]);
}

#[tokio::test]
async fn promotion_passes_over_students_not_enrolled() {
    let f = fixture("promote_enrolment.wal", 0, 8).await;
    let violin = f.engine.create_subject("violin").await.unwrap();
    let violinist = Ulid::new();
    f.engine
        .upsert_student(StudentUpsert {
            id: violinist,
            name: None,
            tier: ServiceTier::Premium,
            subjects: vec![violin.id],
        })
        .await
        .unwrap();
    let pianist = student(&f.engine, ServiceTier::Premium).await;
    f.engine.join_waitlist(violinist, f.teacher, at(9, 0), None).await.unwrap();
    f.engine.join_waitlist(pianist, f.teacher, at(9, 0), None).await.unwrap();

    let p = f.engine.promote_for_slot(f.teacher, at(9, 0), "piano").await.unwrap();
    assert_eq!(p.promoted, 1);
    assert_eq!(p.student_id, Some(pianist));
    let left = f.engine.waitlist_for_slot(f.teacher, at(9, 0)).await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].student_id, violinist);

    // the teacher does not teach violin
    f.engine.join_waitlist(pianist, f.teacher, at(11, 0), None).await.unwrap();
    let p = f.engine.promote_for_slot(f.teacher, at(11, 0), "violin").await.unwrap();
    assert_eq!(p.promoted, 0);
    assert_eq!(f.engine.waitlist_for_slot(f.teacher, at(11, 0)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn waitlist_rejects_duplicates_and_checks_owner_on_leave() {
    let f = fixture("waitlist_rules.wal", 0, 8).await;
    let holder = student(&f.engine, ServiceTier::Premium).await;
    let waiter = student(&f.engine, ServiceTier::Premium).await;
    book(&f, holder, at(9, 0)).await.unwrap();

    assert!(matches!(
        f.engine.join_waitlist(holder, f.teacher, at(9, 0), None).await,
        Err(EngineError::AlreadyExists(_))
    ));
    let entry = f.engine.join_waitlist(waiter, f.teacher, at(9, 0), Some(45)).await.unwrap();
    assert_eq!(entry.priority, 3);
    assert!(matches!(
        f.engine.join_waitlist(waiter, f.teacher, at(9, 0), None).await,
        Err(EngineError::AlreadyExists(_))
    ));
    assert!(matches!(
        f.engine.join_waitlist(waiter, f.teacher, calendar::now_ms() - H, None).await,
        Err(EngineError::Validation(_))
    ));

    assert!(matches!(
        f.engine.leave_waitlist(&Principal::student(holder), entry.id).await,
        Err(EngineError::Forbidden)
    ));
    f.engine
        .leave_waitlist(&Principal::student(waiter), entry.id)
        .await
        .unwrap();
    assert!(f.engine.waitlist_for_slot(f.teacher, at(9, 0)).await.unwrap().is_empty());
}

// ── Quota reset & expiry ─────────────────────────────────

#[tokio::test]
async fn stale_month_resets_before_the_policy_runs() {
    let f = fixture("quota_reset.wal", 0, 8).await;
    let s = student(&f.engine, ServiceTier::Level1).await;
    let last_month = calendar::month_start(calendar::now_ms()) - 1;
    {
        let shared = f.engine.student_state(&s).unwrap();
        let mut sp = shared.lock().await;
        sp.monthly_used = 10;
        sp.last_reset = last_month;
    }

    let quota = f.engine.quota_status(s).await.unwrap();
    assert_eq!(quota.used, 0);
    assert_eq!(quota.auto_approve_remaining, Some(2));

    let outcome = book(&f, s, at(9, 0)).await.unwrap();
    assert_eq!(outcome.status, AppointmentStatus::Approved);
    let profile = f.engine.get_student(s).await.unwrap();
    assert_eq!(profile.monthly_used, 1);
    assert!(profile.last_reset > last_month);
}

#[tokio::test]
async fn expiry_sweep_frees_stale_pending_slots() {
    let f = fixture("expiry.wal", 0, 8).await;
    let pending = student(&f.engine, ServiceTier::Level2).await;
    let approved = student(&f.engine, ServiceTier::Premium).await;
    let waiter = student(&f.engine, ServiceTier::Premium).await;
    let stale = book(&f, pending, at(9, 0)).await.unwrap().appointment_id;
    let kept = book(&f, approved, at(10, 0)).await.unwrap().appointment_id;
    f.engine.join_waitlist(waiter, f.teacher, at(9, 0), None).await.unwrap();

    let now = calendar::now_ms();
    // level 2 waits 48 hours
    assert_eq!(f.engine.expire_stale_appointments(now + 47 * H).await.unwrap(), 0);
    assert_eq!(f.engine.expire_stale_appointments(now + 49 * H).await.unwrap(), 1);

    let appt = f.engine.get_appointment(stale).await.unwrap();
    assert_eq!(appt.student_id, waiter);
    assert_eq!(appt.status, AppointmentStatus::Approved);
    assert_eq!(
        f.engine.get_appointment(kept).await.unwrap().status,
        AppointmentStatus::Approved
    );
    assert_eq!(f.engine.expire_stale_appointments(now + 49 * H).await.unwrap(), 0);
}

#[tokio::test]
async fn expiry_without_waiters_leaves_expired_row() {
    let f = fixture("expiry_plain.wal", 0, 8).await;
    let s = student(&f.engine, ServiceTier::Level2).await;
    let id = book(&f, s, at(9, 0)).await.unwrap().appointment_id;
    f.engine
        .expire_stale_appointments(calendar::now_ms() + 49 * H)
        .await
        .unwrap();
    assert_eq!(f.engine.get_appointment(id).await.unwrap().status, AppointmentStatus::Expired);
    // the slot is bookable again
    let other = student(&f.engine, ServiceTier::Premium).await;
    assert_eq!(book(&f, other, at(9, 0)).await.unwrap().appointment_id, id);
}

#[tokio::test]
async fn sweep_drops_waitlist_entries_for_past_slots() {
    let f = fixture("waitlist_prune.wal", 0, 8).await;
    let waiter = student(&f.engine, ServiceTier::Premium).await;
    let next_week = at(9, 0) + 7 * 24 * H;
    f.engine.join_waitlist(waiter, f.teacher, at(9, 0), None).await.unwrap();
    f.engine.join_waitlist(waiter, f.teacher, next_week, None).await.unwrap();

    f.engine.expire_stale_appointments(at(9, 0) + M).await.unwrap();
    assert!(f.engine.waitlist_for_slot(f.teacher, at(9, 0)).await.unwrap().is_empty());
    assert_eq!(f.engine.waitlist_for_slot(f.teacher, next_week).await.unwrap().len(), 1);
}

#[tokio::test]
async fn promotion_for_a_past_slot_drops_its_waiters() {
    let f = fixture("promote_past.wal", 0, 8).await;
    let first = student(&f.engine, ServiceTier::Premium).await;
    let second = student(&f.engine, ServiceTier::Premium).await;
    f.engine.join_waitlist(first, f.teacher, at(10, 0), None).await.unwrap();
    f.engine.join_waitlist(second, f.teacher, at(10, 0), None).await.unwrap();

    let p = f
        .engine
        .promote_locked(f.teacher, at(10, 0), "piano", None, at(10, 0) + M)
        .await
        .unwrap();
    assert_eq!(p, Promotion::none());
    assert!(f.engine.waitlist_for_slot(f.teacher, at(10, 0)).await.unwrap().is_empty());
}

// ── Availability rules ───────────────────────────────────

#[tokio::test]
async fn partial_overlap_rejects_or_merges() {
    let f = fixture("rule_merge.wal", 0, 8).await;
    let tuesday = f
        .engine
        .add_availability_rule(f.teacher, RuleProposal::new(2, "09:00", "11:00"), OnConflict::Reject)
        .await
        .unwrap();
    assert!(tuesday.validation.is_ok());

    let proposal = RuleProposal::new(2, "10:00", "12:00");
    let err = f
        .engine
        .add_availability_rule(f.teacher, proposal.clone(), OnConflict::Reject)
        .await
        .unwrap_err();
    let validation = match err {
        EngineError::RuleConflict(v) => v,
        other => panic!("expected a rule conflict, got {other:?}"),
    };
    assert!(validation.can_merge());
    assert_eq!(validation.suggestions[0].kind, SuggestionKind::Merge);

    let merged = f
        .engine
        .add_availability_rule(f.teacher, proposal, OnConflict::Merge)
        .await
        .unwrap();
    assert_eq!(merged.replaced, vec![tuesday.rule.id]);
    assert_eq!(merged.rule.start.to_string(), "09:00");
    assert_eq!(merged.rule.end.to_string(), "12:00");

    let rules = f.engine.list_rules(f.teacher).await.unwrap();
    assert_eq!(rules.len(), 2);
    assert!(rules.iter().all(|r| r.id != tuesday.rule.id));
}

#[tokio::test]
async fn merge_refuses_oversized_union_and_non_overlap_conflicts() {
    let f = fixture("rule_merge_limits.wal", 0, 8).await;
    f.engine
        .add_availability_rule(f.teacher, RuleProposal::new(3, "08:00", "12:00"), OnConflict::Reject)
        .await
        .unwrap();
    assert!(matches!(
        f.engine
            .add_availability_rule(f.teacher, RuleProposal::new(3, "11:00", "17:00"), OnConflict::Merge)
            .await,
        Err(EngineError::Validation(_))
    ));

    // an exact duplicate cannot be merged away
    assert!(matches!(
        f.engine
            .add_availability_rule(f.teacher, RuleProposal::new(1, "09:00", "12:00"), OnConflict::Merge)
            .await,
        Err(EngineError::RuleConflict(_))
    ));
    assert!(matches!(
        f.engine
            .add_availability_rule(f.teacher, RuleProposal::new(1, "12:00", "11:00"), OnConflict::Reject)
            .await,
        Err(EngineError::InvalidTime(_))
    ));
    assert!(matches!(
        f.engine
            .add_availability_rule(f.teacher, RuleProposal::new(7, "09:00", "10:00"), OnConflict::Reject)
            .await,
        Err(EngineError::Validation(_))
    ));
}

#[tokio::test]
async fn dry_run_reports_without_storing() {
    let f = fixture("rule_dry_run.wal", 0, 8).await;
    let s = student(&f.engine, ServiceTier::Premium).await;
    book(&f, s, at(9, 0)).await.unwrap();

    let v = f
        .engine
        .validate_availability_rule(f.teacher, &RuleProposal::new(1, "09:00", "12:00"))
        .await
        .unwrap();
    assert_eq!(v.conflicts.len(), 1);
    assert_eq!(v.conflicts[0].kind, ConflictKind::ExactMatch);
    assert_eq!(v.appointment_warnings.len(), 1);
    assert_eq!(f.engine.list_rules(f.teacher).await.unwrap().len(), 1);

    let clear = f
        .engine
        .validate_availability_rule(f.teacher, &RuleProposal::new(1, "13:00", "14:00"))
        .await
        .unwrap();
    assert!(clear.is_ok());
}

#[tokio::test]
async fn update_toggle_and_remove_rules() {
    let f = fixture("rule_update.wal", 0, 8).await;

    let moved = f
        .engine
        .update_availability_rule(f.rule, RuleProposal::new(1, "13:00", "14:00"))
        .await
        .unwrap();
    assert_eq!(moved.id, f.rule);
    let slots = f.engine.generate_slots(f.teacher, monday(), 30.0).await.unwrap();
    assert_eq!(hm(&slots), vec!["13:00", "13:30"]);

    let off = f.engine.set_rule_active(f.rule, false).await.unwrap();
    assert!(!off.active);
    assert!(f.engine.generate_slots(f.teacher, monday(), 30.0).await.unwrap().is_empty());

    // an inactive rule does not conflict, so this is accepted
    f.engine
        .add_availability_rule(f.teacher, RuleProposal::new(1, "13:00", "13:30"), OnConflict::Reject)
        .await
        .unwrap();
    assert!(matches!(
        f.engine.set_rule_active(f.rule, true).await,
        Err(EngineError::RuleConflict(_))
    ));

    f.engine.remove_availability_rule(f.rule).await.unwrap();
    assert!(matches!(
        f.engine.remove_availability_rule(f.rule).await,
        Err(EngineError::NotFound(_))
    ));
    assert_eq!(f.engine.list_rules(f.teacher).await.unwrap().len(), 1);
}

// ── Reference data ───────────────────────────────────────

#[tokio::test]
async fn reference_data_validation() {
    let f = fixture("reference_data.wal", 0, 8).await;
    assert!(matches!(
        f.engine.create_subject("piano").await,
        Err(EngineError::AlreadyExists(_))
    ));
    assert!(matches!(f.engine.create_subject("  ").await, Err(EngineError::Validation(_))));

    let mut bad = TeacherProfile::new(Ulid::new());
    bad.max_daily_meetings = 0;
    assert!(matches!(f.engine.upsert_teacher(bad).await, Err(EngineError::Validation(_))));

    let mut unknown_subject = TeacherProfile::new(Ulid::new());
    unknown_subject.subjects = vec![Ulid::new()];
    assert!(matches!(
        f.engine.upsert_teacher(unknown_subject).await,
        Err(EngineError::NotFound(_))
    ));

    let mut far = TeacherProfile::new(Ulid::new());
    far.utc_offset_min = 15 * 60;
    assert!(matches!(f.engine.upsert_teacher(far).await, Err(EngineError::InvalidTime(_))));

    assert!(matches!(
        f.engine
            .set_policy(ServicePolicy {
                expire_hours: 0,
                ..default_policy(ServiceTier::Level2)
            })
            .await,
        Err(EngineError::Validation(_))
    ));
    assert_eq!(f.engine.list_subjects().len(), 1);
}

#[tokio::test]
async fn student_upsert_keeps_usage() {
    let f = fixture("student_upsert.wal", 0, 8).await;
    let s = student(&f.engine, ServiceTier::Level1).await;
    book(&f, s, at(9, 0)).await.unwrap();

    let updated = f
        .engine
        .upsert_student(StudentUpsert {
            id: s,
            name: Some("Ada".into()),
            tier: ServiceTier::Premium,
            subjects: Vec::new(),
        })
        .await
        .unwrap();
    assert_eq!(updated.monthly_used, 1);
    assert_eq!(updated.tier, ServiceTier::Premium);
    assert_eq!(f.engine.quota_status(s).await.unwrap().cap, None);
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn state_survives_wal_replay() {
    let path = test_wal_path("replay.wal");
    let (teacher, appt_id, waiter, s) = {
        let f = fixture_at(path.clone(), 10, 8).await;
        let s = student(&f.engine, ServiceTier::Level1).await;
        let waiter = student(&f.engine, ServiceTier::Premium).await;
        let id = book(&f, s, at(9, 0)).await.unwrap().appointment_id;
        f.engine.join_waitlist(waiter, f.teacher, at(9, 0), None).await.unwrap();
        f.engine
            .add_blocked_interval(f.teacher, Span::new(at(11, 0), at(12, 0)), None)
            .await
            .unwrap();
        (f.teacher, id, waiter, s)
    };

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    let profile = engine.get_teacher(teacher).await.unwrap();
    assert_eq!(profile.buffer_min, 10);
    assert_eq!(engine.get_appointment(appt_id).await.unwrap().student_id, s);
    assert_eq!(engine.get_student(s).await.unwrap().monthly_used, 1);
    assert_eq!(engine.list_blocked_intervals(teacher).await.unwrap().len(), 1);
    assert_eq!(engine.list_rules(teacher).await.unwrap().len(), 1);
    let waiting = engine.waitlist_for_slot(teacher, at(9, 0)).await.unwrap();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].student_id, waiter);

    // the replayed engine keeps enforcing the rules
    let other = student(&engine, ServiceTier::Premium).await;
    let req = BookingRequest {
        student_id: other,
        teacher_id: teacher,
        subject: "piano".into(),
        slot: at(9, 30),
        duration_min: 30,
        idempotency_key: "after-replay".into(),
    };
    assert!(matches!(
        engine.create_appointment(req).await,
        Err(EngineError::Rejected(RejectReason::SlotTaken))
    ));
}

#[tokio::test]
async fn compaction_preserves_state_and_idempotency() {
    let path = test_wal_path("compact.wal");
    let (teacher, req, outcome, rule) = {
        let f = fixture_at(path.clone(), 0, 8).await;
        let s = student(&f.engine, ServiceTier::Level1).await;
        let req = request(&f, s, at(10, 0), 30);
        let outcome = f.engine.create_appointment(req.clone()).await.unwrap();
        let other = book(&f, s, at(11, 0)).await.unwrap().appointment_id;
        f.engine
            .cancel_appointment(&Principal::student(s), other)
            .await
            .unwrap();
        f.engine.set_rule_active(f.rule, false).await.unwrap();

        assert!(f.engine.wal_appends_since_compact().await > 0);
        f.engine.compact_wal().await.unwrap();
        assert_eq!(f.engine.wal_appends_since_compact().await, 0);
        (f.teacher, req, outcome, f.rule)
    };

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    let rules = engine.list_rules(teacher).await.unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].id, rule);
    assert!(!rules[0].active);
    assert_eq!(engine.appointments_on(teacher, monday()).await.unwrap().len(), 2);
    assert_eq!(engine.get_student(req.student_id).await.unwrap().monthly_used, 2);
    assert_eq!(engine.create_appointment(req).await.unwrap(), outcome);
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_bookings_for_one_slot_admit_exactly_one() {
    let f = fixture("concurrent_book.wal", 0, 8).await;
    let mut students = Vec::new();
    for _ in 0..8 {
        students.push(student(&f.engine, ServiceTier::Premium).await);
    }

    let mut handles = Vec::new();
    for s in students {
        let engine = f.engine.clone();
        let req = request(&f, s, at(9, 0), 30);
        handles.push(tokio::spawn(async move { engine.create_appointment(req).await }));
    }
    let results = futures::future::join_all(handles).await;
    let ok = results.iter().filter(|r| matches!(r, Ok(Ok(_)))).count();
    let taken = results
        .iter()
        .filter(|r| matches!(r, Ok(Err(EngineError::Rejected(RejectReason::SlotTaken)))))
        .count();
    assert_eq!(ok, 1);
    assert_eq!(taken, 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_promotions_promote_exactly_once() {
    let f = fixture("concurrent_promote.wal", 0, 8).await;
    let waiter = student(&f.engine, ServiceTier::Level1).await;
    f.engine.join_waitlist(waiter, f.teacher, at(9, 0), None).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = f.engine.clone();
        let teacher = f.teacher;
        handles.push(tokio::spawn(async move {
            engine.promote_for_slot(teacher, at(9, 0), "piano").await
        }));
    }
    let results = futures::future::join_all(handles).await;
    let promoted: u32 = results
        .into_iter()
        .map(|r| u32::from(r.unwrap().unwrap().promoted))
        .sum();
    assert_eq!(promoted, 1);
    assert_eq!(f.engine.get_student(waiter).await.unwrap().monthly_used, 1);
    assert!(f.engine.claims.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicate_keys_book_once() {
    let f = fixture("concurrent_keys.wal", 0, 8).await;
    let s = student(&f.engine, ServiceTier::Premium).await;
    let req = request(&f, s, at(9, 0), 30);

    let mut handles = Vec::new();
    for _ in 0..6 {
        let engine = f.engine.clone();
        let req = req.clone();
        handles.push(tokio::spawn(async move { engine.create_appointment(req).await }));
    }
    let results = futures::future::join_all(handles).await;
    let ids: Vec<Ulid> = results
        .into_iter()
        .filter_map(|r| r.unwrap().ok())
        .map(|o| o.appointment_id)
        .collect();
    assert!(!ids.is_empty());
    assert!(ids.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(f.engine.get_student(s).await.unwrap().monthly_used, 1);
    assert!(f.engine.pending_keys.is_empty());
}
