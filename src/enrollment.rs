use std::collections::HashSet;

use chrono::{Duration, NaiveDate};
use rusqlite::Connection;
use serde::Serialize;

use crate::clock::Ctx;
use crate::config::InsufficientDatesPolicy;
use crate::error::{CoreError, CoreResult};
use crate::model::{Enrollment, EnrollmentSlot, EnrollmentSlotStatus, EnrollmentStatus, Modality};
use crate::payments::{self, PaymentInput, PaymentOutcome};
use crate::quota;
use crate::schedule::{self, ScheduleReport};
use crate::status::{self, EnrollmentEvent};
use crate::store;

pub struct CreateEnrollment {
    pub student_id: String,
    pub modality_id: String,
    pub slot_ids: Vec<String>,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub classes_total: Option<i64>,
    pub monthly_fee_cents: Option<i64>,
    pub branch_id: Option<String>,
    pub trainer_id: Option<String>,
    pub notes: Option<String>,
    pub initial_status: Option<EnrollmentStatus>,
    pub payment: Option<PaymentInput>,
    pub on_insufficient_dates: Option<InsufficientDatesPolicy>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentView {
    #[serde(flatten)]
    pub enrollment: Enrollment,
    pub classes_remaining: i64,
    pub balance_cents: i64,
    pub slots: Vec<EnrollmentSlot>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentCreated {
    pub enrollment: EnrollmentView,
    pub schedule: ScheduleReport,
    pub payment: Option<PaymentOutcome>,
}

pub fn view(conn: &Connection, enrollment: Enrollment) -> CoreResult<EnrollmentView> {
    let slots = store::list_enrollment_slots(conn, &enrollment.id)?;
    let balance_cents = payments::balance(conn, &enrollment)?;
    Ok(EnrollmentView {
        classes_remaining: (enrollment.classes_total - enrollment.classes_attended).max(0),
        balance_cents,
        slots,
        enrollment,
    })
}

pub fn get(conn: &Connection, id: &str) -> CoreResult<EnrollmentView> {
    let e = store::require_enrollment(conn, id)?;
    view(conn, e)
}

pub(crate) fn require_active_modality(conn: &Connection, id: &str) -> CoreResult<Modality> {
    let m = store::get_modality(conn, id)?.ok_or_else(|| CoreError::not_found("modality", id))?;
    if !m.active {
        return Err(CoreError::validation(format!("modality {} is inactive", m.name)));
    }
    Ok(m)
}

pub(crate) fn check_slot_ids(slot_ids: &[String]) -> CoreResult<()> {
    if slot_ids.is_empty() {
        return Err(CoreError::validation("at least one slot is required"));
    }
    let mut seen = HashSet::new();
    for id in slot_ids {
        if !seen.insert(id.as_str()) {
            return Err(CoreError::validation(format!("slot {} listed twice", id)));
        }
    }
    Ok(())
}

pub(crate) fn default_end(start: NaiveDate, modality: &Modality) -> NaiveDate {
    start + Duration::days(modality.period_days.max(1) - 1)
}

/// Fields of a new enrollment row before it is opened.
pub(crate) struct Draft {
    pub student_id: String,
    pub modality: Modality,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub classes_total: i64,
    pub monthly_fee_cents: i64,
    pub branch_id: Option<String>,
    pub trainer_id: Option<String>,
    pub notes: Option<String>,
    pub renewed_from_id: Option<String>,
    pub status: EnrollmentStatus,
}

/// Inserts the enrollment, attaches its slots with the distributed quota and
/// generates its schedule. Shared by creation and renewal.
pub(crate) fn open(
    conn: &Connection,
    ctx: &Ctx<'_>,
    draft: Draft,
    slot_ids: &[String],
    policy: InsufficientDatesPolicy,
) -> CoreResult<(Enrollment, ScheduleReport)> {
    if draft.end_date < draft.start_date {
        return Err(CoreError::validation("end date is before start date"));
    }
    if draft.classes_total <= 0 {
        return Err(CoreError::validation("classes total must be positive"));
    }
    if draft.monthly_fee_cents < 0 {
        return Err(CoreError::validation("fee must not be negative"));
    }
    if let Some(existing) = store::find_open_overlap(
        conn,
        &draft.student_id,
        &draft.modality.id,
        draft.start_date,
        draft.end_date,
        draft.renewed_from_id.as_deref(),
    )? {
        return Err(CoreError::Conflict {
            message: format!(
                "student already has an open enrollment in this modality ({} to {})",
                existing.start_date, existing.end_date
            ),
            existing_id: existing.id,
            existing_state: existing.status.to_string(),
        });
    }

    let now = ctx.now();
    let enrollment = Enrollment {
        id: store::new_id(),
        student_id: draft.student_id,
        modality_id: draft.modality.id.clone(),
        branch_id: draft.branch_id,
        trainer_id: draft.trainer_id,
        start_date: draft.start_date,
        end_date: draft.end_date,
        classes_total: draft.classes_total,
        classes_attended: 0,
        permissions_available: draft.modality.max_permissions,
        permissions_used: 0,
        monthly_fee_cents: draft.monthly_fee_cents,
        status: draft.status,
        notes: draft.notes,
        renewed_from_id: draft.renewed_from_id,
        created_by: ctx.actor_id().map(str::to_string),
        created_at: now,
        updated_at: now,
    };
    store::insert_enrollment(conn, &enrollment)?;

    let shares = quota::distribute(enrollment.classes_total as u32, slot_ids.len());
    for (slot_id, share) in slot_ids.iter().zip(shares) {
        schedule::attach_slot(
            conn,
            &enrollment,
            slot_id,
            share as i64,
            (enrollment.start_date, enrollment.end_date),
        )?;
    }
    let report = schedule::generate(conn, &enrollment, policy)?;

    // Nothing to pay: a free period is settled from the start.
    if enrollment.status == EnrollmentStatus::InArrears && payments::balance(conn, &enrollment)? == 0 {
        status::apply(conn, &enrollment.id, EnrollmentEvent::PaymentSettled, now)?;
    }
    let enrollment = store::require_enrollment(conn, &enrollment.id)?;
    Ok((enrollment, report))
}

/// Creates an enrollment with its slots, schedule and optional first
/// payment. Any failure leaves nothing behind once the caller's
/// transaction rolls back.
pub fn create(conn: &Connection, ctx: &Ctx<'_>, req: CreateEnrollment) -> CoreResult<EnrollmentCreated> {
    let student = store::get_student(conn, &req.student_id)?
        .ok_or_else(|| CoreError::not_found("student", &req.student_id))?;
    if !student.active {
        return Err(CoreError::validation(format!(
            "student {} is inactive",
            student.full_name
        )));
    }
    let modality = require_active_modality(conn, &req.modality_id)?;
    check_slot_ids(&req.slot_ids)?;
    let status = match req.initial_status {
        None | Some(EnrollmentStatus::InArrears) => EnrollmentStatus::InArrears,
        Some(EnrollmentStatus::Active) => EnrollmentStatus::Active,
        Some(other) => {
            return Err(CoreError::validation(format!(
                "an enrollment cannot start as {}",
                other
            )))
        }
    };

    let draft = Draft {
        student_id: student.id,
        end_date: req
            .end_date
            .unwrap_or_else(|| default_end(req.start_date, &modality)),
        start_date: req.start_date,
        classes_total: req.classes_total.unwrap_or(modality.classes_total),
        monthly_fee_cents: req.monthly_fee_cents.unwrap_or(modality.monthly_fee_cents),
        modality,
        branch_id: req.branch_id,
        trainer_id: req.trainer_id,
        notes: req.notes,
        renewed_from_id: None,
        status,
    };
    let policy = req
        .on_insufficient_dates
        .unwrap_or(ctx.config.scheduling.on_create);
    let (enrollment, report) = open(conn, ctx, draft, &req.slot_ids, policy)?;

    let payment = match &req.payment {
        Some(input) => Some(payments::register(conn, ctx, &enrollment.id, input)?),
        None => None,
    };
    let enrollment = store::require_enrollment(conn, &enrollment.id)?;
    tracing::info!(
        enrollment = %enrollment.id,
        student = %enrollment.student_id,
        status = %enrollment.status,
        classes = report.created(),
        "enrollment created"
    );
    Ok(EnrollmentCreated {
        enrollment: view(conn, enrollment)?,
        schedule: report,
        payment,
    })
}

fn require_editable(conn: &Connection, id: &str) -> CoreResult<Enrollment> {
    let e = store::require_enrollment(conn, id)?;
    if !matches!(e.status, EnrollmentStatus::Active | EnrollmentStatus::InArrears) {
        return Err(CoreError::state(
            "slots can only change on an activo or en_mora enrollment",
            e.status.as_str(),
        ));
    }
    Ok(e)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotsChanged {
    pub enrollment: EnrollmentView,
    pub schedule: ScheduleReport,
}

/// Adds a slot from today (or the period start) to the period end, then
/// re-splits the quota over all active slots.
pub fn attach_slot(
    conn: &Connection,
    ctx: &Ctx<'_>,
    enrollment_id: &str,
    slot_id: &str,
    policy: Option<InsufficientDatesPolicy>,
) -> CoreResult<SlotsChanged> {
    let e = require_editable(conn, enrollment_id)?;
    let today = ctx.today();
    let from = e.start_date.max(today);
    if from > e.end_date {
        return Err(CoreError::validation("enrollment period is already over"));
    }
    schedule::attach_slot(conn, &e, slot_id, 0, (from, e.end_date))?;
    schedule::redistribute(conn, &e, today)?;
    let report = schedule::generate(conn, &e, policy.unwrap_or(ctx.config.scheduling.on_create))?;
    tracing::info!(enrollment = %e.id, slot = slot_id, "slot attached");
    Ok(SlotsChanged {
        enrollment: get(conn, &e.id)?,
        schedule: report,
    })
}

pub fn detach_slot(
    conn: &Connection,
    ctx: &Ctx<'_>,
    enrollment_id: &str,
    slot_id: &str,
    policy: Option<InsufficientDatesPolicy>,
) -> CoreResult<SlotsChanged> {
    let e = require_editable(conn, enrollment_id)?;
    let es = store::get_enrollment_slot_by_pair(conn, &e.id, slot_id)?
        .ok_or_else(|| CoreError::not_found("enrollment slot", slot_id))?;
    let active = store::list_enrollment_slots(conn, &e.id)?
        .into_iter()
        .filter(|s| s.status == EnrollmentSlotStatus::Active)
        .count();
    if es.status == EnrollmentSlotStatus::Active && active <= 1 {
        return Err(CoreError::validation("cannot detach the last slot of an enrollment"));
    }
    if es.status == EnrollmentSlotStatus::Active && !store::release_capacity(conn, slot_id)? {
        tracing::warn!(slot = slot_id, "no occupancy to release on detach");
    }
    let removed = store::delete_enrollment_slot(conn, &es.id)?;
    schedule::redistribute(conn, &e, ctx.today())?;
    let report = schedule::generate(conn, &e, policy.unwrap_or(ctx.config.scheduling.on_create))?;
    tracing::info!(enrollment = %e.id, slot = slot_id, removed, "slot detached");
    Ok(SlotsChanged {
        enrollment: get(conn, &e.id)?,
        schedule: report,
    })
}

pub fn regenerate(
    conn: &Connection,
    ctx: &Ctx<'_>,
    enrollment_id: &str,
    policy: Option<InsufficientDatesPolicy>,
) -> CoreResult<ScheduleReport> {
    let e = store::require_enrollment(conn, enrollment_id)?;
    if !e.status.is_open() {
        return Err(CoreError::state(
            "schedule can only be generated for an open enrollment",
            e.status.as_str(),
        ));
    }
    schedule::generate(conn, &e, policy.unwrap_or(ctx.config.scheduling.on_create))
}

pub fn suspend(conn: &Connection, ctx: &Ctx<'_>, enrollment_id: &str) -> CoreResult<EnrollmentView> {
    status::apply(conn, enrollment_id, EnrollmentEvent::Suspend, ctx.now())?;
    get(conn, enrollment_id)
}

pub fn reactivate(conn: &Connection, ctx: &Ctx<'_>, enrollment_id: &str) -> CoreResult<EnrollmentView> {
    let e = store::require_enrollment(conn, enrollment_id)?;
    let balance_due = payments::balance(conn, &e)? > 0;
    status::apply(
        conn,
        enrollment_id,
        EnrollmentEvent::Reactivate { balance_due },
        ctx.now(),
    )?;
    get(conn, enrollment_id)
}

/// Expires every open enrollment whose period ended before today and gives
/// back its seats.
pub fn expire_due(conn: &Connection, ctx: &Ctx<'_>) -> CoreResult<Vec<String>> {
    let mut expired = Vec::new();
    for e in store::list_open_enrollments_ending_before(conn, ctx.today())? {
        status::apply(conn, &e.id, EnrollmentEvent::Expire, ctx.now())?;
        schedule::release_slots(conn, &e.id)?;
        expired.push(e.id);
    }
    if !expired.is_empty() {
        tracing::info!(count = expired.len(), "enrollments expired");
    }
    Ok(expired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Actor;
    use crate::config::EngineConfig;
    use crate::model::{ClassState, PaymentMethod};
    use crate::testkit::*;

    fn request(student: &str, modality: &str, slots: &[&String]) -> CreateEnrollment {
        CreateEnrollment {
            student_id: student.to_string(),
            modality_id: modality.to_string(),
            slot_ids: slots.iter().map(|s| s.to_string()).collect(),
            start_date: d("2026-01-01"),
            end_date: Some(d("2026-01-31")),
            classes_total: None,
            monthly_fee_cents: None,
            branch_id: None,
            trainer_id: None,
            notes: None,
            initial_status: None,
            payment: None,
            on_insufficient_dates: None,
        }
    }

    fn full_payment(amount: i64) -> PaymentInput {
        PaymentInput {
            amount_cents: amount,
            discount_cents: 0,
            discount_reason: None,
            method: PaymentMethod::Card,
            paid_date: None,
            due_date: None,
        }
    }

    #[test]
    fn create_clamps_schedule_and_reserves_seat() {
        let conn = db();
        let student = seed_student(&conn);
        let modality = seed_modality(&conn, 12, 25_000);
        let tue = seed_slot(&conn, &modality, "tuesday", 5);
        let clock = clock_at("2026-01-01");
        let ctx = Ctx::new(&clock, EngineConfig::default(), Actor::default());

        let out = create(&conn, &ctx, request(&student, &modality, &[&tue])).expect("create");
        assert_eq!(out.schedule.created(), 4);
        assert_eq!(out.schedule.warnings.len(), 1);
        assert_eq!(out.enrollment.enrollment.status, EnrollmentStatus::InArrears);
        assert_eq!(out.enrollment.balance_cents, 25_000);
        assert_eq!(out.enrollment.slots[0].classes_allocated, 12);
        assert_eq!(out.enrollment.enrollment.permissions_available, 3);
        let slot = store::get_slot(&conn, &tue).expect("q").expect("slot");
        assert_eq!(slot.current_occupancy, 1);
    }

    #[test]
    fn full_payment_at_creation_starts_active() {
        let conn = db();
        let student = seed_student(&conn);
        let modality = seed_modality(&conn, 8, 25_000);
        let tue = seed_slot(&conn, &modality, "tuesday", 5);
        let thu = seed_slot(&conn, &modality, "thursday", 5);
        let clock = clock_at("2026-01-01");
        let ctx = Ctx::new(&clock, EngineConfig::default(), Actor(Some("desk".into())));

        let mut req = request(&student, &modality, &[&tue, &thu]);
        req.payment = Some(full_payment(25_000));
        let out = create(&conn, &ctx, req).expect("create");
        assert_eq!(out.enrollment.enrollment.status, EnrollmentStatus::Active);
        assert_eq!(out.enrollment.enrollment.created_by.as_deref(), Some("desk"));
        assert_eq!(
            out.enrollment.slots.iter().map(|s| s.classes_allocated).collect::<Vec<_>>(),
            vec![4, 4]
        );
        assert_eq!(out.schedule.created(), 8);
    }

    #[test]
    fn free_enrollment_starts_active() {
        let conn = db();
        let student = seed_student(&conn);
        let modality = seed_modality(&conn, 4, 0);
        let tue = seed_slot(&conn, &modality, "tuesday", 5);
        let clock = clock_at("2026-01-01");
        let ctx = Ctx::new(&clock, EngineConfig::default(), Actor::default());

        let out = create(&conn, &ctx, request(&student, &modality, &[&tue])).expect("create");
        assert_eq!(out.enrollment.enrollment.status, EnrollmentStatus::Active);
        assert_eq!(out.enrollment.balance_cents, 0);
    }

    #[test]
    fn overlap_and_duplicate_slots_are_rejected() {
        let conn = db();
        let student = seed_student(&conn);
        let modality = seed_modality(&conn, 4, 25_000);
        let tue = seed_slot(&conn, &modality, "tuesday", 5);
        let clock = clock_at("2026-01-01");
        let ctx = Ctx::new(&clock, EngineConfig::default(), Actor::default());

        let dup = create(&conn, &ctx, request(&student, &modality, &[&tue, &tue])).unwrap_err();
        assert!(matches!(dup, CoreError::Validation(_)));

        let first = create(&conn, &ctx, request(&student, &modality, &[&tue])).expect("first");
        let err = create(&conn, &ctx, request(&student, &modality, &[&tue])).unwrap_err();
        match err {
            CoreError::Conflict { existing_id, .. } => {
                assert_eq!(existing_id, first.enrollment.enrollment.id)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn attach_and_detach_redistribute_quota() {
        let conn = db();
        let student = seed_student(&conn);
        let modality = seed_modality(&conn, 8, 25_000);
        let tue = seed_slot(&conn, &modality, "tuesday", 5);
        let thu = seed_slot(&conn, &modality, "thursday", 5);
        let clock = clock_at("2026-01-01");
        let ctx = Ctx::new(&clock, EngineConfig::default(), Actor::default());
        let mut req = request(&student, &modality, &[&tue]);
        req.end_date = Some(d("2026-02-28"));
        let created = create(&conn, &ctx, req).expect("create");
        let id = created.enrollment.enrollment.id.clone();

        let attached = attach_slot(&conn, &ctx, &id, &thu, None).expect("attach");
        let allocs: Vec<_> = attached
            .enrollment
            .slots
            .iter()
            .map(|s| s.classes_allocated)
            .collect();
        assert_eq!(allocs, vec![4, 4]);
        let live = store::list_classes(&conn, &id, None, None)
            .expect("list")
            .into_iter()
            .filter(|c| c.state == ClassState::Scheduled)
            .count();
        assert_eq!(live, 8);

        let last = detach_slot(&conn, &ctx, &id, &thu, None).expect("detach");
        assert_eq!(last.enrollment.slots.len(), 1);
        assert_eq!(last.enrollment.slots[0].classes_allocated, 8);
        assert_eq!(last.schedule.slots[0].restored, 4);
        let live: Vec<_> = store::list_classes(&conn, &id, None, None)
            .expect("list")
            .into_iter()
            .filter(|c| c.state == ClassState::Scheduled)
            .collect();
        assert_eq!(live.len(), 8);
        assert!(live.iter().all(|c| c.slot_id == tue));
        let err = detach_slot(&conn, &ctx, &id, &tue, None).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        let slot = store::get_slot(&conn, &thu).expect("q").expect("slot");
        assert_eq!(slot.current_occupancy, 0);
    }

    #[test]
    fn suspend_reactivate_and_expire() {
        let conn = db();
        let student = seed_student(&conn);
        let modality = seed_modality(&conn, 4, 25_000);
        let tue = seed_slot(&conn, &modality, "tuesday", 5);
        let clock = clock_at("2026-01-01");
        let ctx = Ctx::new(&clock, EngineConfig::default(), Actor::default());
        let mut req = request(&student, &modality, &[&tue]);
        req.payment = Some(full_payment(25_000));
        let id = create(&conn, &ctx, req).expect("create").enrollment.enrollment.id;

        assert_eq!(suspend(&conn, &ctx, &id).expect("suspend").enrollment.status, EnrollmentStatus::Suspended);
        assert_eq!(reactivate(&conn, &ctx, &id).expect("reactivate").enrollment.status, EnrollmentStatus::Active);
        assert!(reactivate(&conn, &ctx, &id).is_err());

        let feb = clock_at("2026-02-01");
        let feb_ctx = Ctx::new(&feb, EngineConfig::default(), Actor::default());
        assert_eq!(expire_due(&conn, &feb_ctx).expect("expire"), vec![id.clone()]);
        let e = store::require_enrollment(&conn, &id).expect("e");
        assert_eq!(e.status, EnrollmentStatus::Expired);
        let slot = store::get_slot(&conn, &tue).expect("q").expect("slot");
        assert_eq!(slot.current_occupancy, 0);
        assert!(expire_due(&conn, &feb_ctx).expect("again").is_empty());
    }
}
