use chrono::{Duration, NaiveDate};
use rusqlite::Connection;
use serde::Serialize;

use crate::calendar::{month_bounds, Weekday};
use crate::clock::Ctx;
use crate::config::{DeadlineBasis, PermissionConfig};
use crate::error::{CoreError, CoreResult};
use crate::ledger::{self, Applied};
use crate::model::{
    AttendanceRecord, AttendanceState, ClassState, Enrollment, MakeUpClass, MakeUpStatus,
    Permission, PermissionStatus, ScheduledClass,
};
use crate::status;
use crate::store;

pub struct GrantRequest {
    pub enrollment_id: String,
    pub slot_id: String,
    pub absence_date: NaiveDate,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionView {
    #[serde(flatten)]
    pub permission: Permission,
    pub deadline: NaiveDate,
    pub recoverable: bool,
}

pub fn deadline(cfg: &PermissionConfig, enrollment: &Enrollment, absence_date: NaiveDate) -> NaiveDate {
    let basis = match cfg.deadline_basis {
        DeadlineBasis::AbsenceDate => absence_date,
        DeadlineBasis::EnrollmentEnd => enrollment.end_date,
    };
    basis + Duration::days(cfg.make_up_window_days)
}

/// A permission can still be made up when it was approved, has no make-up
/// in flight and its deadline has not passed.
pub fn recoverable(
    permission: &Permission,
    has_active_make_up: bool,
    deadline: NaiveDate,
    today: NaiveDate,
) -> bool {
    permission.status == PermissionStatus::Approved && !has_active_make_up && today <= deadline
}

pub fn view(
    conn: &Connection,
    cfg: &PermissionConfig,
    enrollment: &Enrollment,
    permission: Permission,
    today: NaiveDate,
) -> CoreResult<PermissionView> {
    let deadline = deadline(cfg, enrollment, permission.absence_date);
    let active = store::active_make_up_for_permission(conn, &permission.id)?.is_some();
    let completed = permission.has_make_up && !active;
    Ok(PermissionView {
        recoverable: !completed && recoverable(&permission, active, deadline, today),
        deadline,
        permission,
    })
}

fn check_monthly_quota(
    conn: &Connection,
    cfg: &PermissionConfig,
    enrollment_id: &str,
    absence_date: NaiveDate,
) -> CoreResult<()> {
    let (first, last) = month_bounds(absence_date);
    let count = store::count_permissions_between(conn, enrollment_id, first, last)?;
    if count >= cfg.monthly_quota {
        return Err(CoreError::QuotaExceeded {
            message: format!(
                "monthly limit of justified absences reached for {}",
                absence_date.format("%Y-%m")
            ),
            limit: cfg.monthly_quota,
            current: count,
        });
    }
    Ok(())
}

/// Grants a justified absence: marks the attendance as excused, consumes one
/// permission unit and moves the class to `justificada`. Auto-approved.
pub fn grant(conn: &Connection, ctx: &Ctx<'_>, req: &GrantRequest) -> CoreResult<PermissionView> {
    let enrollment = store::require_enrollment(conn, &req.enrollment_id)?;
    if !status::accepts_permissions(enrollment.status) {
        return Err(CoreError::state(
            "justified absences need an activo or en_mora enrollment",
            enrollment.status.as_str(),
        ));
    }
    let reason = req.reason.trim();
    if reason.is_empty() {
        return Err(CoreError::validation("reason must not be empty"));
    }
    let es = store::get_enrollment_slot_by_pair(conn, &enrollment.id, &req.slot_id)?
        .ok_or_else(|| {
            CoreError::validation(format!("slot {} is not part of this enrollment", req.slot_id))
        })?;
    check_class_date(conn, &enrollment, &req.slot_id, req.absence_date)?;

    let existing = store::get_attendance(conn, &enrollment.id, &req.slot_id, req.absence_date)?;
    if let Some(prev) = &existing {
        if prev.state == AttendanceState::Excused || prev.recovered {
            return Err(CoreError::Conflict {
                message: "absence is already justified".into(),
                existing_id: prev.permission_id.clone().unwrap_or_else(|| prev.id.clone()),
                existing_state: prev.state.to_string(),
            });
        }
    }
    check_monthly_quota(conn, &ctx.config.permissions, &enrollment.id, req.absence_date)?;

    let now = ctx.now();
    let class = store::find_class(conn, &es.id, req.absence_date)?;
    let class_id = class.as_ref().map(|c| c.id.as_str());
    let permission_id = store::new_id();

    let record = match existing {
        Some(mut prev) => {
            if prev.state == AttendanceState::Attended {
                ledger::revert_attended(
                    conn,
                    &enrollment.id,
                    Some(&es.id),
                    class_id,
                    Applied::of(&prev),
                    now,
                )?;
                Applied::default().store_on(&mut prev);
            }
            prev.state = AttendanceState::Excused;
            prev.note = Some(reason.to_string());
            prev.permission_id = Some(permission_id.clone());
            store::update_attendance(conn, &prev, ctx.actor_id(), now)?;
            prev
        }
        None => {
            let rec = AttendanceRecord {
                id: store::new_id(),
                enrollment_id: enrollment.id.clone(),
                slot_id: req.slot_id.clone(),
                date: req.absence_date,
                state: AttendanceState::Excused,
                note: Some(reason.to_string()),
                recovered: false,
                permission_id: Some(permission_id.clone()),
                counted: false,
                slot_counted: false,
            };
            store::insert_attendance(conn, &rec, ctx.actor_id(), now)?;
            rec
        }
    };

    ledger::record_permission(conn, &enrollment.id, Some(&es.id), class_id, &record.id, now)?;

    let permission = Permission {
        id: permission_id,
        enrollment_id: enrollment.id.clone(),
        attendance_id: record.id.clone(),
        slot_id: req.slot_id.clone(),
        request_date: ctx.today(),
        absence_date: req.absence_date,
        reason: reason.to_string(),
        status: PermissionStatus::Approved,
        approver_id: ctx.actor_id().map(str::to_string),
        has_make_up: false,
        make_up_id: None,
    };
    store::insert_permission(conn, &permission)?;
    tracing::info!(
        enrollment = %enrollment.id,
        permission = %permission.id,
        date = %req.absence_date,
        "justified absence granted"
    );
    view(conn, &ctx.config.permissions, &enrollment, permission, ctx.today())
}

/// The date must fall inside the enrollment period, on the slot's weekday.
pub(crate) fn check_class_date(
    conn: &Connection,
    enrollment: &Enrollment,
    slot_id: &str,
    date: NaiveDate,
) -> CoreResult<()> {
    if date < enrollment.start_date || date > enrollment.end_date {
        return Err(CoreError::validation(format!(
            "{} is outside the enrollment period {} to {}",
            date, enrollment.start_date, enrollment.end_date
        )));
    }
    let slot = store::get_slot(conn, slot_id)?.ok_or_else(|| CoreError::not_found("slot", slot_id))?;
    if Weekday::of(date) != slot.weekday {
        return Err(CoreError::validation(format!(
            "{} is a {}, slot meets on {}",
            date,
            Weekday::of(date).as_str(),
            slot.weekday.as_str()
        )));
    }
    Ok(())
}

pub struct ScheduleMakeUp {
    pub permission_id: String,
    pub slot_id: String,
    pub date: NaiveDate,
}

pub fn schedule_make_up(
    conn: &Connection,
    ctx: &Ctx<'_>,
    req: &ScheduleMakeUp,
) -> CoreResult<MakeUpClass> {
    let permission = store::get_permission(conn, &req.permission_id)?
        .ok_or_else(|| CoreError::not_found("permission", &req.permission_id))?;
    if permission.status != PermissionStatus::Approved {
        return Err(CoreError::state(
            "only approved permissions can be made up",
            permission.status.as_str(),
        ));
    }
    if let Some(active) = store::active_make_up_for_permission(conn, &permission.id)? {
        return Err(CoreError::Conflict {
            message: "permission already has a make-up class".into(),
            existing_id: active.id,
            existing_state: active.status.to_string(),
        });
    }
    if permission.has_make_up {
        return Err(CoreError::state(
            "permission was already recovered",
            "completada",
        ));
    }
    let enrollment = store::require_enrollment(conn, &permission.enrollment_id)?;
    if !status::accepts_permissions(enrollment.status) {
        return Err(CoreError::state(
            "make-ups need an activo or en_mora enrollment",
            enrollment.status.as_str(),
        ));
    }

    let today = ctx.today();
    let deadline = deadline(&ctx.config.permissions, &enrollment, permission.absence_date);
    if today > deadline || req.date > deadline {
        return Err(CoreError::state(
            format!(
                "absence of {} is not recoverable on {}: deadline was {}",
                permission.absence_date, req.date, deadline
            ),
            "not_recoverable",
        ));
    }
    if req.date < today {
        return Err(CoreError::validation("make-up date is in the past"));
    }

    let slot = store::get_slot(conn, &req.slot_id)?
        .ok_or_else(|| CoreError::not_found("slot", &req.slot_id))?;
    if let Some(m) = slot.modality_id.as_deref() {
        if m != enrollment.modality_id {
            return Err(CoreError::validation(format!(
                "slot {} belongs to another modality",
                slot.id
            )));
        }
    }
    if Weekday::of(req.date) != slot.weekday {
        return Err(CoreError::validation(format!(
            "{} is a {}, slot meets on {}",
            req.date,
            Weekday::of(req.date).as_str(),
            slot.weekday.as_str()
        )));
    }
    if let Some(es) = store::get_enrollment_slot_by_pair(conn, &enrollment.id, &slot.id)? {
        if let Some(own) = store::find_class(conn, &es.id, req.date)? {
            if own.state != ClassState::Canceled {
                return Err(CoreError::Conflict {
                    message: format!("student already has a class in this slot on {}", req.date),
                    existing_id: own.id,
                    existing_state: own.state.to_string(),
                });
            }
        }
    }
    if let Some(existing) = store::get_attendance(conn, &enrollment.id, &slot.id, req.date)? {
        return Err(CoreError::Conflict {
            message: format!("attendance already recorded in this slot on {}", req.date),
            existing_id: existing.id,
            existing_state: existing.state.to_string(),
        });
    }
    store::reserve_capacity(conn, &slot.id)?;

    let original = match store::get_enrollment_slot_by_pair(conn, &enrollment.id, &permission.slot_id)? {
        Some(es) => store::find_class(conn, &es.id, permission.absence_date)?,
        None => None,
    };
    let class = ScheduledClass {
        id: store::new_id(),
        enrollment_id: enrollment.id.clone(),
        enrollment_slot_id: None,
        slot_id: slot.id.clone(),
        student_id: enrollment.student_id.clone(),
        date: req.date,
        start_time: slot.start_time.clone(),
        end_time: slot.end_time.clone(),
        state: ClassState::MakeUp,
        is_make_up: true,
        counts_toward_attendance: false,
        attendance_id: None,
        original_class_id: original.map(|c| c.id),
        notes: Some(format!("make-up for absence on {}", permission.absence_date)),
    };
    store::insert_scheduled_class(conn, &class)?;

    let make_up = MakeUpClass {
        id: store::new_id(),
        enrollment_id: enrollment.id.clone(),
        student_id: enrollment.student_id.clone(),
        permission_id: permission.id.clone(),
        slot_id: slot.id.clone(),
        scheduled_date: req.date,
        deadline,
        status: MakeUpStatus::Scheduled,
        completed_at: None,
        attendance_id: None,
        scheduled_class_id: Some(class.id.clone()),
    };
    store::insert_make_up(conn, &make_up)?;
    store::set_permission_make_up(conn, &permission.id, Some(&make_up.id))?;
    tracing::info!(
        make_up = %make_up.id,
        permission = %permission.id,
        date = %req.date,
        "make-up scheduled"
    );
    Ok(make_up)
}

fn require_active_make_up(conn: &Connection, id: &str) -> CoreResult<MakeUpClass> {
    let m = store::get_make_up(conn, id)?.ok_or_else(|| CoreError::not_found("make-up", id))?;
    if !m.status.is_active() {
        return Err(CoreError::state("make-up is already closed", m.status.as_str()));
    }
    Ok(m)
}

pub fn complete_make_up(conn: &Connection, ctx: &Ctx<'_>, id: &str) -> CoreResult<MakeUpClass> {
    let mut m = require_active_make_up(conn, id)?;
    let enrollment = store::require_enrollment(conn, &m.enrollment_id)?;
    if !status::accepts_attendance(enrollment.status) {
        return Err(CoreError::state(
            "enrollment no longer accepts attendance",
            enrollment.status.as_str(),
        ));
    }
    if m.scheduled_date > ctx.today() {
        return Err(CoreError::validation("make-up class has not happened yet"));
    }
    if let Some(existing) = store::get_attendance(conn, &m.enrollment_id, &m.slot_id, m.scheduled_date)? {
        return Err(CoreError::Conflict {
            message: "attendance already recorded for the make-up date".into(),
            existing_id: existing.id,
            existing_state: existing.state.to_string(),
        });
    }

    let now = ctx.now();
    let record = AttendanceRecord {
        id: store::new_id(),
        enrollment_id: m.enrollment_id.clone(),
        slot_id: m.slot_id.clone(),
        date: m.scheduled_date,
        state: AttendanceState::Attended,
        note: Some("make-up".into()),
        recovered: true,
        permission_id: Some(m.permission_id.clone()),
        counted: false,
        slot_counted: false,
    };
    store::insert_attendance(conn, &record, ctx.actor_id(), now)?;
    ledger::make_up_completed(
        conn,
        &m.enrollment_id,
        m.scheduled_class_id.as_deref(),
        &record.id,
        now,
    )?;
    if !store::release_capacity(conn, &m.slot_id)? {
        tracing::warn!(slot = %m.slot_id, "no occupancy to release after make-up");
    }
    store::finish_make_up(conn, &m.id, MakeUpStatus::Completed, Some(now), Some(&record.id))?;
    m.status = MakeUpStatus::Completed;
    m.completed_at = Some(now);
    m.attendance_id = Some(record.id);
    tracing::info!(make_up = %m.id, "make-up completed");
    Ok(m)
}

pub fn cancel_make_up(conn: &Connection, id: &str) -> CoreResult<MakeUpClass> {
    let mut m = require_active_make_up(conn, id)?;
    if !store::release_capacity(conn, &m.slot_id)? {
        tracing::warn!(slot = %m.slot_id, "no occupancy to release on make-up cancel");
    }
    if let Some(class_id) = m.scheduled_class_id.as_deref() {
        store::set_class_state(conn, class_id, ClassState::Canceled, None)?;
    }
    store::finish_make_up(conn, &m.id, MakeUpStatus::Canceled, None, None)?;
    store::set_permission_make_up(conn, &m.permission_id, None)?;
    m.status = MakeUpStatus::Canceled;
    tracing::info!(make_up = %m.id, "make-up canceled");
    Ok(m)
}
