use chrono::NaiveDate;
use rusqlite::Connection;
use serde::Serialize;

use crate::clock::Ctx;
use crate::error::{CoreError, CoreResult};
use crate::ledger::{self, Applied};
use crate::model::{AttendanceRecord, AttendanceState, EnrollmentStatus};
use crate::permissions::{self, GrantRequest, PermissionView};
use crate::status;
use crate::store;

pub struct MarkRequest {
    pub enrollment_id: String,
    pub slot_id: String,
    pub date: NaiveDate,
    pub state: AttendanceState,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkOutcome {
    pub record: AttendanceRecord,
    pub previous: Option<AttendanceState>,
    pub clamped: bool,
    pub status: EnrollmentStatus,
    pub permission: Option<PermissionView>,
}

/// Upserts the attendance record for (enrollment, slot, date) and routes the
/// change to the counter ledger. Marking `justificado` grants a permission.
pub fn mark(conn: &Connection, ctx: &Ctx<'_>, req: &MarkRequest) -> CoreResult<MarkOutcome> {
    let enrollment = store::require_enrollment(conn, &req.enrollment_id)?;
    if !status::accepts_attendance(enrollment.status) {
        return Err(CoreError::state(
            "enrollment does not accept attendance",
            enrollment.status.as_str(),
        ));
    }
    if req.date > ctx.today() {
        return Err(CoreError::validation(format!(
            "cannot mark attendance for a future date ({})",
            req.date
        )));
    }
    let es = store::get_enrollment_slot_by_pair(conn, &enrollment.id, &req.slot_id)?
        .ok_or_else(|| {
            CoreError::validation(format!("slot {} is not part of this enrollment", req.slot_id))
        })?;
    permissions::check_class_date(conn, &enrollment, &req.slot_id, req.date)?;

    if req.state == AttendanceState::Excused {
        let reason = req
            .note
            .clone()
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| CoreError::validation("an excused absence needs a reason in note"))?;
        let view = permissions::grant(
            conn,
            ctx,
            &GrantRequest {
                enrollment_id: enrollment.id.clone(),
                slot_id: req.slot_id.clone(),
                absence_date: req.date,
                reason,
            },
        )?;
        let record = store::get_attendance(conn, &enrollment.id, &req.slot_id, req.date)?
            .ok_or_else(|| CoreError::not_found("attendance", &view.permission.attendance_id))?;
        let status = store::require_enrollment(conn, &enrollment.id)?.status;
        return Ok(MarkOutcome {
            record,
            previous: None,
            clamped: false,
            status,
            permission: Some(view),
        });
    }

    let now = ctx.now();
    let class_id = store::find_class(conn, &es.id, req.date)?.map(|c| c.id);
    let existing = store::get_attendance(conn, &enrollment.id, &req.slot_id, req.date)?;
    let previous = existing.as_ref().map(|r| r.state);
    let mut clamped = false;

    let record = match existing {
        None => {
            let mut rec = AttendanceRecord {
                id: store::new_id(),
                enrollment_id: enrollment.id.clone(),
                slot_id: req.slot_id.clone(),
                date: req.date,
                state: req.state,
                note: req.note.clone(),
                recovered: false,
                permission_id: None,
                counted: false,
                slot_counted: false,
            };
            if req.state == AttendanceState::Attended {
                let out = ledger::record_attended(
                    conn,
                    &enrollment.id,
                    Some(&es.id),
                    class_id.as_deref(),
                    &rec.id,
                    now,
                )?;
                clamped = out.clamped;
                out.applied.store_on(&mut rec);
            } else {
                ledger::record_absent(conn, class_id.as_deref(), &rec.id)?;
            }
            store::insert_attendance(conn, &rec, ctx.actor_id(), now)?;
            rec
        }
        Some(prev) if prev.recovered || prev.state == AttendanceState::Excused => {
            return Err(CoreError::Conflict {
                message: "attendance is tied to a justified absence and cannot be changed".into(),
                existing_id: prev.id,
                existing_state: prev.state.to_string(),
            });
        }
        Some(mut prev) => {
            match (prev.state, req.state) {
                (AttendanceState::Absent, AttendanceState::Attended) => {
                    let out = ledger::record_attended(
                        conn,
                        &enrollment.id,
                        Some(&es.id),
                        class_id.as_deref(),
                        &prev.id,
                        now,
                    )?;
                    clamped = out.clamped;
                    out.applied.store_on(&mut prev);
                }
                (AttendanceState::Attended, AttendanceState::Absent) => {
                    ledger::revert_attended(
                        conn,
                        &enrollment.id,
                        Some(&es.id),
                        class_id.as_deref(),
                        Applied::of(&prev),
                        now,
                    )?;
                    Applied::default().store_on(&mut prev);
                }
                _ => {}
            }
            prev.state = req.state;
            if req.note.is_some() {
                prev.note = req.note.clone();
            }
            store::update_attendance(conn, &prev, ctx.actor_id(), now)?;
            prev
        }
    };

    let status = store::require_enrollment(conn, &enrollment.id)?.status;
    tracing::info!(
        enrollment = %enrollment.id,
        date = %req.date,
        state = %record.state,
        clamped,
        "attendance marked"
    );
    Ok(MarkOutcome {
        record,
        previous,
        clamped,
        status,
        permission: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Actor;
    use crate::config::{EngineConfig, InsufficientDatesPolicy};
    use crate::model::{ClassState, EnrollmentSlot};
    use crate::schedule;
    use crate::testkit::*;

    struct Fixture {
        conn: Connection,
        enrollment_id: String,
        es: EnrollmentSlot,
        slot_id: String,
    }

    fn fixture(total: i64) -> Fixture {
        let conn = db();
        let student = seed_student(&conn);
        let modality = seed_modality(&conn, total, 25_000);
        let slot_id = seed_slot(&conn, &modality, "tuesday", 10);
        let e = seed_enrollment(&conn, &student, &modality, "2026-01-01", "2026-01-31");
        let es = schedule::attach_slot(
            &conn,
            &e,
            &slot_id,
            total,
            (d("2026-01-01"), d("2026-01-31")),
        )
        .expect("attach");
        schedule::generate(&conn, &e, InsufficientDatesPolicy::Clamp).expect("generate");
        Fixture {
            conn,
            enrollment_id: e.id,
            es,
            slot_id,
        }
    }

    fn req(f: &Fixture, date: &str, state: AttendanceState) -> MarkRequest {
        MarkRequest {
            enrollment_id: f.enrollment_id.clone(),
            slot_id: f.slot_id.clone(),
            date: d(date),
            state,
            note: None,
        }
    }

    #[test]
    fn attended_on_scheduled_date_updates_every_layer() {
        let f = fixture(12);
        let clock = clock_at("2026-01-06");
        let ctx = Ctx::new(&clock, EngineConfig::default(), Actor(Some("coach".into())));

        let out = mark(&f.conn, &ctx, &req(&f, "2026-01-06", AttendanceState::Attended)).expect("mark");
        assert_eq!(out.previous, None);
        assert!(!out.clamped);

        let e = store::require_enrollment(&f.conn, &f.enrollment_id).expect("e");
        assert_eq!(e.classes_attended, 1);
        let es = store::get_enrollment_slot(&f.conn, &f.es.id).expect("q").expect("es");
        assert_eq!((es.classes_attended, es.classes_remaining), (1, 11));
        let class = store::find_class(&f.conn, &f.es.id, d("2026-01-06"))
            .expect("q")
            .expect("class");
        assert_eq!(class.state, ClassState::Held);
    }

    #[test]
    fn remarking_same_state_is_idempotent_and_correction_reverts() {
        let f = fixture(12);
        let clock = clock_at("2026-01-13");
        let ctx = Ctx::new(&clock, EngineConfig::default(), Actor::default());

        mark(&f.conn, &ctx, &req(&f, "2026-01-06", AttendanceState::Attended)).expect("first");
        mark(&f.conn, &ctx, &req(&f, "2026-01-06", AttendanceState::Attended)).expect("again");
        let e = store::require_enrollment(&f.conn, &f.enrollment_id).expect("e");
        assert_eq!(e.classes_attended, 1);

        let out = mark(&f.conn, &ctx, &req(&f, "2026-01-06", AttendanceState::Absent)).expect("fix");
        assert_eq!(out.previous, Some(AttendanceState::Attended));
        let e = store::require_enrollment(&f.conn, &f.enrollment_id).expect("e");
        assert_eq!(e.classes_attended, 0);
        let class = store::find_class(&f.conn, &f.es.id, d("2026-01-06"))
            .expect("q")
            .expect("class");
        assert_eq!(class.state, ClassState::Absent);
    }

    #[test]
    fn correcting_a_clamped_mark_keeps_real_attendance() {
        let f = fixture(2);
        let clock = clock_at("2026-01-27");
        let ctx = Ctx::new(&clock, EngineConfig::default(), Actor::default());

        for date in ["2026-01-06", "2026-01-13"] {
            let out = mark(&f.conn, &ctx, &req(&f, date, AttendanceState::Attended)).expect("mark");
            assert!(out.record.counted && out.record.slot_counted);
        }
        let extra = mark(&f.conn, &ctx, &req(&f, "2026-01-20", AttendanceState::Attended)).expect("extra");
        assert!(extra.clamped);
        assert!(!extra.record.counted && !extra.record.slot_counted);

        mark(&f.conn, &ctx, &req(&f, "2026-01-20", AttendanceState::Absent)).expect("fix");
        let e = store::require_enrollment(&f.conn, &f.enrollment_id).expect("e");
        assert_eq!(e.classes_attended, 2);
        assert_eq!(e.status, EnrollmentStatus::Completed);
        let es = store::get_enrollment_slot(&f.conn, &f.es.id).expect("q").expect("es");
        assert_eq!((es.classes_attended, es.classes_remaining), (2, 0));

        // A counted mark corrected to absent still gives its unit back.
        mark(&f.conn, &ctx, &req(&f, "2026-01-13", AttendanceState::Absent)).expect("undo");
        let e = store::require_enrollment(&f.conn, &f.enrollment_id).expect("e");
        assert_eq!(e.classes_attended, 1);
        let rec = store::get_attendance(&f.conn, &f.enrollment_id, &f.slot_id, d("2026-01-13"))
            .expect("q")
            .expect("record");
        assert!(!rec.counted);
    }

    #[test]
    fn excused_marking_grants_permission() {
        let f = fixture(12);
        let clock = clock_at("2026-01-06");
        let ctx = Ctx::new(&clock, EngineConfig::default(), Actor::default());
        let mut r = req(&f, "2026-01-06", AttendanceState::Excused);
        assert!(matches!(mark(&f.conn, &ctx, &r).unwrap_err(), CoreError::Validation(_)));

        r.note = Some("flu".into());
        let out = mark(&f.conn, &ctx, &r).expect("excused");
        let view = out.permission.expect("permission");
        assert_eq!(out.record.permission_id.as_deref(), Some(view.permission.id.as_str()));

        let change = mark(&f.conn, &ctx, &req(&f, "2026-01-06", AttendanceState::Attended)).unwrap_err();
        assert!(matches!(change, CoreError::Conflict { .. }));
    }

    #[test]
    fn rejects_future_wrong_weekday_and_foreign_slot() {
        let f = fixture(12);
        let clock = clock_at("2026-01-10");
        let ctx = Ctx::new(&clock, EngineConfig::default(), Actor::default());

        let future = mark(&f.conn, &ctx, &req(&f, "2026-01-13", AttendanceState::Attended)).unwrap_err();
        assert!(matches!(future, CoreError::Validation(_)));
        let wednesday = mark(&f.conn, &ctx, &req(&f, "2026-01-07", AttendanceState::Attended)).unwrap_err();
        assert!(matches!(wednesday, CoreError::Validation(_)));
        let mut foreign = req(&f, "2026-01-06", AttendanceState::Attended);
        foreign.slot_id = "nope".into();
        assert!(matches!(mark(&f.conn, &ctx, &foreign).unwrap_err(), CoreError::Validation(_)));
    }

    #[test]
    fn suspended_enrollment_refuses_attendance() {
        let f = fixture(12);
        store::set_enrollment_status(
            &f.conn,
            &f.enrollment_id,
            EnrollmentStatus::Suspended,
            clock_at("2026-01-06").0,
        )
        .expect("suspend");
        let clock = clock_at("2026-01-06");
        let ctx = Ctx::new(&clock, EngineConfig::default(), Actor::default());
        let err = mark(&f.conn, &ctx, &req(&f, "2026-01-06", AttendanceState::Attended)).unwrap_err();
        assert!(matches!(err, CoreError::StateTransition { .. }));
    }
}
