//! Counter ledger: one function per attendance event, each moving the
//! enrollment, enrollment-slot and scheduled-class layers together inside
//! the caller's transaction.

use chrono::NaiveDateTime;
use rusqlite::Connection;
use serde::Serialize;

use crate::error::{CoreError, CoreResult};
use crate::model::{AttendanceRecord, ClassState, EnrollmentStatus};
use crate::status::{self, EnrollmentEvent};
use crate::store;

/// Counters an attended mark actually moved. Stored on the attendance row
/// so a correction undoes exactly this much.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Applied {
    pub enrollment: bool,
    pub slot: bool,
}

impl Applied {
    pub fn of(record: &AttendanceRecord) -> Self {
        Self {
            enrollment: record.counted,
            slot: record.slot_counted,
        }
    }

    pub fn store_on(self, record: &mut AttendanceRecord) {
        record.counted = self.enrollment;
        record.slot_counted = self.slot;
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendedOutcome {
    pub applied: Applied,
    /// The enrollment was already at its quota; no counter moved.
    pub clamped: bool,
    /// This event exhausted the quota and completed the enrollment.
    pub completed: bool,
}

pub fn record_attended(
    conn: &Connection,
    enrollment_id: &str,
    enrollment_slot_id: Option<&str>,
    class_id: Option<&str>,
    attendance_id: &str,
    now: NaiveDateTime,
) -> CoreResult<AttendedOutcome> {
    let mut out = AttendedOutcome::default();

    if store::enrollment_increment_attended(conn, enrollment_id, now)? {
        out.applied.enrollment = true;
        if let Some(es_id) = enrollment_slot_id {
            out.applied.slot = store::enrollment_slot_increment_attended(conn, es_id)?;
            if !out.applied.slot {
                tracing::warn!(
                    enrollment_slot = es_id,
                    "slot allocation already used up, slot counter clamped"
                );
            }
        }
    } else {
        tracing::warn!(
            enrollment = enrollment_id,
            "attendance beyond classes_total, counters clamped"
        );
        out.clamped = true;
    }

    if let Some(class_id) = class_id {
        store::set_class_state(conn, class_id, ClassState::Held, Some(attendance_id))?;
    }

    out.completed = complete_if_exhausted(conn, enrollment_id, now)?;
    Ok(out)
}

/// Undoes one `record_attended` when a marking is corrected. Only the
/// counters in `applied` move back.
pub fn revert_attended(
    conn: &Connection,
    enrollment_id: &str,
    enrollment_slot_id: Option<&str>,
    class_id: Option<&str>,
    applied: Applied,
    now: NaiveDateTime,
) -> CoreResult<()> {
    if applied.enrollment {
        store::enrollment_decrement_attended(conn, enrollment_id, now)?;
    }
    if let (true, Some(es_id)) = (applied.slot, enrollment_slot_id) {
        store::enrollment_slot_decrement_attended(conn, es_id)?;
    }
    if let Some(class_id) = class_id {
        store::set_class_state(conn, class_id, ClassState::Absent, None)?;
    }
    Ok(())
}

pub fn record_absent(conn: &Connection, class_id: Option<&str>, attendance_id: &str) -> CoreResult<()> {
    if let Some(class_id) = class_id {
        store::set_class_state(conn, class_id, ClassState::Absent, Some(attendance_id))?;
    }
    Ok(())
}

/// Consumes one permission unit. Fails with QuotaExceeded, leaving every
/// counter untouched, when the enrollment has none left.
pub fn record_permission(
    conn: &Connection,
    enrollment_id: &str,
    enrollment_slot_id: Option<&str>,
    class_id: Option<&str>,
    attendance_id: &str,
    now: NaiveDateTime,
) -> CoreResult<()> {
    if !store::enrollment_consume_permission(conn, enrollment_id, now)? {
        let e = store::require_enrollment(conn, enrollment_id)?;
        return Err(CoreError::QuotaExceeded {
            message: "no justified absences left on this enrollment".into(),
            limit: e.permissions_used + e.permissions_available,
            current: e.permissions_used,
        });
    }
    if let Some(es_id) = enrollment_slot_id {
        store::enrollment_slot_add_permission(conn, es_id)?;
    }
    if let Some(class_id) = class_id {
        store::set_class_state(conn, class_id, ClassState::Excused, Some(attendance_id))?;
    }
    Ok(())
}

/// Gives back the permission unit a completed make-up recovered. Returns
/// false when there was nothing to give back.
pub fn make_up_completed(
    conn: &Connection,
    enrollment_id: &str,
    make_up_class_id: Option<&str>,
    attendance_id: &str,
    now: NaiveDateTime,
) -> CoreResult<bool> {
    let restored = store::enrollment_restore_permission(conn, enrollment_id, now)?;
    if !restored {
        tracing::warn!(
            enrollment = enrollment_id,
            "make-up completed with no permission in use"
        );
    }
    if let Some(class_id) = make_up_class_id {
        store::set_class_state(conn, class_id, ClassState::Held, Some(attendance_id))?;
    }
    Ok(restored)
}

pub fn recompute_remaining(conn: &Connection, enrollment_slot_id: &str) -> CoreResult<()> {
    store::recompute_enrollment_slot_remaining(conn, enrollment_slot_id)?;
    Ok(())
}

fn complete_if_exhausted(
    conn: &Connection,
    enrollment_id: &str,
    now: NaiveDateTime,
) -> CoreResult<bool> {
    let e = store::require_enrollment(conn, enrollment_id)?;
    if e.classes_attended < e.classes_total || e.status != EnrollmentStatus::Active {
        return Ok(false);
    }
    let (_, next) = status::apply(conn, enrollment_id, EnrollmentEvent::ClassesExhausted, now)?;
    Ok(next == EnrollmentStatus::Completed)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Drift {
    pub entity: &'static str,
    pub id: String,
    pub field: &'static str,
    pub stored: i64,
    pub recomputed: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub enrollment_id: String,
    pub drift: Vec<Drift>,
    pub status: EnrollmentStatus,
}

/// Recomputes every counter of the enrollment from attendance and
/// permission rows and overwrites the stored values.
pub fn reconcile(
    conn: &Connection,
    enrollment_id: &str,
    now: NaiveDateTime,
) -> CoreResult<ReconcileReport> {
    let e = store::require_enrollment(conn, enrollment_id)?;
    let max_permissions = match store::get_modality(conn, &e.modality_id)? {
        Some(m) => m.max_permissions,
        None => e.permissions_used + e.permissions_available,
    };
    let mut drift = Vec::new();
    let mut note = |entity: &'static str, id: &str, field: &'static str, stored: i64, recomputed: i64| {
        if stored != recomputed {
            drift.push(Drift {
                entity,
                id: id.to_string(),
                field,
                stored,
                recomputed,
            });
        }
    };

    let attended = store::count_attended(conn, &e.id, None)?.min(e.classes_total);
    let used = store::count_outstanding_permissions(conn, &e.id)?;
    let available = (max_permissions - used).max(0);
    note("enrollment", &e.id, "classesAttended", e.classes_attended, attended);
    note("enrollment", &e.id, "permissionsUsed", e.permissions_used, used);
    note("enrollment", &e.id, "permissionsAvailable", e.permissions_available, available);
    store::enrollment_overwrite_counters(conn, &e.id, attended, used, available, now)?;

    for es in store::list_enrollment_slots(conn, &e.id)? {
        let slot_attended =
            store::count_attended(conn, &e.id, Some(&es.slot_id))?.min(es.classes_allocated);
        let slot_permissions = store::count_slot_permissions(conn, &e.id, &es.slot_id)?;
        note("enrollmentSlot", &es.id, "classesAttended", es.classes_attended, slot_attended);
        note("enrollmentSlot", &es.id, "permissionsUsed", es.permissions_used, slot_permissions);
        let expected_remaining = (es.classes_allocated - slot_attended).max(0);
        note("enrollmentSlot", &es.id, "classesRemaining", es.classes_remaining, expected_remaining);
        store::overwrite_enrollment_slot_counters(conn, &es.id, slot_attended, slot_permissions)?;
    }

    complete_if_exhausted(conn, &e.id, now)?;
    let status = store::require_enrollment(conn, &e.id)?.status;
    if !drift.is_empty() {
        tracing::info!(enrollment = %e.id, fields = drift.len(), "counter drift repaired");
    }
    Ok(ReconcileReport {
        enrollment_id: e.id,
        drift,
        status,
    })
}
