//! Persistence functions over the workspace database. Every function takes a
//! plain `&Connection` so callers can pass an open transaction.

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::model::*;

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// students / modalities / slots

const STUDENT_COLS: &str = "id, full_name, document, phone, email, active";

fn student_row(r: &Row<'_>) -> rusqlite::Result<Student> {
    Ok(Student {
        id: r.get(0)?,
        full_name: r.get(1)?,
        document: r.get(2)?,
        phone: r.get(3)?,
        email: r.get(4)?,
        active: r.get(5)?,
    })
}

pub fn insert_student(conn: &Connection, s: &Student, now: NaiveDateTime) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO students(id, full_name, document, phone, email, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        params![s.id, s.full_name, s.document, s.phone, s.email, s.active, now],
    )?;
    Ok(())
}

pub fn get_student(conn: &Connection, id: &str) -> rusqlite::Result<Option<Student>> {
    conn.query_row(
        &format!("SELECT {} FROM students WHERE id = ?", STUDENT_COLS),
        [id],
        student_row,
    )
    .optional()
}

pub fn list_students(conn: &Connection) -> rusqlite::Result<Vec<Student>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM students ORDER BY full_name",
        STUDENT_COLS
    ))?;
    let rows = stmt.query_map([], student_row)?;
    rows.collect()
}

const MODALITY_COLS: &str =
    "id, name, classes_total, max_permissions, monthly_fee_cents, period_days, active";

fn modality_row(r: &Row<'_>) -> rusqlite::Result<Modality> {
    Ok(Modality {
        id: r.get(0)?,
        name: r.get(1)?,
        classes_total: r.get(2)?,
        max_permissions: r.get(3)?,
        monthly_fee_cents: r.get(4)?,
        period_days: r.get(5)?,
        active: r.get(6)?,
    })
}

pub fn insert_modality(conn: &Connection, m: &Modality) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO modalities(id, name, classes_total, max_permissions, monthly_fee_cents, period_days, active)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        params![
            m.id,
            m.name,
            m.classes_total,
            m.max_permissions,
            m.monthly_fee_cents,
            m.period_days,
            m.active
        ],
    )?;
    Ok(())
}

pub fn get_modality(conn: &Connection, id: &str) -> rusqlite::Result<Option<Modality>> {
    conn.query_row(
        &format!("SELECT {} FROM modalities WHERE id = ?", MODALITY_COLS),
        [id],
        modality_row,
    )
    .optional()
}

pub fn find_modality_by_name(conn: &Connection, name: &str) -> rusqlite::Result<Option<Modality>> {
    conn.query_row(
        &format!("SELECT {} FROM modalities WHERE name = ?", MODALITY_COLS),
        [name],
        modality_row,
    )
    .optional()
}

pub fn list_modalities(conn: &Connection) -> rusqlite::Result<Vec<Modality>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM modalities ORDER BY name",
        MODALITY_COLS
    ))?;
    let rows = stmt.query_map([], modality_row)?;
    rows.collect()
}

const SLOT_COLS: &str = "id, modality_id, weekday, start_time, end_time, max_occupancy, current_occupancy, trainer_id, branch_id";

fn slot_row(r: &Row<'_>) -> rusqlite::Result<Slot> {
    Ok(Slot {
        id: r.get(0)?,
        modality_id: r.get(1)?,
        weekday: r.get(2)?,
        start_time: r.get(3)?,
        end_time: r.get(4)?,
        max_occupancy: r.get(5)?,
        current_occupancy: r.get(6)?,
        trainer_id: r.get(7)?,
        branch_id: r.get(8)?,
    })
}

pub fn insert_slot(conn: &Connection, s: &Slot) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO slots(id, modality_id, weekday, start_time, end_time, max_occupancy, current_occupancy, trainer_id, branch_id)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            s.id,
            s.modality_id,
            s.weekday,
            s.start_time,
            s.end_time,
            s.max_occupancy,
            s.current_occupancy,
            s.trainer_id,
            s.branch_id
        ],
    )?;
    Ok(())
}

pub fn get_slot(conn: &Connection, id: &str) -> rusqlite::Result<Option<Slot>> {
    conn.query_row(
        &format!("SELECT {} FROM slots WHERE id = ?", SLOT_COLS),
        [id],
        slot_row,
    )
    .optional()
}

pub fn list_slots(conn: &Connection, modality_id: Option<&str>) -> rusqlite::Result<Vec<Slot>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM slots
         WHERE (?1 IS NULL OR modality_id = ?1)
         ORDER BY CASE weekday
             WHEN 'monday' THEN 1 WHEN 'tuesday' THEN 2 WHEN 'wednesday' THEN 3
             WHEN 'thursday' THEN 4 WHEN 'friday' THEN 5 WHEN 'saturday' THEN 6
             ELSE 7 END, start_time",
        SLOT_COLS
    ))?;
    let rows = stmt.query_map([modality_id], slot_row)?;
    rows.collect()
}

/// Takes one seat in `slot_id`. The bound check and the increment are one
/// statement, so two writers can never both take the last seat.
pub fn reserve_capacity(conn: &Connection, slot_id: &str) -> CoreResult<()> {
    let changed = conn.execute(
        "UPDATE slots SET current_occupancy = current_occupancy + 1
         WHERE id = ? AND current_occupancy < max_occupancy",
        [slot_id],
    )?;
    if changed == 1 {
        return Ok(());
    }
    match get_slot(conn, slot_id)? {
        None => Err(CoreError::not_found("slot", slot_id)),
        Some(s) => Err(CoreError::Capacity {
            slot_id: s.id,
            current: s.current_occupancy,
            max: s.max_occupancy,
        }),
    }
}

pub fn release_capacity(conn: &Connection, slot_id: &str) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE slots SET current_occupancy = current_occupancy - 1
         WHERE id = ? AND current_occupancy > 0",
        [slot_id],
    )?;
    Ok(changed == 1)
}

// ---------------------------------------------------------------------------
// enrollments

const ENROLLMENT_COLS: &str = "id, student_id, modality_id, branch_id, trainer_id, start_date, end_date,
    classes_total, classes_attended, permissions_available, permissions_used, monthly_fee_cents,
    status, notes, renewed_from_id, created_by, created_at, updated_at";

fn enrollment_row(r: &Row<'_>) -> rusqlite::Result<Enrollment> {
    Ok(Enrollment {
        id: r.get(0)?,
        student_id: r.get(1)?,
        modality_id: r.get(2)?,
        branch_id: r.get(3)?,
        trainer_id: r.get(4)?,
        start_date: r.get(5)?,
        end_date: r.get(6)?,
        classes_total: r.get(7)?,
        classes_attended: r.get(8)?,
        permissions_available: r.get(9)?,
        permissions_used: r.get(10)?,
        monthly_fee_cents: r.get(11)?,
        status: r.get(12)?,
        notes: r.get(13)?,
        renewed_from_id: r.get(14)?,
        created_by: r.get(15)?,
        created_at: r.get(16)?,
        updated_at: r.get(17)?,
    })
}

pub fn insert_enrollment(conn: &Connection, e: &Enrollment) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO enrollments(id, student_id, modality_id, branch_id, trainer_id, start_date, end_date,
            classes_total, classes_attended, permissions_available, permissions_used, monthly_fee_cents,
            status, notes, renewed_from_id, created_by, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            e.id,
            e.student_id,
            e.modality_id,
            e.branch_id,
            e.trainer_id,
            e.start_date,
            e.end_date,
            e.classes_total,
            e.classes_attended,
            e.permissions_available,
            e.permissions_used,
            e.monthly_fee_cents,
            e.status,
            e.notes,
            e.renewed_from_id,
            e.created_by,
            e.created_at,
            e.updated_at
        ],
    )?;
    Ok(())
}

pub fn get_enrollment(conn: &Connection, id: &str) -> rusqlite::Result<Option<Enrollment>> {
    conn.query_row(
        &format!("SELECT {} FROM enrollments WHERE id = ?", ENROLLMENT_COLS),
        [id],
        enrollment_row,
    )
    .optional()
}

pub fn require_enrollment(conn: &Connection, id: &str) -> CoreResult<Enrollment> {
    get_enrollment(conn, id)?.ok_or_else(|| CoreError::not_found("enrollment", id))
}

pub fn list_enrollments(
    conn: &Connection,
    student_id: Option<&str>,
    status: Option<EnrollmentStatus>,
) -> rusqlite::Result<Vec<Enrollment>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM enrollments
         WHERE (?1 IS NULL OR student_id = ?1) AND (?2 IS NULL OR status = ?2)
         ORDER BY start_date DESC, created_at DESC",
        ENROLLMENT_COLS
    ))?;
    let rows = stmt.query_map(params![student_id, status], enrollment_row)?;
    rows.collect()
}

/// Open enrollments (activo / en_mora / suspendida) whose period ended
/// before `date`.
pub fn list_open_enrollments_ending_before(
    conn: &Connection,
    date: NaiveDate,
) -> rusqlite::Result<Vec<Enrollment>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM enrollments
         WHERE end_date < ? AND status IN ('activo', 'en_mora', 'suspendida')
         ORDER BY end_date",
        ENROLLMENT_COLS
    ))?;
    let rows = stmt.query_map([date], enrollment_row)?;
    rows.collect()
}

pub fn find_open_overlap(
    conn: &Connection,
    student_id: &str,
    modality_id: &str,
    start: NaiveDate,
    end: NaiveDate,
    exclude_id: Option<&str>,
) -> rusqlite::Result<Option<Enrollment>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM enrollments
             WHERE student_id = ?1 AND modality_id = ?2
               AND status IN ('activo', 'en_mora', 'suspendida')
               AND start_date <= ?4 AND end_date >= ?3
               AND (?5 IS NULL OR id <> ?5)
             ORDER BY start_date
             LIMIT 1",
            ENROLLMENT_COLS
        ),
        params![student_id, modality_id, start, end, exclude_id],
        enrollment_row,
    )
    .optional()
}

pub fn set_enrollment_status(
    conn: &Connection,
    id: &str,
    status: EnrollmentStatus,
    now: NaiveDateTime,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE enrollments SET status = ?, updated_at = ? WHERE id = ?",
        params![status, now, id],
    )?;
    Ok(())
}

pub fn set_enrollment_end_date(
    conn: &Connection,
    id: &str,
    end: NaiveDate,
    now: NaiveDateTime,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE enrollments SET end_date = ?, updated_at = ? WHERE id = ?",
        params![end, now, id],
    )?;
    Ok(())
}

/// Returns false when the aggregate is already at `classes_total`.
pub fn enrollment_increment_attended(
    conn: &Connection,
    id: &str,
    now: NaiveDateTime,
) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE enrollments SET classes_attended = classes_attended + 1, updated_at = ?
         WHERE id = ? AND classes_attended < classes_total",
        params![now, id],
    )?;
    Ok(changed == 1)
}

pub fn enrollment_decrement_attended(
    conn: &Connection,
    id: &str,
    now: NaiveDateTime,
) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE enrollments SET classes_attended = classes_attended - 1, updated_at = ?
         WHERE id = ? AND classes_attended > 0",
        params![now, id],
    )?;
    Ok(changed == 1)
}

/// Moves one unit from available to used; false when nothing is available.
pub fn enrollment_consume_permission(
    conn: &Connection,
    id: &str,
    now: NaiveDateTime,
) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE enrollments
         SET permissions_used = permissions_used + 1,
             permissions_available = permissions_available - 1,
             updated_at = ?
         WHERE id = ? AND permissions_available > 0",
        params![now, id],
    )?;
    Ok(changed == 1)
}

/// Moves one unit back from used to available; false when nothing is used.
pub fn enrollment_restore_permission(
    conn: &Connection,
    id: &str,
    now: NaiveDateTime,
) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE enrollments
         SET permissions_used = permissions_used - 1,
             permissions_available = permissions_available + 1,
             updated_at = ?
         WHERE id = ? AND permissions_used > 0",
        params![now, id],
    )?;
    Ok(changed == 1)
}

pub fn enrollment_overwrite_counters(
    conn: &Connection,
    id: &str,
    classes_attended: i64,
    permissions_used: i64,
    permissions_available: i64,
    now: NaiveDateTime,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE enrollments
         SET classes_attended = ?, permissions_used = ?, permissions_available = ?, updated_at = ?
         WHERE id = ?",
        params![classes_attended, permissions_used, permissions_available, now, id],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// enrollment slots

const ES_COLS: &str = "id, enrollment_id, slot_id, classes_allocated, classes_attended, classes_remaining,
    permissions_used, start_date, end_date, status, sort_order";

fn es_row(r: &Row<'_>) -> rusqlite::Result<EnrollmentSlot> {
    Ok(EnrollmentSlot {
        id: r.get(0)?,
        enrollment_id: r.get(1)?,
        slot_id: r.get(2)?,
        classes_allocated: r.get(3)?,
        classes_attended: r.get(4)?,
        classes_remaining: r.get(5)?,
        permissions_used: r.get(6)?,
        start_date: r.get(7)?,
        end_date: r.get(8)?,
        status: r.get(9)?,
        sort_order: r.get(10)?,
    })
}

pub fn insert_enrollment_slot(conn: &Connection, es: &EnrollmentSlot) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO enrollment_slots(id, enrollment_id, slot_id, classes_allocated, classes_attended,
            classes_remaining, permissions_used, start_date, end_date, status, sort_order)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            es.id,
            es.enrollment_id,
            es.slot_id,
            es.classes_allocated,
            es.classes_attended,
            es.classes_remaining,
            es.permissions_used,
            es.start_date,
            es.end_date,
            es.status,
            es.sort_order
        ],
    )?;
    Ok(())
}

pub fn list_enrollment_slots(
    conn: &Connection,
    enrollment_id: &str,
) -> rusqlite::Result<Vec<EnrollmentSlot>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM enrollment_slots WHERE enrollment_id = ? ORDER BY sort_order, rowid",
        ES_COLS
    ))?;
    let rows = stmt.query_map([enrollment_id], es_row)?;
    rows.collect()
}

pub fn get_enrollment_slot(conn: &Connection, id: &str) -> rusqlite::Result<Option<EnrollmentSlot>> {
    conn.query_row(
        &format!("SELECT {} FROM enrollment_slots WHERE id = ?", ES_COLS),
        [id],
        es_row,
    )
    .optional()
}

pub fn get_enrollment_slot_by_pair(
    conn: &Connection,
    enrollment_id: &str,
    slot_id: &str,
) -> rusqlite::Result<Option<EnrollmentSlot>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM enrollment_slots WHERE enrollment_id = ? AND slot_id = ?",
            ES_COLS
        ),
        [enrollment_id, slot_id],
        es_row,
    )
    .optional()
}

pub fn next_enrollment_slot_order(conn: &Connection, enrollment_id: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM enrollment_slots WHERE enrollment_id = ?",
        [enrollment_id],
        |r| r.get(0),
    )
}

/// Returns false when the slot has already used its whole allocation.
pub fn enrollment_slot_increment_attended(conn: &Connection, id: &str) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE enrollment_slots
         SET classes_attended = classes_attended + 1,
             classes_remaining = classes_allocated - (classes_attended + 1)
         WHERE id = ? AND classes_attended < classes_allocated",
        [id],
    )?;
    Ok(changed == 1)
}

pub fn enrollment_slot_decrement_attended(conn: &Connection, id: &str) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE enrollment_slots
         SET classes_attended = classes_attended - 1,
             classes_remaining = classes_allocated - (classes_attended - 1)
         WHERE id = ? AND classes_attended > 0",
        [id],
    )?;
    Ok(changed == 1)
}

pub fn enrollment_slot_add_permission(conn: &Connection, id: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE enrollment_slots SET permissions_used = permissions_used + 1 WHERE id = ?",
        [id],
    )?;
    Ok(())
}

pub fn set_enrollment_slot_allocation(
    conn: &Connection,
    id: &str,
    allocated: i64,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE enrollment_slots SET classes_allocated = ? WHERE id = ?",
        params![allocated, id],
    )?;
    Ok(())
}

/// `remaining = max(0, allocated - attended)`; an allocation below what was
/// already attended is raised to `attended`.
pub fn recompute_enrollment_slot_remaining(conn: &Connection, id: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE enrollment_slots
         SET classes_allocated = MAX(classes_allocated, classes_attended),
             classes_remaining = MAX(classes_allocated, classes_attended) - classes_attended
         WHERE id = ?",
        [id],
    )?;
    Ok(())
}

pub fn overwrite_enrollment_slot_counters(
    conn: &Connection,
    id: &str,
    classes_attended: i64,
    permissions_used: i64,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE enrollment_slots SET classes_attended = ?, permissions_used = ? WHERE id = ?",
        params![classes_attended, permissions_used, id],
    )?;
    recompute_enrollment_slot_remaining(conn, id)
}

pub fn set_enrollment_slot_status(
    conn: &Connection,
    id: &str,
    status: EnrollmentSlotStatus,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE enrollment_slots SET status = ? WHERE id = ?",
        params![status, id],
    )?;
    Ok(())
}

/// Deletes the enrollment slot together with its still-`programada`
/// classes; classes with history are kept and unlinked.
pub fn delete_enrollment_slot(conn: &Connection, id: &str) -> rusqlite::Result<usize> {
    let removed = conn.execute(
        "DELETE FROM scheduled_classes WHERE enrollment_slot_id = ? AND state = 'programada'",
        [id],
    )?;
    conn.execute(
        "UPDATE scheduled_classes SET enrollment_slot_id = NULL WHERE enrollment_slot_id = ?",
        [id],
    )?;
    conn.execute("DELETE FROM enrollment_slots WHERE id = ?", [id])?;
    Ok(removed)
}

// ---------------------------------------------------------------------------
// scheduled classes

const CLASS_COLS: &str = "id, enrollment_id, enrollment_slot_id, slot_id, student_id, date, start_time,
    end_time, state, is_make_up, counts_toward_attendance, attendance_id, original_class_id, notes";

fn class_row(r: &Row<'_>) -> rusqlite::Result<ScheduledClass> {
    Ok(ScheduledClass {
        id: r.get(0)?,
        enrollment_id: r.get(1)?,
        enrollment_slot_id: r.get(2)?,
        slot_id: r.get(3)?,
        student_id: r.get(4)?,
        date: r.get(5)?,
        start_time: r.get(6)?,
        end_time: r.get(7)?,
        state: r.get(8)?,
        is_make_up: r.get(9)?,
        counts_toward_attendance: r.get(10)?,
        attendance_id: r.get(11)?,
        original_class_id: r.get(12)?,
        notes: r.get(13)?,
    })
}

/// Returns false when a class already exists for the (enrollment slot, date).
pub fn insert_scheduled_class(conn: &Connection, c: &ScheduledClass) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO scheduled_classes(id, enrollment_id, enrollment_slot_id, slot_id, student_id,
            date, start_time, end_time, state, is_make_up, counts_toward_attendance, attendance_id,
            original_class_id, notes)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            c.id,
            c.enrollment_id,
            c.enrollment_slot_id,
            c.slot_id,
            c.student_id,
            c.date,
            c.start_time,
            c.end_time,
            c.state,
            c.is_make_up,
            c.counts_toward_attendance,
            c.attendance_id,
            c.original_class_id,
            c.notes
        ],
    )?;
    Ok(changed == 1)
}

/// Regular (non make-up, non canceled) classes of one enrollment slot.
pub fn count_regular_classes(conn: &Connection, enrollment_slot_id: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM scheduled_classes
         WHERE enrollment_slot_id = ? AND is_make_up = 0 AND state <> 'cancelada'",
        [enrollment_slot_id],
        |r| r.get(0),
    )
}

pub fn find_class(
    conn: &Connection,
    enrollment_slot_id: &str,
    date: NaiveDate,
) -> rusqlite::Result<Option<ScheduledClass>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM scheduled_classes WHERE enrollment_slot_id = ? AND date = ?",
            CLASS_COLS
        ),
        params![enrollment_slot_id, date],
        class_row,
    )
    .optional()
}

#[cfg(test)]
pub fn get_class(conn: &Connection, id: &str) -> rusqlite::Result<Option<ScheduledClass>> {
    conn.query_row(
        &format!("SELECT {} FROM scheduled_classes WHERE id = ?", CLASS_COLS),
        [id],
        class_row,
    )
    .optional()
}

pub fn set_class_state(
    conn: &Connection,
    id: &str,
    state: ClassState,
    attendance_id: Option<&str>,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE scheduled_classes SET state = ?, attendance_id = COALESCE(?, attendance_id) WHERE id = ?",
        params![state, attendance_id, id],
    )?;
    Ok(())
}

pub fn list_classes(
    conn: &Connection,
    enrollment_id: &str,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> rusqlite::Result<Vec<ScheduledClass>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM scheduled_classes
         WHERE enrollment_id = ?1 AND (?2 IS NULL OR date >= ?2) AND (?3 IS NULL OR date <= ?3)
         ORDER BY date, start_time",
        CLASS_COLS
    ))?;
    let rows = stmt.query_map(params![enrollment_id, from, to], class_row)?;
    rows.collect()
}

/// Future `programada` classes of an enrollment slot, latest first.
pub fn list_future_scheduled(
    conn: &Connection,
    enrollment_slot_id: &str,
    from: NaiveDate,
) -> rusqlite::Result<Vec<ScheduledClass>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM scheduled_classes
         WHERE enrollment_slot_id = ? AND state = 'programada' AND is_make_up = 0 AND date >= ?
         ORDER BY date DESC",
        CLASS_COLS
    ))?;
    let rows = stmt.query_map(params![enrollment_slot_id, from], class_row)?;
    rows.collect()
}

pub fn cancel_scheduled_from(
    conn: &Connection,
    enrollment_id: &str,
    from: NaiveDate,
) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE scheduled_classes SET state = 'cancelada'
         WHERE enrollment_id = ? AND state = 'programada' AND date >= ?",
        params![enrollment_id, from],
    )
}

// ---------------------------------------------------------------------------
// attendance

const ATTENDANCE_COLS: &str =
    "id, enrollment_id, slot_id, date, state, note, recovered, permission_id, counted, slot_counted";

fn attendance_row(r: &Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    Ok(AttendanceRecord {
        id: r.get(0)?,
        enrollment_id: r.get(1)?,
        slot_id: r.get(2)?,
        date: r.get(3)?,
        state: r.get(4)?,
        note: r.get(5)?,
        recovered: r.get(6)?,
        permission_id: r.get(7)?,
        counted: r.get(8)?,
        slot_counted: r.get(9)?,
    })
}

pub fn get_attendance(
    conn: &Connection,
    enrollment_id: &str,
    slot_id: &str,
    date: NaiveDate,
) -> rusqlite::Result<Option<AttendanceRecord>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM attendance WHERE enrollment_id = ? AND slot_id = ? AND date = ?",
            ATTENDANCE_COLS
        ),
        params![enrollment_id, slot_id, date],
        attendance_row,
    )
    .optional()
}

pub fn insert_attendance(
    conn: &Connection,
    a: &AttendanceRecord,
    recorded_by: Option<&str>,
    now: NaiveDateTime,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO attendance(id, enrollment_id, slot_id, date, state, note, recovered, permission_id,
                                counted, slot_counted, recorded_by, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            a.id,
            a.enrollment_id,
            a.slot_id,
            a.date,
            a.state,
            a.note,
            a.recovered,
            a.permission_id,
            a.counted,
            a.slot_counted,
            recorded_by,
            now
        ],
    )?;
    Ok(())
}

pub fn update_attendance(
    conn: &Connection,
    a: &AttendanceRecord,
    recorded_by: Option<&str>,
    now: NaiveDateTime,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE attendance SET state = ?, note = ?, recovered = ?, permission_id = ?,
                counted = ?, slot_counted = ?, recorded_by = ?, updated_at = ?
         WHERE id = ?",
        params![
            a.state,
            a.note,
            a.recovered,
            a.permission_id,
            a.counted,
            a.slot_counted,
            recorded_by,
            now,
            a.id
        ],
    )?;
    Ok(())
}

pub fn list_attendance(
    conn: &Connection,
    enrollment_id: &str,
) -> rusqlite::Result<Vec<AttendanceRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM attendance WHERE enrollment_id = ? ORDER BY date, slot_id",
        ATTENDANCE_COLS
    ))?;
    let rows = stmt.query_map([enrollment_id], attendance_row)?;
    rows.collect()
}

/// Regular attendance (make-up completions excluded) for the enrollment,
/// optionally restricted to one slot.
pub fn count_attended(
    conn: &Connection,
    enrollment_id: &str,
    slot_id: Option<&str>,
) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM attendance
         WHERE enrollment_id = ?1 AND state = 'asistio' AND recovered = 0
           AND (?2 IS NULL OR slot_id = ?2)",
        params![enrollment_id, slot_id],
        |r| r.get(0),
    )
}

// ---------------------------------------------------------------------------
// permissions

const PERMISSION_COLS: &str = "id, enrollment_id, attendance_id, slot_id, request_date, absence_date,
    reason, status, approver_id, has_make_up, make_up_id";

fn permission_row(r: &Row<'_>) -> rusqlite::Result<Permission> {
    Ok(Permission {
        id: r.get(0)?,
        enrollment_id: r.get(1)?,
        attendance_id: r.get(2)?,
        slot_id: r.get(3)?,
        request_date: r.get(4)?,
        absence_date: r.get(5)?,
        reason: r.get(6)?,
        status: r.get(7)?,
        approver_id: r.get(8)?,
        has_make_up: r.get(9)?,
        make_up_id: r.get(10)?,
    })
}

pub fn insert_permission(conn: &Connection, p: &Permission) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO permissions(id, enrollment_id, attendance_id, slot_id, request_date, absence_date,
            reason, status, approver_id, has_make_up, make_up_id)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            p.id,
            p.enrollment_id,
            p.attendance_id,
            p.slot_id,
            p.request_date,
            p.absence_date,
            p.reason,
            p.status,
            p.approver_id,
            p.has_make_up,
            p.make_up_id
        ],
    )?;
    Ok(())
}

pub fn get_permission(conn: &Connection, id: &str) -> rusqlite::Result<Option<Permission>> {
    conn.query_row(
        &format!("SELECT {} FROM permissions WHERE id = ?", PERMISSION_COLS),
        [id],
        permission_row,
    )
    .optional()
}

pub fn list_permissions(conn: &Connection, enrollment_id: &str) -> rusqlite::Result<Vec<Permission>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM permissions WHERE enrollment_id = ? ORDER BY absence_date",
        PERMISSION_COLS
    ))?;
    let rows = stmt.query_map([enrollment_id], permission_row)?;
    rows.collect()
}

/// Non-rejected permissions whose absence falls in `[from, to]`.
pub fn count_permissions_between(
    conn: &Connection,
    enrollment_id: &str,
    from: NaiveDate,
    to: NaiveDate,
) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM permissions
         WHERE enrollment_id = ? AND status <> 'rechazado' AND absence_date BETWEEN ? AND ?",
        params![enrollment_id, from, to],
        |r| r.get(0),
    )
}

/// Approved permissions not yet given back by a completed make-up.
pub fn count_outstanding_permissions(conn: &Connection, enrollment_id: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM permissions p
         WHERE p.enrollment_id = ? AND p.status = 'aprobado'
           AND NOT EXISTS (
             SELECT 1 FROM make_up_classes m
             WHERE m.permission_id = p.id AND m.status = 'completada'
           )",
        [enrollment_id],
        |r| r.get(0),
    )
}

pub fn count_slot_permissions(
    conn: &Connection,
    enrollment_id: &str,
    slot_id: &str,
) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM permissions
         WHERE enrollment_id = ? AND slot_id = ? AND status = 'aprobado'",
        [enrollment_id, slot_id],
        |r| r.get(0),
    )
}

pub fn set_permission_make_up(
    conn: &Connection,
    id: &str,
    make_up_id: Option<&str>,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE permissions SET has_make_up = ?, make_up_id = ? WHERE id = ?",
        params![make_up_id.is_some(), make_up_id, id],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// make-up classes

const MAKE_UP_COLS: &str = "id, enrollment_id, student_id, permission_id, slot_id, scheduled_date, deadline,
    status, completed_at, attendance_id, scheduled_class_id";

fn make_up_row(r: &Row<'_>) -> rusqlite::Result<MakeUpClass> {
    Ok(MakeUpClass {
        id: r.get(0)?,
        enrollment_id: r.get(1)?,
        student_id: r.get(2)?,
        permission_id: r.get(3)?,
        slot_id: r.get(4)?,
        scheduled_date: r.get(5)?,
        deadline: r.get(6)?,
        status: r.get(7)?,
        completed_at: r.get(8)?,
        attendance_id: r.get(9)?,
        scheduled_class_id: r.get(10)?,
    })
}

pub fn insert_make_up(conn: &Connection, m: &MakeUpClass) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO make_up_classes(id, enrollment_id, student_id, permission_id, slot_id, scheduled_date,
            deadline, status, completed_at, attendance_id, scheduled_class_id)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            m.id,
            m.enrollment_id,
            m.student_id,
            m.permission_id,
            m.slot_id,
            m.scheduled_date,
            m.deadline,
            m.status,
            m.completed_at,
            m.attendance_id,
            m.scheduled_class_id
        ],
    )?;
    Ok(())
}

pub fn get_make_up(conn: &Connection, id: &str) -> rusqlite::Result<Option<MakeUpClass>> {
    conn.query_row(
        &format!("SELECT {} FROM make_up_classes WHERE id = ?", MAKE_UP_COLS),
        [id],
        make_up_row,
    )
    .optional()
}

pub fn active_make_up_for_permission(
    conn: &Connection,
    permission_id: &str,
) -> rusqlite::Result<Option<MakeUpClass>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM make_up_classes
             WHERE permission_id = ? AND status IN ('pendiente', 'programada')
             LIMIT 1",
            MAKE_UP_COLS
        ),
        [permission_id],
        make_up_row,
    )
    .optional()
}

pub fn list_make_ups(conn: &Connection, enrollment_id: &str) -> rusqlite::Result<Vec<MakeUpClass>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM make_up_classes WHERE enrollment_id = ? ORDER BY scheduled_date",
        MAKE_UP_COLS
    ))?;
    let rows = stmt.query_map([enrollment_id], make_up_row)?;
    rows.collect()
}

pub fn finish_make_up(
    conn: &Connection,
    id: &str,
    status: MakeUpStatus,
    completed_at: Option<NaiveDateTime>,
    attendance_id: Option<&str>,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE make_up_classes SET status = ?, completed_at = ?, attendance_id = ? WHERE id = ?",
        params![status, completed_at, attendance_id, id],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// payments

const PAYMENT_COLS: &str = "id, enrollment_id, amount_cents, discount_cents, discount_reason, method,
    paid_date, due_date, status, is_partial, group_id, installment, refunded_at, created_by";

fn payment_row(r: &Row<'_>) -> rusqlite::Result<Payment> {
    Ok(Payment {
        id: r.get(0)?,
        enrollment_id: r.get(1)?,
        amount_cents: r.get(2)?,
        discount_cents: r.get(3)?,
        discount_reason: r.get(4)?,
        method: r.get(5)?,
        paid_date: r.get(6)?,
        due_date: r.get(7)?,
        status: r.get(8)?,
        is_partial: r.get(9)?,
        group_id: r.get(10)?,
        installment: r.get(11)?,
        refunded_at: r.get(12)?,
        created_by: r.get(13)?,
    })
}

pub fn insert_payment(conn: &Connection, p: &Payment) -> CoreResult<()> {
    let res = conn.execute(
        "INSERT INTO payments(id, enrollment_id, amount_cents, discount_cents, discount_reason, method,
            paid_date, due_date, status, is_partial, group_id, installment, refunded_at, created_by)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            p.id,
            p.enrollment_id,
            p.amount_cents,
            p.discount_cents,
            p.discount_reason,
            p.method,
            p.paid_date,
            p.due_date,
            p.status,
            p.is_partial,
            p.group_id,
            p.installment,
            p.refunded_at,
            p.created_by
        ],
    );
    match res {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(CoreError::Conflict {
                message: format!(
                    "installment {} already exists in payment group",
                    p.installment.unwrap_or_default()
                ),
                existing_id: p.group_id.clone().unwrap_or_default(),
                existing_state: "exists".to_string(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

pub fn get_payment(conn: &Connection, id: &str) -> rusqlite::Result<Option<Payment>> {
    conn.query_row(
        &format!("SELECT {} FROM payments WHERE id = ?", PAYMENT_COLS),
        [id],
        payment_row,
    )
    .optional()
}

pub fn list_payments(conn: &Connection, enrollment_id: &str) -> rusqlite::Result<Vec<Payment>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM payments WHERE enrollment_id = ? ORDER BY COALESCE(paid_date, due_date), installment",
        PAYMENT_COLS
    ))?;
    let rows = stmt.query_map([enrollment_id], payment_row)?;
    rows.collect()
}

/// Unpaid installment (pendiente or vencido) of the enrollment, if any.
pub fn open_installment(conn: &Connection, enrollment_id: &str) -> rusqlite::Result<Option<Payment>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM payments
             WHERE enrollment_id = ? AND status IN ('pendiente', 'vencido')
             ORDER BY installment
             LIMIT 1",
            PAYMENT_COLS
        ),
        [enrollment_id],
        payment_row,
    )
    .optional()
}

pub fn paid_covered_total(conn: &Connection, enrollment_id: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COALESCE(SUM(amount_cents + discount_cents), 0) FROM payments
         WHERE enrollment_id = ? AND status = 'pagado'",
        [enrollment_id],
        |r| r.get(0),
    )
}

/// Turns an open installment into a `pagado` payment.
pub fn settle_installment(
    conn: &Connection,
    id: &str,
    amount_cents: i64,
    discount_cents: i64,
    method: PaymentMethod,
    paid_date: NaiveDate,
    created_by: Option<&str>,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE payments SET status = 'pagado', amount_cents = ?, discount_cents = ?, method = ?,
            paid_date = ?, created_by = COALESCE(?, created_by)
         WHERE id = ?",
        params![amount_cents, discount_cents, method, paid_date, created_by, id],
    )?;
    Ok(())
}

pub fn void_payment(conn: &Connection, id: &str, at: NaiveDateTime) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE payments SET status = 'anulado', refunded_at = ? WHERE id = ?",
        params![at, id],
    )?;
    Ok(())
}

/// Voids the still-open installments of a payment group.
pub fn void_open_installments(
    conn: &Connection,
    group_id: &str,
    at: NaiveDateTime,
) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE payments SET status = 'anulado', refunded_at = ?
         WHERE group_id = ? AND status IN ('pendiente', 'vencido')",
        params![at, group_id],
    )
}

/// Flags pending installments past their due date; returns the enrollments
/// that own at least one overdue installment.
pub fn mark_overdue(conn: &Connection, today: NaiveDate) -> rusqlite::Result<Vec<String>> {
    conn.execute(
        "UPDATE payments SET status = 'vencido'
         WHERE status = 'pendiente' AND due_date IS NOT NULL AND due_date < ?",
        [today],
    )?;
    let mut stmt = conn.prepare(
        "SELECT DISTINCT enrollment_id FROM payments WHERE status = 'vencido' ORDER BY enrollment_id",
    )?;
    let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
    rows.collect()
}
