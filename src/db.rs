use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::Path;

pub const DB_FILE: &str = "academy.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    init_schema(&conn)?;
    Ok(conn)
}

#[cfg(test)]
pub fn open_in_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            full_name TEXT NOT NULL,
            document TEXT,
            phone TEXT,
            email TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS modalities(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            classes_total INTEGER NOT NULL,
            max_permissions INTEGER NOT NULL DEFAULT 3,
            monthly_fee_cents INTEGER NOT NULL,
            period_days INTEGER NOT NULL DEFAULT 30,
            active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS slots(
            id TEXT PRIMARY KEY,
            modality_id TEXT,
            weekday TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            max_occupancy INTEGER NOT NULL,
            current_occupancy INTEGER NOT NULL DEFAULT 0,
            trainer_id TEXT,
            branch_id TEXT,
            CHECK(current_occupancy >= 0),
            FOREIGN KEY(modality_id) REFERENCES modalities(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            modality_id TEXT NOT NULL,
            branch_id TEXT,
            trainer_id TEXT,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            classes_total INTEGER NOT NULL,
            classes_attended INTEGER NOT NULL DEFAULT 0,
            permissions_available INTEGER NOT NULL,
            permissions_used INTEGER NOT NULL DEFAULT 0,
            monthly_fee_cents INTEGER NOT NULL,
            status TEXT NOT NULL,
            notes TEXT,
            renewed_from_id TEXT,
            created_by TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            CHECK(classes_attended <= classes_total),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(modality_id) REFERENCES modalities(id),
            FOREIGN KEY(renewed_from_id) REFERENCES enrollments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student ON enrollments(student_id, modality_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollment_slots(
            id TEXT PRIMARY KEY,
            enrollment_id TEXT NOT NULL,
            slot_id TEXT NOT NULL,
            classes_allocated INTEGER NOT NULL,
            classes_attended INTEGER NOT NULL DEFAULT 0,
            classes_remaining INTEGER NOT NULL,
            permissions_used INTEGER NOT NULL DEFAULT 0,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            status TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(enrollment_id) REFERENCES enrollments(id),
            UNIQUE(enrollment_id, slot_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS scheduled_classes(
            id TEXT PRIMARY KEY,
            enrollment_id TEXT NOT NULL,
            enrollment_slot_id TEXT,
            slot_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            date TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            state TEXT NOT NULL,
            is_make_up INTEGER NOT NULL DEFAULT 0,
            counts_toward_attendance INTEGER NOT NULL DEFAULT 1,
            attendance_id TEXT,
            original_class_id TEXT,
            notes TEXT,
            FOREIGN KEY(enrollment_id) REFERENCES enrollments(id),
            FOREIGN KEY(enrollment_slot_id) REFERENCES enrollment_slots(id),
            UNIQUE(enrollment_slot_id, date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_scheduled_classes_enrollment ON scheduled_classes(enrollment_id, date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            enrollment_id TEXT NOT NULL,
            slot_id TEXT NOT NULL,
            date TEXT NOT NULL,
            state TEXT NOT NULL,
            note TEXT,
            recovered INTEGER NOT NULL DEFAULT 0,
            permission_id TEXT,
            counted INTEGER NOT NULL DEFAULT 0,
            slot_counted INTEGER NOT NULL DEFAULT 0,
            recorded_by TEXT,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(enrollment_id) REFERENCES enrollments(id),
            UNIQUE(enrollment_id, slot_id, date)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS permissions(
            id TEXT PRIMARY KEY,
            enrollment_id TEXT NOT NULL,
            attendance_id TEXT NOT NULL,
            slot_id TEXT NOT NULL,
            request_date TEXT NOT NULL,
            absence_date TEXT NOT NULL,
            reason TEXT NOT NULL,
            status TEXT NOT NULL,
            approver_id TEXT,
            has_make_up INTEGER NOT NULL DEFAULT 0,
            make_up_id TEXT,
            FOREIGN KEY(enrollment_id) REFERENCES enrollments(id),
            FOREIGN KEY(attendance_id) REFERENCES attendance(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_permissions_enrollment ON permissions(enrollment_id, absence_date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS make_up_classes(
            id TEXT PRIMARY KEY,
            enrollment_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            permission_id TEXT NOT NULL,
            slot_id TEXT NOT NULL,
            scheduled_date TEXT NOT NULL,
            deadline TEXT NOT NULL,
            status TEXT NOT NULL,
            completed_at TEXT,
            attendance_id TEXT,
            scheduled_class_id TEXT,
            FOREIGN KEY(enrollment_id) REFERENCES enrollments(id),
            FOREIGN KEY(permission_id) REFERENCES permissions(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_make_up_classes_permission ON make_up_classes(permission_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS payments(
            id TEXT PRIMARY KEY,
            enrollment_id TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            discount_cents INTEGER NOT NULL DEFAULT 0,
            discount_reason TEXT,
            method TEXT NOT NULL,
            paid_date TEXT,
            due_date TEXT,
            status TEXT NOT NULL,
            is_partial INTEGER NOT NULL DEFAULT 0,
            group_id TEXT,
            installment INTEGER,
            refunded_at TEXT,
            created_by TEXT,
            FOREIGN KEY(enrollment_id) REFERENCES enrollments(id),
            UNIQUE(group_id, installment)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_enrollment ON payments(enrollment_id)",
        [],
    )?;

    Ok(())
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    // A corrupt value falls back to defaults rather than blocking the workspace.
    Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, value.to_string()),
    )?;
    Ok(())
}

/// Runs `f` inside a `BEGIN IMMEDIATE` transaction. The reserved lock taken
/// up front serializes writers, so capacity checks and increments done in
/// `f` cannot interleave with another writer. Any error rolls back every
/// write made by `f`.
pub fn with_immediate_tx<T, E, F>(conn: &Connection, f: F) -> Result<T, E>
where
    E: From<rusqlite::Error>,
    F: FnOnce(&Transaction<'_>) -> Result<T, E>,
{
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    match f(&tx) {
        Ok(v) => {
            tx.commit()?;
            Ok(v)
        }
        Err(e) => {
            if let Err(rb) = tx.rollback() {
                tracing::error!(error = %rb, "rollback failed");
            }
            Err(e)
        }
    }
}
