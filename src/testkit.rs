//! Fixtures shared by the unit tests.

use chrono::NaiveDate;
use rusqlite::Connection;

use crate::calendar::{parse_date, Weekday};
use crate::clock::FixedClock;
use crate::model::{Enrollment, EnrollmentStatus, Modality, Slot, Student};
use crate::{db, store};

pub fn db() -> Connection {
    db::open_in_memory().expect("in-memory db")
}

pub fn d(s: &str) -> NaiveDate {
    parse_date(s).expect("date")
}

pub fn clock_at(s: &str) -> FixedClock {
    FixedClock::at_date(d(s)).expect("clock")
}

pub fn seed_student(conn: &Connection) -> String {
    let s = Student {
        id: store::new_id(),
        full_name: "Valeria Rojas".into(),
        document: None,
        phone: None,
        email: None,
        active: true,
    };
    store::insert_student(conn, &s, clock_at("2026-01-01").0).expect("student");
    s.id
}

pub fn seed_modality(conn: &Connection, classes_total: i64, fee_cents: i64) -> String {
    let id = store::new_id();
    let m = Modality {
        name: format!("Funcional {}", &id[..8]),
        id,
        classes_total,
        max_permissions: 3,
        monthly_fee_cents: fee_cents,
        period_days: 31,
        active: true,
    };
    store::insert_modality(conn, &m).expect("modality");
    m.id
}

pub fn seed_slot(conn: &Connection, modality_id: &str, weekday: &str, max: i64) -> String {
    let s = Slot {
        id: store::new_id(),
        modality_id: Some(modality_id.to_string()),
        weekday: Weekday::parse(weekday).expect("weekday"),
        start_time: "18:00".into(),
        end_time: "19:00".into(),
        max_occupancy: max,
        current_occupancy: 0,
        trainer_id: None,
        branch_id: None,
    };
    store::insert_slot(conn, &s).expect("slot");
    s.id
}

/// Bare enrollment row with no slots attached.
pub fn seed_enrollment(
    conn: &Connection,
    student_id: &str,
    modality_id: &str,
    start: &str,
    end: &str,
) -> Enrollment {
    let m = store::get_modality(conn, modality_id)
        .expect("query")
        .expect("modality");
    let now = clock_at(start).0;
    let e = Enrollment {
        id: store::new_id(),
        student_id: student_id.to_string(),
        modality_id: modality_id.to_string(),
        branch_id: None,
        trainer_id: None,
        start_date: d(start),
        end_date: d(end),
        classes_total: m.classes_total,
        classes_attended: 0,
        permissions_available: m.max_permissions,
        permissions_used: 0,
        monthly_fee_cents: m.monthly_fee_cents,
        status: EnrollmentStatus::Active,
        notes: None,
        renewed_from_id: None,
        created_by: None,
        created_at: now,
        updated_at: now,
    };
    store::insert_enrollment(conn, &e).expect("enrollment");
    e
}
