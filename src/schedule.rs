use chrono::NaiveDate;
use rusqlite::Connection;
use serde::Serialize;

use crate::calendar::{dates_for_weekday, Weekday};
use crate::config::InsufficientDatesPolicy;
use crate::error::{CoreError, CoreResult};
use crate::ledger;
use crate::model::{
    ClassState, Enrollment, EnrollmentSlot, EnrollmentSlotStatus, ScheduledClass, Slot,
};
use crate::quota;
use crate::store;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotSchedule {
    pub enrollment_slot_id: String,
    pub slot_id: String,
    pub weekday: Option<Weekday>,
    pub allocated: i64,
    pub available: i64,
    pub created: i64,
    pub existing: i64,
    pub restored: i64,
    pub shortfall: i64,
    pub skipped: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleReport {
    pub slots: Vec<SlotSchedule>,
    pub warnings: Vec<String>,
}

impl ScheduleReport {
    pub fn created(&self) -> i64 {
        self.slots.iter().map(|s| s.created).sum()
    }

    pub fn existing(&self) -> i64 {
        self.slots.iter().map(|s| s.existing).sum()
    }
}

/// Creates the `programada` classes of every active enrollment slot: the
/// first `classes_allocated` matching dates of the slot's period. Dates that
/// already have a class are counted as existing, so re-running is a no-op.
pub fn generate(
    conn: &Connection,
    enrollment: &Enrollment,
    policy: InsufficientDatesPolicy,
) -> CoreResult<ScheduleReport> {
    let mut report = ScheduleReport::default();

    for es in store::list_enrollment_slots(conn, &enrollment.id)? {
        if es.status != EnrollmentSlotStatus::Active {
            continue;
        }
        let Some(slot) = store::get_slot(conn, &es.slot_id)? else {
            tracing::warn!(
                enrollment = %enrollment.id,
                slot = %es.slot_id,
                "slot missing, skipping schedule generation"
            );
            report
                .warnings
                .push(format!("slot {} no longer exists; skipped", es.slot_id));
            report.slots.push(SlotSchedule {
                enrollment_slot_id: es.id.clone(),
                slot_id: es.slot_id.clone(),
                weekday: None,
                allocated: es.classes_allocated,
                available: 0,
                created: 0,
                existing: 0,
                restored: 0,
                shortfall: 0,
                skipped: true,
            });
            continue;
        };

        let dates = dates_for_weekday(slot.weekday, es.start_date, es.end_date);
        let available = dates.clone().count() as i64;
        let wanted = es.classes_allocated.max(0);
        let mut shortfall = 0;
        if available < wanted {
            shortfall = wanted - available;
            match policy {
                InsufficientDatesPolicy::Fail => {
                    return Err(CoreError::InsufficientData {
                        slot_id: slot.id.clone(),
                        required: wanted as u32,
                        available: available as u32,
                        shortfall: shortfall as u32,
                    });
                }
                InsufficientDatesPolicy::Clamp => {
                    tracing::warn!(
                        enrollment = %enrollment.id,
                        slot = %slot.id,
                        required = wanted,
                        available,
                        "not enough dates in period, schedule clamped"
                    );
                    report.warnings.push(format!(
                        "slot {} ({}) has {} dates for {} classes; short by {}",
                        slot.id,
                        slot.weekday.as_str(),
                        available,
                        wanted,
                        shortfall
                    ));
                }
            }
        }

        let (mut created, mut existing, mut restored) = (0, 0, 0);
        for date in dates.take(wanted as usize) {
            if store::insert_scheduled_class(conn, &regular_class(enrollment, &es, &slot, date))? {
                created += 1;
                continue;
            }
            existing += 1;
            // A class trimmed by an earlier quota change comes back.
            if let Some(class) = store::find_class(conn, &es.id, date)? {
                if class.state == ClassState::Canceled {
                    store::set_class_state(conn, &class.id, ClassState::Scheduled, None)?;
                    restored += 1;
                }
            }
        }

        report.slots.push(SlotSchedule {
            enrollment_slot_id: es.id.clone(),
            slot_id: slot.id.clone(),
            weekday: Some(slot.weekday),
            allocated: es.classes_allocated,
            available,
            created,
            existing,
            restored,
            shortfall,
            skipped: false,
        });
    }

    tracing::debug!(
        enrollment = %enrollment.id,
        created = report.created(),
        existing = report.existing(),
        "schedule generated"
    );
    Ok(report)
}

fn regular_class(
    enrollment: &Enrollment,
    es: &EnrollmentSlot,
    slot: &Slot,
    date: NaiveDate,
) -> ScheduledClass {
    ScheduledClass {
        id: store::new_id(),
        enrollment_id: enrollment.id.clone(),
        enrollment_slot_id: Some(es.id.clone()),
        slot_id: slot.id.clone(),
        student_id: enrollment.student_id.clone(),
        date,
        start_time: slot.start_time.clone(),
        end_time: slot.end_time.clone(),
        state: ClassState::Scheduled,
        is_make_up: false,
        counts_toward_attendance: true,
        attendance_id: None,
        original_class_id: None,
        notes: None,
    }
}

/// Attaches `slot_id` to the enrollment, taking one seat in the slot.
pub fn attach_slot(
    conn: &Connection,
    enrollment: &Enrollment,
    slot_id: &str,
    allocated: i64,
    period: (NaiveDate, NaiveDate),
) -> CoreResult<EnrollmentSlot> {
    let slot = store::get_slot(conn, slot_id)?.ok_or_else(|| CoreError::not_found("slot", slot_id))?;
    if let Some(modality) = slot.modality_id.as_deref() {
        if modality != enrollment.modality_id {
            return Err(CoreError::validation(format!(
                "slot {} belongs to another modality",
                slot_id
            )));
        }
    }
    if let Some(existing) = store::get_enrollment_slot_by_pair(conn, &enrollment.id, slot_id)? {
        return Err(CoreError::Conflict {
            message: format!("slot {} is already attached", slot_id),
            existing_id: existing.id,
            existing_state: existing.status.to_string(),
        });
    }
    store::reserve_capacity(conn, slot_id)?;

    let es = EnrollmentSlot {
        id: store::new_id(),
        enrollment_id: enrollment.id.clone(),
        slot_id: slot_id.to_string(),
        classes_allocated: allocated,
        classes_attended: 0,
        classes_remaining: allocated,
        permissions_used: 0,
        start_date: period.0,
        end_date: period.1,
        status: EnrollmentSlotStatus::Active,
        sort_order: store::next_enrollment_slot_order(conn, &enrollment.id)?,
    };
    store::insert_enrollment_slot(conn, &es)?;
    Ok(es)
}

/// Re-splits the enrollment quota over its active slots (attachment order),
/// then brings remaining counts and future classes in line with the new
/// allocations.
pub fn redistribute(
    conn: &Connection,
    enrollment: &Enrollment,
    today: NaiveDate,
) -> CoreResult<Vec<EnrollmentSlot>> {
    let active: Vec<EnrollmentSlot> = store::list_enrollment_slots(conn, &enrollment.id)?
        .into_iter()
        .filter(|es| es.status == EnrollmentSlotStatus::Active)
        .collect();
    let shares = quota::distribute(enrollment.classes_total.max(0) as u32, active.len());
    for (es, share) in active.iter().zip(shares) {
        store::set_enrollment_slot_allocation(conn, &es.id, share as i64)?;
        ledger::recompute_remaining(conn, &es.id)?;
    }
    let mut out = Vec::with_capacity(active.len());
    for es in active {
        if let Some(fresh) = store::get_enrollment_slot(conn, &es.id)? {
            trim_surplus(conn, &fresh, today)?;
            out.push(fresh);
        }
    }
    Ok(out)
}

/// Cancels future `programada` classes beyond the slot's allocation,
/// latest first. Returns how many were canceled.
pub fn trim_surplus(conn: &Connection, es: &EnrollmentSlot, today: NaiveDate) -> CoreResult<i64> {
    let live = store::count_regular_classes(conn, &es.id)?;
    let mut surplus = live - es.classes_allocated;
    if surplus <= 0 {
        return Ok(0);
    }
    let mut canceled = 0;
    for class in store::list_future_scheduled(conn, &es.id, today)? {
        if surplus == 0 {
            break;
        }
        store::set_class_state(conn, &class.id, ClassState::Canceled, None)?;
        surplus -= 1;
        canceled += 1;
    }
    if surplus > 0 {
        tracing::warn!(
            enrollment_slot = %es.id,
            surplus,
            "surplus classes are already in the past and were kept"
        );
    }
    Ok(canceled)
}

/// Gives back the seats held by every active slot of the enrollment.
pub fn release_slots(conn: &Connection, enrollment_id: &str) -> CoreResult<usize> {
    let mut released = 0;
    for es in store::list_enrollment_slots(conn, enrollment_id)? {
        if es.status != EnrollmentSlotStatus::Active {
            continue;
        }
        if !store::release_capacity(conn, &es.slot_id)? {
            tracing::warn!(slot = %es.slot_id, "no occupancy to release");
        }
        store::set_enrollment_slot_status(conn, &es.id, EnrollmentSlotStatus::Released)?;
        released += 1;
    }
    Ok(released)
}
