use chrono::NaiveTime;
use rusqlite::Connection;
use serde_json::Value;

use crate::calendar::Weekday;
use crate::clock::Ctx;
use crate::error::CoreError;
use crate::ipc::helpers::{
    get_opt_bool, get_opt_i64, get_opt_str, get_required_i64, get_required_str, mutate, read,
    reply, reply_created, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{Modality, Slot, Student};
use crate::store;

const DEFAULT_MAX_PERMISSIONS: i64 = 3;
const DEFAULT_PERIOD_DAYS: i64 = 30;

fn students_create(conn: &Connection, ctx: &Ctx<'_>, params: &Value) -> Result<Student, HandlerErr> {
    let student = Student {
        id: store::new_id(),
        full_name: get_required_str(params, "fullName")?,
        document: get_opt_str(params, "document"),
        phone: get_opt_str(params, "phone"),
        email: get_opt_str(params, "email"),
        active: true,
    };
    store::insert_student(conn, &student, ctx.now())?;
    tracing::info!(student = %student.id, "student created");
    Ok(student)
}

fn modalities_create(conn: &Connection, params: &Value) -> Result<Modality, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let classes_total = get_required_i64(params, "classesTotal")?;
    let max_permissions = get_opt_i64(params, "maxPermissions")?.unwrap_or(DEFAULT_MAX_PERMISSIONS);
    let monthly_fee_cents = get_required_i64(params, "monthlyFeeCents")?;
    let period_days = get_opt_i64(params, "periodDays")?.unwrap_or(DEFAULT_PERIOD_DAYS);
    if classes_total <= 0 {
        return Err(CoreError::validation("classesTotal must be positive").into());
    }
    if max_permissions < 0 || monthly_fee_cents < 0 {
        return Err(CoreError::validation("maxPermissions and monthlyFeeCents must not be negative").into());
    }
    if !(1..=366).contains(&period_days) {
        return Err(CoreError::validation("periodDays must be in 1..=366").into());
    }
    if let Some(existing) = store::find_modality_by_name(conn, &name)? {
        return Err(CoreError::Conflict {
            message: format!("modality {} already exists", name),
            existing_id: existing.id,
            existing_state: if existing.active { "active" } else { "inactive" }.to_string(),
        }
        .into());
    }
    let modality = Modality {
        id: store::new_id(),
        name,
        classes_total,
        max_permissions,
        monthly_fee_cents,
        period_days,
        active: get_opt_bool(params, "active")?.unwrap_or(true),
    };
    store::insert_modality(conn, &modality)?;
    tracing::info!(modality = %modality.id, name = %modality.name, "modality created");
    Ok(modality)
}

fn parse_time(params: &Value, key: &str) -> Result<NaiveTime, HandlerErr> {
    let raw = get_required_str(params, key)?;
    NaiveTime::parse_from_str(&raw, "%H:%M")
        .map_err(|_| HandlerErr::bad_params(format!("{} must be HH:MM", key)))
}

fn slots_create(conn: &Connection, params: &Value) -> Result<Slot, HandlerErr> {
    let modality_id = get_opt_str(params, "modalityId");
    if let Some(id) = modality_id.as_deref() {
        if store::get_modality(conn, id)?.is_none() {
            return Err(CoreError::not_found("modality", id).into());
        }
    }
    let weekday = Weekday::parse_required(&get_required_str(params, "weekday")?)?;
    let start = parse_time(params, "startTime")?;
    let end = parse_time(params, "endTime")?;
    if end <= start {
        return Err(CoreError::validation("endTime must be after startTime").into());
    }
    let max_occupancy = get_required_i64(params, "maxOccupancy")?;
    if max_occupancy <= 0 {
        return Err(CoreError::validation("maxOccupancy must be positive").into());
    }
    let slot = Slot {
        id: store::new_id(),
        modality_id,
        weekday,
        start_time: start.format("%H:%M").to_string(),
        end_time: end.format("%H:%M").to_string(),
        max_occupancy,
        current_occupancy: 0,
        trainer_id: get_opt_str(params, "trainerId"),
        branch_id: get_opt_str(params, "branchId"),
    };
    store::insert_slot(conn, &slot)?;
    tracing::info!(slot = %slot.id, weekday = %slot.weekday.as_str(), "slot created");
    Ok(slot)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let id = &req.id;
    let p = &req.params;
    match req.method.as_str() {
        "students.create" => Some(reply_created(
            id,
            mutate(state, req, |conn, ctx| students_create(conn, ctx, p)),
        )),
        "students.list" => Some(reply(
            id,
            read(state, |conn| Ok(store::list_students(conn)?)),
        )),
        "modalities.create" => Some(reply_created(
            id,
            mutate(state, req, |conn, _| modalities_create(conn, p)),
        )),
        "modalities.list" => Some(reply(
            id,
            read(state, |conn| Ok(store::list_modalities(conn)?)),
        )),
        "slots.create" => Some(reply_created(
            id,
            mutate(state, req, |conn, _| slots_create(conn, p)),
        )),
        "slots.list" => Some(reply(
            id,
            read(state, |conn| {
                Ok(store::list_slots(conn, get_opt_str(p, "modalityId").as_deref())?)
            }),
        )),
        _ => None,
    }
}
