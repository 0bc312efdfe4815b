use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::{json, Value};

use crate::config;
use crate::ipc::helpers::{
    get_required_date, get_required_str, mutate, read, reply, reply_created, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::permissions::{self, GrantRequest, ScheduleMakeUp};
use crate::store;

fn parse_grant(params: &Value) -> Result<GrantRequest, HandlerErr> {
    Ok(GrantRequest {
        enrollment_id: get_required_str(params, "enrollmentId")?,
        slot_id: get_required_str(params, "slotId")?,
        absence_date: get_required_date(params, "absenceDate")?,
        reason: get_required_str(params, "reason")?,
    })
}

fn parse_schedule(params: &Value) -> Result<ScheduleMakeUp, HandlerErr> {
    Ok(ScheduleMakeUp {
        permission_id: get_required_str(params, "permissionId")?,
        slot_id: get_required_str(params, "slotId")?,
        date: get_required_date(params, "date")?,
    })
}

fn permissions_list(conn: &Connection, today: NaiveDate, params: &Value) -> Result<Value, HandlerErr> {
    let enrollment_id = get_required_str(params, "enrollmentId")?;
    let enrollment = store::require_enrollment(conn, &enrollment_id)?;
    let cfg = config::load(conn)?;
    let views = store::list_permissions(conn, &enrollment_id)?
        .into_iter()
        .map(|p| permissions::view(conn, &cfg.permissions, &enrollment, p, today))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({
        "enrollmentId": enrollment_id,
        "permissionsUsed": enrollment.permissions_used,
        "permissionsAvailable": enrollment.permissions_available,
        "permissions": views,
    }))
}

fn makeups_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let enrollment_id = get_required_str(params, "enrollmentId")?;
    store::require_enrollment(conn, &enrollment_id)?;
    let make_ups = store::list_make_ups(conn, &enrollment_id)?;
    Ok(json!({ "enrollmentId": enrollment_id, "makeUps": make_ups }))
}

fn handle_grant(state: &mut AppState, req: &Request) -> Value {
    reply_created(
        &req.id,
        mutate(state, req, |conn, ctx| {
            let input = parse_grant(&req.params)?;
            Ok(permissions::grant(conn, ctx, &input)?)
        }),
    )
}

fn handle_schedule(state: &mut AppState, req: &Request) -> Value {
    reply_created(
        &req.id,
        mutate(state, req, |conn, ctx| {
            let input = parse_schedule(&req.params)?;
            Ok(permissions::schedule_make_up(conn, ctx, &input)?)
        }),
    )
}

fn handle_complete(state: &mut AppState, req: &Request) -> Value {
    reply(
        &req.id,
        mutate(state, req, |conn, ctx| {
            let make_up_id = get_required_str(&req.params, "makeUpId")?;
            Ok(permissions::complete_make_up(conn, ctx, &make_up_id)?)
        }),
    )
}

fn handle_cancel(state: &mut AppState, req: &Request) -> Value {
    reply(
        &req.id,
        mutate(state, req, |conn, _| {
            let make_up_id = get_required_str(&req.params, "makeUpId")?;
            Ok(permissions::cancel_make_up(conn, &make_up_id)?)
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "permissions.grant" => Some(handle_grant(state, req)),
        "permissions.list" => {
            let today = state.clock.today();
            Some(reply(
                &req.id,
                read(state, |conn| permissions_list(conn, today, &req.params)),
            ))
        }
        "makeups.schedule" => Some(handle_schedule(state, req)),
        "makeups.complete" => Some(handle_complete(state, req)),
        "makeups.cancel" => Some(handle_cancel(state, req)),
        "makeups.list" => Some(reply(&req.id, read(state, |conn| makeups_list(conn, &req.params)))),
        _ => None,
    }
}
