use rusqlite::Connection;
use serde_json::{json, Value};

use crate::attendance::{self, MarkRequest};
use crate::ipc::helpers::{
    get_opt_str, get_required_date, get_required_str, mutate, read, reply, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::AttendanceState;
use crate::store;

fn parse_mark(params: &Value) -> Result<MarkRequest, HandlerErr> {
    let raw_state = get_required_str(params, "state")?;
    let state = AttendanceState::parse(&raw_state).ok_or_else(|| {
        HandlerErr::bad_params("state must be one of: asistio, falta, justificado")
    })?;
    Ok(MarkRequest {
        enrollment_id: get_required_str(params, "enrollmentId")?,
        slot_id: get_required_str(params, "slotId")?,
        date: get_required_date(params, "date")?,
        state,
        note: get_opt_str(params, "note"),
    })
}

fn attendance_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let enrollment_id = get_required_str(params, "enrollmentId")?;
    store::require_enrollment(conn, &enrollment_id)?;
    let records = store::list_attendance(conn, &enrollment_id)?;
    Ok(json!({ "enrollmentId": enrollment_id, "records": records }))
}

fn handle_attendance_mark(state: &mut AppState, req: &Request) -> Value {
    reply(
        &req.id,
        mutate(state, req, |conn, ctx| {
            let input = parse_mark(&req.params)?;
            Ok(attendance::mark(conn, ctx, &input)?)
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.mark" => Some(handle_attendance_mark(state, req)),
        "attendance.list" => Some(reply(
            &req.id,
            read(state, |conn| attendance_list(conn, &req.params)),
        )),
        _ => None,
    }
}
