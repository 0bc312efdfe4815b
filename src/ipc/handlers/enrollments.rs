use rusqlite::Connection;
use serde_json::{json, Value};

use crate::clock::Ctx;
use crate::config::InsufficientDatesPolicy;
use crate::enrollment::{self, CreateEnrollment};
use crate::error::CoreError;
use crate::ipc::helpers::{
    get_opt_date, get_opt_i64, get_opt_str, get_payment, get_policy, get_required_date,
    get_required_str, get_str_list, mutate, read, reply, reply_created, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::ledger;
use crate::model::EnrollmentStatus;
use crate::renewal::{self, RenewRequest};
use crate::store;

fn parse_create(params: &Value) -> Result<CreateEnrollment, HandlerErr> {
    let initial_status = match get_opt_str(params, "initialStatus") {
        Some(raw) => Some(
            EnrollmentStatus::parse(&raw)
                .ok_or_else(|| HandlerErr::bad_params(format!("unknown status: {}", raw)))?,
        ),
        None => None,
    };
    Ok(CreateEnrollment {
        student_id: get_required_str(params, "studentId")?,
        modality_id: get_required_str(params, "modalityId")?,
        slot_ids: get_str_list(params, "slotIds")?
            .ok_or_else(|| HandlerErr::bad_params("missing slotIds"))?,
        start_date: get_required_date(params, "startDate")?,
        end_date: get_opt_date(params, "endDate")?,
        classes_total: get_opt_i64(params, "classesTotal")?,
        monthly_fee_cents: get_opt_i64(params, "monthlyFeeCents")?,
        branch_id: get_opt_str(params, "branchId"),
        trainer_id: get_opt_str(params, "trainerId"),
        notes: get_opt_str(params, "notes"),
        initial_status,
        payment: get_payment(params, "payment")?,
        on_insufficient_dates: get_policy(params)?,
    })
}

fn parse_renew(params: &Value) -> Result<RenewRequest, HandlerErr> {
    Ok(RenewRequest {
        enrollment_id: get_required_str(params, "enrollmentId")?,
        start_date: get_opt_date(params, "startDate")?,
        end_date: get_opt_date(params, "endDate")?,
        slot_ids: get_str_list(params, "slotIds")?,
        classes_total: get_opt_i64(params, "classesTotal")?,
        monthly_fee_cents: get_opt_i64(params, "monthlyFeeCents")?,
        payment: get_payment(params, "payment")?,
        on_insufficient_dates: get_policy(params)?,
    })
}

fn enrollments_list(conn: &Connection, params: &Value) -> Result<Vec<enrollment::EnrollmentView>, HandlerErr> {
    let status = match get_opt_str(params, "status") {
        Some(raw) => Some(
            EnrollmentStatus::parse(&raw)
                .ok_or_else(|| HandlerErr::bad_params(format!("unknown status: {}", raw)))?,
        ),
        None => None,
    };
    let student = get_opt_str(params, "studentId");
    store::list_enrollments(conn, student.as_deref(), status)?
        .into_iter()
        .map(|e| enrollment::view(conn, e).map_err(HandlerErr::from))
        .collect()
}

fn classes_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let enrollment_id = get_required_str(params, "enrollmentId")?;
    store::require_enrollment(conn, &enrollment_id)?;
    let classes = store::list_classes(
        conn,
        &enrollment_id,
        get_opt_date(params, "from")?,
        get_opt_date(params, "to")?,
    )?;
    Ok(json!({ "enrollmentId": enrollment_id, "classes": classes }))
}

fn handle_create(state: &mut AppState, req: &Request) -> Value {
    reply_created(
        &req.id,
        mutate(state, req, |conn, ctx| {
            let input = parse_create(&req.params)?;
            Ok(enrollment::create(conn, ctx, input)?)
        }),
    )
}

fn handle_renew(state: &mut AppState, req: &Request) -> Value {
    reply_created(
        &req.id,
        mutate(state, req, |conn, ctx| {
            let input = parse_renew(&req.params)?;
            Ok(renewal::renew(conn, ctx, input)?)
        }),
    )
}

type SlotOp = fn(
    &Connection,
    &Ctx<'_>,
    &str,
    &str,
    Option<InsufficientDatesPolicy>,
) -> Result<enrollment::SlotsChanged, CoreError>;

fn parse_slot_change(
    params: &Value,
) -> Result<(String, String, Option<InsufficientDatesPolicy>), HandlerErr> {
    Ok((
        get_required_str(params, "enrollmentId")?,
        get_required_str(params, "slotId")?,
        get_policy(params)?,
    ))
}

fn slot_change(state: &mut AppState, req: &Request, op: SlotOp) -> Value {
    reply(
        &req.id,
        mutate(state, req, |conn, ctx| {
            let (enrollment_id, slot_id, policy) = parse_slot_change(&req.params)?;
            Ok(op(conn, ctx, &enrollment_id, &slot_id, policy)?)
        }),
    )
}

fn handle_generate_schedule(state: &mut AppState, req: &Request) -> Value {
    reply(
        &req.id,
        mutate(state, req, |conn, ctx| {
            let enrollment_id = get_required_str(&req.params, "enrollmentId")?;
            let policy = get_policy(&req.params)?;
            Ok(enrollment::regenerate(conn, ctx, &enrollment_id, policy)?)
        }),
    )
}

/// Operations taking only `enrollmentId`.
fn by_enrollment<T, F>(state: &mut AppState, req: &Request, f: F) -> Value
where
    T: serde::Serialize,
    F: FnOnce(&Connection, &Ctx<'_>, &str) -> Result<T, CoreError>,
{
    reply(
        &req.id,
        mutate(state, req, |conn, ctx| {
            let enrollment_id = get_required_str(&req.params, "enrollmentId")?;
            Ok(f(conn, ctx, &enrollment_id)?)
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let id = &req.id;
    let p = &req.params;
    match req.method.as_str() {
        "enrollments.create" => Some(handle_create(state, req)),
        "enrollments.get" => Some(reply(
            id,
            read(state, |conn| {
                let enrollment_id = get_required_str(p, "enrollmentId")?;
                Ok(enrollment::get(conn, &enrollment_id)?)
            }),
        )),
        "enrollments.list" => Some(reply(id, read(state, |conn| enrollments_list(conn, p)))),
        "enrollments.renew" => Some(handle_renew(state, req)),
        "enrollments.attachSlot" => Some(slot_change(state, req, enrollment::attach_slot)),
        "enrollments.detachSlot" => Some(slot_change(state, req, enrollment::detach_slot)),
        "enrollments.generateSchedule" => Some(handle_generate_schedule(state, req)),
        "enrollments.reconcile" => Some(by_enrollment(state, req, |conn, ctx, e| {
            ledger::reconcile(conn, e, ctx.now())
        })),
        "enrollments.suspend" => Some(by_enrollment(state, req, enrollment::suspend)),
        "enrollments.reactivate" => Some(by_enrollment(state, req, enrollment::reactivate)),
        "enrollments.expireDue" => Some(reply(
            id,
            mutate(state, req, |conn, ctx| {
                let expired = enrollment::expire_due(conn, ctx)?;
                Ok(json!({ "expired": expired }))
            }),
        )),
        "classes.list" => Some(reply(id, read(state, |conn| classes_list(conn, p)))),
        _ => None,
    }
}
