use rusqlite::Connection;
use serde_json::{json, Value};

use crate::ipc::helpers::{get_required_str, mutate, parse_payment, read, reply, reply_created, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::payments::{self, PaymentInput};
use crate::store;

fn parse_register(params: &Value) -> Result<(String, PaymentInput), HandlerErr> {
    Ok((get_required_str(params, "enrollmentId")?, parse_payment(params)?))
}

fn payments_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let enrollment_id = get_required_str(params, "enrollmentId")?;
    let enrollment = store::require_enrollment(conn, &enrollment_id)?;
    let balance = payments::balance(conn, &enrollment)?;
    let rows = store::list_payments(conn, &enrollment_id)?;
    Ok(json!({
        "enrollmentId": enrollment_id,
        "feeCents": enrollment.monthly_fee_cents,
        "balanceCents": balance,
        "payments": rows,
    }))
}

fn handle_register(state: &mut AppState, req: &Request) -> Value {
    reply_created(
        &req.id,
        mutate(state, req, |conn, ctx| {
            let (enrollment_id, input) = parse_register(&req.params)?;
            Ok(payments::register(conn, ctx, &enrollment_id, &input)?)
        }),
    )
}

fn handle_refund(state: &mut AppState, req: &Request) -> Value {
    reply(
        &req.id,
        mutate(state, req, |conn, ctx| {
            let payment_id = get_required_str(&req.params, "paymentId")?;
            Ok(payments::refund(conn, ctx, &payment_id)?)
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "payments.register" => Some(handle_register(state, req)),
        "payments.refund" => Some(handle_refund(state, req)),
        "payments.list" => Some(reply(&req.id, read(state, |conn| payments_list(conn, &req.params)))),
        "payments.refreshOverdue" => Some(reply(
            &req.id,
            mutate(state, req, |conn, ctx| {
                let flagged = payments::refresh_overdue(conn, ctx)?;
                Ok(json!({ "overdue": flagged }))
            }),
        )),
        _ => None,
    }
}
