use chrono::NaiveDate;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;

use crate::calendar;
use crate::clock::{Actor, Ctx};
use crate::config::{self, InsufficientDatesPolicy};
use crate::db;
use crate::error::CoreError;
use crate::ipc::error::{created, err_with_status, ok};
use crate::ipc::types::{AppState, Request};
use crate::model::PaymentMethod;
use crate::payments::PaymentInput;

#[derive(Debug)]
pub struct HandlerErr {
    pub status: u16,
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn bad_params(message: impl Into<String>) -> Self {
        Self {
            status: 422,
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }

    pub fn response(self, id: &str) -> Value {
        err_with_status(id, self.status, self.code, self.message, self.details)
    }
}

impl From<CoreError> for HandlerErr {
    fn from(e: CoreError) -> Self {
        if let CoreError::Db(ref inner) = e {
            tracing::error!(error = %inner, "database failure");
        }
        Self {
            status: e.status(),
            code: e.code(),
            message: e.to_string(),
            details: e.details(),
        }
    }
}

impl From<rusqlite::Error> for HandlerErr {
    fn from(e: rusqlite::Error) -> Self {
        CoreError::Db(e).into()
    }
}

pub fn reply(id: &str, result: Result<Value, HandlerErr>) -> Value {
    match result {
        Ok(data) => ok(id, data),
        Err(e) => e.response(id),
    }
}

pub fn reply_created(id: &str, result: Result<Value, HandlerErr>) -> Value {
    match result {
        Ok(data) => created(id, data),
        Err(e) => e.response(id),
    }
}

pub fn to_data<T: Serialize>(value: &T) -> Result<Value, HandlerErr> {
    serde_json::to_value(value).map_err(|e| HandlerErr {
        status: 500,
        code: "serialize_failed",
        message: e.to_string(),
        details: None,
    })
}

pub fn require_db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state.db.as_ref().ok_or_else(|| HandlerErr {
        status: 400,
        code: "no_workspace",
        message: "select a workspace first".to_string(),
        details: None,
    })
}

/// Read-only operation against the open workspace.
pub fn read<T, F>(state: &AppState, f: F) -> Result<Value, HandlerErr>
where
    T: Serialize,
    F: FnOnce(&Connection) -> Result<T, HandlerErr>,
{
    let conn = require_db(state)?;
    to_data(&f(conn)?)
}

/// Mutating operation: loads the engine configuration, builds the context
/// for the acting user and runs `f` inside one immediate transaction.
pub fn mutate<T, F>(state: &AppState, req: &Request, f: F) -> Result<Value, HandlerErr>
where
    T: Serialize,
    F: FnOnce(&Connection, &Ctx<'_>) -> Result<T, HandlerErr>,
{
    let conn = require_db(state)?;
    let cfg = config::load(conn)?;
    let ctx = Ctx::new(state.clock.as_ref(), cfg, get_actor(&req.params));
    let out = db::with_immediate_tx(conn, |tx| f(tx, &ctx))?;
    to_data(&out)
}

pub fn get_actor(params: &Value) -> Actor {
    Actor(get_opt_str(params, "actorId"))
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_opt_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn get_required_i64(params: &Value, key: &str) -> Result<i64, HandlerErr> {
    get_opt_i64(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_opt_i64(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be integer", key))),
    }
}

pub fn get_opt_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be boolean", key))),
    }
}

pub fn get_required_date(params: &Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    get_opt_date(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_opt_date(params: &Value, key: &str) -> Result<Option<NaiveDate>, HandlerErr> {
    let Some(raw) = get_opt_str(params, key) else {
        return Ok(None);
    };
    calendar::parse_date(&raw)
        .map(Some)
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key)))
}

pub fn get_str_list(params: &Value, key: &str) -> Result<Option<Vec<String>>, HandlerErr> {
    let Some(v) = params.get(key).filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    let arr = v
        .as_array()
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an array", key)))?;
    arr.iter()
        .map(|item| {
            item.as_str()
                .map(|s| s.trim().to_string())
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must contain strings", key)))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

pub fn get_policy(params: &Value) -> Result<Option<InsufficientDatesPolicy>, HandlerErr> {
    let Some(raw) = get_opt_str(params, "onInsufficientDates") else {
        return Ok(None);
    };
    InsufficientDatesPolicy::parse(&raw)
        .map(Some)
        .ok_or_else(|| HandlerErr::bad_params("onInsufficientDates must be one of: clamp, fail"))
}

/// Reads a payment object: `{ amountCents, discountCents?, discountReason?,
/// method, paidDate?, dueDate? }`.
pub fn get_payment(params: &Value, key: &str) -> Result<Option<PaymentInput>, HandlerErr> {
    let Some(p) = params.get(key).filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    if !p.is_object() {
        return Err(HandlerErr::bad_params(format!("{} must be an object", key)));
    }
    parse_payment(p).map(Some)
}

pub fn parse_payment(p: &Value) -> Result<PaymentInput, HandlerErr> {
    let raw_method = get_required_str(p, "method")?;
    let method = PaymentMethod::parse(&raw_method).ok_or_else(|| {
        HandlerErr::bad_params("method must be one of: efectivo, tarjeta, transferencia, otro")
    })?;
    Ok(PaymentInput {
        amount_cents: get_required_i64(p, "amountCents")?,
        discount_cents: get_opt_i64(p, "discountCents")?.unwrap_or(0),
        discount_reason: get_opt_str(p, "discountReason"),
        method,
        paid_date: get_opt_date(p, "paidDate")?,
        due_date: get_opt_date(p, "dueDate")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payment_object_parses_with_defaults() {
        let params = json!({ "payment": { "amountCents": 10000, "method": "cash" } });
        let p = get_payment(&params, "payment").expect("ok").expect("some");
        assert_eq!(p.amount_cents, 10_000);
        assert_eq!(p.discount_cents, 0);
        assert_eq!(p.method, PaymentMethod::Cash);
        assert!(p.paid_date.is_none());
    }

    #[test]
    fn bad_dates_and_policies_are_bad_params() {
        let params = json!({ "startDate": "2026-13-01", "onInsufficientDates": "maybe" });
        let e = get_opt_date(&params, "startDate").err().expect("date error");
        assert_eq!((e.status, e.code), (422, "bad_params"));
        assert!(get_policy(&params).is_err());
        assert!(get_required_str(&json!({ "x": "  " }), "x").is_err());
    }
}
