use chrono::{Duration, NaiveDate};
use rusqlite::Connection;
use serde::Serialize;

use crate::clock::Ctx;
use crate::error::{CoreError, CoreResult};
use crate::model::{Enrollment, EnrollmentStatus, Payment, PaymentMethod, PaymentStatus};
use crate::status::{self, EnrollmentEvent};
use crate::store;

/// Days a second installment stays pending when no due date is given.
pub const DEFAULT_INSTALLMENT_DAYS: i64 = 15;

#[derive(Debug, Clone)]
pub struct PaymentInput {
    pub amount_cents: i64,
    pub discount_cents: i64,
    pub discount_reason: Option<String>,
    pub method: PaymentMethod,
    pub paid_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOutcome {
    pub payment: Payment,
    /// Pending second installment created by a short first payment.
    pub installment: Option<Payment>,
    pub balance_cents: i64,
    pub status: EnrollmentStatus,
}

pub fn balance(conn: &Connection, enrollment: &Enrollment) -> CoreResult<i64> {
    let paid = store::paid_covered_total(conn, &enrollment.id)?;
    Ok((enrollment.monthly_fee_cents - paid).max(0))
}

fn validate(input: &PaymentInput) -> CoreResult<()> {
    if input.amount_cents < 0 || input.discount_cents < 0 {
        return Err(CoreError::validation("amounts must not be negative"));
    }
    if input.amount_cents + input.discount_cents == 0 {
        return Err(CoreError::validation("payment must cover a positive amount"));
    }
    if input.discount_cents > 0
        && input
            .discount_reason
            .as_deref()
            .map_or(true, |r| r.trim().is_empty())
    {
        return Err(CoreError::validation("a discount needs a reason"));
    }
    Ok(())
}

/// Registers a payment against the enrollment fee. A payment that settles
/// the balance moves the enrollment to `activo`; a short first payment is
/// split into a paid installment 1 and a pending installment 2 for the rest.
/// While an installment is open, the next payment must match it exactly.
pub fn register(
    conn: &Connection,
    ctx: &Ctx<'_>,
    enrollment_id: &str,
    input: &PaymentInput,
) -> CoreResult<PaymentOutcome> {
    validate(input)?;
    let enrollment = store::require_enrollment(conn, enrollment_id)?;
    let paid_date = input.paid_date.unwrap_or_else(|| ctx.today());
    let covered = input.amount_cents + input.discount_cents;
    let now = ctx.now();

    if let Some(open) = store::open_installment(conn, &enrollment.id)? {
        if covered > open.amount_cents {
            return Err(CoreError::QuotaExceeded {
                message: "payment exceeds the pending installment".into(),
                limit: open.amount_cents,
                current: covered,
            });
        }
        if covered < open.amount_cents {
            return Err(CoreError::validation(format!(
                "installment {} must be paid in full ({} cents)",
                open.installment.unwrap_or(2),
                open.amount_cents
            )));
        }
        store::settle_installment(
            conn,
            &open.id,
            input.amount_cents,
            input.discount_cents,
            input.method,
            paid_date,
            ctx.actor_id(),
        )?;
        let payment = store::get_payment(conn, &open.id)?
            .ok_or_else(|| CoreError::not_found("payment", &open.id))?;
        let remaining = balance(conn, &enrollment)?;
        let event = if remaining == 0 {
            EnrollmentEvent::PaymentSettled
        } else {
            EnrollmentEvent::PaymentOutstanding
        };
        let (_, status) = status::apply(conn, &enrollment.id, event, now)?;
        tracing::info!(enrollment = %enrollment.id, payment = %payment.id, "installment settled");
        return Ok(PaymentOutcome {
            payment,
            installment: None,
            balance_cents: remaining,
            status,
        });
    }

    let due = balance(conn, &enrollment)?;
    if due == 0 {
        return Err(CoreError::QuotaExceeded {
            message: "enrollment fee is already paid".into(),
            limit: enrollment.monthly_fee_cents,
            current: enrollment.monthly_fee_cents,
        });
    }
    if covered > due {
        return Err(CoreError::QuotaExceeded {
            message: "payment exceeds the outstanding balance".into(),
            limit: due,
            current: covered,
        });
    }

    let split = covered < due;
    let group_id = split.then(store::new_id);
    let payment = Payment {
        id: store::new_id(),
        enrollment_id: enrollment.id.clone(),
        amount_cents: input.amount_cents,
        discount_cents: input.discount_cents,
        discount_reason: input.discount_reason.clone(),
        method: input.method,
        paid_date: Some(paid_date),
        due_date: None,
        status: PaymentStatus::Paid,
        is_partial: split,
        group_id: group_id.clone(),
        installment: split.then_some(1),
        refunded_at: None,
        created_by: ctx.actor_id().map(str::to_string),
    };
    store::insert_payment(conn, &payment)?;

    let installment = if split {
        let second = Payment {
            id: store::new_id(),
            enrollment_id: enrollment.id.clone(),
            amount_cents: due - covered,
            discount_cents: 0,
            discount_reason: None,
            method: input.method,
            paid_date: None,
            due_date: Some(
                input
                    .due_date
                    .unwrap_or(paid_date + Duration::days(DEFAULT_INSTALLMENT_DAYS)),
            ),
            status: PaymentStatus::Pending,
            is_partial: true,
            group_id,
            installment: Some(2),
            refunded_at: None,
            created_by: ctx.actor_id().map(str::to_string),
        };
        store::insert_payment(conn, &second)?;
        Some(second)
    } else {
        None
    };

    let event = if split {
        EnrollmentEvent::PaymentOutstanding
    } else {
        EnrollmentEvent::PaymentSettled
    };
    let (_, status) = status::apply(conn, &enrollment.id, event, now)?;
    let remaining = balance(conn, &enrollment)?;
    tracing::info!(
        enrollment = %enrollment.id,
        payment = %payment.id,
        split,
        remaining,
        "payment registered"
    );
    Ok(PaymentOutcome {
        payment,
        installment,
        balance_cents: remaining,
        status,
    })
}

/// Voids a paid payment, together with any installment still open in its
/// group, and puts the enrollment back in arrears.
pub fn refund(conn: &Connection, ctx: &Ctx<'_>, payment_id: &str) -> CoreResult<PaymentOutcome> {
    let payment = store::get_payment(conn, payment_id)?
        .ok_or_else(|| CoreError::not_found("payment", payment_id))?;
    if payment.status != PaymentStatus::Paid {
        return Err(CoreError::state(
            "only paid payments can be refunded",
            payment.status.as_str(),
        ));
    }
    let now = ctx.now();
    store::void_payment(conn, &payment.id, now)?;
    if let Some(group) = payment.group_id.as_deref() {
        store::void_open_installments(conn, group, now)?;
    }
    let enrollment = store::require_enrollment(conn, &payment.enrollment_id)?;
    let remaining = balance(conn, &enrollment)?;
    let event = if remaining > 0 {
        EnrollmentEvent::PaymentOutstanding
    } else {
        EnrollmentEvent::PaymentSettled
    };
    let (_, status) = status::apply(conn, &enrollment.id, event, now)?;
    let payment = store::get_payment(conn, &payment.id)?
        .ok_or_else(|| CoreError::not_found("payment", payment_id))?;
    tracing::info!(payment = %payment.id, enrollment = %enrollment.id, "payment refunded");
    Ok(PaymentOutcome {
        payment,
        installment: None,
        balance_cents: remaining,
        status,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverdueEntry {
    pub enrollment_id: String,
    pub status: EnrollmentStatus,
}

/// Flags installments past their due date and moves their enrollments into
/// arrears.
pub fn refresh_overdue(conn: &Connection, ctx: &Ctx<'_>) -> CoreResult<Vec<OverdueEntry>> {
    let mut out = Vec::new();
    for enrollment_id in store::mark_overdue(conn, ctx.today())? {
        let (_, status) =
            status::apply(conn, &enrollment_id, EnrollmentEvent::OverdueDetected, ctx.now())?;
        out.push(OverdueEntry {
            enrollment_id,
            status,
        });
    }
    if !out.is_empty() {
        tracing::info!(count = out.len(), "overdue installments detected");
    }
    Ok(out)
}
