use chrono::{Duration, NaiveDate};
use rusqlite::Connection;
use serde::Serialize;

use crate::clock::Ctx;
use crate::config::InsufficientDatesPolicy;
use crate::enrollment::{self, Draft, EnrollmentView};
use crate::error::{CoreError, CoreResult};
use crate::model::{EnrollmentSlotStatus, EnrollmentStatus};
use crate::payments::{self, PaymentInput, PaymentOutcome};
use crate::schedule::{self, ScheduleReport};
use crate::status::{self, EnrollmentEvent};
use crate::store;

pub struct RenewRequest {
    pub enrollment_id: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Defaults to the slots of the previous period.
    pub slot_ids: Option<Vec<String>>,
    pub classes_total: Option<i64>,
    pub monthly_fee_cents: Option<i64>,
    pub payment: Option<PaymentInput>,
    pub on_insufficient_dates: Option<InsufficientDatesPolicy>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Renewed {
    pub previous: EnrollmentView,
    pub enrollment: EnrollmentView,
    pub schedule: ScheduleReport,
    pub payment: Option<PaymentOutcome>,
    pub canceled_classes: usize,
}

/// Closes an `activo` enrollment and opens its successor for the next
/// period. Runs inside the caller's transaction; a schedule or capacity
/// failure undoes the whole renewal.
pub fn renew(conn: &Connection, ctx: &Ctx<'_>, req: RenewRequest) -> CoreResult<Renewed> {
    let old = store::require_enrollment(conn, &req.enrollment_id)?;
    if old.status != EnrollmentStatus::Active {
        return Err(CoreError::state(
            "only an activo enrollment can be renewed",
            old.status.as_str(),
        ));
    }
    let modality = enrollment::require_active_modality(conn, &old.modality_id)?;

    let start = req.start_date.unwrap_or(old.end_date + Duration::days(1));
    if start <= old.start_date {
        return Err(CoreError::validation(
            "renewal must start after the current period starts",
        ));
    }
    let end = req
        .end_date
        .unwrap_or_else(|| enrollment::default_end(start, &modality));

    let slot_ids = match req.slot_ids {
        Some(ids) => ids,
        None => store::list_enrollment_slots(conn, &old.id)?
            .into_iter()
            .filter(|es| es.status == EnrollmentSlotStatus::Active)
            .map(|es| es.slot_id)
            .collect(),
    };
    enrollment::check_slot_ids(&slot_ids)?;

    let now = ctx.now();
    schedule::release_slots(conn, &old.id)?;
    let canceled = store::cancel_scheduled_from(conn, &old.id, ctx.today().min(start))?;
    status::apply(conn, &old.id, EnrollmentEvent::Renewed, now)?;
    let closing = start - Duration::days(1);
    if closing != old.end_date {
        store::set_enrollment_end_date(conn, &old.id, closing, now)?;
    }

    let draft = Draft {
        student_id: old.student_id.clone(),
        start_date: start,
        end_date: end,
        classes_total: req.classes_total.unwrap_or(modality.classes_total),
        monthly_fee_cents: req.monthly_fee_cents.unwrap_or(modality.monthly_fee_cents),
        modality,
        branch_id: old.branch_id.clone(),
        trainer_id: old.trainer_id.clone(),
        notes: Some(format!("renewal of {}", old.id)),
        renewed_from_id: Some(old.id.clone()),
        status: EnrollmentStatus::InArrears,
    };
    let policy = req
        .on_insufficient_dates
        .unwrap_or(ctx.config.scheduling.on_renew);
    let (successor, report) = enrollment::open(conn, ctx, draft, &slot_ids, policy)?;

    let payment = match &req.payment {
        Some(input) => Some(payments::register(conn, ctx, &successor.id, input)?),
        None => None,
    };
    tracing::info!(
        previous = %old.id,
        enrollment = %successor.id,
        start = %start,
        end = %end,
        canceled,
        "enrollment renewed"
    );
    Ok(Renewed {
        previous: enrollment::get(conn, &old.id)?,
        enrollment: enrollment::get(conn, &successor.id)?,
        schedule: report,
        payment,
        canceled_classes: canceled,
    })
}
