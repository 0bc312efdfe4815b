use chrono::NaiveDateTime;
use rusqlite::Connection;

use crate::error::{CoreError, CoreResult};
use crate::model::EnrollmentStatus;
use crate::store;

/// Things that happen to an enrollment and may move its status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentEvent {
    PaymentSettled,
    PaymentOutstanding,
    OverdueDetected,
    ClassesExhausted,
    Renewed,
    Suspend,
    /// Carries whether the enrollment still owes money.
    Reactivate { balance_due: bool },
    Expire,
}

impl EnrollmentEvent {
    pub fn name(self) -> &'static str {
        match self {
            Self::PaymentSettled => "payment_settled",
            Self::PaymentOutstanding => "payment_outstanding",
            Self::OverdueDetected => "overdue_detected",
            Self::ClassesExhausted => "classes_exhausted",
            Self::Renewed => "renewed",
            Self::Suspend => "suspend",
            Self::Reactivate { .. } => "reactivate",
            Self::Expire => "expire",
        }
    }
}

/// Pure transition table. `Err` carries a StateTransition error naming the
/// current status.
pub fn transition(
    current: EnrollmentStatus,
    event: EnrollmentEvent,
) -> CoreResult<EnrollmentStatus> {
    use EnrollmentEvent as Ev;
    use EnrollmentStatus as St;

    let next = match (current, event) {
        (St::Active, Ev::PaymentSettled) => Some(St::Active),
        (St::Active, Ev::PaymentOutstanding | Ev::OverdueDetected) => Some(St::InArrears),
        (St::Active, Ev::ClassesExhausted) => Some(St::Completed),
        (St::Active, Ev::Renewed) => Some(St::Renewed),
        (St::Active, Ev::Suspend) => Some(St::Suspended),
        (St::Active, Ev::Expire) => Some(St::Expired),

        (St::InArrears, Ev::PaymentSettled) => Some(St::Active),
        (St::InArrears, Ev::PaymentOutstanding | Ev::OverdueDetected) => Some(St::InArrears),
        (St::InArrears, Ev::ClassesExhausted) => Some(St::InArrears),
        (St::InArrears, Ev::Suspend) => Some(St::Suspended),
        (St::InArrears, Ev::Expire) => Some(St::Expired),

        (
            St::Suspended,
            Ev::PaymentSettled
            | Ev::PaymentOutstanding
            | Ev::OverdueDetected
            | Ev::ClassesExhausted
            | Ev::Suspend,
        ) => Some(St::Suspended),
        (St::Suspended, Ev::Reactivate { balance_due }) => Some(if balance_due {
            St::InArrears
        } else {
            St::Active
        }),
        (St::Suspended, Ev::Expire) => Some(St::Expired),

        (
            St::Expired,
            Ev::PaymentSettled | Ev::PaymentOutstanding | Ev::OverdueDetected | Ev::Expire,
        ) => Some(St::Expired),

        (
            St::Renewed | St::Completed,
            Ev::PaymentSettled | Ev::PaymentOutstanding | Ev::OverdueDetected,
        ) => Some(current),
        (St::Completed, Ev::ClassesExhausted) => Some(St::Completed),

        _ => None,
    };

    next.ok_or_else(|| {
        CoreError::state(
            format!("cannot apply {} to enrollment", event.name()),
            current.as_str(),
        )
    })
}

/// Applies `event` to the stored enrollment and persists the new status.
/// Returns `(previous, next)`.
///
/// An enrollment that enters `activo` with its quota already used up (classes
/// attended while `en_mora`, then the fee settled) goes straight on to
/// `completada`.
pub fn apply(
    conn: &Connection,
    enrollment_id: &str,
    event: EnrollmentEvent,
    now: NaiveDateTime,
) -> CoreResult<(EnrollmentStatus, EnrollmentStatus)> {
    let enrollment = store::require_enrollment(conn, enrollment_id)?;
    let mut next = transition(enrollment.status, event)?;
    if next == EnrollmentStatus::Active
        && enrollment.status != EnrollmentStatus::Active
        && enrollment.classes_attended >= enrollment.classes_total
    {
        next = transition(next, EnrollmentEvent::ClassesExhausted)?;
    }
    if next != enrollment.status {
        store::set_enrollment_status(conn, enrollment_id, next, now)?;
        tracing::info!(
            enrollment = enrollment_id,
            from = %enrollment.status,
            to = %next,
            event = event.name(),
            "enrollment status changed"
        );
    }
    Ok((enrollment.status, next))
}

/// Whether attendance can still be recorded against an enrollment in `status`.
pub fn accepts_attendance(status: EnrollmentStatus) -> bool {
    matches!(
        status,
        EnrollmentStatus::Active | EnrollmentStatus::InArrears | EnrollmentStatus::Completed
    )
}

pub fn accepts_permissions(status: EnrollmentStatus) -> bool {
    matches!(status, EnrollmentStatus::Active | EnrollmentStatus::InArrears)
}
