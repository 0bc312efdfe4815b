use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::Serialize;

use crate::calendar::Weekday;

/// Closed string-backed enum: one canonical wire/db spelling per variant,
/// plus accepted aliases at the parsing boundary.
macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($variant:ident => $canon:literal $(| $alias:literal)*),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $canon),+
                }
            }

            pub fn parse(raw: &str) -> Option<Self> {
                match raw.trim().to_ascii_lowercase().as_str() {
                    $($canon $(| $alias)* => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                s.serialize_str(self.as_str())
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let s = value.as_str()?;
                Self::parse(s).ok_or_else(|| {
                    FromSqlError::Other(format!("invalid {}: {}", stringify!($name), s).into())
                })
            }
        }
    };
}

text_enum! {
    pub enum EnrollmentStatus {
        Active => "activo" | "active",
        InArrears => "en_mora" | "in_arrears",
        Suspended => "suspendida" | "suspended",
        Expired => "vencida" | "expired",
        Renewed => "renovado" | "renewed",
        Completed => "completada" | "completed",
    }
}

impl EnrollmentStatus {
    /// Statuses that hold a seat and block overlapping enrollments.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Active | Self::InArrears | Self::Suspended)
    }
}

text_enum! {
    pub enum ClassState {
        Scheduled => "programada" | "scheduled",
        Held => "realizada" | "held",
        Absent => "ausente" | "absent",
        Excused => "justificada" | "excused",
        Canceled => "cancelada" | "canceled",
        Holiday => "feriado" | "holiday",
        MakeUp => "recuperacion" | "make_up",
    }
}

text_enum! {
    pub enum AttendanceState {
        Attended => "asistio" | "attended",
        Absent => "falta" | "absent",
        Excused => "justificado" | "excused",
    }
}

text_enum! {
    pub enum PermissionStatus {
        Approved => "aprobado" | "approved",
        Rejected => "rechazado" | "rejected",
        Pending => "pendiente" | "pending",
    }
}

text_enum! {
    pub enum MakeUpStatus {
        Pending => "pendiente" | "pending",
        Scheduled => "programada" | "scheduled",
        Completed => "completada" | "completed",
        Canceled => "cancelada" | "canceled",
    }
}

impl MakeUpStatus {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Scheduled)
    }
}

text_enum! {
    pub enum PaymentStatus {
        Paid => "pagado" | "paid",
        Pending => "pendiente" | "pending",
        Void => "anulado" | "void",
        Overdue => "vencido" | "overdue",
    }
}

text_enum! {
    pub enum PaymentMethod {
        Cash => "efectivo" | "cash",
        Card => "tarjeta" | "card",
        Transfer => "transferencia" | "transfer",
        Other => "otro" | "other",
    }
}

text_enum! {
    pub enum EnrollmentSlotStatus {
        Active => "activo" | "active",
        Released => "liberado" | "released",
    }
}

impl ToSql for Weekday {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Weekday {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Weekday::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("invalid weekday: {}", s).into()))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub full_name: String,
    pub document: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Modality {
    pub id: String,
    pub name: String,
    pub classes_total: i64,
    pub max_permissions: i64,
    pub monthly_fee_cents: i64,
    pub period_days: i64,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub id: String,
    pub modality_id: Option<String>,
    pub weekday: Weekday,
    pub start_time: String,
    pub end_time: String,
    pub max_occupancy: i64,
    pub current_occupancy: i64,
    pub trainer_id: Option<String>,
    pub branch_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    pub id: String,
    pub student_id: String,
    pub modality_id: String,
    pub branch_id: Option<String>,
    pub trainer_id: Option<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub classes_total: i64,
    pub classes_attended: i64,
    pub permissions_available: i64,
    pub permissions_used: i64,
    pub monthly_fee_cents: i64,
    pub status: EnrollmentStatus,
    pub notes: Option<String>,
    pub renewed_from_id: Option<String>,
    pub created_by: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentSlot {
    pub id: String,
    pub enrollment_id: String,
    pub slot_id: String,
    pub classes_allocated: i64,
    pub classes_attended: i64,
    pub classes_remaining: i64,
    pub permissions_used: i64,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub status: EnrollmentSlotStatus,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledClass {
    pub id: String,
    pub enrollment_id: String,
    pub enrollment_slot_id: Option<String>,
    pub slot_id: String,
    pub student_id: String,
    pub date: NaiveDate,
    pub start_time: String,
    pub end_time: String,
    pub state: ClassState,
    pub is_make_up: bool,
    pub counts_toward_attendance: bool,
    pub attendance_id: Option<String>,
    pub original_class_id: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub id: String,
    pub enrollment_id: String,
    pub slot_id: String,
    pub date: NaiveDate,
    pub state: AttendanceState,
    pub note: Option<String>,
    pub recovered: bool,
    pub permission_id: Option<String>,
    /// The mark moved the enrollment counter.
    pub counted: bool,
    /// The mark moved the enrollment-slot counter.
    pub slot_counted: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub id: String,
    pub enrollment_id: String,
    pub attendance_id: String,
    pub slot_id: String,
    pub request_date: NaiveDate,
    pub absence_date: NaiveDate,
    pub reason: String,
    pub status: PermissionStatus,
    pub approver_id: Option<String>,
    pub has_make_up: bool,
    pub make_up_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MakeUpClass {
    pub id: String,
    pub enrollment_id: String,
    pub student_id: String,
    pub permission_id: String,
    pub slot_id: String,
    pub scheduled_date: NaiveDate,
    pub deadline: NaiveDate,
    pub status: MakeUpStatus,
    pub completed_at: Option<NaiveDateTime>,
    pub attendance_id: Option<String>,
    pub scheduled_class_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: String,
    pub enrollment_id: String,
    pub amount_cents: i64,
    pub discount_cents: i64,
    pub discount_reason: Option<String>,
    pub method: PaymentMethod,
    pub paid_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub status: PaymentStatus,
    pub is_partial: bool,
    pub group_id: Option<String>,
    pub installment: Option<i64>,
    pub refunded_at: Option<NaiveDateTime>,
    pub created_by: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_accept_canonical_and_english_spellings() {
        assert_eq!(EnrollmentStatus::parse("en_mora"), Some(EnrollmentStatus::InArrears));
        assert_eq!(EnrollmentStatus::parse("Active"), Some(EnrollmentStatus::Active));
        assert_eq!(AttendanceState::parse("asistio"), Some(AttendanceState::Attended));
        assert_eq!(AttendanceState::parse("absent"), Some(AttendanceState::Absent));
        assert_eq!(ClassState::Held.as_str(), "realizada");
        assert_eq!(PaymentMethod::parse("bitcoin"), None);
    }

    #[test]
    fn status_serializes_as_canonical_text() {
        let v = serde_json::to_value(EnrollmentStatus::Completed).expect("json");
        assert_eq!(v, serde_json::json!("completada"));
    }
}
