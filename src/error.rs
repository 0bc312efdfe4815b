use serde_json::json;
use thiserror::Error;

/// Failure taxonomy shared by every engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Capacity,
    QuotaExceeded,
    InsufficientData,
    StateTransition,
    Internal,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    Validation(String),

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("{message}")]
    Conflict {
        message: String,
        existing_id: String,
        existing_state: String,
    },

    #[error("slot {slot_id} is full ({current}/{max})")]
    Capacity {
        slot_id: String,
        current: i64,
        max: i64,
    },

    #[error("{message} (limit {limit}, current {current})")]
    QuotaExceeded {
        message: String,
        limit: i64,
        current: i64,
    },

    #[error(
        "slot {slot_id} has {available} matching dates in the period but {required} classes are required (short by {shortfall})"
    )]
    InsufficientData {
        slot_id: String,
        required: u32,
        available: u32,
        shortfall: u32,
    },

    #[error("{message} (current state: {current})")]
    StateTransition { message: String, current: String },

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            id: id.into(),
        }
    }

    pub fn state(message: impl Into<String>, current: impl Into<String>) -> Self {
        Self::StateTransition {
            message: message.into(),
            current: current.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Capacity { .. } => ErrorKind::Capacity,
            Self::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            Self::InsufficientData { .. } => ErrorKind::InsufficientData,
            Self::StateTransition { .. } => ErrorKind::StateTransition,
            Self::Db(_) => ErrorKind::Internal,
        }
    }

    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Validation => "validation_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Capacity => "capacity_exceeded",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::InsufficientData => "insufficient_data",
            ErrorKind::StateTransition => "invalid_state_transition",
            ErrorKind::Internal => "db_query_failed",
        }
    }

    /// HTTP-style status carried in the response envelope.
    pub fn status(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation => 422,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Capacity
            | ErrorKind::QuotaExceeded
            | ErrorKind::InsufficientData
            | ErrorKind::StateTransition => 400,
            ErrorKind::Internal => 500,
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::NotFound { what, id } => Some(json!({ "entity": what, "id": id })),
            Self::Conflict {
                existing_id,
                existing_state,
                ..
            } => Some(json!({
                "existingId": existing_id,
                "existingState": existing_state,
            })),
            Self::Capacity {
                slot_id,
                current,
                max,
            } => Some(json!({
                "slotId": slot_id,
                "currentOccupancy": current,
                "maxOccupancy": max,
            })),
            Self::QuotaExceeded { limit, current, .. } => {
                Some(json!({ "limit": limit, "current": current }))
            }
            Self::InsufficientData {
                slot_id,
                required,
                available,
                shortfall,
            } => Some(json!({
                "slotId": slot_id,
                "required": required,
                "available": available,
                "shortfall": shortfall,
            })),
            Self::StateTransition { current, .. } => Some(json!({ "currentState": current })),
            Self::Validation(_) | Self::Db(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_envelope_table() {
        assert_eq!(CoreError::validation("bad date").status(), 422);
        assert_eq!(CoreError::not_found("enrollment", "x").status(), 404);
        let conflict = CoreError::Conflict {
            message: "dup".into(),
            existing_id: "e1".into(),
            existing_state: "activo".into(),
        };
        assert_eq!(conflict.status(), 409);
        assert_eq!(conflict.kind(), ErrorKind::Conflict);
        let quota = CoreError::QuotaExceeded {
            message: "monthly permission limit reached".into(),
            limit: 3,
            current: 3,
        };
        assert_eq!(quota.status(), 400);
        assert_eq!(quota.code(), "quota_exceeded");
        assert!(quota.to_string().contains("limit 3"));
    }

    #[test]
    fn insufficient_data_reports_shortfall() {
        let e = CoreError::InsufficientData {
            slot_id: "s1".into(),
            required: 6,
            available: 4,
            shortfall: 2,
        };
        let d = e.details().expect("details");
        assert_eq!(d["shortfall"], 2);
        assert_eq!(e.kind(), ErrorKind::InsufficientData);
    }
}
