use thiserror::Error;
use uuid::Uuid;

use shared_models::error::AppError;

use crate::models::AppointmentStatus;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulingError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Slot unavailable: {0}")]
    SlotUnavailable(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("Cannot {action} an appointment in status {status}")]
    InvalidTransition {
        action: &'static str,
        status: AppointmentStatus,
    },

    #[error("Persistence error: {0}")]
    Persistence(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("{entity} {id} was modified concurrently")]
    VersionConflict { entity: &'static str, id: Uuid },

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for SchedulingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => SchedulingError::NotFound { entity, id },
            other => SchedulingError::Persistence(other.to_string()),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LockError {
    #[error("Timed out waiting for lock {key}")]
    Timeout { key: String },

    #[error("Lock backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        LockError::Backend(err.to_string())
    }
}

impl From<deadpool_redis::PoolError> for LockError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        LockError::Backend(err.to_string())
    }
}

/// Failure of a best-effort side channel. Logged by the caller, never
/// surfaced as a `SchedulingError`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeliveryError {
    #[error("Delivery channel unavailable: {0}")]
    Unavailable(String),

    #[error("Delivery rejected: {0}")]
    Rejected(String),
}

impl From<SchedulingError> for AppError {
    fn from(err: SchedulingError) -> Self {
        match err {
            SchedulingError::Validation(msg) => AppError::ValidationError(msg),
            SchedulingError::SlotUnavailable(msg) => AppError::Conflict(msg),
            e @ SchedulingError::NotFound { .. } => AppError::NotFound(e.to_string()),
            e @ SchedulingError::InvalidTransition { .. } => AppError::Conflict(e.to_string()),
            SchedulingError::Persistence(msg) => AppError::Database(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_http_status_mapping() {
        let cases = [
            (SchedulingError::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (SchedulingError::SlotUnavailable("taken".into()), StatusCode::CONFLICT),
            (
                SchedulingError::NotFound {
                    entity: "Appointment",
                    id: Uuid::nil(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                SchedulingError::InvalidTransition {
                    action: "complete exam for",
                    status: AppointmentStatus::Scheduled,
                },
                StatusCode::CONFLICT,
            ),
            (SchedulingError::Persistence("down".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, status) in cases {
            assert_eq!(AppError::from(err).status_code(), status);
        }
    }

    #[test]
    fn test_store_not_found_keeps_entity() {
        let id = Uuid::new_v4();
        let err: SchedulingError = StoreError::NotFound {
            entity: "Appointment",
            id,
        }
        .into();
        assert_eq!(
            err,
            SchedulingError::NotFound {
                entity: "Appointment",
                id
            }
        );
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = SchedulingError::InvalidTransition {
            action: "check in",
            status: AppointmentStatus::Completed,
        };
        assert_eq!(err.to_string(), "Cannot check in an appointment in status completed");
    }
}
