//! Top-level error type and its mapping onto client-facing classes.

use krapi_db::DbError;
use krapi_queue::QueueError;
use krapi_types::ErrorClass;
use thiserror::Error;

use crate::router::RoutingError;

/// Any failure surfaced by [`DataCore`](crate::DataCore).
#[derive(Debug, Error)]
pub enum CoreError {
    /// The operation queue refused or lost the operation.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Handle resolution, parameter translation or execution failed.
    #[error(transparent)]
    Db(#[from] DbError),

    /// The statement could not be routed.
    #[error(transparent)]
    Routing(#[from] RoutingError),
}

impl CoreError {
    /// How an API layer should respond to this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Queue(e) => match e {
                QueueError::CapacityExceeded { .. }
                | QueueError::ShuttingDown
                | QueueError::Cleared => ErrorClass::RetryLater,
                QueueError::NotInitialized
                | QueueError::AlreadyInitialized
                | QueueError::RuntimeUnavailable
                | QueueError::Abandoned => ErrorClass::ServerFault,
            },
            Self::Db(e) => match e {
                DbError::ParameterMismatch(_) | DbError::InvalidTenantId(_) => {
                    ErrorClass::ClientFault
                }
                DbError::TenantBusy(_) => ErrorClass::RetryLater,
                DbError::Execution { .. }
                | DbError::TenantUnavailable { .. }
                | DbError::MainUnavailable(_)
                | DbError::Pool(_)
                | DbError::Schema(_)
                | DbError::Filesystem { .. } => ErrorClass::ServerFault,
            },
            Self::Routing(_) => ErrorClass::ClientFault,
        }
    }

    /// A message safe to return to API clients.
    ///
    /// Client faults keep their detail. Server faults are reduced to a
    /// generic description; the full error belongs in operator logs.
    pub fn client_message(&self) -> String {
        match self {
            Self::Queue(QueueError::CapacityExceeded { .. }) => {
                "too many pending operations, retry later".to_string()
            }
            Self::Queue(QueueError::ShuttingDown | QueueError::Cleared) => {
                "service is shutting down, retry later".to_string()
            }
            Self::Queue(_) => "operation could not be completed".to_string(),
            Self::Db(DbError::ParameterMismatch(e)) => format!("parameter mismatch: {e}"),
            Self::Db(DbError::InvalidTenantId(_)) => "invalid tenant identifier".to_string(),
            Self::Db(DbError::Execution { .. }) => "database statement failed".to_string(),
            Self::Db(DbError::TenantBusy(_)) => "tenant database busy, retry later".to_string(),
            Self::Db(DbError::TenantUnavailable { .. }) => {
                "tenant database unavailable".to_string()
            }
            Self::Db(_) => "database unavailable".to_string(),
            Self::Routing(e) => e.to_string(),
        }
    }
}
