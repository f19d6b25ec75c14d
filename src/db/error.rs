//! Error taxonomy for the database backend.

use std::time::Duration;
use thiserror::Error;

/// How the backend treats a failure reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Another writer holds a conflicting lock. Retried locally.
    Lock,
    /// The physical connection is unusable. Escalated.
    Connection,
    /// Valid but needs an explicit decision before going on. Escalated.
    Consultation,
    /// Anything else: bad SQL, constraint violations and the like.
    Statement,
}

/// An engine failure normalised at the driver boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DriverError {
    pub class: ErrorClass,
    /// Engine specific code, e.g. the SQLite extended result code or SQLSTATE.
    pub code: Option<String>,
    pub message: String,
}

impl DriverError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn lock(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Lock, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Connection, message)
    }

    pub fn consultation(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Consultation, message)
    }

    pub fn statement(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Statement, message)
    }

    pub fn is_lock(&self) -> bool {
        self.class == ErrorClass::Lock
    }
}

/// Errors returned by `DbBackend` operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database still locked after {attempts} attempts: {source}")]
    Lock {
        attempts: u32,
        #[source]
        source: DriverError,
    },

    #[error("database connection error: {0}")]
    Connection(#[source] DriverError),

    #[error("operation needs confirmation: {0}")]
    ConsultationRequired(#[source] DriverError),

    #[error("statement failed: {0}")]
    Sql(#[source] DriverError),

    #[error("queries aborted by error handler: {0}")]
    Aborted(#[source] DriverError),

    #[error("connection replaced while a transaction was open: {0}")]
    TransactionLost(#[source] DriverError),

    #[error("no decision from error handler within {0:?}")]
    EscalationTimeout(Duration),

    #[error("database backend is closing")]
    Closing,

    #[error("transactions still open on: {}", threads.join(", "))]
    StuckTransactions { threads: Vec<String> },

    #[error("internal consistency error: {0}")]
    Internal(String),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl DbError {
    pub(crate) fn internal(message: impl Into<String>) -> Self {
        DbError::Internal(message.into())
    }

    /// Programming errors: never retried, never escalated.
    pub fn is_internal(&self) -> bool {
        matches!(self, DbError::Internal(_) | DbError::Closing)
    }

    /// The engine failure behind this error, if there is one.
    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            DbError::Lock { source, .. } => Some(source),
            DbError::Connection(e)
            | DbError::ConsultationRequired(e)
            | DbError::Sql(e)
            | DbError::Aborted(e)
            | DbError::TransactionLost(e) => Some(e),
            _ => None,
        }
    }

    /// Map a failure that was not absorbed by retry or escalation.
    pub(crate) fn from_driver(error: DriverError, attempts: u32) -> Self {
        match error.class {
            ErrorClass::Lock => DbError::Lock {
                attempts,
                source: error,
            },
            ErrorClass::Connection => DbError::Connection(error),
            ErrorClass::Consultation => DbError::ConsultationRequired(error),
            ErrorClass::Statement => DbError::Sql(error),
        }
    }
}
