mod action;
mod backend;
mod driver;
mod error;
mod escalation;
mod privileged;
mod retry;
mod slots;
mod transaction;
mod value;
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use action::{placeholder_names, DbAction};
pub use backend::{BackendStatus, DbBackend, DbBackendBuilder};
pub use driver::{driver_for, DbConnection, Driver};
pub use error::{DbError, DbResult, DriverError, ErrorClass};
pub use escalation::{ErrorAnswer, ErrorHandler, EscalationKind, QueryStatus, Resolution};
pub use privileged::{PrivilegedContext, PrivilegedHandle, PrivilegedLoop};
pub use retry::{Boundary, RetryFailure, RetryPolicy};
pub use slots::{LastError, ValidityEpoch};
pub use sqlite::SqliteDriver;
pub use transaction::Transaction;
pub use value::{Params, QueryResult, Value};

#[cfg(feature = "postgres")]
pub use postgres::PostgresDriver;
